use crate::substrate::{ExecOutput, NodeCommand, Substrate, SubstrateError};
use crate::util::serde_arc_str;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// An entry of the command log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRecord {
    pub sequence: u64,
    #[serde(with = "serde_arc_str")]
    pub node: Arc<str>,
    pub command: String,
    /// `None` if the command could not be spawned at all
    pub status: Option<i32>,
    /// Time since the executor was created, in milliseconds
    pub at_ms: u64,
}

/// The single path through which commands reach the substrate
pub struct Executor<S> {
    substrate: S,
    started: Instant,
    log: Mutex<Vec<CommandRecord>>,
}

impl<S: Substrate> Executor<S> {
    pub fn new(substrate: S) -> Self {
        Self {
            substrate,
            started: Instant::now(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub async fn exec(
        &self,
        node: &str,
        command: &NodeCommand,
    ) -> Result<ExecOutput, SubstrateError> {
        let rendered = command.to_string();
        let result = self.substrate.exec(node, command).await;
        let status = result.as_ref().ok().map(|output| output.status);
        tracing::debug!(node, command = %rendered, ?status, "exec");

        let mut log = self.log.lock();
        let sequence = log.len() as u64;
        log.push(CommandRecord {
            sequence,
            node: node.into(),
            command: rendered,
            status,
            at_ms: self.started.elapsed().as_millis() as u64,
        });

        result
    }

    /// Like [`Executor::exec`], but a non-zero exit status becomes an error
    pub async fn exec_checked(
        &self,
        node: &str,
        command: &NodeCommand,
    ) -> Result<ExecOutput, SubstrateError> {
        let output = self.exec(node, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SubstrateError::CommandFailed {
                node: node.into(),
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    pub fn log(&self) -> Vec<CommandRecord> {
        self.log.lock().clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().len()
    }
}
