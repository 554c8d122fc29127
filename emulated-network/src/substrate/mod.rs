//! The boundary between the lab and whatever provides hosts, switches and links
//!
//! Everything the engines do to the network goes through [`Substrate::exec`], wrapped by the
//! [`Executor`] so that the order of side effects is recorded in one place.

pub mod command;
pub mod executor;
pub mod netns;

pub use command::NodeCommand;
pub use executor::{CommandRecord, Executor};

use crate::topology::{Link, Node};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// The captured result of a command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("node `{0}` does not exist in the substrate")]
    UnknownNode(Arc<str>),
    #[error("failed to spawn `{command}` on `{node}`")]
    Spawn {
        node: Arc<str>,
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` on `{node}` exited with status {status}: {stderr}")]
    CommandFailed {
        node: Arc<str>,
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("{operation} failed: {stderr}")]
    Operation { operation: String, stderr: String },
    #[error("the substrate has not been started")]
    NotStarted,
}

/// Provides the emulated hosts, switches and links.
///
/// Lifecycle calls arrive in the order `cleanup`, `create_node`*, `create_link`*, `start`, then
/// any number of `exec`, then `stop`.
pub trait Substrate: Send + Sync + 'static {
    /// Removes whatever a previous run left behind
    fn cleanup(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn create_node(&self, node: &Node) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Creates the link and applies its shaping
    fn create_link(&self, link: &Link) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn start(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn stop(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Runs a command on a node. A non-zero exit status is not an error at this level.
    fn exec(
        &self,
        node: &str,
        command: &NodeCommand,
    ) -> impl Future<Output = Result<ExecOutput, SubstrateError>> + Send;
}
