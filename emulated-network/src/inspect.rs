//! Interactive shell to poke at a running lab before it is torn down

use crate::convergence::status::parse_stp_show;
use crate::gateway::conntrack::parse_conntrack;
use crate::orchestrator::result::ScenarioReport;
use crate::substrate::{Executor, NodeCommand, Substrate};
use crate::topology::Topology;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const PROMPT: &str = "netlab> ";

const HELP: &str = "\
commands:
  nodes               list nodes, roles and addresses
  links               list links and their shaping
  stp <switch>        spanning tree status of a switch
  rules               rules installed on the gateway
  conntrack           connections tracked by the gateway
  results             outcome of the automated tests
  log [n]             last n executed commands (default 20)
  <node> <command>    run a shell command on a node
  exit                tear the lab down
";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Help,
    Nodes,
    Links,
    Stp(String),
    Rules,
    Conntrack,
    Results,
    Log(usize),
    Exec { node: String, command: String },
    Exit,
}

/// Returns `Ok(None)` for blank lines
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, String> {
    let line = line.trim();
    let Some((word, rest)) = line
        .split_once(char::is_whitespace)
        .map(|(w, r)| (w, r.trim()))
        .or(Some((line, "")))
        .filter(|(w, _)| !w.is_empty())
    else {
        return Ok(None);
    };

    let command = match (word, rest) {
        ("help" | "?", _) => ShellCommand::Help,
        ("nodes", "") => ShellCommand::Nodes,
        ("links", "") => ShellCommand::Links,
        ("stp", "") => return Err("usage: stp <switch>".to_string()),
        ("stp", switch) => ShellCommand::Stp(switch.to_string()),
        ("rules", "") => ShellCommand::Rules,
        ("conntrack", "") => ShellCommand::Conntrack,
        ("results", "") => ShellCommand::Results,
        ("log", "") => ShellCommand::Log(20),
        ("log", n) => ShellCommand::Log(n.parse().map_err(|_| "usage: log [n]".to_string())?),
        ("exit" | "quit", _) => ShellCommand::Exit,
        (node, "") => return Err(format!("no command given for `{node}`")),
        (node, command) => ShellCommand::Exec {
            node: node.to_string(),
            command: command.to_string(),
        },
    };

    Ok(Some(command))
}

pub struct InspectionShell<'a, S> {
    executor: &'a Executor<S>,
    topology: &'a Topology,
    gateway: Option<Arc<str>>,
    reports: &'a [ScenarioReport],
}

impl<'a, S: Substrate> InspectionShell<'a, S> {
    pub fn new(
        executor: &'a Executor<S>,
        topology: &'a Topology,
        gateway: Option<Arc<str>>,
        reports: &'a [ScenarioReport],
    ) -> Self {
        Self {
            executor,
            topology,
            gateway,
            reports,
        }
    }

    /// Reads commands until `exit` or end of input
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            output.write_all(PROMPT.as_bytes()).await?;
            output.flush().await?;

            let Some(line) = lines.next_line().await? else {
                output.write_all(b"\n").await?;
                break;
            };

            let response = match parse_command(&line) {
                Ok(None) => continue,
                Ok(Some(ShellCommand::Exit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Err(usage) => format!("{usage}\n"),
            };
            output.write_all(response.as_bytes()).await?;
        }

        output.flush().await
    }

    pub async fn execute(&self, command: ShellCommand) -> String {
        let mut out = String::new();
        match command {
            ShellCommand::Help => out.push_str(HELP),
            ShellCommand::Nodes => {
                for node in self.topology.nodes() {
                    let addresses: Vec<_> = node.addresses().map(|a| a.to_string()).collect();
                    let _ = writeln!(
                        out,
                        "* {} ({}) {}",
                        node.name(),
                        node.role(),
                        addresses.join(", ")
                    );
                }
            }
            ShellCommand::Links => {
                for link in self.topology.links() {
                    let _ = writeln!(out, "* {link}");
                }
            }
            ShellCommand::Stp(switch) => {
                if self
                    .topology
                    .node(&switch)
                    .and_then(|n| n.as_switch())
                    .is_none()
                {
                    let _ = writeln!(out, "`{switch}` is not a switch");
                    return out;
                }

                let command = NodeCommand::StpShow {
                    bridge: switch.as_str().into(),
                };
                match self.executor.exec(&switch, &command).await {
                    Ok(output) if output.success() => match parse_stp_show(&output.stdout) {
                        Ok(status) => {
                            let root = if status.is_root { " (root)" } else { "" };
                            let _ = writeln!(out, "bridge {}{root}", status.bridge_id);
                            let _ = writeln!(out, "root   {}", status.root_id);
                            for port in &status.ports {
                                let _ = writeln!(
                                    out,
                                    "* {}: {} {} (cost {})",
                                    port.interface,
                                    port.role.as_str(),
                                    port.state.as_str(),
                                    port.cost
                                );
                            }
                        }
                        Err(_) => out.push_str(&output.stdout),
                    },
                    Ok(output) => out.push_str(&output.stderr),
                    Err(e) => {
                        let _ = writeln!(out, "error: {e}");
                    }
                }
            }
            ShellCommand::Rules => {
                let Some(gateway) = &self.gateway else {
                    out.push_str("the lab has no gateway\n");
                    return out;
                };
                match self.executor.exec(gateway, &NodeCommand::IptablesSave).await {
                    Ok(output) => out.push_str(&output.stdout),
                    Err(e) => {
                        let _ = writeln!(out, "error: {e}");
                    }
                }
            }
            ShellCommand::Conntrack => {
                let Some(gateway) = &self.gateway else {
                    out.push_str("the lab has no gateway\n");
                    return out;
                };
                let entries = match self.executor.exec(gateway, &NodeCommand::ConntrackList).await
                {
                    Ok(output) => parse_conntrack(&output.stdout),
                    Err(e) => Err(e.into()),
                };
                match entries {
                    Ok(entries) if entries.is_empty() => out.push_str("no tracked connections\n"),
                    Ok(entries) => {
                        for entry in entries {
                            let _ = writeln!(out, "* {entry}");
                        }
                    }
                    Err(e) => {
                        let _ = writeln!(out, "error: {e:#}");
                    }
                }
            }
            ShellCommand::Results => {
                if self.reports.is_empty() {
                    out.push_str("no tests were run\n");
                }
                for report in self.reports {
                    let verdict = if report.passed { "passed" } else { "FAILED" };
                    let _ = writeln!(out, "* {}: {verdict}", report.name);
                    for result in &report.results {
                        let _ = writeln!(out, "  * {result}");
                    }
                }
            }
            ShellCommand::Log(n) => {
                let log = self.executor.log();
                for record in &log[log.len().saturating_sub(n)..] {
                    let status = record
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let _ = writeln!(
                        out,
                        "{:>5} {:>8}ms [{}] {} => {status}",
                        record.sequence, record.at_ms, record.node, record.command
                    );
                }
            }
            ShellCommand::Exec { node, command } => {
                if self.topology.node(&node).is_none() {
                    let _ = writeln!(out, "unknown command or node `{node}` (try `help`)");
                    return out;
                }
                match self.executor.exec(&node, &NodeCommand::Raw(command)).await {
                    Ok(output) => {
                        out.push_str(&output.stdout);
                        out.push_str(&output.stderr);
                    }
                    Err(e) => {
                        let _ = writeln!(out, "error: {e}");
                    }
                }
            }
            ShellCommand::Exit => {}
        }

        out
    }
}
