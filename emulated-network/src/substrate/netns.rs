//! Linux substrate: network namespaces for hosts and gateways, Open vSwitch bridges for switches,
//! veth pairs for links and `tc netem` for shaping.
//!
//! Requires passwordless `sudo`, `iproute2`, `openvswitch-switch` and the `sch_netem` module.

use crate::shaping::netem_args;
use crate::substrate::{ExecOutput, NodeCommand, Substrate, SubstrateError};
use crate::topology::{Link, MacAddr, Node, NodeRole};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Marks the bridges created by this tool, so `cleanup` never touches foreign ones
const BRIDGE_TAG: &str = "external_ids:netlab=true";

#[derive(Default)]
struct State {
    roles: HashMap<Arc<str>, NodeRole>,
    macs: HashMap<Arc<str>, MacAddr>,
    namespaces: Vec<String>,
    bridges: Vec<Arc<str>>,
    /// Interfaces living in the root namespace (switch ports), removed on `stop`
    root_interfaces: Vec<Arc<str>>,
    /// (node, interface) pairs to bring up on `start`
    pending_up: Vec<(Arc<str>, Arc<str>)>,
    started: bool,
}

pub struct NetnsSubstrate {
    prefix: String,
    state: Mutex<State>,
}

impl NetnsSubstrate {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn namespace(&self, node: &str) -> String {
        format!("{}{node}", self.prefix)
    }

    fn role(&self, node: &str) -> Result<NodeRole, SubstrateError> {
        self.state
            .lock()
            .roles
            .get(node)
            .copied()
            .ok_or_else(|| SubstrateError::UnknownNode(node.into()))
    }

    /// The full argv to spawn, as seen from the root namespace
    fn wrap(&self, node: &str, argv: Vec<String>) -> Result<Vec<String>, SubstrateError> {
        match self.role(node)? {
            NodeRole::Switch => Ok(argv),
            NodeRole::Host | NodeRole::Gateway => {
                let mut wrapped = vec![
                    "ip".to_string(),
                    "netns".to_string(),
                    "exec".to_string(),
                    self.namespace(node),
                ];
                wrapped.extend(argv);
                Ok(wrapped)
            }
        }
    }

    /// Runs a lifecycle step, failing on a non-zero exit status
    async fn step(&self, operation: &str, argv: Vec<String>) -> Result<ExecOutput, SubstrateError> {
        let output = sudo(&argv).await.map_err(|e| SubstrateError::Operation {
            operation: operation.to_string(),
            stderr: e.to_string(),
        })?;

        if output.success() {
            Ok(output)
        } else {
            Err(SubstrateError::Operation {
                operation: operation.to_string(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Runs a lifecycle step whose failure is irrelevant (e.g. deleting something that may not
    /// exist)
    async fn best_effort(&self, argv: Vec<String>) {
        if let Err(e) = sudo(&argv).await {
            tracing::debug!("ignoring failure of `{}`: {e}", argv.join(" "));
        }
    }

    async fn attach_end(&self, node: &Arc<str>, interface: &Arc<str>) -> Result<(), SubstrateError> {
        let mac = self.state.lock().macs.get(interface).copied();
        if let Some(mac) = mac {
            self.step(
                "set link-layer address",
                args(["ip", "link", "set", "dev", interface, "address", &mac.to_string()]),
            )
            .await?;
        }

        match self.role(node)? {
            NodeRole::Switch => {
                self.step(
                    "add bridge port",
                    args(["ovs-vsctl", "add-port", node, interface]),
                )
                .await?;
                self.state.lock().root_interfaces.push(interface.clone());
            }
            NodeRole::Host | NodeRole::Gateway => {
                self.step(
                    "move interface into namespace",
                    args(["ip", "link", "set", interface, "netns", &self.namespace(node)]),
                )
                .await?;
            }
        }

        self.state
            .lock()
            .pending_up
            .push((node.clone(), interface.clone()));
        Ok(())
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

async fn sudo(argv: &[String]) -> std::io::Result<ExecOutput> {
    let output = tokio::process::Command::new("sudo")
        .args(argv)
        .output()
        .await?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        status: output.status.code().unwrap_or(-1),
    })
}

impl Substrate for NetnsSubstrate {
    async fn cleanup(&self) -> Result<(), SubstrateError> {
        let namespaces = self
            .step("list namespaces", args(["ip", "netns", "list"]))
            .await?;
        for line in namespaces.stdout.lines() {
            // Lines look like `netlab-h1 (id: 3)`
            let Some(name) = line.split_whitespace().next() else {
                continue;
            };
            if name.starts_with(&self.prefix) {
                tracing::info!("removing leftover namespace {name}");
                self.best_effort(args(["ip", "netns", "del", name])).await;
            }
        }

        let bridges = self
            .step(
                "list bridges",
                args(["ovs-vsctl", "--bare", "--columns=name", "find", "bridge", BRIDGE_TAG]),
            )
            .await?;
        for bridge in bridges.stdout.split_whitespace() {
            tracing::info!("removing leftover bridge {bridge}");
            let ports = sudo(&args(["ovs-vsctl", "list-ports", bridge]))
                .await
                .map(|o| o.stdout)
                .unwrap_or_default();
            self.best_effort(args(["ovs-vsctl", "--if-exists", "del-br", bridge]))
                .await;
            for port in ports.split_whitespace() {
                self.best_effort(args(["ip", "link", "del", port])).await;
            }
        }

        self.best_effort(args(["pkill", "-f", "iperf3"])).await;
        Ok(())
    }

    async fn create_node(&self, node: &Node) -> Result<(), SubstrateError> {
        {
            let mut state = self.state.lock();
            state.roles.insert(node.name().clone(), node.role());
            for interface in node.interfaces() {
                state.macs.insert(interface.name().clone(), interface.mac());
            }
        }

        match node.role() {
            NodeRole::Switch => {
                let name = node.name();
                self.step(
                    "create bridge",
                    args([
                        "ovs-vsctl",
                        "--may-exist",
                        "add-br",
                        name,
                        "--",
                        "set",
                        "bridge",
                        name,
                        "fail-mode=standalone",
                        "--",
                        "set",
                        "bridge",
                        name,
                        BRIDGE_TAG,
                        "--",
                        "set",
                        "bridge",
                        name,
                        &format!("other_config:hwaddr={}", node.system_id()),
                    ]),
                )
                .await?;
                self.state.lock().bridges.push(name.clone());
            }
            NodeRole::Host | NodeRole::Gateway => {
                let namespace = self.namespace(node.name());
                self.step(
                    "create namespace",
                    args(["ip", "netns", "add", &namespace]),
                )
                .await?;
                self.step(
                    "bring loopback up",
                    args(["ip", "netns", "exec", &namespace, "ip", "link", "set", "lo", "up"]),
                )
                .await?;
                self.state.lock().namespaces.push(namespace);
            }
        }

        Ok(())
    }

    async fn create_link(&self, link: &Link) -> Result<(), SubstrateError> {
        let [a, b] = link.ends();
        self.step(
            "create veth pair",
            args([
                "ip",
                "link",
                "add",
                &a.interface,
                "type",
                "veth",
                "peer",
                "name",
                &b.interface,
            ]),
        )
        .await?;

        self.attach_end(&a.node, &a.interface).await?;
        self.attach_end(&b.node, &b.interface).await?;

        for end in [a, b] {
            if let Some(tc) = netem_args(&end.interface, link.shaping()) {
                let mut argv = vec!["tc".to_string()];
                argv.extend(tc);
                let argv = self.wrap(&end.node, argv)?;
                self.step("apply link shaping", argv).await?;
            }
        }

        Ok(())
    }

    async fn start(&self) -> Result<(), SubstrateError> {
        let pending = std::mem::take(&mut self.state.lock().pending_up);
        for (node, interface) in pending {
            let argv = self.wrap(&node, args(["ip", "link", "set", &interface, "up"]))?;
            self.step("bring interface up", argv).await?;
        }

        self.state.lock().started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), SubstrateError> {
        let (namespaces, bridges, root_interfaces) = {
            let mut state = self.state.lock();
            state.started = false;
            (
                std::mem::take(&mut state.namespaces),
                std::mem::take(&mut state.bridges),
                std::mem::take(&mut state.root_interfaces),
            )
        };

        self.best_effort(args(["pkill", "-f", "iperf3"])).await;
        for namespace in namespaces {
            self.best_effort(args(["ip", "netns", "del", &namespace])).await;
        }
        for bridge in bridges {
            self.best_effort(args(["ovs-vsctl", "--if-exists", "del-br", &bridge]))
                .await;
        }
        // Deleting one end of a veth pair removes both
        for interface in root_interfaces {
            self.best_effort(args(["ip", "link", "del", &interface])).await;
        }

        Ok(())
    }

    async fn exec(&self, node: &str, command: &NodeCommand) -> Result<ExecOutput, SubstrateError> {
        if !self.state.lock().started {
            return Err(SubstrateError::NotStarted);
        }

        let argv = self.wrap(node, command.argv())?;
        sudo(&argv).await.map_err(|source| SubstrateError::Spawn {
            node: node.into(),
            command: command.to_string(),
            source,
        })
    }
}
