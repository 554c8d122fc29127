//! Lab fixtures shared by the tests

use crate::gateway::rule::Protocol;
use crate::gateway::{self, GatewayPlan, NodeAddressing, PortForward};
use crate::shaping::LinkShaping;
use crate::sim::{SimConfig, SimulatedNetwork};
use crate::substrate::{ExecOutput, Executor, NodeCommand, Substrate, SubstrateError};
use crate::topology::route::Route;
use crate::topology::{Link, Node, NodeRole, Topology};
use bon::builder;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const PRIVATE_SUBNET: &str = "10.1.1.0/24";

/// Four switches in a ring plus the s1-s3 diagonal, with two hosts per switch (h1..h8 at
/// 10.0.0.2..10.0.0.9)
#[builder]
pub(crate) fn ring_topology(
    switch_delay_ms: Option<u64>,
    host_delay_ms: Option<u64>,
) -> Topology {
    let switch_delay = LinkShaping::with_delay(Duration::from_millis(switch_delay_ms.unwrap_or(7)));
    let host_delay = LinkShaping::with_delay(Duration::from_millis(host_delay_ms.unwrap_or(5)));

    let mut topology = Topology::new();
    for s in 1..=4 {
        topology.add_node(&format!("s{s}"), NodeRole::Switch).unwrap();
    }
    for (a, b) in [("s1", "s2"), ("s2", "s3"), ("s3", "s4"), ("s4", "s1"), ("s1", "s3")] {
        topology.add_link(a, b, switch_delay.clone()).unwrap();
    }

    for h in 1..=8 {
        let host = format!("h{h}");
        let switch = format!("s{}", (h + 1) / 2);
        topology.add_node(&host, NodeRole::Host).unwrap();
        topology.add_link(&host, &switch, host_delay.clone()).unwrap();
        topology
            .set_interface_addresses(
                &host,
                &format!("{host}-eth0"),
                vec![format!("10.0.0.{}/24", h + 1).parse().unwrap()],
            )
            .unwrap();
    }

    topology
}

/// A public segment (s1 with h3 and h4) and a private one (s2 with h1 and h2), joined by the
/// gateway h9 through h9-eth0 (public) and h9-eth1 (private)
#[builder]
pub(crate) fn nat_topology(delay_ms: Option<u64>, public_bandwidth_mbps: Option<f64>) -> Topology {
    let delay = Duration::from_millis(delay_ms.unwrap_or(5));
    let shaping = LinkShaping {
        delay: Some(delay),
        bandwidth_mbps: public_bandwidth_mbps,
        ..LinkShaping::default()
    };

    let mut topology = Topology::new();
    topology.add_node("s1", NodeRole::Switch).unwrap();
    topology.add_node("s2", NodeRole::Switch).unwrap();
    topology.add_node("h9", NodeRole::Gateway).unwrap();
    topology.add_link("h9", "s1", shaping.clone()).unwrap();
    topology
        .add_link("h9", "s2", LinkShaping::with_delay(delay))
        .unwrap();

    for (host, address) in [("h3", "10.0.0.4/24"), ("h4", "10.0.0.5/24")] {
        topology.add_node(host, NodeRole::Host).unwrap();
        topology.add_link(host, "s1", shaping.clone()).unwrap();
        topology
            .set_interface_addresses(
                host,
                &format!("{host}-eth0"),
                vec![address.parse().unwrap()],
            )
            .unwrap();
    }
    for host in ["h1", "h2"] {
        topology.add_node(host, NodeRole::Host).unwrap();
        topology
            .add_link(host, "s2", LinkShaping::with_delay(delay))
            .unwrap();
    }

    topology
}

pub(crate) fn gateway_plan() -> GatewayPlan {
    let forward = |protocol, public: &str, port, private: &str| PortForward {
        protocol,
        public: public.parse().unwrap(),
        public_port: port,
        private: private.parse().unwrap(),
        private_port: port,
    };

    GatewayPlan {
        node: "h9".into(),
        public_interface: "h9-eth0".into(),
        private_interface: "h9-eth1".into(),
        private_subnet: PRIVATE_SUBNET.parse().unwrap(),
        addresses: vec![
            (
                "h9-eth0".into(),
                ["10.0.0.1/24", "172.16.10.10/24", "172.16.10.11/24", "172.16.10.12/24"]
                    .iter()
                    .map(|a| a.parse().unwrap())
                    .collect(),
            ),
            ("h9-eth1".into(), vec!["10.1.1.1/24".parse().unwrap()]),
        ],
        port_forwards: vec![
            forward(Protocol::Icmp, "172.16.10.11", None, "10.1.1.2"),
            forward(Protocol::Icmp, "172.16.10.12", None, "10.1.1.3"),
            forward(Protocol::Tcp, "172.16.10.11", Some(5201), "10.1.1.2"),
            forward(Protocol::Tcp, "172.16.10.12", Some(5201), "10.1.1.3"),
        ],
    }
}

/// Private hosts default through the gateway; public hosts only know how to reach the
/// translated block
pub(crate) fn nat_addressing() -> Vec<NodeAddressing> {
    let private = |node: &str, address: &str| NodeAddressing {
        node: node.into(),
        interfaces: vec![(
            format!("{node}-eth0").into(),
            vec![address.parse().unwrap()],
        )],
        routes: vec![Route::default_via("10.1.1.1".parse().unwrap())],
    };
    let public = |node: &str| NodeAddressing {
        node: node.into(),
        interfaces: Vec::new(),
        routes: vec!["172.16.10.0/24 via 10.0.0.1".parse().unwrap()],
    };

    vec![
        private("h1", "10.1.1.2/24"),
        private("h2", "10.1.1.3/24"),
        public("h3"),
        public("h4"),
    ]
}

type Fault = Box<dyn FnMut(&str, &NodeCommand) -> Option<ExecOutput> + Send>;

/// A simulated network whose command outputs can be replaced: whenever `fault` returns an
/// output, the command never reaches the network
pub(crate) struct FaultyNetwork {
    pub(crate) network: SimulatedNetwork,
    fault: Mutex<Fault>,
}

impl FaultyNetwork {
    pub(crate) fn new(
        fault: impl FnMut(&str, &NodeCommand) -> Option<ExecOutput> + Send + 'static,
    ) -> Self {
        Self {
            network: SimulatedNetwork::new(SimConfig::default()),
            fault: Mutex::new(Box::new(fault)),
        }
    }
}

impl Substrate for FaultyNetwork {
    async fn cleanup(&self) -> Result<(), SubstrateError> {
        self.network.cleanup().await
    }

    async fn create_node(&self, node: &Node) -> Result<(), SubstrateError> {
        self.network.create_node(node).await
    }

    async fn create_link(&self, link: &Link) -> Result<(), SubstrateError> {
        self.network.create_link(link).await
    }

    async fn start(&self) -> Result<(), SubstrateError> {
        self.network.start().await
    }

    async fn stop(&self) -> Result<(), SubstrateError> {
        self.network.stop().await
    }

    async fn exec(&self, node: &str, command: &NodeCommand) -> Result<ExecOutput, SubstrateError> {
        let injected = (*self.fault.lock())(node, command);
        match injected {
            Some(output) => Ok(output),
            None => self.network.exec(node, command).await,
        }
    }
}

/// Builds the topology on a fresh simulated network and assigns its static addresses
pub(crate) async fn start(topology: &Topology) -> Arc<Executor<SimulatedNetwork>> {
    start_on(SimulatedNetwork::new(SimConfig::default()), topology).await
}

pub(crate) async fn start_on<S: Substrate>(network: S, topology: &Topology) -> Arc<Executor<S>> {
    network.cleanup().await.unwrap();
    for node in topology.nodes() {
        network.create_node(node).await.unwrap();
    }
    for link in topology.links() {
        network.create_link(link).await.unwrap();
    }
    network.start().await.unwrap();

    let executor = Arc::new(Executor::new(network));
    for node in topology.nodes() {
        let interfaces: Vec<_> = node
            .interfaces()
            .iter()
            .filter(|i| !i.addresses().is_empty())
            .map(|i| (i.name().clone(), i.addresses().to_vec()))
            .collect();
        gateway::assign_addresses(&executor, node.name(), &interfaces)
            .await
            .unwrap();
    }

    executor
}
