//! An in-memory substrate that interprets node commands instead of spawning them
//!
//! Used for tests and for running labs without privileges. Time is measured on the tokio clock,
//! so a paused runtime makes every run reproducible.

mod dataplane;
mod output;
mod stp;

use crate::convergence::status::BridgeId;
use crate::gateway::conntrack::ConntrackEntry;
use crate::gateway::rule::{NatRule, Protocol, Table};
use crate::shaping::LinkShaping;
use crate::sim::dataplane::{Delivery, Packet, PortStates};
use crate::sim::output::{ProbeReply, StpBridgeView, StpPortView, Transfer};
use crate::sim::stp::{ElectionBridge, ElectionPort, port_state};
use crate::substrate::{ExecOutput, NodeCommand, Substrate, SubstrateError};
use crate::topology::ip::Ipv4Cidr;
use crate::topology::route::Route;
use crate::topology::{Link, MacAddr, Node, NodeRole};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Bandwidth reported by an unshaped veth pair
const UNSHAPED_MBPS: f64 = 10_000.0;
const DEFAULT_BRIDGE_PRIORITY: u16 = 32768;
const FIRST_EPHEMERAL_PORT: u16 = 40000;

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Time a bridge port spends in each of the listening and learning states
    pub forward_delay: Duration,
    /// Time between starting a throughput server and it accepting connections
    pub server_bind_delay: Duration,
    /// Seed of the generator deciding packet loss
    pub rng_seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            forward_delay: Duration::from_secs(15),
            server_bind_delay: Duration::from_millis(500),
            rng_seed: 42,
        }
    }
}

/// A packet as seen by the node it was delivered to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedPacket {
    pub node: Arc<str>,
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub destination_port: Option<u16>,
}

struct SimInterface {
    name: Arc<str>,
    addresses: Vec<Ipv4Cidr>,
    link: Option<usize>,
}

struct Listener {
    port: u16,
    ready_at: Instant,
}

struct SimNode {
    name: Arc<str>,
    role: NodeRole,
    system_id: MacAddr,
    interfaces: Vec<SimInterface>,
    routes: Vec<Route>,
    ip_forward: bool,
    nat: Vec<NatRule>,
    filter: Vec<NatRule>,
    conntrack: Vec<ConntrackEntry>,
    stp_enabled: bool,
    stp_priority: u16,
    listeners: Vec<Listener>,
}

struct SimLink {
    /// (node, interface) of both ends
    ends: [(usize, usize); 2],
    shaping: LinkShaping,
}

pub(crate) struct SimState {
    nodes: Vec<SimNode>,
    by_name: HashMap<Arc<str>, usize>,
    links: Vec<SimLink>,
    observed: Vec<ObservedPacket>,
    rng: fastrand::Rng,
    started: bool,
    /// Any spanning tree change restarts the listening/learning timers of every port
    stp_changed_at: Option<Instant>,
    next_flow_id: u16,
}

impl SimState {
    fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            links: Vec::new(),
            observed: Vec::new(),
            rng: fastrand::Rng::with_seed(seed),
            started: false,
            stp_changed_at: None,
            next_flow_id: 0,
        }
    }

    fn next_flow_id(&mut self) -> u16 {
        self.next_flow_id = self.next_flow_id.wrapping_add(1);
        self.next_flow_id
    }

    fn interface_mut(&mut self, node: usize, name: &str) -> Option<&mut SimInterface> {
        self.nodes[node]
            .interfaces
            .iter_mut()
            .find(|i| &*i.name == name)
    }

    /// Spanning tree participants, as (node index, election input)
    fn election_input(&self) -> Vec<(usize, ElectionBridge)> {
        let bridges: Vec<usize> = (0..self.nodes.len())
            .filter(|&n| self.nodes[n].role == NodeRole::Switch && self.nodes[n].stp_enabled)
            .collect();
        let index: HashMap<usize, usize> = bridges.iter().enumerate().map(|(b, &n)| (n, b)).collect();

        bridges
            .iter()
            .map(|&n| {
                let node = &self.nodes[n];
                let ports = node
                    .interfaces
                    .iter()
                    .enumerate()
                    .filter_map(|(i, iface)| {
                        let link = &self.links[iface.link?];
                        let [a, b] = link.ends;
                        let (peer_node, peer_iface) = if a == (n, i) { b } else { a };
                        Some(ElectionPort {
                            port_no: i as u16 + 1,
                            cost: link.shaping.stp_path_cost(),
                            peer: index
                                .get(&peer_node)
                                .map(|&peer| (peer, peer_iface as u16 + 1)),
                        })
                    })
                    .collect();

                let bridge = ElectionBridge {
                    id: BridgeId {
                        priority: node.stp_priority,
                        system_id: node.system_id,
                    },
                    ports,
                };
                (n, bridge)
            })
            .collect()
    }

    fn since_stp_change(&self, now: Instant) -> Duration {
        self.stp_changed_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX)
    }

    fn port_states(&self, now: Instant, forward_delay: Duration) -> PortStates {
        let input = self.election_input();
        let bridges: Vec<ElectionBridge> = input.iter().map(|(_, b)| b.clone()).collect();
        let elected = stp::elect(&bridges);
        let elapsed = self.since_stp_change(now);

        input
            .iter()
            .zip(elected)
            .flat_map(|((n, _), bridge)| {
                bridge.ports.into_iter().map(move |p| {
                    let state = port_state(p.role, elapsed, forward_delay);
                    ((*n, p.port_no as usize - 1), state)
                })
            })
            .collect()
    }

    fn stp_show(&self, node: usize, now: Instant, forward_delay: Duration) -> ExecOutput {
        let input = self.election_input();
        let Some(position) = input.iter().position(|(n, _)| *n == node) else {
            return output::stp_disabled(&self.nodes[node].name);
        };

        let bridges: Vec<ElectionBridge> = input.iter().map(|(_, b)| b.clone()).collect();
        let elected = stp::elect(&bridges);
        let elapsed = self.since_stp_change(now);
        let this = &elected[position];
        let interfaces = &self.nodes[node].interfaces;

        let view = StpBridgeView {
            bridge: &self.nodes[node].name,
            bridge_id: bridges[position].id,
            root_id: this.root,
            root_port: this
                .root_port
                .map(|p| (&*interfaces[p as usize - 1].name, this.root_cost)),
            forward_delay,
            ports: this
                .ports
                .iter()
                .map(|p| StpPortView {
                    interface: &interfaces[p.port_no as usize - 1].name,
                    port_no: p.port_no,
                    role: p.role,
                    state: port_state(p.role, elapsed, forward_delay),
                    cost: p.cost,
                })
                .collect(),
        };

        output::stp_show(&view)
    }
}

pub struct SimulatedNetwork {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedNetwork {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState::new(config.rng_seed);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Every packet delivered to a node so far, in delivery order
    pub fn observed(&self) -> Vec<ObservedPacket> {
        self.state.lock().observed.clone()
    }

    pub fn observed_by(&self, node: &str) -> Vec<ObservedPacket> {
        self.state
            .lock()
            .observed
            .iter()
            .filter(|p| &*p.node == node)
            .cloned()
            .collect()
    }

    /// Interprets a command, returning its output and how long it took
    fn run(
        &self,
        node: &str,
        command: &NodeCommand,
    ) -> Result<(ExecOutput, Duration), SubstrateError> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(SubstrateError::NotStarted);
        }
        let n = *state
            .by_name
            .get(node)
            .ok_or_else(|| SubstrateError::UnknownNode(node.into()))?;
        let now = Instant::now();
        let instant = |output: ExecOutput| Ok((output, Duration::ZERO));

        match command {
            NodeCommand::FlushAddresses { interface } => match state.interface_mut(n, interface) {
                Some(iface) => {
                    iface.addresses.clear();
                    instant(ExecOutput::ok(""))
                }
                None => instant(no_such_device(interface)),
            },
            NodeCommand::AddAddress { interface, address } => {
                match state.interface_mut(n, interface) {
                    Some(iface) if iface.addresses.contains(address) => {
                        instant(ExecOutput::failed(2, "RTNETLINK answers: File exists\n"))
                    }
                    Some(iface) => {
                        iface.addresses.push(*address);
                        instant(ExecOutput::ok(""))
                    }
                    None => instant(no_such_device(interface)),
                }
            }
            NodeCommand::LinkUp { interface } => match state.interface_mut(n, interface) {
                Some(_) => instant(ExecOutput::ok("")),
                None => instant(no_such_device(interface)),
            },
            NodeCommand::ReplaceRoute(route) => {
                let reachable = state.nodes[n]
                    .interfaces
                    .iter()
                    .any(|i| i.addresses.iter().any(|a| a.contains(route.next)));
                if !reachable {
                    return instant(ExecOutput::failed(2, "Error: Nexthop has invalid gateway.\n"));
                }

                let routes = &mut state.nodes[n].routes;
                routes.retain(|r| r.destination != route.destination);
                routes.push(route.clone());
                instant(ExecOutput::ok(""))
            }
            NodeCommand::SetIpForward(enabled) => {
                state.nodes[n].ip_forward = *enabled;
                instant(ExecOutput::ok(format!(
                    "net.ipv4.ip_forward = {}\n",
                    u8::from(*enabled)
                )))
            }
            NodeCommand::GetIpForward => instant(ExecOutput::ok(format!(
                "{}\n",
                u8::from(state.nodes[n].ip_forward)
            ))),
            NodeCommand::IptablesFlush(table) => {
                match table {
                    Table::Nat => state.nodes[n].nat.clear(),
                    Table::Filter => state.nodes[n].filter.clear(),
                }
                instant(ExecOutput::ok(""))
            }
            NodeCommand::IptablesAppend(rule) => {
                match rule.table() {
                    Table::Nat => state.nodes[n].nat.push(rule.clone()),
                    Table::Filter => state.nodes[n].filter.push(rule.clone()),
                }
                instant(ExecOutput::ok(""))
            }
            NodeCommand::IptablesSave => {
                let node = &state.nodes[n];
                instant(output::iptables_save(&node.nat, &node.filter))
            }
            NodeCommand::ConntrackList => instant(output::conntrack(&state.nodes[n].conntrack)),
            NodeCommand::StpEnable { bridge, enabled } => {
                let Some(b) = state.bridge(bridge) else {
                    return instant(no_such_bridge(bridge));
                };
                if state.nodes[b].stp_enabled != *enabled {
                    state.nodes[b].stp_enabled = *enabled;
                    state.stp_changed_at = Some(now);
                }
                instant(ExecOutput::ok(""))
            }
            NodeCommand::StpPriority { bridge, priority } => {
                let Some(b) = state.bridge(bridge) else {
                    return instant(no_such_bridge(bridge));
                };
                if state.nodes[b].stp_priority != *priority {
                    state.nodes[b].stp_priority = *priority;
                    if state.nodes[b].stp_enabled {
                        state.stp_changed_at = Some(now);
                    }
                }
                instant(ExecOutput::ok(""))
            }
            NodeCommand::StpShow { bridge } => match state.bridge(bridge) {
                Some(b) => instant(state.stp_show(b, now, self.config.forward_delay)),
                None => instant(output::stp_disabled(bridge)),
            },
            NodeCommand::Ping {
                destination,
                count,
                timeout,
            } => Ok(self.ping(&mut state, n, *destination, *count, *timeout, now)),
            NodeCommand::IperfServer { port } => {
                let node = &mut state.nodes[n];
                if node.listeners.iter().any(|l| l.port == *port) {
                    return instant(ExecOutput::failed(
                        1,
                        "iperf3: error - unable to start listener for connections: Address already in use\n",
                    ));
                }
                node.listeners.push(Listener {
                    port: *port,
                    ready_at: now + self.config.server_bind_delay,
                });
                instant(ExecOutput::ok(""))
            }
            NodeCommand::IperfClient {
                destination,
                port,
                duration,
            } => Ok(self.iperf(&mut state, n, *destination, *port, *duration, now)),
            NodeCommand::KillIperf => {
                let listeners = &mut state.nodes[n].listeners;
                let killed = !listeners.is_empty();
                listeners.clear();
                instant(ExecOutput {
                    status: if killed { 0 } else { 1 },
                    ..ExecOutput::default()
                })
            }
            NodeCommand::Raw(command) => instant(ExecOutput::failed(
                127,
                format!("sh: {command}: not available in the simulated network\n"),
            )),
        }
    }

    fn ping(
        &self,
        state: &mut SimState,
        origin: usize,
        destination: Ipv4Addr,
        count: u32,
        timeout: Duration,
        now: Instant,
    ) -> (ExecOutput, Duration) {
        let ports = state.port_states(now, self.config.forward_delay);
        let mut replies = Vec::new();
        let mut elapsed = Duration::ZERO;

        for probe in 0..count {
            let id = state.next_flow_id();
            let request = Packet {
                protocol: Protocol::Icmp,
                source: Ipv4Addr::UNSPECIFIED,
                destination,
                source_port: Some(id),
                destination_port: None,
            };

            let reply = match state.send(&ports, origin, request) {
                Delivery::NoRoute => return (output::ping_no_route(), elapsed),
                Delivery::HostUnreachable { reporter } => ProbeReply::HostUnreachable { reporter },
                Delivery::Lost => ProbeReply::Lost,
                Delivery::Delivered {
                    node,
                    packet,
                    metrics: there,
                } => match state.send(&ports, node, packet.answer()) {
                    Delivery::Delivered {
                        node,
                        metrics: back,
                        ..
                    } if node == origin && there.delay + back.delay <= timeout => {
                        ProbeReply::Echo {
                            rtt: there.delay + back.delay,
                            ttl: 64u8.saturating_sub(back.routed_hops),
                        }
                    }
                    _ => ProbeReply::Lost,
                },
            };

            let took = match &reply {
                ProbeReply::Echo { rtt, .. } => *rtt,
                _ => timeout,
            };
            elapsed += if probe + 1 < count {
                took.max(Duration::from_secs(1))
            } else {
                took
            };
            replies.push(reply);
        }

        (output::ping(destination, &replies), elapsed)
    }

    fn iperf(
        &self,
        state: &mut SimState,
        origin: usize,
        destination: Ipv4Addr,
        port: u16,
        duration: Duration,
        now: Instant,
    ) -> (ExecOutput, Duration) {
        let ports = state.port_states(now, self.config.forward_delay);
        let local_port = FIRST_EPHEMERAL_PORT.wrapping_add(state.next_flow_id());
        let syn = Packet {
            protocol: Protocol::Tcp,
            source: Ipv4Addr::UNSPECIFIED,
            destination,
            source_port: Some(local_port),
            destination_port: Some(port),
        };

        let (server, packet, there) = match state.send(&ports, origin, syn) {
            Delivery::Delivered {
                node,
                packet,
                metrics,
            } => (node, packet, metrics),
            Delivery::NoRoute => {
                return (
                    output::iperf_error("unable to connect to server: Network is unreachable"),
                    Duration::ZERO,
                );
            }
            Delivery::HostUnreachable { .. } => {
                return (
                    output::iperf_error("unable to connect to server: No route to host"),
                    Duration::from_secs(3),
                );
            }
            Delivery::Lost => {
                return (
                    output::iperf_error("unable to connect to server: Connection timed out"),
                    duration,
                );
            }
        };

        let listening = state.nodes[server]
            .listeners
            .iter()
            .any(|l| Some(l.port) == packet.destination_port && l.ready_at <= now);
        if !listening {
            return (
                output::iperf_error("unable to connect to server: Connection refused"),
                there.delay * 2,
            );
        }

        let Delivery::Delivered {
            node,
            packet: syn_ack,
            metrics: back,
        } = state.send(&ports, server, packet.answer())
        else {
            return (
                output::iperf_error("unable to connect to server: Connection timed out"),
                duration,
            );
        };
        if node != origin {
            return (
                output::iperf_error("unable to connect to server: Connection timed out"),
                duration,
            );
        }

        let mbps = match (there.bottleneck_mbps, back.bottleneck_mbps) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b).unwrap_or(UNSHAPED_MBPS),
        };
        let transfer = Transfer {
            local: (syn_ack.destination, local_port),
            remote: (destination, port),
            seconds: duration.as_secs_f64(),
            bits_per_second: mbps * 1_000_000.0,
        };

        (output::iperf(&transfer), duration + there.delay + back.delay)
    }
}

impl SimState {
    fn bridge(&self, name: &str) -> Option<usize> {
        self.by_name
            .get(name)
            .copied()
            .filter(|&n| self.nodes[n].role == NodeRole::Switch)
    }
}

fn no_such_device(interface: &str) -> ExecOutput {
    ExecOutput::failed(1, format!("Cannot find device \"{interface}\"\n"))
}

fn no_such_bridge(bridge: &str) -> ExecOutput {
    ExecOutput::failed(1, format!("ovs-vsctl: no row \"{bridge}\" in table Bridge\n"))
}

impl Substrate for SimulatedNetwork {
    async fn cleanup(&self) -> Result<(), SubstrateError> {
        *self.state.lock() = SimState::new(self.config.rng_seed);
        Ok(())
    }

    async fn create_node(&self, node: &Node) -> Result<(), SubstrateError> {
        let mut state = self.state.lock();
        if state.by_name.contains_key(node.name()) {
            return Err(SubstrateError::Operation {
                operation: format!("create node {}", node.name()),
                stderr: "node already exists".to_string(),
            });
        }

        let index = state.nodes.len();
        state.nodes.push(SimNode {
            name: node.name().clone(),
            role: node.role(),
            system_id: node.system_id(),
            interfaces: node
                .interfaces()
                .iter()
                .map(|i| SimInterface {
                    name: i.name().clone(),
                    addresses: Vec::new(),
                    link: None,
                })
                .collect(),
            routes: Vec::new(),
            ip_forward: false,
            nat: Vec::new(),
            filter: Vec::new(),
            conntrack: Vec::new(),
            stp_enabled: false,
            stp_priority: DEFAULT_BRIDGE_PRIORITY,
            listeners: Vec::new(),
        });
        state.by_name.insert(node.name().clone(), index);
        Ok(())
    }

    async fn create_link(&self, link: &Link) -> Result<(), SubstrateError> {
        let mut state = self.state.lock();
        let index = state.links.len();

        let mut ends = [(0, 0); 2];
        for (slot, end) in ends.iter_mut().zip(link.ends()) {
            let n = *state
                .by_name
                .get(&end.node)
                .ok_or_else(|| SubstrateError::UnknownNode(end.node.clone()))?;
            let i = state.nodes[n]
                .interfaces
                .iter()
                .position(|i| i.name == end.interface)
                .ok_or_else(|| SubstrateError::Operation {
                    operation: format!("create link {link}"),
                    stderr: format!("interface {} does not exist", end.interface),
                })?;
            state.nodes[n].interfaces[i].link = Some(index);
            *slot = (n, i);
        }

        state.links.push(SimLink {
            ends,
            shaping: link.shaping().clone(),
        });
        Ok(())
    }

    async fn start(&self) -> Result<(), SubstrateError> {
        self.state.lock().started = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), SubstrateError> {
        let mut state = self.state.lock();
        state.started = false;
        for node in &mut state.nodes {
            node.listeners.clear();
        }
        Ok(())
    }

    async fn exec(&self, node: &str, command: &NodeCommand) -> Result<ExecOutput, SubstrateError> {
        let (output, took) = self.run(node, command)?;
        tokio::time::sleep(took).await;
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::Topology;

    async fn started(topology: &Topology) -> SimulatedNetwork {
        let network = SimulatedNetwork::new(SimConfig::default());
        for node in topology.nodes() {
            network.create_node(node).await.unwrap();
        }
        for link in topology.links() {
            network.create_link(link).await.unwrap();
        }
        network.start().await.unwrap();
        network
    }

    async fn address(network: &SimulatedNetwork, node: &str, interface: &str, cidr: &str) {
        let output = network
            .exec(
                node,
                &NodeCommand::AddAddress {
                    interface: interface.into(),
                    address: cidr.parse().unwrap(),
                },
            )
            .await
            .unwrap();
        assert!(output.success());
    }

    fn ping(destination: &str) -> NodeCommand {
        NodeCommand::Ping {
            destination: destination.parse().unwrap(),
            count: 1,
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_through_single_switch() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("h2", NodeRole::Host).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        let delay = LinkShaping::with_delay(Duration::from_millis(5));
        topology.add_link("h1", "s1", delay.clone()).unwrap();
        topology.add_link("h2", "s1", delay).unwrap();

        let network = started(&topology).await;
        address(&network, "h1", "h1-eth0", "10.0.0.2/24").await;
        address(&network, "h2", "h2-eth0", "10.0.0.3/24").await;

        let start = Instant::now();
        let output = network.exec("h1", &ping("10.0.0.3")).await.unwrap();
        assert!(output.success(), "{}", output.stdout);
        assert!(output.stdout.contains("time=20.0 ms"), "{}", output.stdout);
        assert_eq!(start.elapsed(), Duration::from_millis(20));

        let output = network.exec("h1", &ping("192.168.0.1")).await.unwrap();
        assert_eq!(output.status, 2);
        assert!(output.stderr.contains("Network is unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_without_spanning_tree_storms() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("h2", NodeRole::Host).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        topology.add_node("s2", NodeRole::Switch).unwrap();
        topology.add_link("s1", "s2", LinkShaping::default()).unwrap();
        topology.add_link("s1", "s2", LinkShaping::default()).unwrap();
        topology.add_link("h1", "s1", LinkShaping::default()).unwrap();
        topology.add_link("h2", "s2", LinkShaping::default()).unwrap();

        let network = started(&topology).await;
        address(&network, "h1", "h1-eth0", "10.0.0.2/24").await;
        address(&network, "h2", "h2-eth0", "10.0.0.3/24").await;

        let output = network.exec("h1", &ping("10.0.0.3")).await.unwrap();
        assert_eq!(output.status, 1);
        assert!(output.stdout.contains("100% packet loss"));

        for bridge in ["s1", "s2"] {
            let enable = NodeCommand::StpEnable {
                bridge: bridge.into(),
                enabled: true,
            };
            network.exec(bridge, &enable).await.unwrap();
        }

        let output = network
            .exec("s2", &NodeCommand::StpShow { bridge: "s2".into() })
            .await
            .unwrap();
        assert!(output.stdout.contains("listening"), "{}", output.stdout);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let output = network.exec("h1", &ping("10.0.0.3")).await.unwrap();
        assert!(output.success(), "{}", output.stdout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_server_needs_time_to_bind() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("h2", NodeRole::Host).unwrap();
        let shaping = LinkShaping {
            bandwidth_mbps: Some(100.0),
            ..LinkShaping::default()
        };
        topology.add_link("h1", "h2", shaping).unwrap();

        let network = started(&topology).await;
        address(&network, "h1", "h1-eth0", "10.0.0.2/24").await;
        address(&network, "h2", "h2-eth0", "10.0.0.3/24").await;

        let client = NodeCommand::IperfClient {
            destination: "10.0.0.3".parse().unwrap(),
            port: 5201,
            duration: Duration::from_secs(10),
        };
        network
            .exec("h2", &NodeCommand::IperfServer { port: 5201 })
            .await
            .unwrap();

        let refused = network.exec("h1", &client).await.unwrap();
        assert_eq!(refused.status, 1);
        assert!(refused.stdout.contains("Connection refused"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let output = network.exec("h1", &client).await.unwrap();
        assert!(output.success(), "{}", output.stdout);
        assert!(output.stdout.contains("100000000"));
    }
}
