use crate::config::cli::TunableOverrides;
use anyhow::{Context, bail, ensure};
use emulated_network::convergence::ConvergenceSettings;
use emulated_network::gateway::rule::Protocol;
use emulated_network::gateway::{GatewayPlan, NodeAddressing, PortForward};
use emulated_network::orchestrator::scenario::{Reachability, Scenario, ScenarioKind};
use emulated_network::run::LabPlan;
use emulated_network::shaping::LinkShaping;
use emulated_network::topology::ip::Ipv4Cidr;
use emulated_network::topology::route::Route;
use emulated_network::topology::{NodeRole, Topology};
use emulated_network::tunables::Tunables;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct LabJson {
    pub name: String,
    nodes: Vec<NodeJson>,
    links: Vec<LinkJson>,
    #[serde(default)]
    convergence: Option<ConvergenceJson>,
    #[serde(default)]
    gateway: Option<GatewayJson>,
    /// Addresses and routes applied together with the gateway configuration
    #[serde(default)]
    addressing: Vec<AddressingJson>,
    #[serde(default)]
    scenarios: Vec<ScenarioJson>,
    #[serde(default)]
    tunables: TunablesJson,
}

#[derive(Deserialize, Clone)]
struct NodeJson {
    id: String,
    #[serde(rename = "type")]
    #[serde(default = "default_node_kind")]
    kind: NodeKindJson,
    /// Static addresses, assigned as soon as the node is up
    #[serde(default)]
    interfaces: Vec<InterfaceJson>,
}

fn default_node_kind() -> NodeKindJson {
    NodeKindJson::Host
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
enum NodeKindJson {
    Host,
    Switch,
    Gateway,
}

impl From<NodeKindJson> for NodeRole {
    fn from(kind: NodeKindJson) -> Self {
        match kind {
            NodeKindJson::Host => NodeRole::Host,
            NodeKindJson::Switch => NodeRole::Switch,
            NodeKindJson::Gateway => NodeRole::Gateway,
        }
    }
}

/// Interfaces are named `<node>-eth<n>`, numbered in the order in which links were declared
#[serde_as]
#[derive(Deserialize, Clone)]
struct InterfaceJson {
    name: String,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    addresses: Vec<Ipv4Cidr>,
}

#[derive(Deserialize, Clone)]
struct LinkJson {
    source: String,
    target: String,
    /// The one-way delay of the link, in milliseconds
    #[serde(default)]
    delay_ms: Option<u64>,
    #[serde(default)]
    jitter_ms: Option<u64>,
    /// The bandwidth of the link, in megabits per second
    #[serde(default)]
    bandwidth_mbps: Option<f64>,
    /// The percentage of packets that will be lost (between 0 and 100)
    #[serde(default)]
    loss_percent: Option<f32>,
}

impl LinkJson {
    fn shaping(&self) -> LinkShaping {
        LinkShaping {
            delay: self.delay_ms.map(Duration::from_millis),
            jitter: self.jitter_ms.map(Duration::from_millis),
            bandwidth_mbps: self.bandwidth_mbps,
            loss_percent: self.loss_percent,
        }
    }
}

#[derive(Deserialize, Clone)]
struct ConvergenceJson {
    root: String,
    #[serde(default)]
    root_priority: Option<u16>,
    #[serde(default)]
    default_priority: Option<u16>,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct GatewayJson {
    node: String,
    public_interface: String,
    private_interface: String,
    #[serde_as(as = "DisplayFromStr")]
    private_subnet: Ipv4Cidr,
    interfaces: Vec<InterfaceJson>,
    #[serde(default)]
    port_forwards: Vec<PortForwardJson>,
}

#[derive(Deserialize, Clone)]
struct PortForwardJson {
    protocol: ProtocolJson,
    public: Ipv4Addr,
    #[serde(default)]
    public_port: Option<u16>,
    private: Ipv4Addr,
    #[serde(default)]
    private_port: Option<u16>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
enum ProtocolJson {
    Icmp,
    Tcp,
    Udp,
}

impl From<ProtocolJson> for Protocol {
    fn from(protocol: ProtocolJson) -> Self {
        match protocol {
            ProtocolJson::Icmp => Protocol::Icmp,
            ProtocolJson::Tcp => Protocol::Tcp,
            ProtocolJson::Udp => Protocol::Udp,
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct AddressingJson {
    node: String,
    #[serde(default)]
    interfaces: Vec<InterfaceJson>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ScenarioJson {
    Ping {
        name: String,
        source: String,
        destination: Ipv4Addr,
        #[serde(default)]
        expect: ReachabilityJson,
        #[serde(default = "default_rounds")]
        rounds: u32,
        /// Pause between consecutive rounds, in milliseconds
        #[serde(default)]
        round_delay_ms: u64,
    },
    Throughput {
        name: String,
        client: String,
        server: String,
        destination: Ipv4Addr,
        #[serde(default = "default_iperf_port")]
        port: u16,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
}

fn default_rounds() -> u32 {
    1
}

fn default_iperf_port() -> u16 {
    5201
}

#[derive(Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "camelCase")]
enum ReachabilityJson {
    #[default]
    Reachable,
    Unreachable,
}

impl From<ReachabilityJson> for Reachability {
    fn from(reachability: ReachabilityJson) -> Self {
        match reachability {
            ReachabilityJson::Reachable => Reachability::Reachable,
            ReachabilityJson::Unreachable => Reachability::Unreachable,
        }
    }
}

#[derive(Deserialize, Clone, Default)]
struct TunablesJson {
    poll_interval_ms: Option<u64>,
    convergence_timeout_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    probe_count: Option<u32>,
    probe_timeout_ms: Option<u64>,
    throughput_duration_ms: Option<u64>,
    scenario_timeout_ms: Option<u64>,
    server_settle_ms: Option<u64>,
    throughput_tolerance_ms: Option<u64>,
}

pub fn load(path: &Path) -> anyhow::Result<LabJson> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read lab file at `{}`", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("invalid lab file at `{}`", path.display()))
}

impl LabJson {
    pub fn into_plan(self, overrides: &TunableOverrides) -> anyhow::Result<LabPlan> {
        let topology = self.topology()?;

        let convergence = self.convergence.map(|c| {
            let mut settings = ConvergenceSettings::new(c.root.as_str());
            if let Some(priority) = c.root_priority {
                settings.root_priority = priority;
            }
            if let Some(priority) = c.default_priority {
                settings.default_priority = priority;
            }
            settings
        });

        let gateway = self.gateway.map(|g| GatewayPlan {
            node: g.node.as_str().into(),
            public_interface: g.public_interface.as_str().into(),
            private_interface: g.private_interface.as_str().into(),
            private_subnet: g.private_subnet,
            addresses: interface_addresses(g.interfaces),
            port_forwards: g
                .port_forwards
                .into_iter()
                .map(|pf| PortForward {
                    protocol: pf.protocol.into(),
                    public: pf.public,
                    public_port: pf.public_port,
                    private: pf.private,
                    private_port: pf.private_port,
                })
                .collect(),
        });

        let mut addressing = Vec::with_capacity(self.addressing.len());
        for a in self.addressing {
            if topology.node(&a.node).is_none() {
                bail!("addressing refers to unknown node `{}`", a.node);
            }
            addressing.push(NodeAddressing {
                node: a.node.as_str().into(),
                interfaces: interface_addresses(a.interfaces),
                routes: a.routes,
            });
        }

        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for scenario in self.scenarios {
            let scenario = scenario.into_scenario();
            let mut nodes = vec![&scenario.source];
            if let ScenarioKind::Throughput { server, .. } = &scenario.kind {
                nodes.push(server);
            }
            for node in nodes {
                if topology.node(node).is_none() {
                    bail!("scenario `{}` refers to unknown node `{node}`", scenario.name);
                }
            }
            scenarios.push(scenario);
        }

        Ok(LabPlan {
            topology,
            convergence,
            gateway,
            addressing,
            scenarios,
            tunables: self.tunables.resolve(overrides)?,
        })
    }

    fn topology(&self) -> anyhow::Result<Topology> {
        let mut topology = Topology::new();
        for node in &self.nodes {
            topology
                .add_node(&node.id, node.kind.into())
                .with_context(|| format!("invalid node `{}`", node.id))?;
        }

        for link in &self.links {
            topology
                .add_link(&link.source, &link.target, link.shaping())
                .with_context(|| format!("invalid link {} <-> {}", link.source, link.target))?;
        }

        for node in &self.nodes {
            for interface in &node.interfaces {
                topology
                    .set_interface_addresses(&node.id, &interface.name, interface.addresses.clone())
                    .with_context(|| format!("invalid addresses for node `{}`", node.id))?;
            }
        }

        Ok(topology)
    }
}

fn interface_addresses(interfaces: Vec<InterfaceJson>) -> Vec<(Arc<str>, Vec<Ipv4Cidr>)> {
    interfaces
        .into_iter()
        .map(|i| (i.name.as_str().into(), i.addresses))
        .collect()
}

impl ScenarioJson {
    fn into_scenario(self) -> Scenario {
        match self {
            ScenarioJson::Ping {
                name,
                source,
                destination,
                expect,
                rounds,
                round_delay_ms,
            } => Scenario::ping(&name, &source, destination)
                .expecting(expect.into())
                .repeated(rounds, Duration::from_millis(round_delay_ms)),
            ScenarioJson::Throughput {
                name,
                client,
                server,
                destination,
                port,
                duration_ms,
            } => {
                let mut scenario = Scenario::throughput(&name, &client, &server, destination, port);
                if let ScenarioKind::Throughput { duration, .. } = &mut scenario.kind {
                    *duration = duration_ms.map(Duration::from_millis);
                }
                scenario
            }
        }
    }
}

impl TunablesJson {
    /// Command line overrides win over the lab file, which wins over the defaults
    fn resolve(&self, overrides: &TunableOverrides) -> anyhow::Result<Tunables> {
        let defaults = Tunables::default();
        let ms = |cli: Option<u64>, json: Option<u64>, default: Duration| {
            cli.or(json).map(Duration::from_millis).unwrap_or(default)
        };

        let tunables = Tunables {
            poll_interval: ms(
                overrides.poll_interval_ms,
                self.poll_interval_ms,
                defaults.poll_interval,
            ),
            convergence_timeout: ms(
                overrides.convergence_timeout_ms,
                self.convergence_timeout_ms,
                defaults.convergence_timeout,
            ),
            settle_delay: ms(
                overrides.settle_delay_ms,
                self.settle_delay_ms,
                defaults.settle_delay,
            ),
            probe_count: overrides
                .probe_count
                .or(self.probe_count)
                .unwrap_or(defaults.probe_count),
            probe_timeout: ms(
                overrides.probe_timeout_ms,
                self.probe_timeout_ms,
                defaults.probe_timeout,
            ),
            throughput_duration: ms(
                overrides.throughput_duration_ms,
                self.throughput_duration_ms,
                defaults.throughput_duration,
            ),
            scenario_timeout: ms(None, self.scenario_timeout_ms, defaults.scenario_timeout),
            server_settle: ms(None, self.server_settle_ms, defaults.server_settle),
            throughput_tolerance: ms(
                None,
                self.throughput_tolerance_ms,
                defaults.throughput_tolerance,
            ),
        };

        ensure!(
            !tunables.poll_interval.is_zero(),
            "the spanning tree poll interval must be at least 1 ms"
        );
        Ok(tunables)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LAB: &str = r#"{
        "name": "tiny",
        "nodes": [
            { "id": "s1", "type": "switch" },
            { "id": "h1", "interfaces": [{ "name": "h1-eth0", "addresses": ["10.0.0.2/24"] }] },
            { "id": "h2", "interfaces": [{ "name": "h2-eth0", "addresses": ["10.0.0.3/24"] }] }
        ],
        "links": [
            { "source": "h1", "target": "s1", "delay_ms": 5 },
            { "source": "h2", "target": "s1", "bandwidth_mbps": 100 }
        ],
        "convergence": { "root": "s1" },
        "scenarios": [
            { "type": "ping", "name": "h1 to h2", "source": "h1", "destination": "10.0.0.3", "rounds": 3, "round_delay_ms": 30000 },
            { "type": "throughput", "name": "h1 to h2", "client": "h1", "server": "h2", "destination": "10.0.0.3" }
        ],
        "tunables": { "settle_delay_ms": 0, "probe_count": 5 }
    }"#;

    fn parse(json: &str) -> LabJson {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_lab_into_plan() {
        let plan = parse(LAB).into_plan(&TunableOverrides::default()).unwrap();

        assert_eq!(plan.topology.nodes().len(), 3);
        assert_eq!(plan.topology.links().len(), 2);
        assert_eq!(
            plan.topology.links()[0].shaping().delay,
            Some(Duration::from_millis(5))
        );
        let h1 = plan.topology.node("h1").unwrap();
        assert_eq!(h1.addresses().next().unwrap().to_string(), "10.0.0.2/24");
        assert_eq!(plan.convergence.unwrap().root.as_ref(), "s1");

        assert_eq!(plan.scenarios.len(), 2);
        assert_eq!(
            plan.scenarios[0].kind,
            ScenarioKind::Connectivity {
                destination: "10.0.0.3".parse().unwrap(),
                expect: Reachability::Reachable,
                rounds: 3,
                round_delay: Duration::from_secs(30),
            }
        );
        let ScenarioKind::Throughput { port, .. } = &plan.scenarios[1].kind else {
            panic!("expected a throughput scenario");
        };
        assert_eq!(*port, 5201);
    }

    #[test]
    fn test_tunable_precedence() {
        let overrides = TunableOverrides {
            probe_count: Some(7),
            poll_interval_ms: Some(250),
            ..Default::default()
        };
        let plan = parse(LAB).into_plan(&overrides).unwrap();

        assert_eq!(plan.tunables.probe_count, 7);
        assert_eq!(plan.tunables.poll_interval, Duration::from_millis(250));
        assert_eq!(plan.tunables.settle_delay, Duration::ZERO);
        assert_eq!(plan.tunables.convergence_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_labs_are_rejected() {
        let unknown_link_end = LAB.replace(r#""target": "s1", "delay_ms""#, r#""target": "s9", "delay_ms""#);
        let err = parse(&unknown_link_end)
            .into_plan(&TunableOverrides::default())
            .unwrap_err();
        assert!(format!("{err:#}").contains("`s9`"), "{err:#}");

        let unknown_source = LAB.replace(r#""source": "h1", "destination""#, r#""source": "h7", "destination""#);
        assert!(parse(&unknown_source)
            .into_plan(&TunableOverrides::default())
            .is_err());

        let bad_cidr = LAB.replace("10.0.0.2/24", "10.0.0.2/33");
        assert!(serde_json::from_str::<LabJson>(&bad_cidr).is_err());
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let from_cli = TunableOverrides {
            poll_interval_ms: Some(0),
            ..Default::default()
        };
        let err = parse(LAB).into_plan(&from_cli).unwrap_err();
        assert!(err.to_string().contains("poll interval"), "{err:#}");

        let from_file = LAB.replace(r#""settle_delay_ms": 0"#, r#""poll_interval_ms": 0"#);
        assert!(parse(&from_file)
            .into_plan(&TunableOverrides::default())
            .is_err());
    }
}
