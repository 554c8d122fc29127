//! NAT boundary between a private subnet and the public segment, configured on a gateway node

pub mod conntrack;
pub mod rule;

use crate::gateway::conntrack::{ConntrackEntry, parse_conntrack};
use crate::gateway::rule::{Chain, NatRule, Protocol, RuleTarget, Table};
use crate::substrate::{Executor, NodeCommand, Substrate, SubstrateError};
use crate::topology::ip::Ipv4Cidr;
use crate::topology::route::Route;
use crate::topology::{Topology, TopologyError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("packet forwarding is not enabled on `{0}`")]
    ForwardingNotEnabled(Arc<str>),
    #[error("failed to install `{rule}`: {stderr}")]
    RuleInstallation { rule: String, stderr: String },
    #[error("invalid rule set: {0}")]
    InvalidRuleSet(String),
    #[error("`{0}` is not a gateway")]
    NotAGateway(Arc<str>),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("unable to read the connection table of `{node}`")]
    Parse {
        node: Arc<str>,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// Addresses and routes configured on a node once the substrate is running
#[derive(Clone, Debug, Default)]
pub struct NodeAddressing {
    pub node: Arc<str>,
    pub interfaces: Vec<(Arc<str>, Vec<Ipv4Cidr>)>,
    pub routes: Vec<Route>,
}

/// Exposes `private` (and `private_port`) under `public` (and `public_port`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForward {
    pub protocol: Protocol,
    pub public: Ipv4Addr,
    pub public_port: Option<u16>,
    pub private: Ipv4Addr,
    pub private_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct GatewayPlan {
    pub node: Arc<str>,
    pub public_interface: Arc<str>,
    pub private_interface: Arc<str>,
    pub private_subnet: Ipv4Cidr,
    pub addresses: Vec<(Arc<str>, Vec<Ipv4Cidr>)>,
    pub port_forwards: Vec<PortForward>,
}

impl GatewayPlan {
    /// The rule set realizing this plan: masquerade, one translation per port forward and the
    /// forward-accept pair
    pub fn rules(&self) -> Vec<NatRule> {
        let mut rules = vec![NatRule::masquerade(
            self.private_subnet,
            &self.public_interface,
        )];
        rules.extend(self.port_forwards.iter().map(|f| {
            NatRule::port_forward(
                &self.public_interface,
                f.protocol,
                f.public,
                f.public_port,
                f.private,
                f.private_port,
            )
        }));
        rules.push(NatRule::forward_accept(
            &self.public_interface,
            &self.private_interface,
        ));
        rules.push(NatRule::forward_accept(
            &self.private_interface,
            &self.public_interface,
        ));
        rules
    }
}

/// Flushes and re-adds the addresses of each interface, then brings it up
pub async fn assign_addresses<S: Substrate>(
    executor: &Executor<S>,
    node: &str,
    interfaces: &[(Arc<str>, Vec<Ipv4Cidr>)],
) -> Result<(), SubstrateError> {
    for (interface, addresses) in interfaces {
        executor
            .exec_checked(
                node,
                &NodeCommand::FlushAddresses {
                    interface: interface.clone(),
                },
            )
            .await?;
        for address in addresses {
            executor
                .exec_checked(
                    node,
                    &NodeCommand::AddAddress {
                        interface: interface.clone(),
                        address: *address,
                    },
                )
                .await?;
        }
        executor
            .exec_checked(
                node,
                &NodeCommand::LinkUp {
                    interface: interface.clone(),
                },
            )
            .await?;
    }

    Ok(())
}

pub async fn install_routes<S: Substrate>(
    executor: &Executor<S>,
    node: &str,
    routes: &[Route],
) -> Result<(), SubstrateError> {
    for route in routes {
        executor
            .exec_checked(node, &NodeCommand::ReplaceRoute(route.clone()))
            .await?;
    }

    Ok(())
}

/// Applies a node's late addressing and routes
pub async fn apply_addressing<S: Substrate>(
    executor: &Executor<S>,
    addressing: &NodeAddressing,
) -> Result<(), SubstrateError> {
    assign_addresses(executor, &addressing.node, &addressing.interfaces).await?;
    install_routes(executor, &addressing.node, &addressing.routes).await
}

/// Checks that a rule set forms a complete and unambiguous NAT boundary
pub fn validate_rules(
    rules: &[NatRule],
    public_interface: &str,
    private_interface: &str,
) -> Result<(), GatewayError> {
    let invalid = |message: String| Err(GatewayError::InvalidRuleSet(message));

    let masquerades: Vec<_> = rules
        .iter()
        .filter(|r| r.target == RuleTarget::Masquerade)
        .collect();
    if masquerades.len() != 1 {
        return invalid(format!(
            "expected exactly one masquerade rule, found {}",
            masquerades.len()
        ));
    }
    if masquerades[0].matches.out_interface.as_deref() != Some(public_interface) {
        return invalid(format!(
            "the masquerade rule must leave through {public_interface}"
        ));
    }

    let accepts = |from: &str, to: &str| {
        rules.iter().any(|r| {
            r.chain == Chain::Forward
                && r.target == RuleTarget::Accept
                && r.matches.in_interface.as_deref() == Some(from)
                && r.matches.out_interface.as_deref() == Some(to)
        })
    };
    for (from, to) in [
        (public_interface, private_interface),
        (private_interface, public_interface),
    ] {
        if !accepts(from, to) {
            return invalid(format!("missing forward rule from {from} to {to}"));
        }
    }

    let mut translations: Vec<&NatRule> = Vec::new();
    for rule in rules {
        let RuleTarget::Dnat { port, .. } = rule.target else {
            continue;
        };

        if rule.matches.in_interface.as_deref() != Some(public_interface) {
            return invalid(format!(
                "`{rule}` must match traffic entering through {public_interface}"
            ));
        }

        let has_ports = rule.protocol.is_some_and(Protocol::has_ports);
        if (port.is_some() || rule.matches.destination_port.is_some()) && !has_ports {
            return invalid(format!("`{rule}` uses a port without tcp or udp"));
        }

        if let Some(other) = translations.iter().find(|t| translations_overlap(t, rule)) {
            return invalid(format!("`{rule}` overlaps with `{other}`"));
        }
        translations.push(rule);
    }

    Ok(())
}

/// Whether some packet would match both translations. A missing protocol, destination or port
/// matches everything.
fn translations_overlap(a: &NatRule, b: &NatRule) -> bool {
    fn both<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    both(a.protocol, b.protocol)
        && both(a.matches.destination, b.matches.destination)
        && both(a.matches.destination_port, b.matches.destination_port)
}

/// Owns the rule set of one gateway
pub struct GatewayConfigurator<S> {
    executor: Arc<Executor<S>>,
    plan: GatewayPlan,
    forwarding_enabled: bool,
    installed: Vec<NatRule>,
}

impl<S: Substrate> GatewayConfigurator<S> {
    pub fn new(
        executor: Arc<Executor<S>>,
        topology: &Topology,
        plan: GatewayPlan,
    ) -> Result<Self, GatewayError> {
        let node = topology
            .node(&plan.node)
            .ok_or_else(|| TopologyError::UnknownNode(plan.node.clone()))?;
        let gateway = node
            .as_gateway()
            .ok_or_else(|| GatewayError::NotAGateway(plan.node.clone()))?;

        let interfaces = [&plan.public_interface, &plan.private_interface]
            .into_iter()
            .chain(plan.addresses.iter().map(|(i, _)| i));
        for interface in interfaces {
            if gateway.interface(interface).is_none() {
                return Err(TopologyError::UnknownInterface {
                    node: plan.node.clone(),
                    interface: interface.clone(),
                }
                .into());
            }
        }

        Ok(Self {
            executor,
            plan,
            forwarding_enabled: false,
            installed: Vec::new(),
        })
    }

    pub fn node(&self) -> &Arc<str> {
        &self.plan.node
    }

    pub fn plan(&self) -> &GatewayPlan {
        &self.plan
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.forwarding_enabled
    }

    /// The rules appended since the last flush, in installation order
    pub fn rules(&self) -> &[NatRule] {
        &self.installed
    }

    /// Addresses, forwarding and the rules derived from the plan, in that order
    pub async fn configure(&mut self) -> Result<(), GatewayError> {
        self.assign_addresses().await?;
        self.enable_forwarding().await?;
        self.install_rules(self.plan.rules()).await
    }

    pub async fn assign_addresses(&self) -> Result<(), GatewayError> {
        assign_addresses(&self.executor, &self.plan.node, &self.plan.addresses).await?;
        Ok(())
    }

    pub async fn enable_forwarding(&mut self) -> Result<(), GatewayError> {
        let node = &self.plan.node;
        self.executor
            .exec_checked(node, &NodeCommand::SetIpForward(true))
            .await?;

        let output = self
            .executor
            .exec_checked(node, &NodeCommand::GetIpForward)
            .await?;
        if output.stdout.trim() != "1" {
            return Err(GatewayError::ForwardingNotEnabled(node.clone()));
        }

        self.forwarding_enabled = true;
        Ok(())
    }

    pub async fn disable_forwarding(&mut self) -> Result<(), GatewayError> {
        self.executor
            .exec_checked(&self.plan.node, &NodeCommand::SetIpForward(false))
            .await?;
        self.forwarding_enabled = false;
        Ok(())
    }

    /// Replaces whatever rules the gateway had with `rules`
    pub async fn install_rules(&mut self, mut rules: Vec<NatRule>) -> Result<(), GatewayError> {
        let node = self.plan.node.clone();
        if !self.forwarding_enabled {
            return Err(GatewayError::ForwardingNotEnabled(node));
        }

        validate_rules(
            &rules,
            &self.plan.public_interface,
            &self.plan.private_interface,
        )?;

        // First match wins, so the catch-all translation goes in before the specific ones
        rules.sort_by_key(NatRule::install_rank);

        // From here on the previous rules are gone, whatever happens to the new ones
        self.installed.clear();
        self.flush().await?;
        for rule in rules {
            let output = self
                .executor
                .exec(&node, &NodeCommand::IptablesAppend(rule.clone()))
                .await?;
            if !output.success() {
                return Err(GatewayError::RuleInstallation {
                    rule: rule.to_string(),
                    stderr: output.stderr.trim().to_string(),
                });
            }
            self.installed.push(rule);
        }

        tracing::info!("installed {} rules on {node}", self.installed.len());
        Ok(())
    }

    pub async fn remove_rules(&mut self) -> Result<(), GatewayError> {
        self.flush().await?;
        self.installed.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<(), GatewayError> {
        for table in [Table::Nat, Table::Filter] {
            self.executor
                .exec_checked(&self.plan.node, &NodeCommand::IptablesFlush(table))
                .await?;
        }
        Ok(())
    }

    /// Number of rules the gateway actually holds
    pub async fn effective_rule_count(&self) -> Result<usize, GatewayError> {
        let output = self
            .executor
            .exec_checked(&self.plan.node, &NodeCommand::IptablesSave)
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| l.starts_with("-A "))
            .count())
    }

    pub async fn connection_table(&self) -> Result<Vec<ConntrackEntry>, GatewayError> {
        let output = self
            .executor
            .exec_checked(&self.plan.node, &NodeCommand::ConntrackList)
            .await?;
        parse_conntrack(&output.stdout).map_err(|source| GatewayError::Parse {
            node: self.plan.node.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::substrate::ExecOutput;
    use crate::testlab;

    #[tokio::test(start_paused = true)]
    async fn test_rules_require_forwarding() {
        let topology = testlab::nat_topology().call();
        let executor = testlab::start(&topology).await;
        let mut gateway =
            GatewayConfigurator::new(executor.clone(), &topology, testlab::gateway_plan()).unwrap();

        gateway.assign_addresses().await.unwrap();
        let rules = gateway.plan().rules();
        let log_len = executor.log_len();
        let err = gateway.install_rules(rules).await.unwrap_err();
        assert!(matches!(err, GatewayError::ForwardingNotEnabled(node) if &*node == "h9"));

        // Nothing reached the gateway
        assert_eq!(executor.log_len(), log_len);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_is_idempotent() {
        let topology = testlab::nat_topology().call();
        let executor = testlab::start(&topology).await;
        let mut gateway =
            GatewayConfigurator::new(executor.clone(), &topology, testlab::gateway_plan()).unwrap();

        gateway.configure().await.unwrap();
        let once = gateway.effective_rule_count().await.unwrap();
        assert_eq!(once, gateway.plan().rules().len());

        gateway.install_rules(gateway.plan().rules()).await.unwrap();
        assert_eq!(gateway.effective_rule_count().await.unwrap(), once);

        gateway.remove_rules().await.unwrap();
        assert_eq!(gateway.effective_rule_count().await.unwrap(), 0);
        assert!(gateway.rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_masquerade_is_installed_first() {
        let topology = testlab::nat_topology().call();
        let executor = testlab::start(&topology).await;
        let mut gateway =
            GatewayConfigurator::new(executor.clone(), &topology, testlab::gateway_plan()).unwrap();
        gateway.assign_addresses().await.unwrap();
        gateway.enable_forwarding().await.unwrap();

        // Hand the rules over in the worst possible order
        let mut rules = gateway.plan().rules();
        rules.reverse();
        gateway.install_rules(rules).await.unwrap();

        let appended: Vec<_> = executor
            .log()
            .into_iter()
            .filter(|r| r.command.contains(" -A "))
            .map(|r| r.command)
            .collect();
        assert!(appended[0].contains("MASQUERADE"), "{appended:?}");
        assert!(appended[1].contains("DNAT"), "{appended:?}");
        assert!(appended.last().unwrap().contains("ACCEPT"), "{appended:?}");
    }

    #[test]
    fn test_validation() {
        let plan = testlab::gateway_plan();
        let public = &plan.public_interface;
        let private = &plan.private_interface;
        assert!(validate_rules(&plan.rules(), public, private).is_ok());

        let mut missing_forward = plan.rules();
        missing_forward.pop();
        assert!(matches!(
            validate_rules(&missing_forward, public, private),
            Err(GatewayError::InvalidRuleSet(_))
        ));

        let mut overlapping = plan.clone();
        let mut duplicate = overlapping.port_forwards[0].clone();
        duplicate.private = "10.1.1.3".parse().unwrap();
        overlapping.port_forwards.push(duplicate);
        assert!(validate_rules(&overlapping.rules(), public, private).is_err());

        let mut icmp_port = plan.clone();
        icmp_port.port_forwards.push(PortForward {
            protocol: Protocol::Icmp,
            public: "172.16.10.13".parse().unwrap(),
            public_port: Some(80),
            private: "10.1.1.4".parse().unwrap(),
            private_port: None,
        });
        assert!(validate_rules(&icmp_port.rules(), public, private).is_err());

        let mut twice = plan.rules();
        twice.push(NatRule::masquerade(plan.private_subnet, public));
        assert!(validate_rules(&twice, public, private).is_err());
    }

    #[test]
    fn test_portless_translation_overlaps_every_port() {
        let plan = testlab::gateway_plan();
        let public = &plan.public_interface;
        let private = &plan.private_interface;
        let forward = |protocol, port| PortForward {
            protocol,
            public: "172.16.10.13".parse().unwrap(),
            public_port: port,
            private: "10.1.1.4".parse().unwrap(),
            private_port: port,
        };

        let mut catch_all = plan.clone();
        catch_all.port_forwards.push(forward(Protocol::Tcp, None));
        assert!(validate_rules(&catch_all.rules(), public, private).is_ok());

        // Anything for 172.16.10.13:8080 would be captured by the portless rule
        let mut captured = catch_all.clone();
        captured.port_forwards.push(PortForward {
            private: "10.1.1.5".parse().unwrap(),
            ..forward(Protocol::Tcp, Some(8080))
        });
        let err = validate_rules(&captured.rules(), public, private).unwrap_err();
        assert!(err.to_string().contains("overlaps"), "{err}");

        // Same for the reverse order
        let mut reversed = plan.clone();
        reversed.port_forwards.push(forward(Protocol::Tcp, Some(8080)));
        reversed.port_forwards.push(forward(Protocol::Tcp, None));
        assert!(validate_rules(&reversed.rules(), public, private).is_err());

        // Other protocols and other ports of the same address stay apart
        let mut disjoint = catch_all.clone();
        disjoint.port_forwards.push(forward(Protocol::Udp, Some(8080)));
        disjoint.port_forwards.push(forward(Protocol::Icmp, None));
        assert!(validate_rules(&disjoint.rules(), public, private).is_ok());
        let mut two_ports = plan.clone();
        two_ports.port_forwards.push(forward(Protocol::Tcp, Some(80)));
        two_ports.port_forwards.push(forward(Protocol::Tcp, Some(443)));
        assert!(validate_rules(&two_ports.rules(), public, private).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reinstall_reports_what_remains() {
        let mut appends = 0;
        let network = testlab::FaultyNetwork::new(move |_, command| {
            if !matches!(command, NodeCommand::IptablesAppend(_)) {
                return None;
            }
            appends += 1;
            // The third rule of the second installation
            (appends == 10)
                .then(|| ExecOutput::failed(4, "iptables: Resource temporarily unavailable."))
        });
        let topology = testlab::nat_topology().call();
        let executor = testlab::start_on(network, &topology).await;
        let mut gateway =
            GatewayConfigurator::new(executor.clone(), &topology, testlab::gateway_plan()).unwrap();

        gateway.configure().await.unwrap();
        assert_eq!(gateway.rules().len(), 7);

        let err = gateway
            .install_rules(gateway.plan().rules())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RuleInstallation { .. }));
        assert_eq!(gateway.rules().len(), 2);
        assert_eq!(gateway.effective_rule_count().await.unwrap(), 2);
        assert_eq!(gateway.rules()[0].target, RuleTarget::Masquerade);
    }

    #[tokio::test]
    async fn test_unknown_gateway_interface() {
        let topology = testlab::nat_topology().call();
        let mut plan = testlab::gateway_plan();
        plan.private_interface = "h9-eth7".into();

        let executor = Arc::new(Executor::new(crate::sim::SimulatedNetwork::new(
            Default::default(),
        )));
        let err = GatewayConfigurator::new(executor, &topology, plan)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            GatewayError::Topology(TopologyError::UnknownInterface { .. })
        ));
    }
}
