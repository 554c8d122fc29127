//! Spanning-tree convergence: enables the protocol on every switch, pins the root through its
//! priority and polls the bridges until they settle

pub mod status;
pub mod tree;

use crate::convergence::status::{BridgeStatus, PortState, parse_stp_show};
use crate::substrate::{Executor, NodeCommand, Substrate, SubstrateError};
use crate::topology::{Link, LinkId, Topology};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_ROOT_PRIORITY: u16 = 0x1000;
pub const DEFAULT_BRIDGE_PRIORITY: u16 = 0x8000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchPhase {
    Disabled,
    Enabling,
    Negotiating,
    Converged,
}

impl Display for SwitchPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchPhase::Disabled => f.write_str("disabled"),
            SwitchPhase::Enabling => f.write_str("enabling"),
            SwitchPhase::Negotiating => f.write_str("negotiating"),
            SwitchPhase::Converged => f.write_str("converged"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConvergenceSettings {
    /// The switch that must become the root bridge
    pub root: Arc<str>,
    pub root_priority: u16,
    /// Priority given to every other switch
    pub default_priority: u16,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl ConvergenceSettings {
    pub fn new(root: impl Into<Arc<str>>) -> Self {
        Self {
            root: root.into(),
            root_priority: DEFAULT_ROOT_PRIORITY,
            default_priority: DEFAULT_BRIDGE_PRIORITY,
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// The bridges did not settle in time; the switched network may still contain loops
#[derive(Error, Debug, Clone)]
#[error("spanning tree did not converge within {waited:?} (still negotiating: {})", pending.join(", "))]
pub struct ConvergenceTimeout {
    pub waited: Duration,
    pub pending: Vec<Arc<str>>,
}

#[derive(Error, Debug)]
pub enum ConvergenceError {
    #[error("root priority {root:#06x} must be lower than the default priority {default:#06x}")]
    InvalidPriority { root: u16, default: u16 },
    #[error("designated root `{0}` is not a switch of the topology")]
    UnknownRoot(Arc<str>),
    #[error("the spanning tree poll interval must be positive")]
    ZeroPollInterval,
    #[error(transparent)]
    Timeout(#[from] ConvergenceTimeout),
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

#[derive(Clone, Debug)]
pub struct ConvergenceReport {
    /// The bridge every switch agrees on, if they were polled
    pub root: Option<Arc<str>>,
    pub statuses: Vec<BridgeStatus>,
    /// Switch-to-switch links forwarding on both ends
    pub forwarding_links: Vec<LinkId>,
    pub blocked_links: Vec<LinkId>,
    pub waited: Duration,
}

impl ConvergenceReport {
    /// Whether the forwarding links connect every switched segment without a loop
    pub fn forms_spanning_tree(&self, topology: &Topology) -> bool {
        let switches: Vec<Arc<str>> = topology.switches().map(|s| s.name().clone()).collect();
        let forwarding =
            endpoints(self.forwarding_links.iter().filter_map(|id| topology.link(*id)));

        tree::is_spanning_forest(&switches, &endpoints(topology.switch_links()), &forwarding)
    }
}

fn endpoints<'a>(links: impl Iterator<Item = &'a Link>) -> Vec<(Arc<str>, Arc<str>)> {
    links
        .map(|l| {
            let [a, b] = l.ends();
            (a.node.clone(), b.node.clone())
        })
        .collect()
}

pub struct ConvergenceController<S> {
    executor: Arc<Executor<S>>,
    settings: ConvergenceSettings,
    switches: Vec<Arc<str>>,
    /// Switches joined by switch-to-switch links share a segment and elect a common root
    segments: HashMap<Arc<str>, usize>,
    phases: HashMap<Arc<str>, SwitchPhase>,
}

impl<S: Substrate> ConvergenceController<S> {
    pub fn new(
        executor: Arc<Executor<S>>,
        topology: &Topology,
        settings: ConvergenceSettings,
    ) -> Result<Self, ConvergenceError> {
        if settings.root_priority >= settings.default_priority {
            return Err(ConvergenceError::InvalidPriority {
                root: settings.root_priority,
                default: settings.default_priority,
            });
        }

        // A zero interval would never let a paused clock reach the timeout
        if settings.poll_interval.is_zero() {
            return Err(ConvergenceError::ZeroPollInterval);
        }

        let switches: Vec<Arc<str>> = topology.switches().map(|s| s.name().clone()).collect();
        if !switches.contains(&settings.root) {
            return Err(ConvergenceError::UnknownRoot(settings.root.clone()));
        }

        let segments = tree::components(&switches, &endpoints(topology.switch_links()));
        let phases = switches
            .iter()
            .map(|s| (s.clone(), SwitchPhase::Disabled))
            .collect();
        Ok(Self {
            executor,
            settings,
            switches,
            segments,
            phases,
        })
    }

    pub fn phase(&self, switch: &str) -> Option<SwitchPhase> {
        self.phases.get(switch).copied()
    }

    fn set_phase(&mut self, switch: &Arc<str>, phase: SwitchPhase) {
        if let Some(current) = self.phases.get_mut(switch) {
            if *current != phase {
                tracing::debug!("{switch}: {current} -> {phase}");
                *current = phase;
            }
        }
    }

    /// Assigns priorities and turns the protocol on, on every switch
    pub async fn enable(&mut self) -> Result<(), ConvergenceError> {
        for switch in self.switches.clone() {
            self.set_phase(&switch, SwitchPhase::Enabling);

            let priority = if switch == self.settings.root {
                self.settings.root_priority
            } else {
                self.settings.default_priority
            };
            self.executor
                .exec_checked(
                    &switch,
                    &NodeCommand::StpPriority {
                        bridge: switch.clone(),
                        priority,
                    },
                )
                .await?;
            self.executor
                .exec_checked(
                    &switch,
                    &NodeCommand::StpEnable {
                        bridge: switch.clone(),
                        enabled: true,
                    },
                )
                .await?;

            self.set_phase(&switch, SwitchPhase::Negotiating);
        }

        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<BridgeStatus>, ConvergenceError> {
        let mut statuses = Vec::new();
        for switch in self.switches.clone() {
            let output = self
                .executor
                .exec(
                    &switch,
                    &NodeCommand::StpShow {
                        bridge: switch.clone(),
                    },
                )
                .await?;

            // The bridge may not have picked up the configuration yet
            if !output.success() {
                self.set_phase(&switch, SwitchPhase::Negotiating);
                continue;
            }

            // Output read while the bridge reconfigures can be torn; the next poll retries
            let status = match parse_stp_show(&output.stdout) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("unreadable spanning tree status of {switch}: {e:#}");
                    self.set_phase(&switch, SwitchPhase::Negotiating);
                    continue;
                }
            };
            let phase = if status.is_stable() {
                SwitchPhase::Converged
            } else {
                SwitchPhase::Negotiating
            };
            self.set_phase(&switch, phase);
            statuses.push(status);
        }

        Ok(statuses)
    }

    /// Polls until every switch is stable and agrees on the root of its segment, or the timeout
    /// elapses
    pub async fn wait_for_convergence(
        &mut self,
        topology: &Topology,
    ) -> Result<ConvergenceReport, ConvergenceError> {
        let start = Instant::now();

        if self.switches.len() <= 1 {
            for switch in self.switches.clone() {
                self.set_phase(&switch, SwitchPhase::Converged);
            }
            return Ok(ConvergenceReport {
                root: self.switches.first().cloned(),
                statuses: Vec::new(),
                forwarding_links: Vec::new(),
                blocked_links: Vec::new(),
                waited: Duration::ZERO,
            });
        }

        loop {
            let statuses = self.poll().await?;
            let all_reported = statuses.len() == self.switches.len();
            let mut roots = HashMap::new();
            let agreed = statuses.iter().all(|s| {
                let segment = self.segment(&s.bridge);
                *roots.entry(segment).or_insert(s.root_id) == s.root_id
            });

            if all_reported && agreed && statuses.iter().all(|s| s.is_stable()) {
                let report = self.report(topology, statuses, start.elapsed());
                tracing::info!(
                    "spanning tree converged after {:?} with root {}",
                    report.waited,
                    report.root.as_deref().unwrap_or("?")
                );
                return Ok(report);
            }

            let waited = start.elapsed();
            if waited >= self.settings.timeout {
                let pending = self
                    .switches
                    .iter()
                    .filter(|s| self.phase(s) != Some(SwitchPhase::Converged))
                    .cloned()
                    .collect();
                return Err(ConvergenceTimeout { waited, pending }.into());
            }

            let remaining = self.settings.timeout - waited;
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }

    fn segment(&self, switch: &str) -> Option<usize> {
        self.segments.get(switch).copied()
    }

    fn report(
        &self,
        topology: &Topology,
        statuses: Vec<BridgeStatus>,
        waited: Duration,
    ) -> ConvergenceReport {
        let segment = self.segment(&self.settings.root);
        let root = statuses
            .iter()
            .find(|s| s.is_root && self.segment(&s.bridge) == segment)
            .map(|s| s.bridge.clone());
        if root.as_ref() != Some(&self.settings.root) {
            tracing::warn!(
                "elected root {} differs from the designated root {}",
                root.as_deref().unwrap_or("?"),
                self.settings.root
            );
        }

        let by_bridge: HashMap<&str, &BridgeStatus> =
            statuses.iter().map(|s| (&*s.bridge, s)).collect();
        let forwarding = |node: &str, interface: &str| {
            by_bridge
                .get(node)
                .and_then(|s| s.port(interface))
                .is_some_and(|p| p.state == PortState::Forwarding)
        };

        let (forwarding_links, blocked_links) = topology
            .switch_links()
            .map(|l| {
                let both = l.ends().iter().all(|e| forwarding(&e.node, &e.interface));
                (l.id(), both)
            })
            .partition::<Vec<_>, _>(|(_, both)| *both);

        ConvergenceReport {
            root,
            forwarding_links: forwarding_links.into_iter().map(|(id, _)| id).collect(),
            blocked_links: blocked_links.into_iter().map(|(id, _)| id).collect(),
            statuses,
            waited,
        }
    }
}
