//! Drives a lab through its phases and always tears it down

use crate::convergence::{
    ConvergenceController, ConvergenceError, ConvergenceReport, ConvergenceSettings,
    ConvergenceTimeout,
};
use crate::gateway::conntrack::ConntrackEntry;
use crate::gateway::rule::NatRule;
use crate::gateway::{self, GatewayConfigurator, GatewayError, GatewayPlan, NodeAddressing};
use crate::inspect::InspectionShell;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::result::ScenarioReport;
use crate::orchestrator::scenario::Scenario;
use crate::substrate::{CommandRecord, Executor, Substrate, SubstrateError};
use crate::topology::{Topology, TopologyError};
use crate::tunables::Tunables;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Everything needed to bring a lab up and verify it
#[derive(Clone, Debug)]
pub struct LabPlan {
    pub topology: Topology,
    /// `None` for labs without a switched backbone to converge
    pub convergence: Option<ConvergenceSettings>,
    pub gateway: Option<GatewayPlan>,
    /// Addresses and routes configured together with the gateway
    pub addressing: Vec<NodeAddressing>,
    pub scenarios: Vec<Scenario>,
    pub tunables: Tunables,
}

#[derive(Error, Debug)]
pub enum LabError {
    #[error("invalid topology")]
    Topology(#[from] TopologyError),
    #[error("substrate failure")]
    Substrate(#[from] SubstrateError),
    #[error("spanning tree setup failed")]
    Convergence(#[from] ConvergenceError),
    #[error("gateway configuration failed")]
    Gateway(#[from] GatewayError),
}

#[derive(Error, Debug)]
#[error("teardown step `{step}` failed")]
pub struct TeardownError {
    pub step: &'static str,
    #[source]
    pub source: LabError,
}

#[derive(Clone, Debug)]
pub enum ConvergenceOutcome {
    /// The lab does not ask for a spanning tree
    Skipped,
    Converged(ConvergenceReport),
    /// The run went on, but the backbone may still contain loops
    TimedOut(ConvergenceTimeout),
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    /// `None` if the run failed before reaching the convergence phase
    pub convergence: Option<ConvergenceOutcome>,
    pub reports: Vec<ScenarioReport>,
    pub rules: Vec<NatRule>,
    /// Connections tracked by the gateway once the tests finished
    pub connections: Vec<ConntrackEntry>,
    pub setup_error: Option<LabError>,
    /// The shutdown signal arrived before the run finished; teardown still ran
    pub interrupted: bool,
    pub teardown_errors: Vec<TeardownError>,
    pub command_log: Vec<CommandRecord>,
}

impl RunOutcome {
    /// Only a failed setup or an interruption makes the run itself fail; failed scenarios are
    /// reported
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.setup_error.is_some() {
            1
        } else {
            0
        }
    }

    pub fn passed_scenarios(&self) -> usize {
        self.reports.iter().filter(|r| r.passed).count()
    }
}

pub struct RunController<S> {
    executor: Arc<Executor<S>>,
    plan: LabPlan,
    started: bool,
    gateway: Option<GatewayConfigurator<S>>,
}

impl<S: Substrate> RunController<S> {
    pub fn new(substrate: S, plan: LabPlan) -> Self {
        Self {
            executor: Arc::new(Executor::new(substrate)),
            plan,
            started: false,
            gateway: None,
        }
    }

    pub fn executor(&self) -> &Arc<Executor<S>> {
        &self.executor
    }

    pub fn plan(&self) -> &LabPlan {
        &self.plan
    }

    /// Brings the lab up, tests it and tears it down.
    ///
    /// Once `shutdown` resolves, whatever phase is in progress is abandoned and the run goes
    /// straight to teardown.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RunOutcome {
        self.execute(None::<(tokio::io::Empty, tokio::io::Sink)>, shutdown)
            .await
    }

    /// Like [`RunController::run`], with an inspection shell between the tests and teardown
    pub async fn run_with_inspection<R, W>(
        self,
        input: R,
        output: W,
        shutdown: impl Future<Output = ()>,
    ) -> RunOutcome
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.execute(Some((input, output)), shutdown).await
    }

    async fn execute<R, W>(
        mut self,
        inspection: Option<(R, W)>,
        shutdown: impl Future<Output = ()>,
    ) -> RunOutcome
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut outcome = RunOutcome::default();

        let phases = async {
            match self.setup(&mut outcome).await {
                Ok(()) => {
                    self.test(&mut outcome).await;

                    if let Some((input, output)) = inspection {
                        let shell = InspectionShell::new(
                            &self.executor,
                            &self.plan.topology,
                            self.gateway.as_ref().map(|g| g.node().clone()),
                            &outcome.reports,
                        );
                        if let Err(e) = shell.run(input, output).await {
                            tracing::warn!("inspection shell stopped: {e}");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("setup failed, skipping the tests: {e}");
                    outcome.setup_error = Some(e);
                }
            }
        };

        let interrupted = tokio::select! {
            () = phases => false,
            () = shutdown => true,
        };
        if interrupted {
            tracing::warn!("interrupted, tearing the lab down");
            outcome.interrupted = true;
        }

        outcome.teardown_errors = self.teardown().await;
        outcome.command_log = self.executor.log();
        outcome
    }

    async fn setup(&mut self, outcome: &mut RunOutcome) -> Result<(), LabError> {
        let substrate = self.executor.substrate();
        let topology = &self.plan.topology;

        tracing::info!("cleaning up leftovers of previous runs");
        substrate.cleanup().await?;

        tracing::info!(
            "building {} nodes and {} links",
            topology.nodes().len(),
            topology.links().len()
        );
        for node in topology.nodes() {
            substrate.create_node(node).await?;
        }
        for link in topology.links() {
            substrate.create_link(link).await?;
        }

        substrate.start().await?;
        self.started = true;

        for node in topology.nodes() {
            let interfaces: Vec<_> = node
                .interfaces()
                .iter()
                .filter(|i| !i.addresses().is_empty())
                .map(|i| (i.name().clone(), i.addresses().to_vec()))
                .collect();
            if !interfaces.is_empty() {
                gateway::assign_addresses(&self.executor, node.name(), &interfaces).await?;
            }
        }

        outcome.convergence = Some(self.converge().await?);

        if let Some(plan) = self.plan.gateway.clone() {
            tracing::info!("configuring gateway {}", plan.node);
            let configurator = GatewayConfigurator::new(self.executor.clone(), topology, plan)?;
            let gateway = self.gateway.insert(configurator);
            gateway.assign_addresses().await?;
        }

        for addressing in &self.plan.addressing {
            gateway::apply_addressing(&self.executor, addressing).await?;
        }

        if let Some(gateway) = &mut self.gateway {
            gateway.enable_forwarding().await?;
            let rules = gateway.plan().rules();
            let installed = gateway.install_rules(rules).await;
            // Also after a partial installation, so the report shows what the gateway holds
            outcome.rules = gateway.rules().to_vec();
            installed?;
        }

        let settle = self.plan.tunables.settle_delay;
        tracing::info!("letting the network settle for {settle:?}");
        tokio::time::sleep(settle).await;

        Ok(())
    }

    async fn converge(&self) -> Result<ConvergenceOutcome, LabError> {
        let Some(settings) = self.plan.convergence.clone() else {
            return Ok(ConvergenceOutcome::Skipped);
        };

        let settings = self.plan.tunables.apply_to(settings);
        let mut controller =
            ConvergenceController::new(self.executor.clone(), &self.plan.topology, settings)?;
        controller.enable().await?;

        match controller.wait_for_convergence(&self.plan.topology).await {
            Ok(report) => Ok(ConvergenceOutcome::Converged(report)),
            Err(ConvergenceError::Timeout(timeout)) => {
                tracing::warn!("{timeout}; the backbone may still contain loops");
                Ok(ConvergenceOutcome::TimedOut(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn test(&self, outcome: &mut RunOutcome) {
        let orchestrator =
            Orchestrator::new(self.executor.clone(), self.plan.tunables.probe_settings());
        outcome.reports = orchestrator.run_all(&self.plan.scenarios).await;

        if let Some(gateway) = &self.gateway {
            match gateway.connection_table().await {
                Ok(connections) => outcome.connections = connections,
                Err(e) => tracing::warn!("unable to list the tracked connections: {e}"),
            }
        }
    }

    /// Best effort: every step runs, failures are collected
    async fn teardown(&mut self) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        let mut record = |step: &'static str, error: LabError| {
            tracing::warn!("teardown step `{step}` failed: {error}");
            errors.push(TeardownError {
                step,
                source: error,
            });
        };

        if let Some(gateway) = &mut self.gateway {
            if gateway.forwarding_enabled() {
                if let Err(e) = gateway.disable_forwarding().await {
                    record("disable forwarding", e.into());
                }
                if let Err(e) = gateway.remove_rules().await {
                    record("remove rules", e.into());
                }
            }
        }

        let substrate = self.executor.substrate();
        if self.started {
            if let Err(e) = substrate.stop().await {
                record("stop", e.into());
            }
            self.started = false;
        }
        if let Err(e) = substrate.cleanup().await {
            record("cleanup", e.into());
        }

        errors
    }
}
