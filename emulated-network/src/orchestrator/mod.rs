//! Sequential verification scenarios: connectivity probes and throughput transfers
//!
//! Probe failures are results, never errors. A substrate error only ends the scenario it
//! happened in.

pub mod probe;
pub mod result;
pub mod scenario;

use crate::orchestrator::probe::{IperfReport, failure_outcome, parse_iperf, parse_ping};
use crate::orchestrator::result::{ProbeOutcome, ScenarioReport, TestResult};
use crate::orchestrator::scenario::{Reachability, Scenario, ScenarioKind};
use crate::substrate::{Executor, NodeCommand, Substrate, SubstrateError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Pause before retrying a probe that failed straight away
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ProbeSettings {
    /// Attempts per round (connectivity) or connection attempts (throughput)
    pub count: u32,
    /// Per-attempt timeout of a ping
    pub timeout: Duration,
    /// Hard wall-clock limit of a scenario
    pub scenario_timeout: Duration,
    pub throughput_duration: Duration,
    /// Wait between starting a throughput server and the first client attempt
    pub server_settle: Duration,
    /// Slack allowed on top of the requested transfer duration
    pub tolerance: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            count: 3,
            timeout: Duration::from_secs(2),
            scenario_timeout: Duration::from_secs(300),
            throughput_duration: Duration::from_secs(10),
            server_settle: Duration::from_secs(2),
            tolerance: Duration::from_secs(2),
        }
    }
}

pub struct Orchestrator<S> {
    executor: Arc<Executor<S>>,
    settings: ProbeSettings,
}

struct Attempt<'a> {
    scenario: &'a Scenario,
    destination: Ipv4Addr,
    round: u32,
}

impl Attempt<'_> {
    fn result(&self, attempt: u32, outcome: ProbeOutcome) -> TestResult {
        TestResult {
            scenario: self.scenario.name.clone(),
            source: self.scenario.source.clone(),
            destination: self.destination,
            round: self.round,
            attempt,
            outcome,
            latency_samples: Vec::new(),
            throughput: None,
        }
    }
}

impl<S: Substrate> Orchestrator<S> {
    pub fn new(executor: Arc<Executor<S>>, settings: ProbeSettings) -> Self {
        Self { executor, settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Runs every scenario in order; a failing one does not stop the rest
    pub async fn run_all(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(scenario).await);
        }
        reports
    }

    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        tracing::info!("running {scenario}");

        let mut results = Vec::new();
        let outcome = tokio::time::timeout(
            self.settings.scenario_timeout,
            self.run_probes(scenario, &mut results),
        )
        .await;

        let (passed, error) = match outcome {
            Ok(Ok(passed)) => (passed, None),
            Ok(Err(e)) => {
                tracing::warn!("{}: {e}", scenario.name);
                (false, Some(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    "{}: timed out after {:?}",
                    scenario.name,
                    self.settings.scenario_timeout
                );
                let (round, next) = results
                    .last()
                    .map(|r| (r.round, r.attempt + 1))
                    .unwrap_or((1, 1));
                let attempt = Attempt {
                    scenario,
                    destination: scenario.destination(),
                    round,
                };
                results.push(attempt.result(next, ProbeOutcome::Timeout));
                (false, None)
            }
        };

        // The server goes away whatever happened to the client
        if let ScenarioKind::Throughput { server, .. } = &scenario.kind {
            if let Err(e) = self.executor.exec(server, &NodeCommand::KillIperf).await {
                tracing::warn!("unable to stop the throughput server on {server}: {e}");
            }
        }

        tracing::info!(
            "{}: {}",
            scenario.name,
            if passed { "passed" } else { "failed" }
        );
        ScenarioReport {
            name: scenario.name.clone(),
            passed,
            results,
            error,
        }
    }

    async fn run_probes(
        &self,
        scenario: &Scenario,
        results: &mut Vec<TestResult>,
    ) -> Result<bool, SubstrateError> {
        match &scenario.kind {
            ScenarioKind::Connectivity {
                destination,
                expect,
                rounds,
                round_delay,
            } => {
                let mut passed = true;
                for round in 1..=*rounds {
                    if round > 1 {
                        tokio::time::sleep(*round_delay).await;
                    }

                    let attempt = Attempt {
                        scenario,
                        destination: *destination,
                        round,
                    };
                    let reached = self.ping_round(&attempt, *expect, results).await?;
                    passed &= match expect {
                        Reachability::Reachable => reached,
                        Reachability::Unreachable => !reached,
                    };
                }
                Ok(passed)
            }
            ScenarioKind::Throughput {
                server,
                destination,
                port,
                duration,
            } => {
                let attempt = Attempt {
                    scenario,
                    destination: *destination,
                    round: 1,
                };
                let duration = duration.unwrap_or(self.settings.throughput_duration);
                self.transfer(&attempt, server, *port, duration, results)
                    .await
            }
        }
    }

    /// Pings until one attempt succeeds or the attempts run out. Returns whether the
    /// destination answered.
    async fn ping_round(
        &self,
        attempt: &Attempt<'_>,
        expect: Reachability,
        results: &mut Vec<TestResult>,
    ) -> Result<bool, SubstrateError> {
        let command = NodeCommand::Ping {
            destination: attempt.destination,
            count: 1,
            timeout: self.settings.timeout,
        };

        for n in 1..=self.settings.count {
            let output = self
                .executor
                .exec(&attempt.scenario.source, &command)
                .await?;
            let report = parse_ping(&output);

            let mut result = attempt.result(n, report.outcome);
            result.latency_samples = report.rtts;
            tracing::debug!("{}: {result}", attempt.scenario.name);
            results.push(result);

            match report.outcome {
                ProbeOutcome::Success => return Ok(true),
                ProbeOutcome::Unreachable if expect == Reachability::Unreachable => break,
                // Without a route the kernel answers at once, retrying right away is pointless
                ProbeOutcome::Unreachable if n < self.settings.count => {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                _ => {}
            }
        }

        Ok(false)
    }

    async fn transfer(
        &self,
        attempt: &Attempt<'_>,
        server: &Arc<str>,
        port: u16,
        duration: Duration,
        results: &mut Vec<TestResult>,
    ) -> Result<bool, SubstrateError> {
        self.executor
            .exec_checked(server, &NodeCommand::IperfServer { port })
            .await?;
        tokio::time::sleep(self.settings.server_settle).await;

        let command = NodeCommand::IperfClient {
            destination: attempt.destination,
            port,
            duration,
        };
        for n in 1..=self.settings.count {
            let output = self
                .executor
                .exec(&attempt.scenario.source, &command)
                .await?;

            let report = match parse_iperf(&output) {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("{}: {e:#}", attempt.scenario.name);
                    results.push(attempt.result(n, ProbeOutcome::Timeout));
                    return Ok(false);
                }
            };

            match report {
                IperfReport::Transfer(sample) => {
                    let limit = (duration + self.settings.tolerance).as_secs_f64();
                    let in_time = (0.0..=limit).contains(&sample.seconds);
                    let outcome = if in_time {
                        ProbeOutcome::Success
                    } else {
                        ProbeOutcome::Timeout
                    };

                    let mut result = attempt.result(n, outcome);
                    result.throughput = Some(sample);
                    tracing::debug!("{}: {result}", attempt.scenario.name);
                    results.push(result);
                    return Ok(in_time);
                }
                IperfReport::Refused => {
                    tracing::warn!(
                        "{}: connection refused by {server}, retrying",
                        attempt.scenario.name
                    );
                    results.push(attempt.result(n, ProbeOutcome::Unreachable));
                    tokio::time::sleep(self.settings.server_settle.max(RETRY_BACKOFF)).await;
                }
                IperfReport::Failed(error) => {
                    tracing::debug!("{}: {error}", attempt.scenario.name);
                    results.push(attempt.result(n, failure_outcome(&error)));
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }
}
