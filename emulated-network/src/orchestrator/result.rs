use crate::util::serde_arc_str;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    Timeout,
    Unreachable,
}

impl Display for ProbeOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Success => f.write_str("success"),
            ProbeOutcome::Timeout => f.write_str("timeout"),
            ProbeOutcome::Unreachable => f.write_str("unreachable"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct ThroughputSample {
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
}

/// The outcome of a single probe attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestResult {
    #[serde(serialize_with = "serde_arc_str::serialize")]
    pub scenario: Arc<str>,
    #[serde(serialize_with = "serde_arc_str::serialize")]
    pub source: Arc<str>,
    pub destination: Ipv4Addr,
    /// 1-based
    pub round: u32,
    /// 1-based, within the round
    pub attempt: u32,
    pub outcome: ProbeOutcome,
    pub latency_samples: Vec<Duration>,
    pub throughput: Option<ThroughputSample>,
}

impl Display for TestResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "round {} attempt {}: {} -> {}: {}",
            self.round, self.attempt, self.source, self.destination, self.outcome
        )?;

        if let Some(rtt) = self.latency_samples.first() {
            write!(f, " (rtt {:.1} ms)", rtt.as_secs_f64() * 1000.0)?;
        }
        if let Some(sample) = &self.throughput {
            write!(
                f,
                " ({:.2} Mbit/s over {:.1} s)",
                sample.bits_per_second / 1_000_000.0,
                sample.seconds
            )?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScenarioReport {
    #[serde(serialize_with = "serde_arc_str::serialize")]
    pub name: Arc<str>,
    pub passed: bool,
    pub results: Vec<TestResult>,
    /// Set when the scenario could not run its probes at all
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn attempts(&self) -> usize {
        self.results.len()
    }
}
