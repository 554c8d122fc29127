use crate::convergence::ConvergenceSettings;
use crate::orchestrator::ProbeSettings;
use std::time::Duration;

/// Every wait and retry bound of a run
#[derive(Clone, Debug, PartialEq)]
pub struct Tunables {
    pub poll_interval: Duration,
    pub convergence_timeout: Duration,
    /// Pause between gateway configuration and the first test
    pub settle_delay: Duration,
    pub probe_count: u32,
    pub probe_timeout: Duration,
    pub throughput_duration: Duration,
    pub scenario_timeout: Duration,
    pub server_settle: Duration,
    pub throughput_tolerance: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            convergence_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(15),
            probe_count: 3,
            probe_timeout: Duration::from_secs(2),
            throughput_duration: Duration::from_secs(10),
            scenario_timeout: Duration::from_secs(300),
            server_settle: Duration::from_secs(2),
            throughput_tolerance: Duration::from_secs(2),
        }
    }
}

impl Tunables {
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            count: self.probe_count,
            timeout: self.probe_timeout,
            scenario_timeout: self.scenario_timeout,
            throughput_duration: self.throughput_duration,
            server_settle: self.server_settle,
            tolerance: self.throughput_tolerance,
        }
    }

    /// Overrides the polling bounds of `settings` with ours
    pub fn apply_to(&self, mut settings: ConvergenceSettings) -> ConvergenceSettings {
        settings.poll_interval = self.poll_interval;
        settings.timeout = self.convergence_timeout;
        settings
    }
}
