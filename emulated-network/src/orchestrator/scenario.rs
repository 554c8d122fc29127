use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Display for Reachability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Reachable => f.write_str("reachable"),
            Reachability::Unreachable => f.write_str("unreachable"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScenarioKind {
    Connectivity {
        destination: Ipv4Addr,
        expect: Reachability,
        rounds: u32,
        /// Pause between consecutive rounds
        round_delay: Duration,
    },
    Throughput {
        /// Node running the server
        server: Arc<str>,
        /// Address the client connects to, which may be translated on the way
        destination: Ipv4Addr,
        port: u16,
        /// Overrides the configured transfer duration
        duration: Option<Duration>,
    },
}

/// A verification scenario, run from `source`
#[derive(Clone, Debug, PartialEq)]
pub struct Scenario {
    pub name: Arc<str>,
    pub source: Arc<str>,
    pub kind: ScenarioKind,
}

impl Scenario {
    pub fn ping(name: &str, source: &str, destination: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            kind: ScenarioKind::Connectivity {
                destination,
                expect: Reachability::Reachable,
                rounds: 1,
                round_delay: Duration::ZERO,
            },
        }
    }

    pub fn throughput(
        name: &str,
        client: &str,
        server: &str,
        destination: Ipv4Addr,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            source: client.into(),
            kind: ScenarioKind::Throughput {
                server: server.into(),
                destination,
                port,
                duration: None,
            },
        }
    }

    /// Only meaningful for connectivity scenarios
    pub fn expecting(mut self, reachability: Reachability) -> Self {
        if let ScenarioKind::Connectivity { expect, .. } = &mut self.kind {
            *expect = reachability;
        }
        self
    }

    /// Only meaningful for connectivity scenarios
    pub fn repeated(mut self, times: u32, delay: Duration) -> Self {
        if let ScenarioKind::Connectivity {
            rounds,
            round_delay,
            ..
        } = &mut self.kind
        {
            *rounds = times.max(1);
            *round_delay = delay;
        }
        self
    }

    pub fn destination(&self) -> Ipv4Addr {
        match &self.kind {
            ScenarioKind::Connectivity { destination, .. } => *destination,
            ScenarioKind::Throughput { destination, .. } => *destination,
        }
    }
}

impl Display for Scenario {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ScenarioKind::Connectivity {
                destination,
                expect,
                rounds,
                ..
            } => {
                write!(f, "{}: ping {} -> {destination} ({expect}", self.name, self.source)?;
                if *rounds > 1 {
                    write!(f, ", {rounds} rounds")?;
                }
                f.write_str(")")
            }
            ScenarioKind::Throughput {
                server,
                destination,
                port,
                ..
            } => write!(
                f,
                "{}: iperf {} -> {destination}:{port} (server on {server})",
                self.name, self.source
            ),
        }
    }
}
