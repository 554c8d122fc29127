//! Interpretation of the output of `ping` and `iperf3 -J`

use crate::orchestrator::result::{ProbeOutcome, ThroughputSample};
use crate::substrate::ExecOutput;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

const UNREACHABLE_MARKERS: [&str; 3] = [
    "Network is unreachable",
    "Destination Host Unreachable",
    "No route to host",
];

#[derive(Clone, Debug, PartialEq)]
pub struct PingReport {
    pub outcome: ProbeOutcome,
    pub rtts: Vec<Duration>,
}

pub fn parse_ping(output: &ExecOutput) -> PingReport {
    let rtts: Vec<Duration> = output
        .stdout
        .lines()
        .filter_map(|l| l.split_once("time=")?.1.strip_suffix(" ms"))
        .filter_map(|ms| ms.trim().parse::<f64>().ok())
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .collect();

    let unreachable = || {
        UNREACHABLE_MARKERS
            .iter()
            .any(|m| output.stdout.contains(m) || output.stderr.contains(m))
    };

    let outcome = if output.success() && !rtts.is_empty() {
        ProbeOutcome::Success
    } else if unreachable() {
        ProbeOutcome::Unreachable
    } else {
        ProbeOutcome::Timeout
    };

    PingReport { outcome, rtts }
}

#[derive(Clone, Debug, PartialEq)]
pub enum IperfReport {
    Transfer(ThroughputSample),
    /// Nothing was listening yet
    Refused,
    Failed(String),
}

#[derive(Deserialize)]
struct IperfJson {
    #[serde(default)]
    end: IperfEnd,
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct IperfEnd {
    sum_sent: Option<IperfSum>,
    sum_received: Option<IperfSum>,
}

#[derive(Deserialize)]
struct IperfSum {
    seconds: f64,
    bytes: u64,
    bits_per_second: f64,
}

pub fn parse_iperf(output: &ExecOutput) -> anyhow::Result<IperfReport> {
    let report: IperfJson =
        serde_json::from_str(&output.stdout).context("iperf3 did not produce a JSON report")?;

    if let Some(error) = report.error {
        if error.contains("Connection refused") {
            return Ok(IperfReport::Refused);
        }
        return Ok(IperfReport::Failed(error));
    }

    let sum = report
        .end
        .sum_received
        .or(report.end.sum_sent)
        .context("the iperf3 report has no summary")?;
    Ok(IperfReport::Transfer(ThroughputSample {
        seconds: sum.seconds,
        bytes: sum.bytes,
        bits_per_second: sum.bits_per_second,
    }))
}

/// How a failed transfer is recorded
pub fn failure_outcome(error: &str) -> ProbeOutcome {
    if UNREACHABLE_MARKERS.iter().any(|m| error.contains(m)) {
        ProbeOutcome::Unreachable
    } else {
        ProbeOutcome::Timeout
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let stdout = "\
PING 10.0.0.8 (10.0.0.8) 56(84) bytes of data.
64 bytes from 10.0.0.8: icmp_seq=1 ttl=64 time=38.2 ms

--- 10.0.0.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 38.200/38.200/38.200/0.000 ms
";
        let report = parse_ping(&ExecOutput::ok(stdout));
        assert_eq!(report.outcome, ProbeOutcome::Success);
        assert_eq!(report.rtts, [Duration::from_micros(38_200)]);

        let lost = "\
PING 10.0.0.8 (10.0.0.8) 56(84) bytes of data.

--- 10.0.0.8 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms
";
        let report = parse_ping(&ExecOutput {
            stdout: lost.to_string(),
            stderr: String::new(),
            status: 1,
        });
        assert_eq!(report.outcome, ProbeOutcome::Timeout);
        assert!(report.rtts.is_empty());

        let report = parse_ping(&ExecOutput::failed(
            2,
            "ping: connect: Network is unreachable\n",
        ));
        assert_eq!(report.outcome, ProbeOutcome::Unreachable);

        let unreachable = "\
PING 10.1.1.2 (10.1.1.2) 56(84) bytes of data.
From 10.0.0.1 icmp_seq=1 Destination Host Unreachable
";
        let report = parse_ping(&ExecOutput {
            stdout: unreachable.to_string(),
            stderr: String::new(),
            status: 1,
        });
        assert_eq!(report.outcome, ProbeOutcome::Unreachable);
    }

    #[test]
    fn test_parse_iperf() {
        let stdout = r#"{
            "start": {"connected": [{"local_host": "10.0.0.9", "local_port": 40001}]},
            "intervals": [],
            "end": {
                "sum_sent": {"start": 0, "end": 10.0, "seconds": 10.0, "bytes": 125000000, "bits_per_second": 100000000.0, "retransmits": 0},
                "sum_received": {"start": 0, "end": 10.04, "seconds": 10.04, "bytes": 124000000, "bits_per_second": 98804780.8}
            }
        }"#;
        let report = parse_iperf(&ExecOutput::ok(stdout)).unwrap();
        let IperfReport::Transfer(sample) = report else {
            panic!("expected a transfer");
        };
        assert_eq!(sample.seconds, 10.04);
        assert_eq!(sample.bytes, 124000000);

        let refused = r#"{"start": {}, "intervals": [], "end": {}, "error": "unable to connect to server: Connection refused"}"#;
        assert_eq!(
            parse_iperf(&ExecOutput::ok(refused)).unwrap(),
            IperfReport::Refused
        );

        let unreachable = r#"{"start": {}, "intervals": [], "end": {}, "error": "unable to connect to server: No route to host"}"#;
        let IperfReport::Failed(error) = parse_iperf(&ExecOutput::ok(unreachable)).unwrap() else {
            panic!("expected a failure");
        };
        assert_eq!(failure_outcome(&error), ProbeOutcome::Unreachable);

        assert!(parse_iperf(&ExecOutput::ok("iperf3: command not found")).is_err());
    }
}
