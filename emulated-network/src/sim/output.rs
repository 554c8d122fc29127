//! Renders simulated results in the exact format of the real tools, so the same parsers handle
//! both substrates

use crate::convergence::status::{BridgeId, PortRole, PortState};
use crate::gateway::conntrack::ConntrackEntry;
use crate::gateway::rule::NatRule;
use crate::substrate::ExecOutput;
use std::fmt::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

pub(crate) enum ProbeReply {
    Echo { rtt: Duration, ttl: u8 },
    HostUnreachable { reporter: Ipv4Addr },
    Lost,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Output of `ping -c <n>`
pub(crate) fn ping(destination: Ipv4Addr, replies: &[ProbeReply]) -> ExecOutput {
    let mut out = format!("PING {destination} ({destination}) 56(84) bytes of data.\n");
    let mut rtts = Vec::new();
    let mut errors = 0;

    for (seq, reply) in replies.iter().enumerate() {
        let seq = seq + 1;
        match reply {
            ProbeReply::Echo { rtt, ttl } => {
                rtts.push(millis(*rtt));
                let _ = writeln!(
                    out,
                    "64 bytes from {destination}: icmp_seq={seq} ttl={ttl} time={:.1} ms",
                    millis(*rtt)
                );
            }
            ProbeReply::HostUnreachable { reporter } => {
                errors += 1;
                let _ = writeln!(
                    out,
                    "From {reporter} icmp_seq={seq} Destination Host Unreachable"
                );
            }
            ProbeReply::Lost => {}
        }
    }

    let sent = replies.len();
    let received = rtts.len();
    let loss = if sent == 0 {
        0
    } else {
        (sent - received) * 100 / sent
    };

    let _ = write!(out, "\n--- {destination} ping statistics ---\n{sent} packets transmitted, {received} received, ");
    if errors > 0 {
        let _ = write!(out, "+{errors} errors, ");
    }
    let _ = writeln!(out, "{loss}% packet loss, time {}ms", sent.saturating_sub(1) * 1000);

    if !rtts.is_empty() {
        let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().copied().fold(0.0, f64::max);
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        let mdev = (rtts.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / rtts.len() as f64).sqrt();
        let _ = writeln!(out, "rtt min/avg/max/mdev = {min:.3}/{avg:.3}/{max:.3}/{mdev:.3} ms");
    }

    ExecOutput {
        stdout: out,
        stderr: String::new(),
        status: if received > 0 { 0 } else { 1 },
    }
}

/// Output of `ping` when the kernel has no route at all
pub(crate) fn ping_no_route() -> ExecOutput {
    ExecOutput::failed(2, "ping: connect: Network is unreachable\n")
}

pub(crate) struct Transfer {
    pub(crate) local: (Ipv4Addr, u16),
    pub(crate) remote: (Ipv4Addr, u16),
    pub(crate) seconds: f64,
    pub(crate) bits_per_second: f64,
}

/// Output of `iperf3 -c ... -J`
pub(crate) fn iperf(transfer: &Transfer) -> ExecOutput {
    let bytes = (transfer.bits_per_second * transfer.seconds / 8.0) as u64;
    let sum = serde_json::json!({
        "start": 0,
        "end": transfer.seconds,
        "seconds": transfer.seconds,
        "bytes": bytes,
        "bits_per_second": transfer.bits_per_second,
    });
    let report = serde_json::json!({
        "start": {
            "connected": [{
                "local_host": transfer.local.0.to_string(),
                "local_port": transfer.local.1,
                "remote_host": transfer.remote.0.to_string(),
                "remote_port": transfer.remote.1,
            }],
        },
        "intervals": [],
        "end": {
            "sum_sent": sum.clone(),
            "sum_received": sum,
        },
    });

    ExecOutput::ok(format!("{report:#}\n"))
}

/// Output of `iperf3 -c ... -J` when the transfer never started
pub(crate) fn iperf_error(error: &str) -> ExecOutput {
    let report = serde_json::json!({
        "start": {},
        "intervals": [],
        "end": {},
        "error": error,
    });

    ExecOutput {
        stdout: format!("{report:#}\n"),
        stderr: String::new(),
        status: 1,
    }
}

pub(crate) struct StpPortView<'a> {
    pub(crate) interface: &'a str,
    pub(crate) port_no: u16,
    pub(crate) role: PortRole,
    pub(crate) state: PortState,
    pub(crate) cost: u32,
}

pub(crate) struct StpBridgeView<'a> {
    pub(crate) bridge: &'a str,
    pub(crate) bridge_id: BridgeId,
    pub(crate) root_id: BridgeId,
    /// Root port and root path cost, for bridges other than the root
    pub(crate) root_port: Option<(&'a str, u32)>,
    pub(crate) forward_delay: Duration,
    pub(crate) ports: Vec<StpPortView<'a>>,
}

/// Output of `ovs-appctl stp/show <bridge>`
pub(crate) fn stp_show(view: &StpBridgeView<'_>) -> ExecOutput {
    let timers = format!(
        "\tstp-hello-time\t2s\n\tstp-max-age\t20s\n\tstp-fwd-delay\t{}s\n",
        view.forward_delay.as_secs()
    );

    let mut out = format!("---- {} ----\nRoot ID:\n", view.bridge);
    let _ = writeln!(out, "\tstp-priority\t{}", view.root_id.priority);
    let _ = writeln!(out, "\tstp-system-id\t{}", view.root_id.system_id);
    match view.root_port {
        None => out.push_str("\tThis bridge is the root\n"),
        Some((port, cost)) => {
            let _ = writeln!(out, "\troot-port\t{port}\n\troot-path-cost\t{cost}");
        }
    }
    out.push_str(&timers);

    out.push_str("\nBridge ID:\n");
    let _ = writeln!(out, "\tstp-priority\t{}", view.bridge_id.priority);
    let _ = writeln!(out, "\tstp-system-id\t{}", view.bridge_id.system_id);
    out.push_str(&timers);

    out.push_str("\n\tInterface  Role       State      Cost       Pri.Nbr\n");
    out.push_str("\t---------- ---------- ---------- ---------- -------\n");
    for port in &view.ports {
        let _ = writeln!(
            out,
            "\t{:<10} {:<10} {:<10} {:<10} 128.{}",
            port.interface,
            port.role.as_str(),
            port.state.as_str(),
            port.cost,
            port.port_no
        );
    }

    ExecOutput::ok(out)
}

/// Output of `ovs-appctl stp/show` for a bridge without spanning tree
pub(crate) fn stp_disabled(bridge: &str) -> ExecOutput {
    ExecOutput::failed(2, format!("no such stp object \"{bridge}\"\novs-appctl: ovs-vswitchd: server returned an error\n"))
}

/// Output of `iptables-save`
pub(crate) fn iptables_save(nat: &[NatRule], filter: &[NatRule]) -> ExecOutput {
    let mut out = String::from("*nat\n");
    for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
        let _ = writeln!(out, ":{chain} ACCEPT [0:0]");
    }
    for rule in nat {
        let _ = writeln!(out, "{rule}");
    }
    out.push_str("COMMIT\n*filter\n:INPUT ACCEPT [0:0]\n:FORWARD DROP [0:0]\n:OUTPUT ACCEPT [0:0]\n");
    for rule in filter {
        let _ = writeln!(out, "{rule}");
    }
    out.push_str("COMMIT\n");

    ExecOutput::ok(out)
}

/// Output of `conntrack -L`
pub(crate) fn conntrack(entries: &[ConntrackEntry]) -> ExecOutput {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "{entry}");
    }

    ExecOutput {
        stdout: out,
        stderr: format!(
            "conntrack v1.4.6 (conntrack-tools): {} flow entries have been shown.\n",
            entries.len()
        ),
        status: 0,
    }
}
