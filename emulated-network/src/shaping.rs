//! Link emulation parameters and their translation into `tc netem` arguments

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shaping applied to both directions of a link.
///
/// All fields are optional; a link without any shaping is handed to the substrate as-is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkShaping {
    /// One-way delay
    pub delay: Option<Duration>,
    pub jitter: Option<Duration>,
    /// Bandwidth, in megabits per second
    pub bandwidth_mbps: Option<f64>,
    pub loss_percent: Option<f32>,
}

impl LinkShaping {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn is_unshaped(&self) -> bool {
        self.delay.is_none()
            && self.jitter.is_none()
            && self.bandwidth_mbps.is_none()
            && self.loss_percent.is_none()
    }

    pub fn one_way_delay(&self) -> Duration {
        self.delay.unwrap_or_default()
    }

    /// IEEE 802.1D-1998 path cost for a port attached to this link.
    ///
    /// Unshaped veth pairs report 10 Gbit/s to the bridge.
    pub fn stp_path_cost(&self) -> u32 {
        let mbps = self.bandwidth_mbps.unwrap_or(10_000.0);
        match mbps {
            m if m >= 10_000.0 => 2,
            m if m >= 1_000.0 => 4,
            m if m >= 100.0 => 19,
            m if m >= 16.0 => 62,
            m if m >= 10.0 => 100,
            m if m >= 4.0 => 250,
            _ => 500,
        }
    }
}

impl Display for LinkShaping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unshaped() {
            return f.write_str("unshaped");
        }

        let mut parts = Vec::new();
        if let Some(delay) = self.delay {
            parts.push(format!("delay {}ms", delay.as_millis()));
        }
        if let Some(jitter) = self.jitter {
            parts.push(format!("jitter {}ms", jitter.as_millis()));
        }
        if let Some(bandwidth) = self.bandwidth_mbps {
            parts.push(format!("rate {bandwidth}mbit"));
        }
        if let Some(loss) = self.loss_percent {
            parts.push(format!("loss {loss}%"));
        }

        f.write_str(&parts.join(", "))
    }
}

/// Builds the arguments for `tc` that install `shaping` as the root qdisc of `interface`.
///
/// Returns `None` when there is nothing to shape. `qdisc replace` is used so that reapplying
/// the same shaping is harmless.
pub fn netem_args(interface: &str, shaping: &LinkShaping) -> Option<Vec<String>> {
    if shaping.is_unshaped() {
        return None;
    }

    let mut args: Vec<String> = vec![
        "qdisc".into(),
        "replace".into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "netem".into(),
    ];

    // With a rate limit, netem needs a finite queue or it will buffer without bound. Size it to
    // roughly twice the bandwidth-delay product, with a floor of 20 packets.
    if let Some(rate_mbps) = shaping.bandwidth_mbps {
        let rtt_ms = shaping.delay.map(|d| d.as_millis() as u64).unwrap_or(20) * 2;
        let bdp_bytes = (rate_mbps * 1_000_000.0 / 8.0) as u64 * rtt_ms / 1000;
        let bdp_packets = bdp_bytes / 1400;
        args.push("limit".into());
        args.push(std::cmp::max(bdp_packets * 2, 20).to_string());
    }

    if let Some(delay) = shaping.delay {
        args.push("delay".into());
        args.push(format!("{}ms", delay.as_millis()));

        if let Some(jitter) = shaping.jitter.filter(|j| !j.is_zero()) {
            args.push(format!("{}ms", jitter.as_millis()));
        }
    }

    if let Some(loss) = shaping.loss_percent {
        args.push("loss".into());
        args.push(format!("{loss}%"));
    }

    if let Some(rate_mbps) = shaping.bandwidth_mbps {
        args.push("rate".into());
        args.push(format!("{}kbit", (rate_mbps * 1000.0).round() as u64));
    }

    Some(args)
}
