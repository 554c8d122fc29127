use crate::gateway::rule::{NatRule, Table};
use crate::topology::ip::Ipv4Cidr;
use crate::topology::route::Route;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// A command executed on a node.
///
/// Every variant maps to the argv of a standard Linux networking tool, so the same command can be
/// spawned for real or interpreted by the simulated substrate.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeCommand {
    FlushAddresses {
        interface: Arc<str>,
    },
    AddAddress {
        interface: Arc<str>,
        address: Ipv4Cidr,
    },
    LinkUp {
        interface: Arc<str>,
    },
    ReplaceRoute(Route),
    SetIpForward(bool),
    GetIpForward,
    IptablesFlush(Table),
    IptablesAppend(NatRule),
    IptablesSave,
    ConntrackList,
    StpEnable {
        bridge: Arc<str>,
        enabled: bool,
    },
    StpPriority {
        bridge: Arc<str>,
        priority: u16,
    },
    StpShow {
        bridge: Arc<str>,
    },
    Ping {
        destination: Ipv4Addr,
        count: u32,
        timeout: Duration,
    },
    IperfServer {
        port: u16,
    },
    IperfClient {
        destination: Ipv4Addr,
        port: u16,
        duration: Duration,
    },
    KillIperf,
    /// Free-form shell command, only issued from the inspection shell
    Raw(String),
}

impl NodeCommand {
    pub fn argv(&self) -> Vec<String> {
        fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
            parts.iter().map(|s| s.to_string()).collect()
        }

        match self {
            NodeCommand::FlushAddresses { interface } => {
                argv(["ip", "addr", "flush", "dev", interface])
            }
            NodeCommand::AddAddress { interface, address } => {
                argv(["ip", "addr", "add", &address.to_string(), "dev", interface])
            }
            NodeCommand::LinkUp { interface } => argv(["ip", "link", "set", interface, "up"]),
            NodeCommand::ReplaceRoute(route) => argv([
                "ip",
                "route",
                "replace",
                &route.destination.to_string(),
                "via",
                &route.next.to_string(),
            ]),
            NodeCommand::SetIpForward(enabled) => argv([
                "sysctl",
                "-w",
                &format!("net.ipv4.ip_forward={}", u8::from(*enabled)),
            ]),
            NodeCommand::GetIpForward => argv(["sysctl", "-n", "net.ipv4.ip_forward"]),
            NodeCommand::IptablesFlush(table) => argv(["iptables", "-t", table.as_str(), "-F"]),
            NodeCommand::IptablesAppend(rule) => {
                let mut args = vec!["iptables".to_string()];
                args.extend(rule.iptables_args());
                args
            }
            NodeCommand::IptablesSave => argv(["iptables-save"]),
            NodeCommand::ConntrackList => argv(["conntrack", "-L"]),
            NodeCommand::StpEnable { bridge, enabled } => argv([
                "ovs-vsctl",
                "set",
                "bridge",
                bridge,
                &format!("stp_enable={enabled}"),
            ]),
            NodeCommand::StpPriority { bridge, priority } => argv([
                "ovs-vsctl",
                "set",
                "bridge",
                bridge,
                &format!("other_config:stp-priority={priority:#06x}"),
            ]),
            NodeCommand::StpShow { bridge } => argv(["ovs-appctl", "stp/show", bridge]),
            NodeCommand::Ping {
                destination,
                count,
                timeout,
            } => argv([
                "ping",
                "-c",
                &count.to_string(),
                "-W",
                &whole_seconds(*timeout).to_string(),
                &destination.to_string(),
            ]),
            NodeCommand::IperfServer { port } => {
                argv(["iperf3", "-s", "-p", &port.to_string(), "-D"])
            }
            NodeCommand::IperfClient {
                destination,
                port,
                duration,
            } => argv([
                "iperf3",
                "-c",
                &destination.to_string(),
                "-p",
                &port.to_string(),
                "-t",
                &whole_seconds(*duration).to_string(),
                "-J",
            ]),
            NodeCommand::KillIperf => argv(["pkill", "-f", "iperf3"]),
            NodeCommand::Raw(command) => argv(["sh", "-c", command]),
        }
    }
}

/// The tools only accept whole seconds, and zero means "forever" for most of them
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs_f64().ceil().max(1.0) as u64
}

impl Display for NodeCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let NodeCommand::Raw(command) = self {
            return write!(f, "sh -c '{command}'");
        }

        f.write_str(&self.argv().join(" "))
    }
}
