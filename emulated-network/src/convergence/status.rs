//! Parsing of `ovs-appctl stp/show` output

use crate::topology::MacAddr;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortRole {
    Root,
    Designated,
    Alternate,
    Backup,
    Disabled,
}

impl PortRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PortRole::Root => "root",
            PortRole::Designated => "designated",
            PortRole::Alternate => "alternate",
            PortRole::Backup => "backup",
            PortRole::Disabled => "disabled",
        }
    }
}

impl FromStr for PortRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "root" => PortRole::Root,
            "designated" => PortRole::Designated,
            "alternate" => PortRole::Alternate,
            "backup" => PortRole::Backup,
            "disabled" => PortRole::Disabled,
            _ => anyhow::bail!("unknown port role `{s}`"),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortState {
    Disabled,
    Blocking,
    Listening,
    Learning,
    Forwarding,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Disabled => "disabled",
            PortState::Blocking => "blocking",
            PortState::Listening => "listening",
            PortState::Learning => "learning",
            PortState::Forwarding => "forwarding",
        }
    }

    /// Listening and learning are the transitional states
    pub fn is_transitional(self) -> bool {
        matches!(self, PortState::Listening | PortState::Learning)
    }
}

impl FromStr for PortState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "disabled" => PortState::Disabled,
            "blocking" => PortState::Blocking,
            "listening" => PortState::Listening,
            "learning" => PortState::Learning,
            "forwarding" => PortState::Forwarding,
            _ => anyhow::bail!("unknown port state `{s}`"),
        })
    }
}

/// A bridge identifier; lower values win the root election
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId {
    pub priority: u16,
    pub system_id: MacAddr,
}

impl Display for BridgeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}.", self.priority)?;
        for byte in self.system_id.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub interface: Arc<str>,
    pub role: PortRole,
    pub state: PortState,
    pub cost: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeStatus {
    pub bridge: Arc<str>,
    pub bridge_id: BridgeId,
    pub root_id: BridgeId,
    pub is_root: bool,
    pub ports: Vec<PortStatus>,
}

impl BridgeStatus {
    /// No port is still listening or learning
    pub fn is_stable(&self) -> bool {
        self.ports.iter().all(|p| !p.state.is_transitional())
    }

    pub fn port(&self, interface: &str) -> Option<&PortStatus> {
        self.ports.iter().find(|p| &*p.interface == interface)
    }
}

fn parse_mac(s: &str) -> anyhow::Result<MacAddr> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut bytes {
        let part = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("truncated system id `{s}`"))?;
        *byte = u8::from_str_radix(part, 16)?;
    }

    if parts.next().is_some() {
        anyhow::bail!("system id `{s}` is too long");
    }

    Ok(MacAddr(bytes))
}

fn parse_priority(s: &str) -> anyhow::Result<u16> {
    match s.strip_prefix("0x") {
        Some(hex) => Ok(u16::from_str_radix(hex, 16)?),
        None => Ok(s.parse()?),
    }
}

#[derive(Default)]
struct IdBuilder {
    priority: Option<u16>,
    system_id: Option<MacAddr>,
}

impl IdBuilder {
    fn build(self, section: &str) -> anyhow::Result<BridgeId> {
        match (self.priority, self.system_id) {
            (Some(priority), Some(system_id)) => Ok(BridgeId {
                priority,
                system_id,
            }),
            _ => anyhow::bail!("incomplete `{section}` section"),
        }
    }
}

/// Parses the status of a single bridge
pub fn parse_stp_show(output: &str) -> anyhow::Result<BridgeStatus> {
    enum Section {
        Preamble,
        Root,
        Bridge,
        Ports,
    }

    let mut bridge = None;
    let mut section = Section::Preamble;
    let mut root = IdBuilder::default();
    let mut own = IdBuilder::default();
    let mut is_root = false;
    let mut ports = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // The header (`---- s1 ----`) comes first, later dashed lines are table rulers
        if bridge.is_none() {
            if let Some(name) = trimmed
                .strip_prefix("---- ")
                .and_then(|rest| rest.strip_suffix(" ----"))
            {
                bridge = Some(name.trim().to_string());
            }
            continue;
        }

        match trimmed {
            "Root ID:" => {
                section = Section::Root;
                continue;
            }
            "Bridge ID:" => {
                section = Section::Bridge;
                continue;
            }
            "This bridge is the root" => {
                is_root = true;
                continue;
            }
            _ => {}
        }

        if trimmed.starts_with("Interface") {
            section = Section::Ports;
            continue;
        }
        if trimmed.starts_with("----") {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        match section {
            Section::Preamble => {}
            Section::Root | Section::Bridge => {
                let id = match section {
                    Section::Root => &mut root,
                    _ => &mut own,
                };
                match (fields.next(), fields.next()) {
                    (Some("stp-priority"), Some(value)) => {
                        id.priority = Some(parse_priority(value)?)
                    }
                    (Some("stp-system-id"), Some(value)) => id.system_id = Some(parse_mac(value)?),
                    _ => {}
                }
            }
            Section::Ports => {
                let (Some(interface), Some(role), Some(state), Some(cost)) =
                    (fields.next(), fields.next(), fields.next(), fields.next())
                else {
                    anyhow::bail!("malformed port line `{trimmed}`");
                };
                ports.push(PortStatus {
                    interface: interface.into(),
                    role: role.parse()?,
                    state: state.parse()?,
                    cost: cost.parse()?,
                });
            }
        }
    }

    let bridge = bridge.ok_or_else(|| anyhow::anyhow!("missing bridge header"))?;
    let bridge_id = own.build("Bridge ID")?;
    let root_id = root.build("Root ID")?;

    Ok(BridgeStatus {
        bridge: bridge.into(),
        bridge_id,
        root_id,
        is_root: is_root || root_id == bridge_id,
        ports,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const NON_ROOT: &str = "\
---- s2 ----
Root ID:
\tstp-priority\t4096
\tstp-system-id\t00:00:00:00:00:01
\troot-port\ts2-eth0
\troot-path-cost\t2
\tstp-hello-time\t2s
\tstp-max-age\t20s
\tstp-fwd-delay\t15s

Bridge ID:
\tstp-priority\t32768
\tstp-system-id\t00:00:00:00:00:02
\tstp-hello-time\t2s
\tstp-max-age\t20s
\tstp-fwd-delay\t15s

\tInterface  Role       State      Cost       Pri.Nbr
\t---------- ---------- ---------- ---------- -------
\ts2-eth0    root       forwarding 2          128.1
\ts2-eth1    alternate  blocking   2          128.2
\ts2-eth2    designated learning   2          128.3
";

    #[test]
    fn test_parse_non_root_bridge() {
        let status = parse_stp_show(NON_ROOT).unwrap();
        assert_eq!(&*status.bridge, "s2");
        assert!(!status.is_root);
        assert_eq!(status.root_id.priority, 4096);
        assert_eq!(status.bridge_id.to_string(), "8000.000000000002");
        assert_eq!(status.ports.len(), 3);
        assert_eq!(status.port("s2-eth1").unwrap().role, PortRole::Alternate);
        assert!(!status.is_stable());
    }

    #[test]
    fn test_root_flag() {
        let output = "\
---- s1 ----
Root ID:
\tstp-priority\t4096
\tstp-system-id\t00:00:00:00:00:01
\tThis bridge is the root

Bridge ID:
\tstp-priority\t4096
\tstp-system-id\t00:00:00:00:00:01

\tInterface  Role       State      Cost       Pri.Nbr
\t---------- ---------- ---------- ---------- -------
\ts1-eth0    designated forwarding 2          128.1
";
        let status = parse_stp_show(output).unwrap();
        assert!(status.is_root);
        assert!(status.is_stable());
    }

    #[test]
    fn test_rejects_incomplete_output() {
        assert!(parse_stp_show("").is_err());
        assert!(parse_stp_show("---- s1 ----\nBridge ID:\n\tstp-priority\t4096\n").is_err());
    }
}
