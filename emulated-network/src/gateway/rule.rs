//! Typed NAT and filter rules, rendered to `iptables` arguments

use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::topology::ip::Ipv4Cidr;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

/// The chains are declared in the order a forwarded packet traverses them
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Prerouting,
    Forward,
    Postrouting,
}

impl Chain {
    pub fn as_str(self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Forward => "FORWARD",
            Chain::Postrouting => "POSTROUTING",
        }
    }

    pub fn table(self) -> Table {
        match self {
            Chain::Prerouting | Chain::Postrouting => Table::Nat,
            Chain::Forward => Table::Filter,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    pub fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "icmp" => Some(Protocol::Icmp),
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleMatch {
    pub source: Option<Ipv4Cidr>,
    pub destination: Option<Ipv4Addr>,
    pub destination_port: Option<u16>,
    pub in_interface: Option<Arc<str>>,
    pub out_interface: Option<Arc<str>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleTarget {
    Masquerade,
    Dnat {
        address: Ipv4Addr,
        port: Option<u16>,
    },
    Accept,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatRule {
    pub chain: Chain,
    pub protocol: Option<Protocol>,
    pub matches: RuleMatch,
    pub target: RuleTarget,
}

impl NatRule {
    /// Rewrites the source of everything from `subnet` leaving through `public_interface`
    pub fn masquerade(subnet: Ipv4Cidr, public_interface: &Arc<str>) -> Self {
        Self {
            chain: Chain::Postrouting,
            protocol: None,
            matches: RuleMatch {
                source: Some(subnet.subnet()),
                out_interface: Some(public_interface.clone()),
                ..RuleMatch::default()
            },
            target: RuleTarget::Masquerade,
        }
    }

    /// Translates `public` (and `public_port`, if any) entering through `public_interface` into
    /// `private` (and `private_port`)
    pub fn port_forward(
        public_interface: &Arc<str>,
        protocol: Protocol,
        public: Ipv4Addr,
        public_port: Option<u16>,
        private: Ipv4Addr,
        private_port: Option<u16>,
    ) -> Self {
        Self {
            chain: Chain::Prerouting,
            protocol: Some(protocol),
            matches: RuleMatch {
                destination: Some(public),
                destination_port: public_port,
                in_interface: Some(public_interface.clone()),
                ..RuleMatch::default()
            },
            target: RuleTarget::Dnat {
                address: private,
                port: private_port,
            },
        }
    }

    pub fn forward_accept(in_interface: &Arc<str>, out_interface: &Arc<str>) -> Self {
        Self {
            chain: Chain::Forward,
            protocol: None,
            matches: RuleMatch {
                in_interface: Some(in_interface.clone()),
                out_interface: Some(out_interface.clone()),
                ..RuleMatch::default()
            },
            target: RuleTarget::Accept,
        }
    }

    pub fn table(&self) -> Table {
        self.chain.table()
    }

    /// Installation order: the catch-all translation first, then destination-specific
    /// translations, then the filter rules
    pub(crate) fn install_rank(&self) -> u8 {
        match self.target {
            RuleTarget::Masquerade => 0,
            RuleTarget::Dnat { .. } => 1,
            RuleTarget::Accept => 2,
        }
    }

    /// The rule specification, as understood by both `iptables -A` and `iptables-save`
    fn spec_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(protocol) = self.protocol {
            args.extend(["-p".to_string(), protocol.as_str().to_string()]);
        }
        if let Some(source) = self.matches.source {
            args.extend(["-s".to_string(), source.to_string()]);
        }
        if let Some(destination) = self.matches.destination {
            args.extend(["-d".to_string(), format!("{destination}/32")]);
        }
        if let Some(interface) = &self.matches.in_interface {
            args.extend(["-i".to_string(), interface.to_string()]);
        }
        if let Some(interface) = &self.matches.out_interface {
            args.extend(["-o".to_string(), interface.to_string()]);
        }
        if let Some(port) = self.matches.destination_port {
            args.extend(["--dport".to_string(), port.to_string()]);
        }

        match &self.target {
            RuleTarget::Masquerade => args.extend(["-j".to_string(), "MASQUERADE".to_string()]),
            RuleTarget::Accept => args.extend(["-j".to_string(), "ACCEPT".to_string()]),
            RuleTarget::Dnat { address, port } => {
                args.extend(["-j".to_string(), "DNAT".to_string()]);
                args.push("--to-destination".to_string());
                match port {
                    Some(port) => args.push(format!("{address}:{port}")),
                    None => args.push(address.to_string()),
                }
            }
        }

        args
    }

    /// Full argument list for `iptables`, appending the rule to its chain
    pub fn iptables_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table().as_str().to_string(),
            "-A".to_string(),
            self.chain.as_str().to_string(),
        ];
        args.extend(self.spec_args());
        args
    }
}

/// Renders the rule the way `iptables-save` prints it
impl Display for NatRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "-A {} {}", self.chain.as_str(), self.spec_args().join(" "))
    }
}
