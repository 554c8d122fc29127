//! Connection tracking entries, in the format printed by `conntrack -L`

use crate::gateway::rule::Protocol;
use crate::util::key_values;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// One direction of a tracked flow.
///
/// ICMP has no ports: the echo identifier is kept in `source_port` of the original direction and
/// in `destination_port` of the reply direction, so that swapping a tuple yields its reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
}

impl FlowTuple {
    /// The tuple of a packet travelling in the opposite direction
    pub fn reversed(&self) -> FlowTuple {
        FlowTuple {
            source: self.destination,
            destination: self.source,
            source_port: self.destination_port,
            destination_port: self.source_port,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConntrackEntry {
    pub protocol: Protocol,
    pub original: FlowTuple,
    pub reply: FlowTuple,
}

impl ConntrackEntry {
    /// Whether the flow's addresses were rewritten on the way through
    pub fn is_translated(&self) -> bool {
        self.reply != self.original.reversed()
    }
}

fn write_tuple(
    f: &mut Formatter<'_>,
    protocol: Protocol,
    tuple: &FlowTuple,
    echo_type: u8,
    id: Option<u16>,
) -> std::fmt::Result {
    write!(f, "src={} dst={} ", tuple.source, tuple.destination)?;
    match protocol {
        Protocol::Icmp => {
            write!(f, "type={echo_type} code=0 id={} ", id.unwrap_or(0))
        }
        Protocol::Tcp | Protocol::Udp => write!(
            f,
            "sport={} dport={} ",
            tuple.source_port.unwrap_or(0),
            tuple.destination_port.unwrap_or(0)
        ),
    }
}

impl Display for ConntrackEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            Protocol::Icmp => write!(f, "icmp     1 29 ")?,
            Protocol::Tcp => write!(f, "tcp      6 431999 ESTABLISHED ")?,
            Protocol::Udp => write!(f, "udp      17 29 ")?,
        }

        write_tuple(f, self.protocol, &self.original, 8, self.original.source_port)?;
        write_tuple(f, self.protocol, &self.reply, 0, self.reply.destination_port)?;
        if self.protocol == Protocol::Tcp {
            write!(f, "[ASSURED] ")?;
        }
        write!(f, "mark=0 use=1")
    }
}

/// Parses the output of `conntrack -L`, skipping lines for protocols we do not track
pub fn parse_conntrack(output: &str) -> anyhow::Result<Vec<ConntrackEntry>> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let Some(protocol) = line.split_whitespace().next().and_then(Protocol::parse) else {
            continue;
        };

        let mut tuples: Vec<FlowTuple> = Vec::with_capacity(2);
        for (key, value) in key_values(line) {
            if key == "src" {
                tuples.push(FlowTuple {
                    source: value.parse()?,
                    destination: Ipv4Addr::UNSPECIFIED,
                    source_port: None,
                    destination_port: None,
                });
                continue;
            }

            let reply_direction = tuples.len() == 2;
            let Some(tuple) = tuples.last_mut() else {
                continue;
            };
            match key {
                "dst" => tuple.destination = value.parse()?,
                "sport" => tuple.source_port = Some(value.parse()?),
                "dport" => tuple.destination_port = Some(value.parse()?),
                "id" if reply_direction => tuple.destination_port = Some(value.parse()?),
                "id" => tuple.source_port = Some(value.parse()?),
                _ => {}
            }
        }

        let [original, reply] = tuples[..] else {
            anyhow::bail!("expected two tuples in conntrack entry `{line}`");
        };
        entries.push(ConntrackEntry {
            protocol,
            original,
            reply,
        });
    }

    Ok(entries)
}
