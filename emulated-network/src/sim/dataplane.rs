//! Packet delivery through the simulated network
//!
//! Layer 2 floods over forwarding bridge ports; layer 3 hops between addressable nodes using
//! connected subnets and installed routes, applying the gateway's tables on the way.

use crate::convergence::status::PortState;
use crate::gateway::conntrack::{ConntrackEntry, FlowTuple};
use crate::gateway::rule::{Chain, NatRule, Protocol, RuleTarget};
use crate::shaping::LinkShaping;
use crate::sim::{ObservedPacket, SimState};
use crate::topology::NodeRole;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

const MAX_ROUTED_HOPS: usize = 16;

/// Forwarding state of bridge ports, keyed by (node, interface). Ports missing from the map
/// belong to bridges without spanning tree, which forward unconditionally.
pub(crate) type PortStates = HashMap<(usize, usize), PortState>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Packet {
    pub(crate) protocol: Protocol,
    /// Unspecified until the sender picks one
    pub(crate) source: Ipv4Addr,
    pub(crate) destination: Ipv4Addr,
    pub(crate) source_port: Option<u16>,
    pub(crate) destination_port: Option<u16>,
}

impl Packet {
    pub(crate) fn tuple(&self) -> FlowTuple {
        FlowTuple {
            source: self.source,
            destination: self.destination,
            source_port: self.source_port,
            destination_port: self.destination_port,
        }
    }

    fn set_tuple(&mut self, tuple: FlowTuple) {
        self.source = tuple.source;
        self.destination = tuple.destination;
        self.source_port = tuple.source_port;
        self.destination_port = tuple.destination_port;
    }

    /// The packet a receiver sends back
    pub(crate) fn answer(&self) -> Packet {
        let mut answer = *self;
        answer.set_tuple(self.tuple().reversed());
        answer
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PathMetrics {
    pub(crate) delay: Duration,
    pub(crate) bottleneck_mbps: Option<f64>,
    pub(crate) loss_percents: Vec<f32>,
    pub(crate) routed_hops: u8,
}

impl PathMetrics {
    fn through(&self, shaping: &LinkShaping) -> PathMetrics {
        let mut next = self.clone();
        next.delay += shaping.one_way_delay();
        next.bottleneck_mbps = match (self.bottleneck_mbps, shaping.bandwidth_mbps) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(loss) = shaping.loss_percent.filter(|l| *l > 0.0) {
            next.loss_percents.push(loss);
        }
        next
    }

    fn append(&mut self, other: PathMetrics) {
        self.delay += other.delay;
        self.bottleneck_mbps = match (self.bottleneck_mbps, other.bottleneck_mbps) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.loss_percents.extend(other.loss_percents);
    }
}

pub(crate) enum Delivery {
    Delivered {
        node: usize,
        packet: Packet,
        metrics: PathMetrics,
    },
    /// The sender has no route (or no address to send from)
    NoRoute,
    /// The next hop never answered address resolution
    HostUnreachable { reporter: Ipv4Addr },
    Lost,
}

fn rule_matches(rule: &NatRule, packet: &Packet, in_iface: Option<&str>, out_iface: Option<&str>) -> bool {
    let m = &rule.matches;
    rule.protocol.is_none_or(|p| p == packet.protocol)
        && m.source.is_none_or(|s| s.contains(packet.source))
        && m.destination.is_none_or(|d| d == packet.destination)
        && m.destination_port.is_none_or(|p| Some(p) == packet.destination_port)
        && m.in_interface.as_deref().is_none_or(|i| Some(i) == in_iface)
        && m.out_interface.as_deref().is_none_or(|o| Some(o) == out_iface)
}

impl SimState {
    fn iface_name(&self, node: usize, iface: usize) -> &str {
        &self.nodes[node].interfaces[iface].name
    }

    /// The other end of the link attached to an interface
    fn cross(&self, node: usize, iface: usize) -> Option<(usize, usize, &LinkShaping)> {
        let link = &self.links[self.nodes[node].interfaces[iface].link?];
        let [a, b] = link.ends;
        let (peer_node, peer_iface) = if a == (node, iface) { b } else { a };
        Some((peer_node, peer_iface, &link.shaping))
    }

    fn forwards(&self, ports: &PortStates, node: usize, iface: usize) -> bool {
        self.nodes[node].role != NodeRole::Switch
            || ports
                .get(&(node, iface))
                .is_none_or(|state| *state == PortState::Forwarding)
    }

    /// Addressable interfaces reachable at layer 2 from `(node, iface)`, or `None` if the
    /// broadcast domain contains a forwarding loop (frames are lost in the storm)
    pub(crate) fn l2_endpoints(
        &self,
        ports: &PortStates,
        node: usize,
        iface: usize,
    ) -> Option<Vec<(usize, usize, PathMetrics)>> {
        let mut endpoints = Vec::new();
        let Some((peer, peer_iface, shaping)) = self.cross(node, iface) else {
            return Some(endpoints);
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((peer, peer_iface, PathMetrics::default().through(shaping)));

        while let Some((n, ingress, metrics)) = queue.pop_front() {
            if !self.forwards(ports, n, ingress) {
                continue;
            }

            if self.nodes[n].role != NodeRole::Switch {
                endpoints.push((n, ingress, metrics));
                continue;
            }

            // Reaching a bridge twice means frames circulate forever
            if !visited.insert(n) {
                return None;
            }

            for i in 0..self.nodes[n].interfaces.len() {
                if i == ingress || !self.forwards(ports, n, i) {
                    continue;
                }
                if let Some((p, pi, shaping)) = self.cross(n, i) {
                    queue.push_back((p, pi, metrics.through(shaping)));
                }
            }
        }

        Some(endpoints)
    }

    pub(crate) fn owns(&self, node: usize, address: Ipv4Addr) -> bool {
        self.nodes[node]
            .interfaces
            .iter()
            .any(|i| i.addresses.iter().any(|a| a.address() == address))
    }

    /// Longest-prefix match over connected subnets and installed routes
    pub(crate) fn lookup_route(&self, node: usize, destination: Ipv4Addr) -> Option<(usize, Ipv4Addr)> {
        let n = &self.nodes[node];
        let connected = |ip: Ipv4Addr| {
            n.interfaces
                .iter()
                .enumerate()
                .flat_map(|(i, iface)| iface.addresses.iter().map(move |a| (i, *a)))
                .filter(|(_, a)| a.contains(ip))
                .max_by_key(|(_, a)| a.network_prefix())
        };

        let direct = connected(destination).map(|(i, a)| (a.network_prefix(), i, destination));
        let routed = n
            .routes
            .iter()
            .filter(|r| r.destination.contains(destination))
            .max_by_key(|r| r.destination.prefix_len())
            .and_then(|r| {
                let (i, _) = connected(r.next)?;
                Some((r.destination.prefix_len(), i, r.next))
            });

        match (direct, routed) {
            (Some(d), Some(r)) if r.0 > d.0 => Some((r.1, r.2)),
            (Some(d), _) => Some((d.1, d.2)),
            (None, r) => r.map(|r| (r.1, r.2)),
        }
    }

    /// The address a node uses when sending towards `next_hop` through `iface`
    pub(crate) fn source_for(&self, node: usize, iface: usize, next_hop: Ipv4Addr) -> Option<Ipv4Addr> {
        let addresses = &self.nodes[node].interfaces[iface].addresses;
        addresses
            .iter()
            .find(|a| a.contains(next_hop))
            .or(addresses.first())
            .map(|a| a.address())
    }

    fn destination_translation(&self, node: usize, ingress: usize, packet: &Packet) -> Option<(Ipv4Addr, Option<u16>)> {
        let in_iface = self.iface_name(node, ingress);
        self.nodes[node]
            .nat
            .iter()
            .filter(|r| r.chain == Chain::Prerouting)
            .find(|r| rule_matches(r, packet, Some(in_iface), None))
            .and_then(|r| match r.target {
                RuleTarget::Dnat { address, port } => Some((address, port)),
                _ => None,
            })
    }

    fn forward_accepted(&self, node: usize, ingress: usize, egress: usize, packet: &Packet) -> bool {
        let in_iface = self.iface_name(node, ingress);
        let out_iface = self.iface_name(node, egress);
        self.nodes[node]
            .filter
            .iter()
            .filter(|r| r.chain == Chain::Forward)
            .find(|r| rule_matches(r, packet, Some(in_iface), Some(out_iface)))
            .is_some_and(|r| r.target == RuleTarget::Accept)
    }

    fn masquerades(&self, node: usize, egress: usize, packet: &Packet) -> bool {
        let out_iface = self.iface_name(node, egress);
        self.nodes[node]
            .nat
            .iter()
            .filter(|r| r.chain == Chain::Postrouting)
            .find(|r| rule_matches(r, packet, None, Some(out_iface)))
            .is_some_and(|r| r.target == RuleTarget::Masquerade)
    }

    fn track(&mut self, node: usize, protocol: Protocol, original: FlowTuple, translated: &Packet) {
        let entry = ConntrackEntry {
            protocol,
            original,
            reply: translated.tuple().reversed(),
        };
        let table = &mut self.nodes[node].conntrack;
        if !table.iter().any(|e| e.protocol == protocol && e.original == original) {
            table.push(entry);
        }
    }

    fn lost_on_the_way(&mut self, metrics: &PathMetrics) -> bool {
        metrics
            .loss_percents
            .iter()
            .any(|loss| self.rng.f32() * 100.0 < *loss)
    }

    /// Sends a packet from `origin` and follows it until it is delivered or dropped
    pub(crate) fn send(&mut self, ports: &PortStates, origin: usize, mut packet: Packet) -> Delivery {
        let mut at = origin;
        let mut ingress: Option<usize> = None;
        let mut metrics = PathMetrics::default();

        for _ in 0..MAX_ROUTED_HOPS {
            let arrived = packet;
            let mut is_reply = false;

            if let Some(ingress) = ingress {
                let tracked = self.nodes[at]
                    .conntrack
                    .iter()
                    .find(|e| e.protocol == packet.protocol && e.reply == packet.tuple())
                    .copied();
                if let Some(entry) = tracked {
                    packet.set_tuple(entry.original.reversed());
                    is_reply = true;
                } else if let Some((address, port)) =
                    self.destination_translation(at, ingress, &packet)
                {
                    packet.destination = address;
                    packet.destination_port = port.or(packet.destination_port);
                }
            }

            if self.owns(at, packet.destination) {
                if ingress.is_some() && !is_reply && arrived != packet {
                    self.track(at, packet.protocol, arrived.tuple(), &packet);
                }

                self.observed.push(ObservedPacket {
                    node: self.nodes[at].name.clone(),
                    protocol: packet.protocol,
                    source: packet.source,
                    destination: packet.destination,
                    destination_port: packet.destination_port,
                });
                return Delivery::Delivered {
                    node: at,
                    packet,
                    metrics,
                };
            }

            if ingress.is_some() && (!self.nodes[at].ip_forward || !self.nodes[at].role.is_addressable()) {
                return Delivery::Lost;
            }

            let Some((egress, next_hop)) = self.lookup_route(at, packet.destination) else {
                return match ingress {
                    None => Delivery::NoRoute,
                    Some(_) => Delivery::Lost,
                };
            };

            match ingress {
                None => {
                    if packet.source.is_unspecified() {
                        let Some(source) = self.source_for(at, egress, next_hop) else {
                            return Delivery::NoRoute;
                        };
                        packet.source = source;
                    }
                }
                Some(ingress) => {
                    if !self.forward_accepted(at, ingress, egress, &packet) {
                        return Delivery::Lost;
                    }
                    if !is_reply {
                        if self.masquerades(at, egress, &packet) {
                            if let Some(source) = self.source_for(at, egress, next_hop) {
                                packet.source = source;
                            }
                        }
                        self.track(at, packet.protocol, arrived.tuple(), &packet);
                    }
                    metrics.routed_hops += 1;
                }
            }

            let Some(endpoints) = self.l2_endpoints(ports, at, egress) else {
                return Delivery::Lost;
            };
            let next = endpoints.into_iter().find(|(n, i, _)| {
                self.nodes[*n].interfaces[*i]
                    .addresses
                    .iter()
                    .any(|a| a.address() == next_hop)
            });
            let Some((next_node, next_iface, hop)) = next else {
                return match ingress {
                    None => Delivery::HostUnreachable {
                        reporter: packet.source,
                    },
                    Some(_) => Delivery::Lost,
                };
            };

            if self.lost_on_the_way(&hop) {
                return Delivery::Lost;
            }

            metrics.append(hop);
            at = next_node;
            ingress = Some(next_iface);
        }

        Delivery::Lost
    }
}
