//! Spanning-tree election, computed from a global view of the simulated bridges
//!
//! The outcome matches what 802.1D converges to: the lowest bridge id becomes the root, every
//! other bridge picks the port with the cheapest path towards it, and on each segment the end
//! with the best (root cost, bridge id, port id) is designated. Remaining ports are alternates.

use crate::convergence::status::{BridgeId, PortRole, PortState};
use std::time::Duration;

/// A bridge port, as seen by the election
#[derive(Clone, Debug)]
pub(crate) struct ElectionPort {
    pub(crate) port_no: u16,
    pub(crate) cost: u32,
    /// The bridge and port on the other side, when that side takes part in the election
    pub(crate) peer: Option<(usize, u16)>,
}

#[derive(Clone, Debug)]
pub(crate) struct ElectionBridge {
    pub(crate) id: BridgeId,
    pub(crate) ports: Vec<ElectionPort>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ElectedPort {
    pub(crate) port_no: u16,
    pub(crate) role: PortRole,
    pub(crate) cost: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ElectedBridge {
    pub(crate) root: BridgeId,
    pub(crate) root_cost: u32,
    pub(crate) root_port: Option<u16>,
    pub(crate) ports: Vec<ElectedPort>,
}

fn port_id(port_no: u16) -> u16 {
    (128 << 8) | port_no
}

/// Runs the election. Bridges are identified by their index in `bridges`.
pub(crate) fn elect(bridges: &[ElectionBridge]) -> Vec<ElectedBridge> {
    let n = bridges.len();

    // Each bridge converges on the best root it can hear of
    let mut root: Vec<BridgeId> = bridges.iter().map(|b| b.id).collect();
    let mut cost: Vec<u32> = vec![0; n];
    // (bridge the root port leads to, that bridge's port, own port)
    let mut root_port: Vec<Option<(usize, u16, u16)>> = vec![None; n];

    for _ in 0..=n {
        let mut changed = false;
        for b in 0..n {
            let mut best = (bridges[b].id, 0, bridges[b].id, 0, 0);
            let mut best_port = None;
            for port in &bridges[b].ports {
                let Some((peer, peer_port)) = port.peer else {
                    continue;
                };

                let candidate = (
                    root[peer],
                    cost[peer] + port.cost,
                    bridges[peer].id,
                    port_id(peer_port),
                    port_id(port.port_no),
                );
                if candidate < best {
                    best = candidate;
                    best_port = Some((peer, peer_port, port.port_no));
                }
            }

            if (root[b], cost[b], root_port[b]) != (best.0, best.1, best_port) {
                root[b] = best.0;
                cost[b] = best.1;
                root_port[b] = best_port;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    (0..n)
        .map(|b| {
            let own_root_port = root_port[b].map(|(_, _, own)| own);
            let ports = bridges[b]
                .ports
                .iter()
                .map(|port| {
                    let role = if Some(port.port_no) == own_root_port {
                        PortRole::Root
                    } else {
                        match port.peer {
                            None => PortRole::Designated,
                            Some((peer, peer_port)) => {
                                let peer_uses_it = root_port[peer]
                                    .is_some_and(|(to, _, own)| to == b && own == peer_port);
                                let ours = (cost[b], bridges[b].id, port_id(port.port_no));
                                let theirs = (cost[peer], bridges[peer].id, port_id(peer_port));
                                if peer_uses_it || ours < theirs {
                                    PortRole::Designated
                                } else {
                                    PortRole::Alternate
                                }
                            }
                        }
                    };

                    ElectedPort {
                        port_no: port.port_no,
                        role,
                        cost: port.cost,
                    }
                })
                .collect();

            ElectedBridge {
                root: root[b],
                root_cost: cost[b],
                root_port: own_root_port,
                ports,
            }
        })
        .collect()
}

/// The state of a port `elapsed` after the last topology change
pub(crate) fn port_state(role: PortRole, elapsed: Duration, forward_delay: Duration) -> PortState {
    match role {
        PortRole::Disabled => PortState::Disabled,
        PortRole::Alternate | PortRole::Backup => PortState::Blocking,
        PortRole::Root | PortRole::Designated => {
            if elapsed < forward_delay {
                PortState::Listening
            } else if elapsed < forward_delay * 2 {
                PortState::Learning
            } else {
                PortState::Forwarding
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::MacAddr;

    fn bridge(priority: u16, index: u8) -> ElectionBridge {
        ElectionBridge {
            id: BridgeId {
                priority,
                system_id: MacAddr([0, 0, 0, 0, 0, index]),
            },
            ports: Vec::new(),
        }
    }

    fn connect(bridges: &mut [ElectionBridge], a: usize, b: usize) {
        let a_port = bridges[a].ports.len() as u16 + 1;
        let b_port = bridges[b].ports.len() as u16 + 1;
        bridges[a].ports.push(ElectionPort {
            port_no: a_port,
            cost: 2,
            peer: Some((b, b_port)),
        });
        bridges[b].ports.push(ElectionPort {
            port_no: b_port,
            cost: 2,
            peer: Some((a, a_port)),
        });
    }

    #[test]
    fn test_triangle_blocks_one_port() {
        let mut bridges = vec![bridge(32768, 1), bridge(32768, 2), bridge(32768, 3)];
        connect(&mut bridges, 0, 1);
        connect(&mut bridges, 1, 2);
        connect(&mut bridges, 2, 0);

        let elected = elect(&bridges);
        assert!(elected.iter().all(|b| b.root == bridges[0].id));
        assert_eq!(elected[0].root_port, None);

        let alternates: Vec<_> = elected
            .iter()
            .enumerate()
            .flat_map(|(b, e)| {
                e.ports
                    .iter()
                    .filter(|p| p.role == PortRole::Alternate)
                    .map(move |p| (b, p.port_no))
            })
            .collect();

        // The segment between the two non-root bridges is blocked on the higher id's side
        assert_eq!(alternates, [(2, 1)]);
    }

    #[test]
    fn test_priority_beats_address() {
        let mut bridges = vec![bridge(32768, 1), bridge(4096, 2)];
        connect(&mut bridges, 0, 1);

        let elected = elect(&bridges);
        assert_eq!(elected[0].root, bridges[1].id);
        assert_eq!(elected[0].root_port, Some(1));
        assert_eq!(elected[0].root_cost, 2);
    }

    #[test]
    fn test_parallel_links_keep_lowest_port() {
        let mut bridges = vec![bridge(32768, 1), bridge(32768, 2)];
        connect(&mut bridges, 0, 1);
        connect(&mut bridges, 0, 1);

        let elected = elect(&bridges);
        assert_eq!(elected[1].root_port, Some(1));
        assert_eq!(elected[1].ports[1].role, PortRole::Alternate);
        assert_eq!(elected[0].ports[0].role, PortRole::Designated);
        assert_eq!(elected[0].ports[1].role, PortRole::Designated);
    }

    #[test]
    fn test_port_state_timeline() {
        let fd = Duration::from_secs(15);
        let state = |secs| port_state(PortRole::Designated, Duration::from_secs(secs), fd);
        assert_eq!(state(0), PortState::Listening);
        assert_eq!(state(15), PortState::Learning);
        assert_eq!(state(30), PortState::Forwarding);
        assert_eq!(
            port_state(PortRole::Alternate, Duration::ZERO, fd),
            PortState::Blocking
        );
    }
}
