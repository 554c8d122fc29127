//! The lab's graph of nodes and links
//!
//! The graph is append-only and may contain parallel links between the same pair of switches.
//! Cycles among switches are expected: the spanning-tree protocol, not the topology, is what
//! turns the backbone into a loop-free forwarding tree.

pub mod ip;
pub mod link;
pub mod node;
pub mod route;

pub use link::{Link, LinkEnd, LinkId};
pub use node::{Gateway, Interface, MacAddr, Node, NodeId, NodeRole, Switch};

use crate::shaping::LinkShaping;
use crate::topology::ip::Ipv4Cidr;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("node `{0}` is already registered")]
    DuplicateNode(Arc<str>),
    #[error("node `{0}` was referenced but does not exist")]
    UnknownNode(Arc<str>),
    #[error("link from `{0}` to itself is not allowed")]
    SelfLoop(Arc<str>),
    #[error("node `{node}` has no interface named `{interface}`")]
    UnknownInterface { node: Arc<str>, interface: Arc<str> },
    #[error("node `{0}` is a switch and cannot hold network addresses")]
    NotAddressable(Arc<str>),
    #[error("{0} was referenced but does not exist")]
    UnknownLink(LinkId),
    #[error("no link-layer addresses left for another node")]
    TooManyNodes,
    #[error("no link-layer addresses left for another interface of `{0}`")]
    TooManyInterfaces(Arc<str>),
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    nodes: Vec<Node>,
    by_name: HashMap<Arc<str>, NodeId>,
    links: Vec<Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, role: NodeRole) -> Result<NodeId, TopologyError> {
        if self.by_name.contains_key(name) {
            return Err(TopologyError::DuplicateNode(name.into()));
        }

        let id = NodeId(self.nodes.len());
        let name: Arc<str> = name.into();
        self.nodes.push(Node::new(id, name.clone(), role)?);
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Connects two distinct nodes, creating one new interface on each of them
    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        shaping: LinkShaping,
    ) -> Result<LinkId, TopologyError> {
        let a_id = self.node_id(a)?;
        let b_id = self.node_id(b)?;
        if a_id == b_id {
            return Err(TopologyError::SelfLoop(a.into()));
        }

        // Both ends are checked before either of them is touched
        let a_index = self.nodes[a_id.0].next_interface_index()?;
        let b_index = self.nodes[b_id.0].next_interface_index()?;

        let id = LinkId(self.links.len());
        let a_interface = self.nodes[a_id.0].attach_interface(a_index, id);
        let b_interface = self.nodes[b_id.0].attach_interface(b_index, id);
        self.links.push(Link {
            id,
            ends: [
                LinkEnd {
                    node: self.nodes[a_id.0].name.clone(),
                    interface: a_interface,
                },
                LinkEnd {
                    node: self.nodes[b_id.0].name.clone(),
                    interface: b_interface,
                },
            ],
            shaping,
        });

        Ok(id)
    }

    /// Replaces the static addresses of an interface
    pub fn set_interface_addresses(
        &mut self,
        node: &str,
        interface: &str,
        addresses: Vec<Ipv4Cidr>,
    ) -> Result<(), TopologyError> {
        let id = self.node_id(node)?;
        let node = &mut self.nodes[id.0];
        if !node.role.is_addressable() {
            return Err(TopologyError::NotAddressable(node.name.clone()));
        }

        let interface = node
            .interfaces
            .iter_mut()
            .find(|i| &*i.name == interface)
            .ok_or_else(|| TopologyError::UnknownInterface {
                node: node.name.clone(),
                interface: interface.into(),
            })?;
        interface.addresses = addresses;
        Ok(())
    }

    pub fn set_shaping(&mut self, link: LinkId, shaping: LinkShaping) -> Result<(), TopologyError> {
        let link = self
            .links
            .get_mut(link.0)
            .ok_or(TopologyError::UnknownLink(link))?;
        link.shaping = shaping;
        Ok(())
    }

    pub fn node_id(&self, name: &str) -> Result<NodeId, TopologyError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TopologyError::UnknownNode(name.into()))
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|id| &self.nodes[id.0])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn switches(&self) -> impl Iterator<Item = Switch<'_>> {
        self.nodes.iter().filter_map(|n| n.as_switch())
    }

    pub fn gateway(&self, name: &str) -> Option<Gateway<'_>> {
        self.node(name).and_then(|n| n.as_gateway())
    }

    /// Links whose both ends are switches, i.e. the backbone
    pub fn switch_links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(|l| {
            l.ends
                .iter()
                .all(|end| self.node(&end.node).is_some_and(|n| n.role == NodeRole::Switch))
        })
    }

    /// Finds the link terminated by the given interface
    pub fn link_of(&self, node: &str, interface: &str) -> Option<&Link> {
        let interface = self.node(node)?.interface(interface)?;
        self.links.get(interface.link.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_duplicate_and_unknown_nodes() {
        let mut topology = Topology::new();
        topology.add_node("s1", NodeRole::Switch).unwrap();

        assert_eq!(
            topology.add_node("s1", NodeRole::Host),
            Err(TopologyError::DuplicateNode("s1".into()))
        );
        assert_eq!(
            topology.add_link("s1", "s2", LinkShaping::default()),
            Err(TopologyError::UnknownNode("s2".into()))
        );
        assert_eq!(
            topology.add_link("s1", "s1", LinkShaping::default()),
            Err(TopologyError::SelfLoop("s1".into()))
        );
        assert!(topology.links().is_empty());
    }

    #[test]
    fn test_parallel_links_create_distinct_interfaces() {
        let mut topology = Topology::new();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        topology.add_node("s2", NodeRole::Switch).unwrap();
        let delay = LinkShaping::with_delay(Duration::from_millis(7));

        let first = topology.add_link("s1", "s2", delay.clone()).unwrap();
        let second = topology.add_link("s2", "s1", delay).unwrap();
        assert_ne!(first, second);

        let s1 = topology.node("s1").unwrap();
        let names: Vec<_> = s1.interfaces().iter().map(|i| i.name().to_string()).collect();
        assert_eq!(names, ["s1-eth0", "s1-eth1"]);
        assert_eq!(topology.switch_links().count(), 2);

        let link = topology.link_of("s1", "s1-eth1").unwrap();
        assert_eq!(link.id(), second);
        assert_eq!(&*link.peer_of("s1-eth1").unwrap().interface, "s2-eth1");
    }

    #[test]
    fn test_link_layer_addresses_are_deterministic() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        topology.add_link("h1", "s1", LinkShaping::default()).unwrap();

        let s1 = topology.node("s1").unwrap();
        assert_eq!(s1.system_id().to_string(), "00:00:00:00:00:02");
        assert_eq!(s1.interfaces()[0].mac().to_string(), "02:00:00:02:00:00");
    }

    #[test]
    fn test_link_layer_address_space_is_bounded() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        for _ in 0..256 {
            topology.add_link("h1", "s1", LinkShaping::default()).unwrap();
        }
        assert_eq!(
            topology.add_link("h1", "s1", LinkShaping::default()),
            Err(TopologyError::TooManyInterfaces("h1".into()))
        );
        // The rejected link left no interface behind
        assert_eq!(topology.node("s1").unwrap().interfaces().len(), 256);
        assert_eq!(topology.links().len(), 256);

        let h1 = topology.node("h1").unwrap();
        assert_eq!(h1.interfaces()[255].mac().to_string(), "02:00:00:01:00:ff");

        let mut topology = Topology::new();
        for n in 0..u16::MAX {
            topology.add_node(&format!("n{n}"), NodeRole::Host).unwrap();
        }
        assert_eq!(
            topology.add_node("one-too-many", NodeRole::Host),
            Err(TopologyError::TooManyNodes)
        );
        assert!(topology.node("one-too-many").is_none());
    }

    #[test]
    fn test_switches_are_not_addressable() {
        let mut topology = Topology::new();
        topology.add_node("h1", NodeRole::Host).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();
        topology.add_link("h1", "s1", LinkShaping::default()).unwrap();
        let address: Ipv4Cidr = "10.0.0.2/24".parse().unwrap();

        topology
            .set_interface_addresses("h1", "h1-eth0", vec![address])
            .unwrap();
        assert_eq!(topology.node("h1").unwrap().addresses().collect::<Vec<_>>(), [address]);

        assert_eq!(
            topology.set_interface_addresses("s1", "s1-eth0", vec![address]),
            Err(TopologyError::NotAddressable("s1".into()))
        );
        assert!(matches!(
            topology.set_interface_addresses("h1", "h1-eth9", vec![address]),
            Err(TopologyError::UnknownInterface { .. })
        ));
    }

    #[test]
    fn test_role_views() {
        let mut topology = Topology::new();
        topology.add_node("h9", NodeRole::Gateway).unwrap();
        topology.add_node("s1", NodeRole::Switch).unwrap();

        assert!(topology.gateway("h9").is_some());
        assert!(topology.gateway("s1").is_none());
        assert_eq!(topology.switches().map(|s| s.name().to_string()).collect::<Vec<_>>(), ["s1"]);
    }
}
