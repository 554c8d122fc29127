use crate::topology::{LinkId, TopologyError};
use crate::topology::ip::Ipv4Cidr;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Host,
    Switch,
    Gateway,
}

impl NodeRole {
    /// Whether network addresses can be assigned to the node's interfaces
    pub fn is_addressable(self) -> bool {
        matches!(self, NodeRole::Host | NodeRole::Gateway)
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Host => f.write_str("host"),
            NodeRole::Switch => f.write_str("switch"),
            NodeRole::Gateway => f.write_str("gateway"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Clone, Debug)]
pub struct Interface {
    pub(crate) name: Arc<str>,
    pub(crate) mac: MacAddr,
    pub(crate) addresses: Vec<Ipv4Cidr>,
    pub(crate) link: LinkId,
}

impl Interface {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn addresses(&self) -> &[Ipv4Cidr] {
        &self.addresses
    }

    pub fn link(&self) -> LinkId {
        self.link
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: Arc<str>,
    pub(crate) role: NodeRole,
    pub(crate) system_id: MacAddr,
    pub(crate) interfaces: Vec<Interface>,
}

impl Node {
    pub(crate) fn new(id: NodeId, name: Arc<str>, role: NodeRole) -> Result<Self, TopologyError> {
        // 1-based, so that no node ends up with the all-zero address
        let ordinal = u16::try_from(id.0 + 1).map_err(|_| TopologyError::TooManyNodes)?;
        let [hi, lo] = ordinal.to_be_bytes();
        Ok(Self {
            id,
            name,
            role,
            system_id: MacAddr([0, 0, 0, 0, hi, lo]),
            interfaces: Vec::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// The node's own link-layer identity (used as the bridge address of switches)
    pub fn system_id(&self) -> MacAddr {
        self.system_id
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| &*i.name == name)
    }

    /// Statically assigned addresses, across all interfaces
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Cidr> + '_ {
        self.interfaces
            .iter()
            .flat_map(|i| i.addresses.iter().copied())
    }

    pub fn as_switch(&self) -> Option<Switch<'_>> {
        (self.role == NodeRole::Switch).then_some(Switch(self))
    }

    pub fn as_gateway(&self) -> Option<Gateway<'_>> {
        (self.role == NodeRole::Gateway).then_some(Gateway(self))
    }

    /// The index the next interface will get; the last octet of its MAC address
    pub(crate) fn next_interface_index(&self) -> Result<u8, TopologyError> {
        u8::try_from(self.interfaces.len())
            .map_err(|_| TopologyError::TooManyInterfaces(self.name.clone()))
    }

    pub(crate) fn attach_interface(&mut self, index: u8, link: LinkId) -> Arc<str> {
        let name: Arc<str> = format!("{}-eth{index}", self.name).into();
        let [.., hi, lo] = self.system_id.0;
        self.interfaces.push(Interface {
            name: name.clone(),
            mac: MacAddr([0x02, 0, hi, lo, 0, index]),
            addresses: Vec::new(),
            link,
        });
        name
    }
}

/// A node that takes part in the spanning-tree protocol
#[derive(Copy, Clone)]
pub struct Switch<'a>(&'a Node);

impl<'a> Switch<'a> {
    pub fn node(&self) -> &'a Node {
        self.0
    }

    pub fn name(&self) -> &'a Arc<str> {
        &self.0.name
    }

    pub fn system_id(&self) -> MacAddr {
        self.0.system_id
    }

    /// Every interface of a switch is a bridge port
    pub fn ports(&self) -> &'a [Interface] {
        &self.0.interfaces
    }
}

/// A node able to forward packets between its interfaces
#[derive(Copy, Clone)]
pub struct Gateway<'a>(&'a Node);

impl<'a> Gateway<'a> {
    pub fn node(&self) -> &'a Node {
        self.0
    }

    pub fn name(&self) -> &'a Arc<str> {
        &self.0.name
    }

    pub fn interface(&self, name: &str) -> Option<&'a Interface> {
        self.0.interface(name)
    }
}
