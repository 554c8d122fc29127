use crate::shaping::LinkShaping;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) usize);

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// One of the two interfaces terminated by a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEnd {
    pub node: Arc<str>,
    pub interface: Arc<str>,
}

impl Display for LinkEnd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

#[derive(Clone, Debug)]
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) ends: [LinkEnd; 2],
    pub(crate) shaping: LinkShaping,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn ends(&self) -> &[LinkEnd; 2] {
        &self.ends
    }

    pub fn shaping(&self) -> &LinkShaping {
        &self.shaping
    }

    pub fn connects(&self, node: &str) -> bool {
        self.ends.iter().any(|end| &*end.node == node)
    }

    /// The end opposite to the given interface
    pub fn peer_of(&self, interface: &str) -> Option<&LinkEnd> {
        match &self.ends {
            [a, b] if &*a.interface == interface => Some(b),
            [a, b] if &*b.interface == interface => Some(a),
            _ => None,
        }
    }
}

impl Display for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.ends[0], self.ends[1])
    }
}
