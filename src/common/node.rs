//! Struct and implementation of the Node entry in the Kademlia routing table
use std::net::SocketAddr;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Node entry in Kademlia routing table
pub struct Node {
    pub id: Id,
    pub address: SocketAddr,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node { id, address }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns `true` if this node's id is bound to its address per BEP_0042.
    pub fn is_secure(&self) -> bool {
        self.id.is_secure_for(self.address.ip())
    }
}
