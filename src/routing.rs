//! Capabilities this crate needs from a Kademlia routing table and a KRPC transport.
//!
//! Maintaining k-buckets, sending UDP packets and retransmitting are left to the
//! implementors of these traits, see [crate::testnet::Testnet] for an in-memory one.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::{ErrorSpecific, Id, MessageType, MutableItem, Node, RequestSpecific};

/// Which of the two lookup tables of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Nodes answering `get_peers`.
    Peers,
    /// Nodes answering `get` and accepting `put`.
    Stores,
}

/// Operations the core uses on the overlay's routing table.
pub trait RoutingTable: Debug + Send + Sync {
    /// Populate the routing table from `nodes` using `id` as our own node id.
    ///
    /// Returns the public address other nodes observed us at, if they reported one.
    fn bootstrap(
        &self,
        id: Id,
        public_address: Option<SocketAddr>,
        nodes: &[String],
    ) -> Result<Option<SocketAddr>, RoutingError>;

    /// Addresses of good nodes in the routing table, to be reused as bootstrap nodes.
    fn bootstrap_export(&self) -> Vec<String>;

    /// The address our socket is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Iteratively query the overlay for the nodes closest to `target` able to store values.
    fn lookup_stores(&self, target: Id) -> Result<(), RoutingError>;

    /// Up to `limit` store-capable nodes closest to `target`, closest first.
    fn closest_stores(&self, target: Id, limit: usize) -> Result<Vec<Node>, RoutingError>;

    /// Query every one of `peers` for the mutable item at `target`.
    ///
    /// Returns the verified item with the highest sequence number that is at least `seq`
    /// and signed by `public_key`, or `None` if no peer had one.
    fn m_get_all(
        &self,
        target: Id,
        public_key: &[u8; 32],
        seq: i64,
        salt: Option<&[u8]>,
        peers: &[SocketAddr],
    ) -> Result<Option<MutableItem>, RoutingError>;

    /// Store `item` at every one of `peers`, returning how many acknowledged.
    fn m_put_all(&self, item: &MutableItem, peers: &[SocketAddr]) -> Result<usize, RoutingError>;

    /// Remove the node at `address` from one of the lookup tables.
    fn remove_node(&self, table: Table, address: SocketAddr);
}

/// Handles incoming queries.
pub trait QueryHandler: Debug + Send + Sync {
    /// Returns a [MessageType::Response] or [MessageType::Error] to send back
    /// to `from`, or `None` to stay silent.
    fn handle_request(&self, from: SocketAddr, request: &RequestSpecific) -> Option<MessageType>;
}

impl<H: QueryHandler + ?Sized> QueryHandler for Arc<H> {
    fn handle_request(&self, from: SocketAddr, request: &RequestSpecific) -> Option<MessageType> {
        self.as_ref().handle_request(from, request)
    }
}

/// Called once the transport is listening.
pub type ReadyFn = Box<dyn FnOnce() -> crate::Result<()> + Send>;

/// Transport delivering KRPC queries to a [QueryHandler].
pub trait Transport {
    /// Serve incoming queries with `handler`, calling `ready` once listening.
    fn listen_and_serve(&self, handler: Arc<dyn QueryHandler>, ready: ReadyFn) -> crate::Result<()>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Routing table and transport failures.
pub enum RoutingError {
    #[error("no nodes to bootstrap from")]
    NoBootstrapNodes,

    #[error("routing table is not bootstrapped")]
    NotBootstrapped,

    #[error("request to {0} timed out")]
    Timeout(SocketAddr),

    #[error("unknown node {0}")]
    UnknownNode(SocketAddr),

    #[error("Query Error Response: {0:?}")]
    ErrorResponse(ErrorSpecific),

    #[error("{0}")]
    Other(String),
}
