//! Main Crate Error

use std::net::SocketAddr;

use crate::common::MutableError;
use crate::routing::RoutingError;

#[derive(thiserror::Error, Debug)]
/// Dhtstore crate error enum.
pub enum Error {
    /// No storing peer reported a value for the requested target, key, salt and sequence number.
    ///
    /// The value may show up later, callers are expected to retry.
    #[error("value not found")]
    ValueNotFound,

    /// The overlay recommended a second, different public address after we already
    /// regenerated our node id once.
    #[error("bootstrap did not converge on a public address: first {first}, then {second}")]
    BootstrapDivergence {
        first: SocketAddr,
        second: SocketAddr,
    },

    #[error("bootstrapping the routing table failed: {0}")]
    Bootstrap(#[source] RoutingError),

    #[error("finding peers failed: {0}")]
    FindPeers(#[source] RoutingError),

    #[error("retrieving value from the DHT network failed: {0}")]
    RetrieveValue(#[source] RoutingError),

    #[error("storing value in the DHT network failed: {0}")]
    StoreValue(#[source] PutError),

    #[error("failed to create mutable target: {0}")]
    Mutable(#[from] MutableError),

    /// Polling for a value exceeded its deadline.
    #[error("timed out waiting for value")]
    Timeout,

    /// Polling for a value was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// A decoded KRPC message is missing a field its type requires.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
}

#[derive(thiserror::Error, Debug)]
/// Failures of [crate::Dht::put].
pub enum PutError {
    /// Failed to find any storing peers, usually means the node failed to bootstrap.
    #[error("Failed to find any nodes close to store value at")]
    NoClosestNodes,

    #[error("stored at {stored_at} nodes, {required} required")]
    QuorumNotReached { stored_at: usize, required: usize },

    #[error(transparent)]
    Routing(#[from] RoutingError),
}
