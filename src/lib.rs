#![doc = include_str!("../README.md")]

// Public modules
pub mod bootstrap;
pub mod common;
pub mod config;
mod dht;
mod error;
pub mod routing;
pub mod security;
pub mod server;
pub mod store_cache;
pub mod testnet;

pub use crate::common::{Id, MutableItem};
pub use bootstrap::{BootstrapOutcome, NodeIdentity};
pub use bytes::Bytes;
pub use config::{Config, Poll};
pub use dht::Dht;
pub use error::{Error, PutError};
pub use testnet::Testnet;

pub use ed25519_dalek::SigningKey;

/// Alias for `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
