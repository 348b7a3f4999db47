//! Joining the overlay, and keeping our node id bound to our public address.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::Id;
use crate::config::DEFAULT_BOOTSTRAP_NODES;
use crate::routing::RoutingTable;
use crate::{Error, Result};

/// Our node id, before and after learning our public address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdentity {
    /// Derived from the host alone.
    Unbound(Id),
    /// Bound to `address` per BEP_0042.
    Bound { id: Id, address: SocketAddr },
}

impl NodeIdentity {
    /// A fresh identity for this host, bound to `local_addr` if it is known.
    pub fn new(hostname: &str, local_addr: Option<SocketAddr>) -> Self {
        NodeIdentity::Unbound(Id::secure(hostname, local_addr, None))
    }

    pub fn id(&self) -> Id {
        match self {
            NodeIdentity::Unbound(id) => *id,
            NodeIdentity::Bound { id, .. } => *id,
        }
    }

    pub fn public_address(&self) -> Option<SocketAddr> {
        match self {
            NodeIdentity::Unbound(_) => None,
            NodeIdentity::Bound { address, .. } => Some(*address),
        }
    }

    /// Returns `true` if our id is already valid for `address`.
    pub fn is_secure_for(&self, address: SocketAddr) -> bool {
        self.id().is_secure_for(address.ip())
    }

    /// Regenerate the id for `address`.
    ///
    /// Returns `None` if the identity is already bound, an id is bound at most once.
    pub fn bind(
        self,
        hostname: &str,
        local_addr: Option<SocketAddr>,
        address: SocketAddr,
    ) -> Option<NodeIdentity> {
        match self {
            NodeIdentity::Unbound(_) => Some(NodeIdentity::Bound {
                id: Id::secure(hostname, local_addr, Some(address.ip())),
                address,
            }),
            NodeIdentity::Bound { .. } => None,
        }
    }
}

/// Bootstrap nodes and our public address, persisted between runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BootstrapRecord {
    pub nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl BootstrapRecord {
    /// Read a bencoded record from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;

        Ok(serde_bencode::from_bytes(&bytes)?)
    }

    /// Write this record bencoded to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_bencode::to_bytes(self)?)?;

        Ok(())
    }

    /// The last known public address, ignored if it doesn't parse.
    pub fn public_address(&self) -> Option<SocketAddr> {
        self.ip.as_deref().and_then(|ip| ip.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapOutcome {
    /// Nodes in the routing table after bootstrapping.
    pub nodes: Vec<String>,
    /// Our best known public address.
    pub public_address: Option<SocketAddr>,
    pub identity: NodeIdentity,
}

/// Bootstraps the routing table, regenerating our node id at most once if the
/// overlay reports a public address our id isn't bound to.
#[derive(Debug)]
pub struct BootstrapManager {
    routing_table: Arc<dyn RoutingTable>,
    hostname: String,
    fallback: Vec<String>,
}

impl BootstrapManager {
    pub fn new(routing_table: Arc<dyn RoutingTable>, hostname: &str) -> Self {
        Self {
            routing_table,
            hostname: hostname.to_string(),
            fallback: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Nodes to use when the bootstrap file is missing, unreadable or empty.
    pub fn with_fallback(mut self, nodes: Vec<String>) -> Self {
        self.fallback = nodes;
        self
    }

    /// Bootstrap the routing table as `identity`, loading nodes from `file` if given
    /// and saving the exported nodes back to it.
    ///
    /// An [NodeIdentity::Unbound] identity is regenerated for the first public
    /// address the overlay recommends and retried once. A [NodeIdentity::Bound]
    /// identity is never regenerated: a recommended address it isn't secure for
    /// fails with [Error::BootstrapDivergence], so a host that changed address
    /// has to start over from [NodeIdentity::new].
    pub fn bootstrap(&self, identity: NodeIdentity, file: Option<&Path>) -> Result<BootstrapOutcome> {
        info!("DHT bootstrap...");

        let (nodes, saved_address) = self.load(file);
        let mut identity = identity;
        let mut public_address = identity.public_address().or(saved_address);

        match self
            .routing_table
            .bootstrap(identity.id(), public_address, &nodes)
        {
            Err(error) if !nodes.is_empty() => return Err(Error::Bootstrap(error)),
            Err(error) => {
                debug!(?error, "Bootstrap failed without any bootstrap nodes");
            }
            Ok(Some(recommended)) if !identity.is_secure_for(recommended) => {
                info!(?recommended, "After bootstrap a new recommended address was provided");

                identity = match identity.bind(
                    &self.hostname,
                    self.routing_table.local_addr(),
                    recommended,
                ) {
                    Some(bound) => bound,
                    None => {
                        let first = public_address.unwrap_or(recommended);
                        warn!(?first, second = ?recommended, "Bound identity got a new recommended address");

                        return Err(Error::BootstrapDivergence {
                            first,
                            second: recommended,
                        });
                    }
                };
                public_address = Some(recommended);

                match self
                    .routing_table
                    .bootstrap(identity.id(), public_address, &nodes)
                {
                    Err(error) => return Err(Error::Bootstrap(error)),
                    Ok(Some(second)) if second.ip() != recommended.ip() => {
                        warn!(
                            first = ?recommended,
                            ?second,
                            "After bootstrap another recommended address was provided"
                        );

                        return Err(Error::BootstrapDivergence {
                            first: recommended,
                            second,
                        });
                    }
                    Ok(_) => {}
                }
            }
            Ok(Some(recommended)) => {
                if let NodeIdentity::Unbound(id) = identity {
                    identity = NodeIdentity::Bound {
                        id,
                        address: recommended,
                    };
                }
                public_address = Some(recommended);
            }
            Ok(None) => {}
        }

        let mut final_nodes = nodes;

        if !final_nodes.is_empty() {
            let exported = self.routing_table.bootstrap_export();
            info!(nodes = exported.len(), "Bootstrap nodes");

            if let Some(path) = file {
                let record = BootstrapRecord {
                    nodes: exported.clone(),
                    ip: public_address.map(|address| address.to_string()),
                };

                if let Err(error) = record.save(path) {
                    warn!(?error, ?path, "Failed to save bootstrap nodes");
                }
            }

            if !exported.is_empty() {
                final_nodes = exported;
            }
        }

        info!(id = %identity.id(), ?public_address, "Bootstrapped");

        Ok(BootstrapOutcome {
            nodes: final_nodes,
            public_address,
            identity,
        })
    }

    fn load(&self, file: Option<&Path>) -> (Vec<String>, Option<SocketAddr>) {
        if let Some(path) = file {
            match BootstrapRecord::load(path) {
                Ok(record) if !record.nodes.is_empty() => {
                    info!(nodes = record.nodes.len(), "Loaded bootstrap nodes");
                    let address = record.public_address();

                    return (record.nodes, address);
                }
                Ok(_) => debug!(?path, "Bootstrap file has no nodes"),
                Err(error) => debug!(?error, ?path, "Could not load bootstrap file"),
            }
        }

        (self.fallback.clone(), None)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::path::PathBuf;

    use super::*;
    use crate::routing::mock::MockTable;
    use crate::routing::RoutingError;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dhtstore-{}-{}", name, Id::random()))
    }

    fn address(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::from((ip, 6881))
    }

    #[test]
    fn falls_back_to_public_nodes() {
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(None)]));
        let manager = BootstrapManager::new(table.clone(), "host");
        let identity = NodeIdentity::new("host", None);

        let outcome = manager.bootstrap(identity, None).unwrap();

        let calls = table.bootstrap_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, identity.id());
        assert_eq!(calls[0].1, None);
        assert_eq!(
            calls[0].2,
            vec![
                "router.bittorrent.com:6881".to_string(),
                "router.utorrent.com:6881".to_string()
            ]
        );
        assert_eq!(outcome.identity, identity);
        assert_eq!(outcome.nodes.len(), 2);
    }

    #[test]
    fn retries_once_with_regenerated_id() {
        let recommended = address([124, 31, 75, 21]);
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![
            Ok(Some(recommended)),
            Ok(None),
        ]));
        let manager = BootstrapManager::new(table.clone(), "host");
        let identity = NodeIdentity::new("host", None);

        let outcome = manager.bootstrap(identity, None).unwrap();

        let calls = table.bootstrap_calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[1].0, identity.id());
        assert!(calls[1].0.is_secure_for(recommended.ip()));
        assert_eq!(calls[1].1, Some(recommended));
        assert_eq!(outcome.public_address, Some(recommended));
        assert_eq!(
            outcome.identity,
            NodeIdentity::Bound {
                id: calls[1].0,
                address: recommended
            }
        );
    }

    #[test]
    fn same_address_after_retry_converges() {
        let recommended = address([124, 31, 75, 21]);
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![
            Ok(Some(recommended)),
            Ok(Some(recommended)),
        ]));
        let manager = BootstrapManager::new(table.clone(), "host");

        let outcome = manager
            .bootstrap(NodeIdentity::new("host", None), None)
            .unwrap();

        assert_eq!(table.bootstrap_calls().len(), 2);
        assert_eq!(outcome.public_address, Some(recommended));
    }

    #[test]
    fn second_new_address_diverges() {
        let first = address([124, 31, 75, 21]);
        let second = address([21, 75, 31, 124]);
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![
            Ok(Some(first)),
            Ok(Some(second)),
            Ok(None),
        ]));
        let manager = BootstrapManager::new(table.clone(), "host");

        let result = manager.bootstrap(NodeIdentity::new("host", None), None);

        assert!(matches!(
            result,
            Err(Error::BootstrapDivergence { first: f, second: s }) if f == first && s == second
        ));
        assert_eq!(table.bootstrap_calls().len(), 2);
    }

    #[test]
    fn bound_identity_is_kept() {
        let public = address([124, 31, 75, 21]);
        let identity = NodeIdentity::new("host", None)
            .bind("host", None, public)
            .unwrap();
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(Some(public))]));
        let manager = BootstrapManager::new(table.clone(), "host");

        let outcome = manager.bootstrap(identity, None).unwrap();

        assert_eq!(table.bootstrap_calls().len(), 1);
        assert_eq!(table.bootstrap_calls()[0].1, Some(public));
        assert_eq!(outcome.identity, identity);
    }

    #[test]
    fn bound_identity_is_never_rebound() {
        let public = address([124, 31, 75, 21]);
        let moved = address([21, 75, 31, 124]);
        let identity = NodeIdentity::new("host", None)
            .bind("host", None, public)
            .unwrap();
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(Some(moved))]));
        let manager = BootstrapManager::new(table.clone(), "host");

        assert!(matches!(
            manager.bootstrap(identity, None),
            Err(Error::BootstrapDivergence { first, second }) if first == public && second == moved
        ));
        assert_eq!(table.bootstrap_calls().len(), 1);
        assert!(identity.bind("host", None, moved).is_none());
    }

    #[test]
    fn failure_is_propagated() {
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Err(
            RoutingError::Timeout(address([1, 1, 1, 1])),
        )]));
        let manager = BootstrapManager::new(table.clone(), "host");

        assert!(matches!(
            manager.bootstrap(NodeIdentity::new("host", None), None),
            Err(Error::Bootstrap(RoutingError::Timeout(_)))
        ));
    }

    #[test]
    fn failure_without_nodes_is_ignored() {
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Err(
            RoutingError::NoBootstrapNodes,
        )]));
        let manager = BootstrapManager::new(table.clone(), "host").with_fallback(vec![]);

        let outcome = manager
            .bootstrap(NodeIdentity::new("host", None), None)
            .unwrap();

        assert!(outcome.nodes.is_empty());
    }

    #[test]
    fn persists_and_reloads_the_record() {
        let path = temp_file("bootstrap");
        let recommended = address([124, 31, 75, 21]);
        let table = Arc::new(MockTable::with_bootstrap_answers(vec![
            Ok(Some(recommended)),
            Ok(None),
        ]));
        let manager = BootstrapManager::new(table.clone(), "host");

        manager
            .bootstrap(NodeIdentity::new("host", None), Some(&path))
            .unwrap();

        let record = BootstrapRecord::load(&path).unwrap();
        assert_eq!(record.nodes, table.bootstrap_export());
        assert_eq!(record.public_address(), Some(recommended));

        // The next run starts from the saved nodes and address.
        let next = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(None)]));
        BootstrapManager::new(next.clone(), "host")
            .bootstrap(NodeIdentity::new("host", None), Some(&path))
            .unwrap();

        assert_eq!(next.bootstrap_calls()[0].1, Some(recommended));
        assert_eq!(next.bootstrap_calls()[0].2, table.bootstrap_export());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_falls_back() {
        let path = temp_file("corrupt");
        fs::write(&path, b"not bencode").unwrap();

        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(None)]));
        BootstrapManager::new(table.clone(), "host")
            .bootstrap(NodeIdentity::new("host", None), Some(&path))
            .unwrap();

        assert_eq!(table.bootstrap_calls()[0].2.len(), 2);
        assert_eq!(table.bootstrap_calls()[0].2[0], "router.bittorrent.com:6881");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn save_failure_is_not_fatal() {
        let path = std::env::temp_dir()
            .join(format!("dhtstore-missing-{}", Id::random()))
            .join("bootstrap");

        let table = Arc::new(MockTable::with_bootstrap_answers(vec![Ok(None)]));
        let outcome = BootstrapManager::new(table, "host")
            .bootstrap(NodeIdentity::new("host", None), Some(&path));

        assert!(outcome.is_ok());
    }

    #[test]
    fn bind_makes_a_secure_id() {
        let public = SocketAddr::new(IpAddr::from([65, 23, 51, 170]), 1234);
        let identity = NodeIdentity::new("host", None)
            .bind("host", None, public)
            .unwrap();

        assert!(identity.is_secure_for(public));
        assert_eq!(identity.public_address(), Some(public));
    }
}
