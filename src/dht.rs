//! Dht client storing and retrieving mutable items.

use std::{
    path::PathBuf,
    sync::{atomic::Ordering, Arc, PoisonError, RwLock},
    thread,
    time::Instant,
};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::{
    bootstrap::{BootstrapManager, BootstrapOutcome, NodeIdentity},
    common::{Id, MutableItem},
    config::{Config, Poll},
    error::PutError,
    routing::{QueryHandler, ReadyFn, RoutingTable, Transport},
    security::SecuredQueries,
    store_cache::StoreLocatorCache,
    Error, Result,
};

#[derive(Debug)]
/// Mutable items client over a [RoutingTable].
pub struct Dht {
    routing_table: Arc<dyn RoutingTable>,
    stores: StoreLocatorCache,
    identity: RwLock<NodeIdentity>,
    config: Config,
}

impl Dht {
    /// Create a client with the default [Config].
    pub fn new(routing_table: Arc<dyn RoutingTable>) -> Self {
        Self::with_config(routing_table, Config::default())
    }

    pub fn with_config(routing_table: Arc<dyn RoutingTable>, config: Config) -> Self {
        let stores = StoreLocatorCache::new(routing_table.clone())
            .with_capacity(config.store_cache_capacity)
            .with_ttl(config.store_cache_ttl)
            .with_store_limit(config.store_limit);

        let identity = NodeIdentity::new(&config.hostname, routing_table.local_addr());

        Dht {
            routing_table,
            stores,
            identity: RwLock::new(identity),
            config,
        }
    }

    // === Options ===

    /// Set bootstrapping nodes used when the bootstrap file is missing or empty.
    pub fn with_bootstrap(mut self, bootstrap: &[String]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Load bootstrap nodes from, and save them to, `path`.
    pub fn with_bootstrap_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.bootstrap_file = Some(path.into());
        self
    }

    /// Minimum number of storing nodes that must accept a [Dht::put].
    pub fn with_put_quorum(mut self, put_quorum: usize) -> Self {
        self.config.put_quorum = put_quorum;
        self
    }

    // === Getters ===

    /// Our current node Id.
    pub fn id(&self) -> Id {
        self.identity().id()
    }

    pub fn identity(&self) -> NodeIdentity {
        *self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cache of the storing nodes of targets.
    pub fn stores(&self) -> &StoreLocatorCache {
        &self.stores
    }

    // === Public Methods ===

    /// Bootstrap the routing table with our identity, regenerating it once if
    /// the overlay observes us at an address it isn't bound to.
    ///
    /// An identity is bound to a public address only once. After a successful
    /// bind, bootstrapping again from a different public address fails with
    /// [Error::BootstrapDivergence] and the id is kept. A host whose address
    /// changes needs a new [Dht] to get an id secure for it.
    pub fn bootstrap(&self) -> Result<BootstrapOutcome> {
        let manager = BootstrapManager::new(self.routing_table.clone(), &self.config.hostname)
            .with_fallback(self.config.bootstrap.clone());

        let outcome = manager.bootstrap(self.identity(), self.config.bootstrap_file.as_deref())?;

        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = outcome.identity;

        Ok(outcome)
    }

    /// Get the most recent value signed by `public_key` at `target`, with a
    /// sequence number of at least `seq`.
    ///
    /// Returns [Error::ValueNotFound] if no storing node has one (yet).
    pub fn get(
        &self,
        target: Id,
        public_key: &[u8; 32],
        seq: i64,
        salt: Option<&[u8]>,
    ) -> Result<Bytes> {
        let peers = self
            .stores
            .resolve_stores(target)
            .map_err(Error::FindPeers)?;

        debug!(?target, seq, peers = peers.len(), "Getting mutable item");

        match self
            .routing_table
            .m_get_all(target, public_key, seq, salt, &peers)
        {
            Ok(Some(item)) => {
                trace!(?target, seq = item.seq(), "Found mutable item");
                Ok(item.value().clone())
            }
            Ok(None) => Err(Error::ValueNotFound),
            Err(error) => Err(Error::RetrieveValue(error)),
        }
    }

    /// Keep calling [Dht::get] until a value is found, backing off exponentially
    /// between attempts.
    ///
    /// Stops with [Error::Timeout] at the deadline of `poll` if it has one,
    /// [Error::Cancelled] once its cancel flag is raised, or on the first error
    /// other than [Error::ValueNotFound].
    pub fn get_until_found(
        &self,
        target: Id,
        public_key: &[u8; 32],
        seq: i64,
        salt: Option<&[u8]>,
        poll: &Poll,
    ) -> Result<Bytes> {
        let mut backoff = poll.initial_backoff;

        loop {
            if poll.cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }

            match self.get(target, public_key, seq, salt) {
                Err(Error::ValueNotFound) => {}
                result => return result,
            }

            let delay = match poll.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }

                    backoff.min(deadline - now)
                }
                None => backoff,
            };
            trace!(?target, ?delay, "Value not found, retrying");

            thread::sleep(delay);
            backoff = backoff.saturating_mul(2).min(poll.max_backoff);
        }
    }

    /// Store `item` at the closest storing nodes to its target.
    ///
    /// Returns the number of nodes that accepted it.
    pub fn put(&self, item: &MutableItem) -> Result<usize> {
        let target = *item.target();

        let peers = self
            .stores
            .resolve_stores(target)
            .map_err(Error::FindPeers)?;

        if peers.is_empty() {
            return Err(Error::StoreValue(PutError::NoClosestNodes));
        }

        let stored_at = self
            .routing_table
            .m_put_all(item, &peers)
            .map_err(|error| Error::StoreValue(error.into()))?;

        if stored_at < self.config.put_quorum {
            return Err(Error::StoreValue(PutError::QuorumNotReached {
                stored_at,
                required: self.config.put_quorum,
            }));
        }

        info!(?target, seq = item.seq(), stored_at, "Stored mutable item");

        Ok(stored_at)
    }

    /// Serve incoming queries with `handler` over `transport`, refusing
    /// `get` and `get_peers` queries from insecure node ids.
    pub fn serve<H: QueryHandler + 'static>(
        &self,
        transport: &dyn Transport,
        handler: H,
        ready: ReadyFn,
    ) -> Result<()> {
        let handler = SecuredQueries::new(handler, self.routing_table.clone());

        transport.listen_and_serve(Arc::new(handler), ready)
    }
}
