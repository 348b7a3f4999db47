//! Cache of the nodes responsible for storing a target.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::common::Id;
use crate::config::{DEFAULT_STORE_CACHE_CAPACITY, DEFAULT_STORE_LIMIT};
use crate::routing::{RoutingError, RoutingTable};

#[derive(Debug)]
struct ClosestStores {
    addresses: Vec<SocketAddr>,
    resolved_at: Instant,
}

impl ClosestStores {
    fn expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map(|ttl| self.resolved_at.elapsed() > ttl)
            .unwrap_or(false)
    }
}

/// Read-through cache of the closest store-capable nodes to targets.
///
/// Lookups happen outside of the lock, so concurrent misses for the same target
/// may both query the network, the last one wins.
#[derive(Debug)]
pub struct StoreLocatorCache {
    routing_table: Arc<dyn RoutingTable>,
    entries: RwLock<LruCache<Id, ClosestStores>>,
    store_limit: usize,
    ttl: Option<Duration>,
}

impl StoreLocatorCache {
    pub fn new(routing_table: Arc<dyn RoutingTable>) -> Self {
        Self {
            routing_table,
            entries: RwLock::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_STORE_CACHE_CAPACITY)
                    .unwrap_or(NonZeroUsize::MIN),
            )),
            store_limit: DEFAULT_STORE_LIMIT,
            ttl: None,
        }
    }

    // === Options ===

    /// Maximum number of targets to remember, least recently resolved are dropped first.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.entries = RwLock::new(LruCache::new(
            NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
        ));
        self
    }

    /// Resolve targets again once their storing nodes are older than `ttl`.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_store_limit(mut self, store_limit: usize) -> Self {
        self.store_limit = store_limit;
        self
    }

    // === Public Methods ===

    /// Closest store-capable nodes to `target`, from the cache if possible.
    pub fn resolve_stores(&self, target: Id) -> Result<Vec<SocketAddr>, RoutingError> {
        if let Some(addresses) = self.cached(&target) {
            trace!(?target, "Storing nodes cache hit");
            return Ok(addresses);
        }

        let addresses = self.closest_stores_for_hash(target)?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .put(
                target,
                ClosestStores {
                    addresses: addresses.clone(),
                    resolved_at: Instant::now(),
                },
            );

        Ok(addresses)
    }

    /// Ask the routing table for the closest store-capable nodes to `target`,
    /// closest first, bypassing the cache.
    pub fn closest_stores_for_hash(&self, target: Id) -> Result<Vec<SocketAddr>, RoutingError> {
        self.routing_table.lookup_stores(target)?;

        let addresses: Vec<SocketAddr> = self
            .routing_table
            .closest_stores(target, self.store_limit)?
            .iter()
            .map(|node| node.address())
            .collect();

        debug!(?target, stores = addresses.len(), "Resolved storing nodes");

        Ok(addresses)
    }

    /// Forget the storing nodes of `target`.
    pub fn invalidate(&self, target: &Id) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(target);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Private Methods ===

    fn cached(&self, target: &Id) -> Option<Vec<SocketAddr>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(target)
            .filter(|entry| !entry.expired(self.ttl))
            .map(|entry| entry.addresses.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::routing::mock::MockTable;

    #[test]
    fn second_resolve_hits_the_cache() {
        let table = Arc::new(MockTable::default());
        let cache = StoreLocatorCache::new(table.clone());
        let target = Id::random();

        let first = cache.resolve_stores(target).unwrap();
        let second = cache.resolve_stores(target).unwrap();

        assert_eq!(first, second);
        assert_eq!(table.lookups(), 1);
    }

    #[test]
    fn closest_first_and_limited() {
        let table = Arc::new(MockTable::default());
        let cache = StoreLocatorCache::new(table.clone());

        let addresses = cache.resolve_stores(Id::random()).unwrap();

        assert_eq!(addresses.len(), DEFAULT_STORE_LIMIT);
        assert_eq!(addresses[0].port(), 1);
        assert_eq!(addresses[63].port(), 64);
    }

    #[test]
    fn failures_are_not_cached() {
        let table = Arc::new(
            MockTable::default().failing_lookups(RoutingError::Other("lookup failed".to_string())),
        );
        let cache = StoreLocatorCache::new(table.clone());
        let target = Id::random();

        assert!(cache.resolve_stores(target).is_err());
        assert!(cache.resolve_stores(target).is_err());
        assert_eq!(table.lookups(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_resolved_again() {
        let table = Arc::new(MockTable::default());
        let cache = StoreLocatorCache::new(table.clone()).with_ttl(Some(Duration::ZERO));
        let target = Id::random();

        cache.resolve_stores(target).unwrap();
        thread::sleep(Duration::from_millis(2));
        cache.resolve_stores(target).unwrap();

        assert_eq!(table.lookups(), 2);
    }

    #[test]
    fn invalidate_and_capacity() {
        let table = Arc::new(MockTable::default());
        let cache = StoreLocatorCache::new(table.clone()).with_capacity(1);
        let first = Id::random();

        cache.resolve_stores(first).unwrap();
        cache.resolve_stores(Id::random()).unwrap();
        assert_eq!(cache.len(), 1);

        // Evicted by the second target.
        cache.resolve_stores(first).unwrap();
        assert_eq!(table.lookups(), 3);

        cache.invalidate(&first);
        assert!(cache.is_empty());
    }

    #[test]
    fn poisoned_lock_keeps_caching() {
        let table = Arc::new(MockTable::default());
        let cache = Arc::new(StoreLocatorCache::new(table.clone()));

        {
            let cache = cache.clone();
            let _ = thread::spawn(move || {
                let _entries = cache.entries.write().unwrap();
                panic!("writer panicked");
            })
            .join();
        }
        assert!(cache.entries.is_poisoned());

        let target = Id::random();
        cache.resolve_stores(target).unwrap();
        cache.resolve_stores(target).unwrap();

        assert_eq!(table.lookups(), 1);
        assert_eq!(cache.len(), 1);

        cache.invalidate(&target);
        assert!(cache.is_empty());
    }

    #[test]
    fn pending_lookup_does_not_block_other_targets() {
        let table = Arc::new(MockTable::default());
        let cache = Arc::new(StoreLocatorCache::new(table.clone()));

        let cached = Id::random();
        let missing = Id::random();
        let expected = cache.resolve_stores(cached).unwrap();

        let (started, release) = table.hold_lookup(missing);
        let resolving = {
            let cache = cache.clone();
            thread::spawn(move || cache.resolve_stores(missing))
        };
        started.recv().unwrap();

        let (sender, receiver) = mpsc::channel();
        {
            let cache = cache.clone();
            thread::spawn(move || {
                let _ = sender.send((cache.resolve_stores(cached), cache.len()));
            });
        }

        let (hit, len) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hit.unwrap(), expected);
        assert_eq!(len, 1);
        assert_eq!(table.lookups(), 2);

        release.send(()).unwrap();

        assert_eq!(resolving.join().unwrap().unwrap().len(), DEFAULT_STORE_LIMIT);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_misses_both_resolve() {
        let table = Arc::new(MockTable::default());
        let cache = Arc::new(StoreLocatorCache::new(table.clone()));
        let target = Id::random();

        let (first_started, first_release) = table.hold_lookup(target);
        let (second_started, second_release) = table.hold_lookup(target);

        let spawn = || {
            let cache = cache.clone();
            thread::spawn(move || cache.resolve_stores(target))
        };
        let first = spawn();
        first_started.recv().unwrap();
        let second = spawn();
        second_started.recv().unwrap();

        // Both missed before either wrote.
        assert!(cache.is_empty());

        first_release.send(()).unwrap();
        second_release.send(()).unwrap();

        let first = first.join().unwrap().unwrap();
        let second = second.join().unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(table.lookups(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_resolved_stores_win() {
        let table = Arc::new(MockTable::default());
        let cache = Arc::new(StoreLocatorCache::new(table.clone()));
        let target = Id::random();

        let (first_started, first_release) = table.hold_lookup(target);
        let (second_started, second_release) = table.hold_lookup(target);

        let spawn = || {
            let cache = cache.clone();
            thread::spawn(move || cache.resolve_stores(target))
        };
        let first = spawn();
        first_started.recv().unwrap();
        let second = spawn();
        second_started.recv().unwrap();

        first_release.send(()).unwrap();
        let first = first.join().unwrap().unwrap();

        let moved = vec![SocketAddr::from(([10, 0, 0, 1], 6881))];
        table.set_stores(moved.clone());

        second_release.send(()).unwrap();
        assert_eq!(second.join().unwrap().unwrap(), moved);

        assert_ne!(first, moved);
        assert_eq!(cache.resolve_stores(target).unwrap(), moved);
        assert_eq!(table.lookups(), 2);
    }
}
