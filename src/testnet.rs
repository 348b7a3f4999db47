//! In-memory overlay of storing nodes, for tests and demos.
//!
//! Every query and response goes through the KRPC codec and the BEP_0042
//! filters, only the UDP socket and the iterative lookups are missing.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::{
    GetValueRequestArguments, Id, Message, MessageType, MutableItem, Node,
    PutMutableRequestArguments, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::routing::{QueryHandler, ReadyFn, RoutingError, RoutingTable, Table, Transport};
use crate::security::{secured_response, SecuredQueries};
use crate::server::StorePeer;

/// Address peers observe the local client at, unless changed with [Testnet::set_client_address].
pub const DEFAULT_CLIENT_ADDRESS: ([u8; 4], u16) = ([198, 51, 100, 7], 6881);

#[derive(Debug, Clone)]
struct TestnetNode {
    id: Id,
    store: Arc<StorePeer>,
    table: Arc<NodeTable>,
    handler: Arc<SecuredQueries<Arc<StorePeer>>>,
}

#[derive(Debug)]
struct Client {
    address: SocketAddr,
    id: Option<Id>,
    peers: BTreeSet<SocketAddr>,
    stores: BTreeSet<SocketAddr>,
}

/// A network of [StorePeer]s and the routing table of one local client.
///
/// Implements [RoutingTable] for the client and [Transport] for queries sent to it.
#[derive(Debug)]
pub struct Testnet {
    nodes: RwLock<BTreeMap<SocketAddr, TestnetNode>>,
    client: RwLock<Client>,
    served: RwLock<Option<Arc<dyn QueryHandler>>>,
    transaction_id: AtomicU16,
    lookups: AtomicUsize,
}

impl Testnet {
    /// Create a testnet of `count` storing nodes with secure ids.
    pub fn new(count: usize) -> Testnet {
        let testnet = Testnet {
            nodes: RwLock::new(BTreeMap::new()),
            client: RwLock::new(Client {
                address: SocketAddr::from(DEFAULT_CLIENT_ADDRESS),
                id: None,
                peers: BTreeSet::new(),
                stores: BTreeSet::new(),
            }),
            served: RwLock::new(None),
            transaction_id: AtomicU16::new(0),
            lookups: AtomicUsize::new(0),
        };

        for i in 0..count {
            let address = SocketAddr::from(([10, (i >> 16) as u8, (i >> 8) as u8, i as u8], 6881));
            let id = Id::secure(&format!("testnet-{}", i), None, Some(address.ip()));

            testnet.add_node(id, address);
        }

        testnet
    }

    // === Public Methods ===

    /// Add a storing node, `id` isn't required to be secure for `address`.
    pub fn add_node(&self, id: Id, address: SocketAddr) -> Arc<StorePeer> {
        let store = Arc::new(StorePeer::new(id));
        let table = Arc::new(NodeTable::new(address));

        let node = TestnetNode {
            id,
            store: store.clone(),
            table: table.clone(),
            handler: Arc::new(SecuredQueries::new(store.clone(), table)),
        };

        self.nodes_mut().insert(address, node);

        store
    }

    /// Addresses of all storing nodes, to bootstrap from.
    pub fn bootstrap_nodes(&self) -> Vec<String> {
        self.nodes_ref()
            .keys()
            .map(|address| address.to_string())
            .collect()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes_ref()
            .iter()
            .map(|(address, node)| Node::new(node.id, *address))
            .collect()
    }

    /// The storing node at `address`.
    pub fn store(&self, address: &SocketAddr) -> Option<Arc<StorePeer>> {
        self.nodes_ref().get(address).map(|node| node.store.clone())
    }

    /// Whether the node at `node` has `address` in one of its tables.
    pub fn node_knows(&self, node: &SocketAddr, table: Table, address: &SocketAddr) -> bool {
        self.nodes_ref()
            .get(node)
            .map(|node| node.table.contains(table, address))
            .unwrap_or(false)
    }

    /// Whether the client has `address` in one of its tables.
    pub fn client_knows(&self, table: Table, address: &SocketAddr) -> bool {
        let client = self.client_ref();

        match table {
            Table::Peers => client.peers.contains(address),
            Table::Stores => client.stores.contains(address),
        }
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_ref().address
    }

    /// Peers will observe the client at `address` from now on.
    pub fn set_client_address(&self, address: SocketAddr) {
        self.client_mut().address = address;
    }

    /// Number of [RoutingTable::lookup_stores] calls so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Send a query from a remote node to the handler the client serves.
    pub fn query_client(
        &self,
        from: SocketAddr,
        requester_id: Id,
        request_type: RequestTypeSpecific,
    ) -> Result<Option<Message>, RoutingError> {
        let handler = self
            .served
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RoutingError::UnknownNode(self.client_address()))?;

        let request = Message::request(
            self.next_transaction_id(),
            RequestSpecific {
                requester_id,
                request_type,
            },
        );

        exchange(&request, from, handler.as_ref())
    }

    // === Private Methods ===

    fn nodes_ref(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SocketAddr, TestnetNode>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SocketAddr, TestnetNode>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_ref(&self) -> std::sync::RwLockReadGuard<'_, Client> {
        self.client.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_mut(&self) -> std::sync::RwLockWriteGuard<'_, Client> {
        self.client.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a query from the client to the node at `to`, returning its filtered answer.
    fn query(&self, to: SocketAddr, request_type: RequestTypeSpecific) -> Result<Message, RoutingError> {
        let (from, requester_id) = {
            let client = self.client_ref();
            (client.address, client.id.ok_or(RoutingError::NotBootstrapped)?)
        };

        let node = self
            .nodes_ref()
            .get(&to)
            .cloned()
            .ok_or(RoutingError::UnknownNode(to))?;

        node.table.learn(from, requester_id);

        let request = Message::request(
            self.next_transaction_id(),
            RequestSpecific {
                requester_id,
                request_type,
            },
        );

        let response = exchange(&request, from, node.handler.as_ref())?
            .ok_or(RoutingError::Timeout(to))?;

        Ok(secured_response(to, response))
    }

    fn get_token(&self, peer: SocketAddr, target: Id) -> Result<Option<Vec<u8>>, RoutingError> {
        let message = self.query(
            peer,
            RequestTypeSpecific::GetValue(GetValueRequestArguments { target, seq: None }),
        )?;

        Ok(match message.message_type {
            MessageType::Response(response) => response.token().map(|token| token.to_vec()),
            _ => None,
        })
    }
}

impl RoutingTable for Testnet {
    fn bootstrap(
        &self,
        id: Id,
        _public_address: Option<SocketAddr>,
        nodes: &[String],
    ) -> Result<Option<SocketAddr>, RoutingError> {
        let known: Vec<SocketAddr> = {
            let testnet_nodes = self.nodes_ref();

            nodes
                .iter()
                .filter_map(|node| node.parse::<SocketAddr>().ok())
                .filter(|address| testnet_nodes.contains_key(address))
                .collect()
        };

        if known.is_empty() {
            return Err(RoutingError::NoBootstrapNodes);
        }

        let addresses: Vec<SocketAddr> = self.nodes_ref().keys().copied().collect();

        let mut client = self.client_mut();
        client.id = Some(id);
        client.peers.extend(addresses.iter().copied());
        client.stores.extend(addresses);

        debug!(?id, address = ?client.address, "Testnet client bootstrapped");

        Ok(Some(client.address))
    }

    fn bootstrap_export(&self) -> Vec<String> {
        self.client_ref()
            .stores
            .iter()
            .map(|address| address.to_string())
            .collect()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.client_address())
    }

    fn lookup_stores(&self, target: Id) -> Result<(), RoutingError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        trace!(?target, "Testnet lookup");

        match self.client_ref().id {
            Some(_) => Ok(()),
            None => Err(RoutingError::NotBootstrapped),
        }
    }

    fn closest_stores(&self, target: Id, limit: usize) -> Result<Vec<Node>, RoutingError> {
        let stores = self.client_ref().stores.clone();
        let nodes = self.nodes_ref();

        let mut closest: Vec<Node> = stores
            .iter()
            .filter_map(|address| nodes.get(address).map(|node| Node::new(node.id, *address)))
            .collect();

        closest.sort_by_key(|node| xor(node.id(), &target));
        closest.truncate(limit);

        Ok(closest)
    }

    fn m_get_all(
        &self,
        target: Id,
        public_key: &[u8; 32],
        seq: i64,
        salt: Option<&[u8]>,
        peers: &[SocketAddr],
    ) -> Result<Option<MutableItem>, RoutingError> {
        let mut most_recent: Option<MutableItem> = None;

        for peer in peers {
            let response = match self.query(
                *peer,
                RequestTypeSpecific::GetValue(GetValueRequestArguments {
                    target,
                    // Peers only answer with values more recent than the requested seq.
                    seq: seq.checked_sub(1),
                }),
            ) {
                Ok(response) => response,
                Err(RoutingError::NotBootstrapped) => return Err(RoutingError::NotBootstrapped),
                Err(error) => {
                    debug!(?peer, ?error, "Get query failed");
                    continue;
                }
            };

            match response.message_type {
                MessageType::Response(ResponseSpecific::GetMutable(args)) => {
                    match MutableItem::from_dht_message(
                        target,
                        &args.k,
                        Bytes::from(args.v),
                        args.seq,
                        &args.sig,
                        salt.map(Bytes::copy_from_slice),
                        None,
                    ) {
                        Ok(item) if item.key() == public_key && item.seq() >= seq => {
                            if most_recent
                                .as_ref()
                                .map(|current| item.seq() > current.seq())
                                .unwrap_or(true)
                            {
                                most_recent = Some(item);
                            }
                        }
                        Ok(_) => {}
                        Err(error) => debug!(?peer, ?error, "Invalid mutable item"),
                    }
                }
                MessageType::Error(error) => debug!(?peer, ?error, "Get query error response"),
                _ => {}
            }
        }

        Ok(most_recent)
    }

    fn m_put_all(&self, item: &MutableItem, peers: &[SocketAddr]) -> Result<usize, RoutingError> {
        let mut stored_at = 0;

        for peer in peers {
            let token = match self.get_token(*peer, *item.target()) {
                Ok(Some(token)) => token,
                Ok(None) => {
                    debug!(?peer, "No write token");
                    continue;
                }
                Err(RoutingError::NotBootstrapped) => return Err(RoutingError::NotBootstrapped),
                Err(error) => {
                    debug!(?peer, ?error, "Token query failed");
                    continue;
                }
            };

            let request = RequestTypeSpecific::PutMutable(PutMutableRequestArguments {
                token,
                target: *item.target(),
                v: item.value().to_vec(),
                k: item.key().to_vec(),
                seq: item.seq(),
                sig: item.signature().to_vec(),
                salt: item.salt().map(|salt| salt.to_vec()),
                cas: item.cas(),
            });

            match self.query(*peer, request) {
                Ok(Message {
                    message_type: MessageType::Response(_),
                    ..
                }) => stored_at += 1,
                Ok(message) => debug!(?peer, error = ?message.error(), "Put query error response"),
                Err(error) => debug!(?peer, ?error, "Put query failed"),
            }
        }

        Ok(stored_at)
    }

    fn remove_node(&self, table: Table, address: SocketAddr) {
        let mut client = self.client_mut();

        match table {
            Table::Peers => client.peers.remove(&address),
            Table::Stores => client.stores.remove(&address),
        };
    }
}

impl Transport for Testnet {
    fn listen_and_serve(&self, handler: Arc<dyn QueryHandler>, ready: ReadyFn) -> crate::Result<()> {
        *self.served.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);

        ready()
    }
}

/// Routing table of a storing node, only learning about nodes that query it.
#[derive(Debug)]
pub struct NodeTable {
    address: SocketAddr,
    peers: RwLock<BTreeMap<SocketAddr, Id>>,
    stores: RwLock<BTreeMap<SocketAddr, Id>>,
}

impl NodeTable {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            peers: RwLock::new(BTreeMap::new()),
            stores: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn contains(&self, table: Table, address: &SocketAddr) -> bool {
        self.table(table)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    fn learn(&self, address: SocketAddr, id: Id) {
        for table in [Table::Peers, Table::Stores] {
            self.table(table)
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address, id);
        }
    }

    fn table(&self, table: Table) -> &RwLock<BTreeMap<SocketAddr, Id>> {
        match table {
            Table::Peers => &self.peers,
            Table::Stores => &self.stores,
        }
    }
}

impl RoutingTable for NodeTable {
    fn bootstrap(
        &self,
        _id: Id,
        _public_address: Option<SocketAddr>,
        _nodes: &[String],
    ) -> Result<Option<SocketAddr>, RoutingError> {
        Ok(None)
    }

    fn bootstrap_export(&self) -> Vec<String> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|address| address.to_string())
            .collect()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.address)
    }

    fn lookup_stores(&self, _target: Id) -> Result<(), RoutingError> {
        Ok(())
    }

    fn closest_stores(&self, target: Id, limit: usize) -> Result<Vec<Node>, RoutingError> {
        let mut closest: Vec<Node> = self
            .stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(address, id)| Node::new(*id, *address))
            .collect();

        closest.sort_by_key(|node| xor(node.id(), &target));
        closest.truncate(limit);

        Ok(closest)
    }

    fn m_get_all(
        &self,
        _target: Id,
        _public_key: &[u8; 32],
        _seq: i64,
        _salt: Option<&[u8]>,
        _peers: &[SocketAddr],
    ) -> Result<Option<MutableItem>, RoutingError> {
        Err(RoutingError::Other("testnet nodes only answer queries".to_string()))
    }

    fn m_put_all(&self, _item: &MutableItem, _peers: &[SocketAddr]) -> Result<usize, RoutingError> {
        Err(RoutingError::Other("testnet nodes only answer queries".to_string()))
    }

    fn remove_node(&self, table: Table, address: SocketAddr) {
        self.table(table)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }
}

/// Deliver `request` from `from` to `handler` and its answer back, both through the wire codec.
fn exchange(
    request: &Message,
    from: SocketAddr,
    handler: &dyn QueryHandler,
) -> Result<Option<Message>, RoutingError> {
    let received = Message::from_bytes(request.to_bytes().map_err(wire)?).map_err(wire)?;

    let specific = match &received.message_type {
        MessageType::Request(specific) => specific,
        _ => return Err(RoutingError::Other("expected a query".to_string())),
    };

    let answer = match handler.handle_request(from, specific) {
        Some(answer) => answer,
        None => return Ok(None),
    };

    let response =
        Message::from_bytes(Message::reply(&received, from, answer).to_bytes().map_err(wire)?)
            .map_err(wire)?;

    if response.transaction_id != request.transaction_id {
        return Err(RoutingError::Other("transaction id mismatch".to_string()));
    }

    Ok(Some(response))
}

fn wire(error: crate::Error) -> RoutingError {
    RoutingError::Other(error.to_string())
}

fn xor(id: &Id, target: &Id) -> [u8; 20] {
    let mut distance = [0_u8; 20];

    for (i, byte) in distance.iter_mut().enumerate() {
        *byte = id.as_bytes()[i] ^ target.as_bytes()[i];
    }

    distance
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::common::{ErrorSpecific, ERROR_INSECURE_NODE_ID};

    fn bootstrapped(count: usize) -> (Testnet, Id) {
        let testnet = Testnet::new(count);
        let id = Id::secure("client", None, Some(testnet.client_address().ip()));

        testnet
            .bootstrap(id, None, &testnet.bootstrap_nodes())
            .unwrap();

        (testnet, id)
    }

    fn all_stores(testnet: &Testnet, target: Id) -> Vec<SocketAddr> {
        testnet
            .closest_stores(target, 64)
            .unwrap()
            .iter()
            .map(|node| node.address())
            .collect()
    }

    #[test]
    fn bootstrap_requires_known_nodes() {
        let testnet = Testnet::new(3);

        assert_eq!(
            testnet.bootstrap(Id::random(), None, &["router.bittorrent.com:6881".to_string()]),
            Err(RoutingError::NoBootstrapNodes)
        );
        assert_eq!(
            testnet.lookup_stores(Id::random()),
            Err(RoutingError::NotBootstrapped)
        );
    }

    #[test]
    fn bootstrap_reports_the_observed_address() {
        let testnet = Testnet::new(3);

        let recommended = testnet
            .bootstrap(Id::random(), None, &testnet.bootstrap_nodes())
            .unwrap();

        assert_eq!(recommended, Some(testnet.client_address()));
        assert_eq!(testnet.bootstrap_export().len(), 3);
    }

    #[test]
    fn closest_stores_are_sorted() {
        let (testnet, _) = bootstrapped(20);
        let target = Id::random();

        let closest = testnet.closest_stores(target, 5).unwrap();

        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(xor(pair[0].id(), &target) <= xor(pair[1].id(), &target));
        }
    }

    #[test]
    fn put_then_get() {
        let (testnet, _) = bootstrapped(10);
        let signer = SigningKey::from_bytes(&[3; 32]);
        let item = MutableItem::new(&signer, b"hello", 1, Some(b"salt"));
        let peers = all_stores(&testnet, *item.target());

        assert_eq!(testnet.m_put_all(&item, &peers).unwrap(), 10);

        let found = testnet
            .m_get_all(*item.target(), item.key(), 1, Some(b"salt"), &peers)
            .unwrap()
            .unwrap();

        assert_eq!(found.value().as_ref(), b"hello");
        assert_eq!(found.seq(), 1);

        assert!(testnet
            .m_get_all(*item.target(), item.key(), 2, Some(b"salt"), &peers)
            .unwrap()
            .is_none());
    }

    #[test]
    fn get_returns_the_most_recent() {
        let (testnet, _) = bootstrapped(4);
        let signer = SigningKey::from_bytes(&[3; 32]);
        let first = MutableItem::new(&signer, b"first", 1, None);
        let second = MutableItem::new(&signer, b"second", 2, None);
        let peers = all_stores(&testnet, *first.target());

        testnet.m_put_all(&first, &peers).unwrap();
        testnet.m_put_all(&second, &peers[..1]).unwrap();

        let found = testnet
            .m_get_all(*first.target(), first.key(), 1, None, &peers)
            .unwrap()
            .unwrap();

        assert_eq!(found.value().as_ref(), b"second");
    }

    #[test]
    fn insecure_nodes_get_no_values() {
        let (testnet, _) = bootstrapped(2);
        let address = SocketAddr::from(([10, 9, 9, 9], 6881));
        let insecure = Id::secure("liar", None, Some(IpAddr::from([21, 75, 31, 124])));
        let store = testnet.add_node(insecure, address);

        let item = MutableItem::new(&SigningKey::from_bytes(&[3; 32]), b"hello", 1, None);

        // Its token is dropped, so it is never written to.
        assert_eq!(testnet.m_put_all(&item, &[address]).unwrap(), 0);
        assert!(store.stored(item.target()).is_none());
    }

    #[test]
    fn insecure_client_is_evicted() {
        let (testnet, _) = bootstrapped(2);
        let node = testnet.nodes()[0].address();
        let item = MutableItem::new(&SigningKey::from_bytes(&[3; 32]), b"hello", 1, None);

        testnet.m_put_all(&item, &[node]).unwrap();
        assert!(testnet.node_knows(&node, Table::Stores, &testnet.client_address()));

        let moved = SocketAddr::from(([21, 75, 31, 124], 6881));
        testnet.set_client_address(moved);

        let found = testnet
            .m_get_all(*item.target(), item.key(), 1, None, &[node])
            .unwrap();

        assert!(found.is_none());
        assert!(!testnet.node_knows(&node, Table::Stores, &moved));
        assert!(!testnet.node_knows(&node, Table::Peers, &moved));
    }

    #[test]
    fn serves_queries_to_the_client() {
        #[derive(Debug)]
        struct Refuse;

        impl QueryHandler for Refuse {
            fn handle_request(&self, _from: SocketAddr, _request: &RequestSpecific) -> Option<MessageType> {
                Some(MessageType::Error(ErrorSpecific {
                    code: 201,
                    description: "Generic Error".to_string(),
                }))
            }
        }

        let testnet = Testnet::new(1);
        let from = SocketAddr::from(([10, 0, 0, 0], 6881));

        assert!(testnet
            .query_client(from, Id::random(), RequestTypeSpecific::Ping)
            .is_err());

        testnet
            .listen_and_serve(Arc::new(Refuse), Box::new(|| Ok(())))
            .unwrap();

        let response = testnet
            .query_client(from, Id::random(), RequestTypeSpecific::Ping)
            .unwrap()
            .unwrap();

        assert_eq!(response.error().map(|error| error.code), Some(201));
        assert_ne!(response.error().map(|error| error.code), Some(ERROR_INSECURE_NODE_ID));
    }
}
