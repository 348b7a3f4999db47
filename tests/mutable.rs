use std::net::SocketAddr;
use std::sync::Arc;

use dhtstore::common::{
    GetValueRequestArguments, RequestTypeSpecific, ERROR_INSECURE_NODE_ID,
};
use dhtstore::routing::Table;
use dhtstore::server::StorePeer;
use dhtstore::{Dht, Error, Id, MutableItem, PutError, SigningKey, Testnet};

fn bootstrapped(testnet: &Arc<Testnet>) -> Dht {
    let dht = Dht::new(testnet.clone()).with_bootstrap(&testnet.bootstrap_nodes());
    dht.bootstrap().unwrap();

    dht
}

#[test]
fn put_then_get_by_sequence() {
    let testnet = Arc::new(Testnet::new(20));
    let dht = bootstrapped(&testnet);

    let secret = [9_u8; 32];
    let item = MutableItem::sign(&secret, b"hello", 1, None).unwrap();
    let public_key = SigningKey::from_bytes(&secret).verifying_key().to_bytes();

    assert_eq!(item.cas(), Some(0));
    assert!(dht.put(&item).unwrap() > 0);

    let value = dht.get(*item.target(), &public_key, 1, None).unwrap();
    assert_eq!(value.as_ref(), b"hello");

    assert!(matches!(
        dht.get(*item.target(), &public_key, 2, None),
        Err(Error::ValueNotFound)
    ));
}

#[test]
fn salted_items_live_at_their_own_target() {
    let testnet = Arc::new(Testnet::new(8));
    let dht = bootstrapped(&testnet);

    let signer = SigningKey::from_bytes(&[9; 32]);
    let public_key = signer.verifying_key().to_bytes();

    let plain = MutableItem::new(&signer, b"plain", 1, None);
    let salted = MutableItem::new(&signer, b"salted", 1, Some(b"profile"));
    assert_ne!(plain.target(), salted.target());

    dht.put(&plain).unwrap();
    dht.put(&salted).unwrap();

    assert_eq!(
        dht.get(*salted.target(), &public_key, 1, Some(b"profile"))
            .unwrap()
            .as_ref(),
        b"salted"
    );
    assert_eq!(
        dht.get(*plain.target(), &public_key, 1, None)
            .unwrap()
            .as_ref(),
        b"plain"
    );
}

#[test]
fn newer_values_replace_older_ones() {
    let testnet = Arc::new(Testnet::new(8));
    let dht = bootstrapped(&testnet);
    let secret = [9_u8; 32];

    for (seq, value) in [(1, "one"), (2, "two"), (3, "three")] {
        let item = MutableItem::sign(&secret, value.as_bytes(), seq, None).unwrap();
        dht.put(&item).unwrap();
    }

    let latest = MutableItem::sign(&secret, b"three", 3, None).unwrap();
    let value = dht.get(*latest.target(), latest.key(), 1, None).unwrap();

    assert_eq!(value.as_ref(), b"three");

    // Going back in time is refused by every storing node.
    let stale = MutableItem::sign(&secret, b"zero", 2, None)
        .unwrap()
        .with_cas(None);

    assert!(matches!(
        dht.put(&stale),
        Err(Error::StoreValue(PutError::QuorumNotReached { stored_at: 0, .. }))
    ));
}

#[test]
fn republish_and_skipped_sequence_numbers() {
    let testnet = Arc::new(Testnet::new(4));
    let dht = bootstrapped(&testnet);
    let secret = [9_u8; 32];

    let first = MutableItem::sign(&secret, b"one", 1, None).unwrap();

    assert_eq!(dht.put(&first).unwrap(), 4);
    assert_eq!(dht.put(&first).unwrap(), 4);

    let fifth = MutableItem::sign(&secret, b"five", 5, None).unwrap();
    assert_eq!(dht.put(&fifth).unwrap(), 4);

    let value = dht.get(*fifth.target(), fifth.key(), 1, None).unwrap();
    assert_eq!(value.as_ref(), b"five");

    assert!(matches!(
        dht.get(*fifth.target(), fifth.key(), 6, None),
        Err(Error::ValueNotFound)
    ));
}

#[test]
fn insecure_queries_are_refused_and_evicted() {
    let testnet = Arc::new(Testnet::new(4));
    let dht = bootstrapped(&testnet);

    dht.serve(testnet.as_ref(), StorePeer::new(dht.id()), Box::new(|| Ok(())))
        .unwrap();

    let from: SocketAddr = testnet.bootstrap_nodes()[1].parse().unwrap();
    let liar = Id::secure("liar", None, Some("21.75.31.124".parse().unwrap()));

    let response = testnet
        .query_client(
            from,
            liar,
            RequestTypeSpecific::GetValue(GetValueRequestArguments {
                target: Id::random(),
                seq: None,
            }),
        )
        .unwrap()
        .unwrap();

    assert_eq!(response.error().unwrap().code, ERROR_INSECURE_NODE_ID);
    assert_eq!(response.error().unwrap().description, "Insecure node id");
    assert!(!testnet.client_knows(Table::Peers, &from));
    assert!(!testnet.client_knows(Table::Stores, &from));
}

#[test]
fn client_observed_elsewhere_is_evicted() {
    let testnet = Arc::new(Testnet::new(4));
    let dht = bootstrapped(&testnet);
    let item = MutableItem::new(&SigningKey::from_bytes(&[9; 32]), b"hello", 1, None);

    dht.put(&item).unwrap();

    // Our id no longer matches the address the storing nodes see.
    let moved: SocketAddr = "21.75.31.124:6881".parse().unwrap();
    testnet.set_client_address(moved);

    assert!(matches!(
        dht.get(*item.target(), item.key(), 1, None),
        Err(Error::ValueNotFound)
    ));

    for node in testnet.nodes() {
        assert!(!testnet.node_knows(&node.address(), Table::Stores, &moved));
    }
}

#[test]
fn bootstrap_file_round_trip() {
    let path = std::env::temp_dir().join(format!("dhtstore-it-{}", Id::random()));
    let testnet = Arc::new(Testnet::new(5));

    let dht = Dht::new(testnet.clone())
        .with_bootstrap(&testnet.bootstrap_nodes())
        .with_bootstrap_file(&path);

    let outcome = dht.bootstrap().unwrap();

    assert_eq!(outcome.nodes.len(), 5);
    assert_eq!(outcome.public_address, Some(testnet.client_address()));
    assert!(path.exists());

    // No fallback nodes, the file alone is enough.
    let again = Dht::new(testnet.clone())
        .with_bootstrap(&[])
        .with_bootstrap_file(&path);

    assert_eq!(again.bootstrap().unwrap().nodes, outcome.nodes);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn oversized_items_are_not_signed() {
    assert!(matches!(
        MutableItem::sign(&[9; 32], &[0; 1000], 1, None),
        Err(dhtstore::common::MutableError::ValueTooLarge(_))
    ));
    assert!(matches!(
        MutableItem::sign(&[9; 32], b"hello", 1, Some(&[0; 65])),
        Err(dhtstore::common::MutableError::SaltTooLarge(65))
    ));
    assert!(matches!(
        MutableItem::sign(&[9; 16], b"hello", 1, None),
        Err(dhtstore::common::MutableError::InvalidSecretKey(16))
    ));
}
