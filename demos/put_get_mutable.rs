use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use dhtstore::{Dht, MutableItem, Poll, SigningKey, Testnet};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about = "Put and get a mutable item on an in-memory testnet", long_about = None)]
struct Cli {
    /// Value to store.
    value: String,
    /// Number of storing nodes in the testnet.
    #[arg(short, long, default_value_t = 32)]
    nodes: usize,
    /// Optional salt.
    #[arg(long)]
    salt: Option<String>,
    /// Seconds to wait for the value.
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let cli = Cli::parse();

    let testnet = Arc::new(Testnet::new(cli.nodes));
    let dht = Dht::new(testnet.clone()).with_bootstrap(&testnet.bootstrap_nodes());

    let outcome = dht.bootstrap().expect("bootstrap failed");
    println!(
        "Bootstrapped with {} nodes as {} at {:?}",
        outcome.nodes.len(),
        outcome.identity.id(),
        outcome.public_address
    );

    let signer = SigningKey::from_bytes(&rand::random());
    let salt = cli.salt.as_ref().map(|salt| salt.as_bytes());
    let item = MutableItem::new(&signer, cli.value.as_bytes(), 1, salt);

    let start = Instant::now();
    let stored_at = dht.put(&item).expect("put failed");
    println!(
        "Stored \"{}\" at {} on {} nodes in {:?}",
        cli.value,
        item.target(),
        stored_at,
        start.elapsed()
    );

    let poll = Poll::with_timeout(Duration::from_secs(cli.timeout));
    let value = dht
        .get_until_found(*item.target(), item.key(), 1, salt, &poll)
        .expect("get failed");

    println!(
        "Got \"{}\" in {:?}",
        String::from_utf8_lossy(&value),
        start.elapsed()
    );
}
