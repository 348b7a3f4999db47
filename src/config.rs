use std::{path::PathBuf, time::Duration};

/// Public rendezvous nodes used when no bootstrap file is available.
pub const DEFAULT_BOOTSTRAP_NODES: [&str; 2] =
    ["router.bittorrent.com:6881", "router.utorrent.com:6881"];

/// How many of the closest store-capable nodes a value is read from and written to.
pub const DEFAULT_STORE_LIMIT: usize = 64;

/// Maximum number of targets whose storing nodes are remembered.
pub const DEFAULT_STORE_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
/// Dht client configurations
pub struct Config {
    /// Bootstrap nodes used when the bootstrap file is missing or empty.
    ///
    /// Defaults to [DEFAULT_BOOTSTRAP_NODES]
    pub bootstrap: Vec<String>,
    /// File to load bootstrap nodes and our last known public address from,
    /// and to save them to after bootstrapping.
    ///
    /// Defaults to None
    pub bootstrap_file: Option<PathBuf>,
    /// Host name mixed into our node id.
    ///
    /// Defaults to the `HOSTNAME` environment variable, or `/etc/hostname`,
    /// or an empty string.
    pub hostname: String,
    /// Number of closest store-capable nodes to read from and write to.
    ///
    /// Defaults to [DEFAULT_STORE_LIMIT]
    pub store_limit: usize,
    /// How long resolved storing nodes are reused for a target.
    ///
    /// Defaults to None, storing nodes are reused for the lifetime of the client.
    pub store_cache_ttl: Option<Duration>,
    /// Maximum number of targets in the storing nodes cache.
    ///
    /// Defaults to [DEFAULT_STORE_CACHE_CAPACITY]
    pub store_cache_capacity: usize,
    /// Minimum number of nodes that must acknowledge a put.
    ///
    /// Defaults to 1
    pub put_quorum: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bootstrap_file: None,
            hostname: default_hostname(),
            store_limit: DEFAULT_STORE_LIMIT,
            store_cache_ttl: None,
            store_cache_capacity: DEFAULT_STORE_CACHE_CAPACITY,
            put_quorum: 1,
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|hostname| hostname.trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
/// Pacing of [crate::Dht::get_until_found].
pub struct Poll {
    /// Give up with [crate::Error::Timeout] after this instant, never if None.
    pub deadline: Option<std::time::Instant>,
    /// Delay after the first miss.
    ///
    /// Defaults to 250 milliseconds.
    pub initial_backoff: Duration,
    /// Upper bound of the doubling delay.
    ///
    /// Defaults to 8 seconds.
    pub max_backoff: Duration,
    /// Raise to stop polling with [crate::Error::Cancelled].
    pub cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl Poll {
    /// Poll for at most `timeout`.
    ///
    /// A timeout too large to be represented as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: std::time::Instant::now().checked_add(timeout),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            cancel: Default::default(),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_cancel(mut self, cancel: std::sync::Arc<std::sync::atomic::AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }
}
