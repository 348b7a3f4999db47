//! Manage write tokens for remote client IPs.

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Secrets are rotated this often, tokens stay valid for two intervals.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Tokens generator.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    pub fn new() -> Self {
        let mut rng = thread_rng();

        Tokens {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    pub fn should_update(&self) -> bool {
        self.last_updated.elapsed() > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated for this address within the last two rotations.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        token == generate(address.ip(), &self.curr_secret)
            || token == generate(address.ip(), &self.prev_secret)
    }

    pub fn rotate(&mut self) {
        trace!("Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = thread_rng().gen();

        self.last_updated = Instant::now();
    }

    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        generate(address.ip(), &self.curr_secret)
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn generate(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(v4) => digest.update(&v4.octets()),
        IpAddr::V6(v6) => digest.update(&v6.octets()),
    };
    digest.update(secret);

    digest.finalize().to_be_bytes()
}
