//! Kademlia node Id or a lookup target
use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const IPV4_MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
const IPV6_MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Generate a node Id bound to this host according to
    /// [BEP_0042](https://www.bittorrent.org/beps/bep_0042.html).
    ///
    /// The seed is the sha1 of `hostname` followed by `local_addr` (if any).
    /// When `public_ip` is `None`, the ip of `local_addr` is used instead,
    /// and if neither is known the seed is returned as is.
    pub fn secure(hostname: &str, local_addr: Option<SocketAddr>, public_ip: Option<IpAddr>) -> Id {
        let mut seed = hostname.to_string();
        if let Some(local_addr) = local_addr {
            seed.push_str(&local_addr.to_string());
        }

        let mut hasher = Sha1::new();
        hasher.update(seed.as_bytes());
        let mut id = Id(hasher.digest().bytes());

        if let Some(ip) = public_ip.or_else(|| local_addr.map(|addr| addr.ip())) {
            id.bind_to_ip(ip);
        }

        id
    }

    /// Returns `true` if the leading 21 bits of this Id are the ones
    /// [BEP_0042](https://www.bittorrent.org/beps/bep_0042.html) expects for `ip`.
    pub fn is_secure_for(&self, ip: IpAddr) -> bool {
        let crc = crc_ip(ip, self.0[ID_SIZE - 1]);

        self.0[0] == (crc >> 24) as u8
            && self.0[1] == (crc >> 16) as u8
            && self.0[2] & 0xf8 == (crc >> 8) as u8 & 0xf8
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + laedinge zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn bind_to_ip(&mut self, ip: IpAddr) {
        let crc = crc_ip(ip, self.0[ID_SIZE - 1]);

        self.0[0] = (crc >> 24) as u8;
        self.0[1] = (crc >> 16) as u8;
        self.0[2] = ((crc >> 8) as u8 & 0xf8) | (self.0[2] & 0x07);
    }
}

/// CRC32-C of the masked ip, with the 3 low bits of `r` in the top of the first octet.
fn crc_ip(ip: IpAddr, r: u8) -> u32 {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        ip => ip,
    };

    let mut masked: Vec<u8> = match ip {
        IpAddr::V4(v4) => v4
            .octets()
            .iter()
            .zip(IPV4_MASK)
            .map(|(octet, mask)| octet & mask)
            .collect(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .zip(IPV6_MASK)
            .map(|(octet, mask)| octet & mask)
            .collect(),
    };

    masked[0] |= (r & 0x07) << 5;

    CASTAGNOLI.checksum(&masked)
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse an Id from its 40 hex characters.
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(format!(
                "expected {} hex characters, got {}",
                ID_SIZE * 2,
                s.len()
            )));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, byte) in bytes.iter_mut().enumerate() {
            let hex = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| Error::InvalidIdEncoding(s.to_string()))?;

            *byte = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;
        }

        Ok(Id(bytes))
    }
}
