//! Helper functions and structs for mutable items.

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use sha1_smol::Sha1;
use std::convert::TryFrom;

use crate::Id;

/// Values must bencode to fewer than this many bytes.
pub const MAX_ENCODED_VALUE_SIZE: usize = 1000;
pub const MAX_SALT_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq)]
/// [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html)'s Mutable item.
pub struct MutableItem {
    /// hash of the key and optional salt
    target: Id,
    /// ed25519 public key
    key: [u8; 32],
    /// sequence number
    seq: i64,
    /// mutable value
    value: Bytes,
    /// ed25519 signature
    signature: [u8; 64],
    /// Optional salt
    salt: Option<Bytes>,
    /// Optional compare-and-swap hint, the sequence number we expect storing nodes to hold
    cas: Option<i64>,
}

impl MutableItem {
    /// Create a new mutable item from a signing key, value, sequence number and optional salt.
    ///
    /// The `cas` hint is set to `seq - 1`.
    pub fn new(signer: &SigningKey, value: &[u8], seq: i64, salt: Option<&[u8]>) -> Self {
        let salt = non_empty(salt);
        let signable = encode_signable(seq, value, salt);
        let signature = signer.sign(&signable);

        Self::new_signed_unchecked(
            signer.verifying_key().to_bytes(),
            signature.to_bytes(),
            value,
            seq,
            salt,
        )
        .with_cas(seq.checked_sub(1))
    }

    /// Sign a new mutable item with raw secret key bytes.
    ///
    /// `secret_key` is either a 32 bytes ed25519 seed, or a 64 bytes
    /// `seed || public key` keypair.
    pub fn sign(
        secret_key: &[u8],
        value: &[u8],
        seq: i64,
        salt: Option<&[u8]>,
    ) -> Result<Self, MutableError> {
        let signer = signing_key_from_bytes(secret_key)?;
        let salt = non_empty(salt);

        validate_sizes(value, salt)?;

        let signature = signer.try_sign(&encode_signable(seq, value, salt))?;

        Ok(Self::new_signed_unchecked(
            signer.verifying_key().to_bytes(),
            signature.to_bytes(),
            value,
            seq,
            salt,
        )
        .with_cas(seq.checked_sub(1)))
    }

    /// Return the target of a [MutableItem] by hashing its `public_key` and an optional `salt`
    pub fn target_from_key(public_key: &[u8; 32], salt: Option<&[u8]>) -> Id {
        let mut encoded = vec![];

        encoded.extend(public_key);

        if let Some(salt) = non_empty(salt) {
            encoded.extend(salt);
        }

        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        let bytes = hasher.digest().bytes();

        bytes.into()
    }

    /// Create a new mutable item from an already signed value.
    pub fn new_signed_unchecked(
        key: [u8; 32],
        signature: [u8; 64],
        value: &[u8],
        seq: i64,
        salt: Option<&[u8]>,
    ) -> Self {
        let salt = non_empty(salt);

        Self {
            target: MutableItem::target_from_key(&key, salt),
            key,
            value: Bytes::copy_from_slice(value),
            seq,
            signature,
            salt: salt.map(Bytes::copy_from_slice),
            cas: None,
        }
    }

    /// Validate a mutable item received from the network.
    pub(crate) fn from_dht_message(
        target: Id,
        key: &[u8],
        v: Bytes,
        seq: i64,
        signature: &[u8],
        salt: Option<Bytes>,
        cas: Option<i64>,
    ) -> Result<Self, MutableError> {
        let key = VerifyingKey::try_from(key).map_err(|_| MutableError::InvalidMutablePublicKey)?;
        let salt = salt.filter(|salt| !salt.is_empty());

        if MutableItem::target_from_key(key.as_bytes(), salt.as_deref()) != target {
            return Err(MutableError::TargetMismatch);
        }

        let signature =
            Signature::from_slice(signature).map_err(|_| MutableError::InvalidMutableSignature)?;

        key.verify(&encode_signable(seq, &v, salt.as_deref()), &signature)
            .map_err(|_| MutableError::InvalidMutableSignature)?;

        Ok(Self {
            target,
            key: key.to_bytes(),
            value: v,
            seq,
            signature: signature.to_bytes(),
            salt,
            cas,
        })
    }

    pub fn with_cas(mut self, cas: Option<i64>) -> Self {
        self.cas = cas;
        self
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    pub fn cas(&self) -> Option<i64> {
        self.cas
    }
}

/// Parse an ed25519 signing key from either a 32 bytes seed or a 64 bytes keypair.
pub fn signing_key_from_bytes(secret_key: &[u8]) -> Result<SigningKey, MutableError> {
    match secret_key.len() {
        32 => {
            let mut seed = [0_u8; 32];
            seed.copy_from_slice(secret_key);

            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut keypair = [0_u8; 64];
            keypair.copy_from_slice(secret_key);

            Ok(SigningKey::from_keypair_bytes(&keypair)?)
        }
        len => Err(MutableError::InvalidSecretKey(len)),
    }
}

/// Size of `value` once bencoded as a byte string.
pub fn encoded_value_size(value: &[u8]) -> usize {
    value.len().to_string().len() + 1 + value.len()
}

pub(crate) fn validate_sizes(value: &[u8], salt: Option<&[u8]>) -> Result<(), MutableError> {
    let size = encoded_value_size(value);
    if size >= MAX_ENCODED_VALUE_SIZE {
        return Err(MutableError::ValueTooLarge(size));
    }

    if let Some(salt) = salt {
        if salt.len() > MAX_SALT_SIZE {
            return Err(MutableError::SaltTooLarge(salt.len()));
        }
    }

    Ok(())
}

pub fn encode_signable(seq: i64, value: &[u8], salt: Option<&[u8]>) -> Box<[u8]> {
    let mut signable = vec![];

    if let Some(salt) = non_empty(salt) {
        signable.extend(format!("4:salt{}:", salt.len()).into_bytes());
        signable.extend(salt);
    }

    signable.extend(format!("3:seqi{}e1:v{}:", seq, value.len()).into_bytes());
    signable.extend(value);

    signable.into()
}

fn non_empty(salt: Option<&[u8]>) -> Option<&[u8]> {
    salt.filter(|salt| !salt.is_empty())
}

#[derive(thiserror::Error, Debug)]
/// Mutable items error enum.
pub enum MutableError {
    #[error("Invalid mutable item signature")]
    InvalidMutableSignature,

    #[error("Invalid mutable item public key")]
    InvalidMutablePublicKey,

    #[error("Mutable item target doesn't match the hash of its key and salt")]
    TargetMismatch,

    #[error("Invalid secret key length {0}, expected 32 or 64 bytes")]
    InvalidSecretKey(usize),

    #[error("Signing failed: {0}")]
    Signing(#[from] SignatureError),

    #[error("Value encodes to {0} bytes, must be less than 1000")]
    ValueTooLarge(usize),

    #[error("Salt is {0} bytes, must be at most 64")]
    SaltTooLarge(usize),
}
