//! Answering queries as a storing node.

pub mod tokens;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use crate::common::{
    validate_sizes, ErrorSpecific, FindNodeResponseArguments, GetMutableResponseArguments,
    GetValueRequestArguments, Id, MessageType, MutableError, MutableItem,
    NoMoreRecentValueResponseArguments, NoValuesResponseArguments, PingResponseArguments,
    PutMutableRequestArguments, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::routing::QueryHandler;

use tokens::Tokens;

/// Default number of mutable values a [StorePeer] keeps.
pub const MAX_VALUES: usize = 1000;

pub const ERROR_BAD_TOKEN: i32 = 203;
pub const ERROR_VALUE_TOO_BIG: i32 = 205;
pub const ERROR_INVALID_SIGNATURE: i32 = 206;
pub const ERROR_SALT_TOO_BIG: i32 = 207;
pub const ERROR_CAS_MISMATCH: i32 = 301;
pub const ERROR_SEQ_LESS_THAN_CURRENT: i32 = 302;

#[derive(Debug)]
/// A node storing mutable values.
///
/// Supports [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html) `get` and `put`,
/// and answers `ping`, `find_node` and `get_peers` without values.
///
/// It doesn't implement any rate-limiting or blocking, wrap it in
/// [crate::security::SecuredQueries] to refuse insecure node ids.
pub struct StorePeer {
    id: Id,
    tokens: Mutex<Tokens>,
    mutable_values: Mutex<LruCache<Id, MutableItem>>,
}

impl StorePeer {
    pub fn new(id: Id) -> Self {
        Self::with_capacity(id, MAX_VALUES)
    }

    /// Keep at most `max_values` mutable values, evicting the least recently used.
    pub fn with_capacity(id: Id, max_values: usize) -> Self {
        Self {
            id,
            tokens: Mutex::new(Tokens::new()),
            mutable_values: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_values).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The value currently stored at `target`.
    pub fn stored(&self, target: &Id) -> Option<MutableItem> {
        self.values().peek(target).cloned()
    }

    // === Private Methods ===

    fn values(&self) -> MutexGuard<'_, LruCache<Id, MutableItem>> {
        self.mutable_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tokens(&self) -> MutexGuard<'_, Tokens> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);

        // Lazily rotate secrets before handling a request
        if tokens.should_update() {
            tokens.rotate()
        }

        tokens
    }

    fn handle_get_mutable(&self, from: SocketAddr, target: Id, seq: Option<i64>) -> ResponseSpecific {
        let token = Some(self.tokens().generate_token(from).to_vec());

        match self.values().get(&target) {
            Some(item) => match seq {
                Some(request_seq) if item.seq() <= request_seq => {
                    ResponseSpecific::NoMoreRecentValue(NoMoreRecentValueResponseArguments {
                        responder_id: self.id,
                        token,
                        nodes: None,
                        seq: item.seq(),
                    })
                }
                _ => ResponseSpecific::GetMutable(GetMutableResponseArguments {
                    responder_id: self.id,
                    token,
                    nodes: None,
                    v: item.value().to_vec(),
                    k: item.key().to_vec(),
                    seq: item.seq(),
                    sig: item.signature().to_vec(),
                }),
            },
            None => ResponseSpecific::NoValues(NoValuesResponseArguments {
                responder_id: self.id,
                token,
                nodes: None,
            }),
        }
    }

    fn handle_put_mutable(
        &self,
        from: SocketAddr,
        requester_id: Id,
        arguments: &PutMutableRequestArguments,
    ) -> MessageType {
        let PutMutableRequestArguments {
            token,
            target,
            v,
            k,
            seq,
            sig,
            salt,
            cas,
        } = arguments;

        if !self.tokens().validate(from, token) {
            debug!(?target, ?requester_id, ?from, request_type = "put", "Invalid token");

            return error(ERROR_BAD_TOKEN, "Bad token");
        }

        match validate_sizes(v, salt.as_deref()) {
            Err(MutableError::SaltTooLarge(size)) => {
                debug!(?target, ?requester_id, ?from, size, "Salt too big");
                return error(ERROR_SALT_TOO_BIG, "salt (salt field) too big.");
            }
            Err(_) => {
                debug!(?target, ?requester_id, ?from, size = v.len(), "Value too big");
                return error(ERROR_VALUE_TOO_BIG, "Message (v field) too big.");
            }
            Ok(()) => {}
        }

        let mut values = self.values();

        // Writes at or above the stored sequence number always win, the CAS
        // hint only decides which error a stale write gets.
        if let Some(previous) = values.get(target) {
            if *seq < previous.seq() {
                if cas.is_some_and(|cas| cas != previous.seq()) {
                    debug!(
                        ?target,
                        ?requester_id,
                        ?from,
                        "CAS mismatched, re-read value and try again."
                    );

                    return error(
                        ERROR_CAS_MISMATCH,
                        "CAS mismatched, re-read value and try again.",
                    );
                }

                debug!(
                    ?target,
                    ?requester_id,
                    ?from,
                    "Sequence number less than current."
                );

                return error(
                    ERROR_SEQ_LESS_THAN_CURRENT,
                    "Sequence number less than current.",
                );
            }
        }

        match MutableItem::from_dht_message(
            *target,
            k,
            Bytes::copy_from_slice(v),
            *seq,
            sig,
            salt.as_deref().map(Bytes::copy_from_slice),
            *cas,
        ) {
            Ok(item) => {
                values.put(*target, item);

                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id: self.id,
                }))
            }
            Err(error_) => {
                debug!(?target, ?requester_id, ?from, error = ?error_, "Invalid signature");

                error(ERROR_INVALID_SIGNATURE, "Invalid signature")
            }
        }
    }
}

impl QueryHandler for StorePeer {
    fn handle_request(&self, from: SocketAddr, request: &RequestSpecific) -> Option<MessageType> {
        let message = match &request.request_type {
            RequestTypeSpecific::Ping => {
                MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                    responder_id: self.id,
                }))
            }
            RequestTypeSpecific::FindNode(_) => {
                MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id: self.id,
                    nodes: vec![],
                }))
            }
            RequestTypeSpecific::GetPeers(_) => {
                MessageType::Response(ResponseSpecific::NoValues(NoValuesResponseArguments {
                    responder_id: self.id,
                    token: Some(self.tokens().generate_token(from).to_vec()),
                    nodes: None,
                }))
            }
            RequestTypeSpecific::GetValue(GetValueRequestArguments { target, seq }) => {
                MessageType::Response(self.handle_get_mutable(from, *target, *seq))
            }
            RequestTypeSpecific::PutMutable(arguments) => {
                self.handle_put_mutable(from, request.requester_id, arguments)
            }
        };

        Some(message)
    }
}

fn error(code: i32, description: &str) -> MessageType {
    MessageType::Error(ErrorSpecific {
        code,
        description: description.to_string(),
    })
}
