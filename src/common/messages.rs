//! Serealize and decerealize Krpc messages.
//!
//! Only the shapes needed to query, respond and fail, plus
//! [BEP_0044](https://www.bittorrent.org/beps/bep_0044.html) mutable `get` and `put`.

mod internal;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde_bytes::ByteBuf;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// BEP_0042 enforcing nodes answer queries from insecure ids with this error code.
pub const ERROR_INSECURE_NODE_ID: i32 = 305;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    /// The IP address and port ("SocketAddr") of the requester as seen from the responder's point of view.
    /// This should be set only on response, but is defined at this level with the other common fields to avoid defining yet another layer on the response objects.
    pub requester_ip: Option<SocketAddr>,

    pub message_type: MessageType,

    /// For bep0043. When set true on a request, indicates that the requester can't reply to requests and that responders should not add requester to their routing tables.
    /// Should only be set on requests - undefined behavior when set on a response.
    pub read_only: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl ErrorSpecific {
    pub fn insecure_node_id() -> Self {
        ErrorSpecific {
            code: ERROR_INSECURE_NODE_ID,
            description: "Insecure node id".to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    GetPeers(GetPeersRequestArguments),
    GetValue(GetValueRequestArguments),
    PutMutable(PutMutableRequestArguments),
}

impl RequestTypeSpecific {
    /// The KRPC method name of this query.
    pub fn method(&self) -> &'static str {
        match self {
            RequestTypeSpecific::Ping => "ping",
            RequestTypeSpecific::FindNode(_) => "find_node",
            RequestTypeSpecific::GetPeers(_) => "get_peers",
            RequestTypeSpecific::GetValue(_) => "get",
            RequestTypeSpecific::PutMutable(_) => "put",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    FindNode(FindNodeResponseArguments),
    GetPeers(GetPeersResponseArguments),
    GetMutable(GetMutableResponseArguments),
    NoValues(NoValuesResponseArguments),
    NoMoreRecentValue(NoMoreRecentValueResponseArguments),
}

impl ResponseSpecific {
    pub fn responder_id(&self) -> Id {
        match self {
            ResponseSpecific::Ping(args) => args.responder_id,
            ResponseSpecific::FindNode(args) => args.responder_id,
            ResponseSpecific::GetPeers(args) => args.responder_id,
            ResponseSpecific::GetMutable(args) => args.responder_id,
            ResponseSpecific::NoValues(args) => args.responder_id,
            ResponseSpecific::NoMoreRecentValue(args) => args.responder_id,
        }
    }

    /// The write token, if this response carries one.
    pub fn token(&self) -> Option<&[u8]> {
        match self {
            ResponseSpecific::Ping(_) | ResponseSpecific::FindNode(_) => None,
            ResponseSpecific::GetPeers(args) => args.token.as_deref(),
            ResponseSpecific::GetMutable(args) => args.token.as_deref(),
            ResponseSpecific::NoValues(args) => args.token.as_deref(),
            ResponseSpecific::NoMoreRecentValue(args) => args.token.as_deref(),
        }
    }

    /// Drop the write token, making the responder ineligible as a storage target.
    pub fn clear_token(&mut self) {
        match self {
            ResponseSpecific::Ping(_) | ResponseSpecific::FindNode(_) => {}
            ResponseSpecific::GetPeers(args) => args.token = None,
            ResponseSpecific::GetMutable(args) => args.token = None,
            ResponseSpecific::NoValues(args) => args.token = None,
            ResponseSpecific::NoMoreRecentValue(args) => args.token = None,
        }
    }
}

// === PING ===
#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

// === FIND_NODE ===
#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

// === Get Peers ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub values: Vec<SocketAddr>,
    pub nodes: Option<Vec<Node>>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NoValuesResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub nodes: Option<Vec<Node>>,
}

// === Get Mutable ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetValueRequestArguments {
    pub target: Id,
    pub seq: Option<i64>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetMutableResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub nodes: Option<Vec<Node>>,
    pub v: Vec<u8>,
    pub k: Vec<u8>,
    pub seq: i64,
    pub sig: Vec<u8>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NoMoreRecentValueResponseArguments {
    pub responder_id: Id,
    pub token: Option<Vec<u8>>,
    pub nodes: Option<Vec<Node>>,
    pub seq: i64,
}

// === Put Mutable ===

#[derive(Debug, PartialEq, Clone)]
pub struct PutMutableRequestArguments {
    pub token: Vec<u8>,
    pub target: Id,
    pub v: Vec<u8>,
    pub k: Vec<u8>,
    pub seq: i64,
    pub sig: Vec<u8>,
    pub salt: Option<Vec<u8>>,
    pub cas: Option<i64>,
}

impl Message {
    /// A request with the given transaction id.
    pub fn request(transaction_id: u16, request: RequestSpecific) -> Message {
        Message {
            transaction_id,
            version: None,
            requester_ip: None,
            message_type: MessageType::Request(request),
            read_only: false,
        }
    }

    /// A response or error echoing the transaction id of `request`.
    pub fn reply(request: &Message, requester: SocketAddr, message_type: MessageType) -> Message {
        Message {
            transaction_id: request.transaction_id,
            version: None,
            requester_ip: Some(requester),
            message_type,
            read_only: false,
        }
    }

    /// The node Id of the sender of this message, if it is a query or a response.
    pub fn sender_id(&self) -> Option<Id> {
        match &self.message_type {
            MessageType::Request(request) => Some(request.requester_id),
            MessageType::Response(response) => Some(response.responder_id()),
            MessageType::Error(_) => None,
        }
    }

    /// The error payload, only for messages of type error.
    pub fn error(&self) -> Option<&ErrorSpecific> {
        match &self.message_type {
            MessageType::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    fn into_serde_message(self) -> internal::DHTMessage {
        let mut message = internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            ip: self
                .requester_ip
                .map(|sockaddr| sockaddr_to_bytes(&sockaddr)),
            read_only: if self.read_only { Some(1) } else { None },
            ..Default::default()
        };

        match self.message_type {
            MessageType::Request(RequestSpecific {
                requester_id,
                request_type,
            }) => {
                message.message_type = "q".to_string();
                message.query = Some(request_type.method().to_string());

                let mut arguments = internal::DHTArguments {
                    id: requester_id.to_vec(),
                    ..Default::default()
                };

                match request_type {
                    RequestTypeSpecific::Ping => {}
                    RequestTypeSpecific::FindNode(args) => {
                        arguments.target = Some(args.target.to_vec());
                    }
                    RequestTypeSpecific::GetPeers(args) => {
                        arguments.info_hash = Some(args.info_hash.to_vec());
                    }
                    RequestTypeSpecific::GetValue(args) => {
                        arguments.target = Some(args.target.to_vec());
                        arguments.seq = args.seq;
                    }
                    RequestTypeSpecific::PutMutable(args) => {
                        arguments.token = Some(args.token);
                        arguments.target = Some(args.target.to_vec());
                        arguments.v = Some(args.v);
                        arguments.k = Some(args.k);
                        arguments.seq = Some(args.seq);
                        arguments.sig = Some(args.sig);
                        arguments.salt = args.salt;
                        arguments.cas = args.cas;
                    }
                }

                message.arguments = Some(arguments);
            }
            MessageType::Response(response) => {
                message.message_type = "r".to_string();

                let mut ret = internal::DHTReturn {
                    id: response.responder_id().to_vec(),
                    token: response.token().map(|token| token.to_vec()),
                    ..Default::default()
                };

                match response {
                    ResponseSpecific::Ping(_) => {}
                    ResponseSpecific::FindNode(args) => {
                        ret.nodes = Some(nodes_to_bytes(&args.nodes));
                    }
                    ResponseSpecific::GetPeers(args) => {
                        ret.nodes = args.nodes.as_deref().map(nodes_to_bytes);
                        ret.values = Some(
                            args.values
                                .iter()
                                .map(|peer| ByteBuf::from(sockaddr_to_bytes(peer)))
                                .collect(),
                        );
                    }
                    ResponseSpecific::NoValues(args) => {
                        ret.nodes = args.nodes.as_deref().map(nodes_to_bytes);
                    }
                    ResponseSpecific::GetMutable(args) => {
                        ret.nodes = args.nodes.as_deref().map(nodes_to_bytes);
                        ret.v = Some(args.v);
                        ret.k = Some(args.k);
                        ret.seq = Some(args.seq);
                        ret.sig = Some(args.sig);
                    }
                    ResponseSpecific::NoMoreRecentValue(args) => {
                        ret.nodes = args.nodes.as_deref().map(nodes_to_bytes);
                        ret.seq = Some(args.seq);
                    }
                }

                message.response = Some(ret);
            }
            MessageType::Error(err) => {
                message.message_type = "e".to_string();
                message.error = Some((err.code.into(), err.description));
            }
        }

        message
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        let message_type = match msg.message_type.as_str() {
            "q" => MessageType::Request(request_from_serde(
                msg.query.as_deref(),
                msg.arguments.ok_or(Error::InvalidMessage("query without arguments"))?,
            )?),
            "r" => MessageType::Response(response_from_serde(
                msg.response
                    .ok_or(Error::InvalidMessage("response without return values"))?,
            )?),
            "e" => {
                let (code, description) = msg
                    .error
                    .ok_or(Error::InvalidMessage("error without error list"))?;

                MessageType::Error(ErrorSpecific {
                    code: code
                        .try_into()
                        .map_err(|_| Error::InvalidMessage("error code out of range"))?,
                    description,
                })
            }
            _ => return Err(Error::InvalidMessage("unknown message type")),
        };

        Ok(Message {
            transaction_id: transaction_id(msg.transaction_id)?,
            version: msg.version,
            requester_ip: match msg.ip {
                Some(ip) => Some(bytes_to_sockaddr(&ip)?),
                _ => None,
            },
            read_only: msg.read_only.map(|read_only| read_only > 0).unwrap_or(false),
            message_type,
        })
    }
}

fn request_from_serde(
    query: Option<&str>,
    arguments: internal::DHTArguments,
) -> Result<RequestSpecific> {
    let requester_id = Id::from_bytes(&arguments.id)?;

    let request_type = match query {
        Some("ping") => RequestTypeSpecific::Ping,
        Some("find_node") => RequestTypeSpecific::FindNode(FindNodeRequestArguments {
            target: required_id(arguments.target, "find_node without target")?,
        }),
        Some("get_peers") => RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
            info_hash: required_id(arguments.info_hash, "get_peers without info_hash")?,
        }),
        Some("get") => RequestTypeSpecific::GetValue(GetValueRequestArguments {
            target: required_id(arguments.target, "get without target")?,
            seq: arguments.seq,
        }),
        Some("put") => RequestTypeSpecific::PutMutable(PutMutableRequestArguments {
            token: arguments
                .token
                .ok_or(Error::InvalidMessage("put without token"))?,
            target: required_id(arguments.target, "put without target")?,
            v: arguments.v.ok_or(Error::InvalidMessage("put without v"))?,
            k: arguments
                .k
                .ok_or(Error::InvalidMessage("put is missing k, immutable put is not supported"))?,
            seq: arguments.seq.ok_or(Error::InvalidMessage("put without seq"))?,
            sig: arguments.sig.ok_or(Error::InvalidMessage("put without sig"))?,
            salt: arguments.salt,
            cas: arguments.cas,
        }),
        _ => return Err(Error::InvalidMessage("unknown query method")),
    };

    Ok(RequestSpecific {
        requester_id,
        request_type,
    })
}

fn response_from_serde(ret: internal::DHTReturn) -> Result<ResponseSpecific> {
    let internal::DHTReturn {
        id,
        nodes,
        token,
        values,
        v,
        seq,
        k,
        sig,
    } = ret;

    let responder_id = Id::from_bytes(&id)?;
    let nodes = nodes.map(bytes_to_nodes).transpose()?;

    // Ordered from most to least detailed.
    Ok(match (v, k, sig, seq, values, token) {
        (Some(v), Some(k), Some(sig), Some(seq), _, token) => {
            ResponseSpecific::GetMutable(GetMutableResponseArguments {
                responder_id,
                token,
                nodes,
                v,
                k,
                seq,
                sig,
            })
        }
        (_, _, _, Some(seq), _, token) => {
            ResponseSpecific::NoMoreRecentValue(NoMoreRecentValueResponseArguments {
                responder_id,
                token,
                nodes,
                seq,
            })
        }
        (_, _, _, None, Some(values), token) => {
            ResponseSpecific::GetPeers(GetPeersResponseArguments {
                responder_id,
                token,
                values: values
                    .iter()
                    .map(bytes_to_sockaddr)
                    .collect::<Result<Vec<_>>>()?,
                nodes,
            })
        }
        (_, _, _, None, None, Some(token)) => {
            ResponseSpecific::NoValues(NoValuesResponseArguments {
                responder_id,
                token: Some(token),
                nodes,
            })
        }
        _ => match nodes {
            Some(nodes) => ResponseSpecific::FindNode(FindNodeResponseArguments {
                responder_id,
                nodes,
            }),
            None => ResponseSpecific::Ping(PingResponseArguments { responder_id }),
        },
    })
}

fn required_id(bytes: Option<Vec<u8>>, missing: &'static str) -> Result<Id> {
    Id::from_bytes(bytes.ok_or(Error::InvalidMessage(missing))?)
}

fn transaction_id(bytes: Vec<u8>) -> Result<u16> {
    if bytes.len() == 2 {
        return Ok(((bytes[0] as u16) << 8) + (bytes[1] as u16));
    }

    Err(Error::InvalidTransactionId(bytes))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0_u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(Error::InvalidMessage(
            "wrong number of bytes for a compact address",
        )),
    }
}

fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(18);

    match sockaddr.ip() {
        IpAddr::V4(v4) => bytes.extend(v4.octets()),
        IpAddr::V6(v6) => bytes.extend(v6.octets()),
    }
    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

/// Compact node info, ipv4 only, ipv6 nodes are skipped.
fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * 26);

    for node in nodes.iter().filter(|node| node.address.is_ipv4()) {
        bytes.extend(node.id.as_bytes());
        bytes.extend(sockaddr_to_bytes(&node.address));
    }

    bytes
}

fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();
    if bytes.len() % 26 != 0 {
        return Err(Error::InvalidMessage(
            "wrong number of bytes for compact nodes",
        ));
    }

    bytes
        .chunks_exact(26)
        .map(|chunk| {
            Ok(Node::new(
                Id::from_bytes(&chunk[..ID_SIZE])?,
                bytes_to_sockaddr(&chunk[ID_SIZE..])?,
            ))
        })
        .collect()
}
