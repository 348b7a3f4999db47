//! [BEP_0042](https://www.bittorrent.org/beps/bep_0042.html) enforcement on incoming messages.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::common::{ErrorSpecific, Message, MessageType, RequestSpecific, RequestTypeSpecific};
use crate::routing::{QueryHandler, RoutingTable, Table};

/// Strip the token of a response whose responder id doesn't match its address.
///
/// Responses to `get_peers`/`get` from such nodes are considered to carry no token,
/// so they are not eligible as storage targets.
pub fn secured_response(remote: SocketAddr, mut message: Message) -> Message {
    if let MessageType::Response(response) = &mut message.message_type {
        let responder_id = response.responder_id();

        if response.token().is_some() && !responder_id.is_secure_for(remote.ip()) {
            debug!(?responder_id, ?remote, "Dropping token of insecure responder");
            response.clear_token();
        }
    }

    message
}

/// Wraps a [QueryHandler], answering `get` and `get_peers` queries from insecure
/// node ids with an error and evicting the sender from our lookup tables.
///
/// Other queries are forwarded unchanged.
#[derive(Debug)]
pub struct SecuredQueries<H> {
    inner: H,
    routing_table: Arc<dyn RoutingTable>,
}

impl<H: QueryHandler> SecuredQueries<H> {
    pub fn new(inner: H, routing_table: Arc<dyn RoutingTable>) -> Self {
        Self {
            inner,
            routing_table,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: QueryHandler> QueryHandler for SecuredQueries<H> {
    fn handle_request(&self, from: SocketAddr, request: &RequestSpecific) -> Option<MessageType> {
        let enforced = matches!(
            request.request_type,
            RequestTypeSpecific::GetValue(_) | RequestTypeSpecific::GetPeers(_)
        );

        if enforced && !request.requester_id.is_secure_for(from.ip()) {
            let requester_id = request.requester_id;
            debug!(
                ?requester_id,
                ?from,
                request_type = request.request_type.method(),
                "Insecure node id"
            );

            self.routing_table.remove_node(Table::Peers, from);
            self.routing_table.remove_node(Table::Stores, from);

            return Some(MessageType::Error(ErrorSpecific::insecure_node_id()));
        }

        self.inner.handle_request(from, request)
    }
}
