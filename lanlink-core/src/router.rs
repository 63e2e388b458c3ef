//! Dispatch table: message type -> handler.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::{DispatchError, Node, OutboundAction};
use crate::protocol::{Message, MessageKind};
use crate::{discovery, file, game, group, social};

/// A decoded, identity-checked datagram.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: Message,
    pub source: SocketAddr,
    pub now: f64,
}

/// Handlers push their replies into `out`. An `Err` discards them and drops the datagram.
pub type Handler = fn(&mut Node, Inbound, &mut Vec<OutboundAction>) -> Result<(), DispatchError>;

#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<MessageKind, Handler>,
}

impl Router {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in message type.
    pub fn standard() -> Self {
        let mut r = Self::empty();
        r.register(MessageKind::Ping, discovery::handle_ping);
        r.register(MessageKind::Profile, discovery::handle_profile);
        r.register(MessageKind::Ack, handle_ack);
        r.register(MessageKind::Follow, social::handle_follow);
        r.register(MessageKind::Unfollow, social::handle_follow);
        r.register(MessageKind::Post, social::handle_post);
        r.register(MessageKind::Like, social::handle_like);
        r.register(MessageKind::Dm, social::handle_dm);
        r.register(MessageKind::GroupCreate, group::handle_group_create);
        r.register(MessageKind::GroupUpdate, group::handle_group_update);
        r.register(MessageKind::GroupMessage, group::handle_group_message);
        r.register(MessageKind::TictactoeInvite, game::handle_invite);
        r.register(MessageKind::TictactoeMove, game::handle_move);
        r.register(MessageKind::TictactoeResult, game::handle_result);
        r.register(MessageKind::FileOffer, file::handle_offer);
        r.register(MessageKind::FileAccepted, file::handle_accepted);
        r.register(MessageKind::FileChunk, file::handle_chunk);
        r.register(MessageKind::FileReceived, file::handle_received);
        r
    }

    /// Add or replace a handler; returns the one it displaced.
    pub fn register(&mut self, kind: MessageKind, handler: Handler) -> Option<Handler> {
        self.handlers.insert(kind, handler)
    }

    pub fn unregister(&mut self, kind: MessageKind) -> Option<Handler> {
        self.handlers.remove(&kind)
    }

    pub fn handler(&self, kind: MessageKind) -> Option<Handler> {
        self.handlers.get(&kind).copied()
    }
}

fn handle_ack(
    node: &mut Node,
    inbound: Inbound,
    _out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Ack { message_id, .. } = inbound.message else {
        return Ok(());
    };
    if node.acks.confirm(&message_id) {
        tracing::debug!(key = %message_id, from = %inbound.source, "ack");
    }
    Ok(())
}
