//! Host-driven API: `Node` receives datagrams, timer ticks and user operations; returns actions.
//!
//! The node never touches a socket. The host holds it behind one lock, calls a single
//! operation per critical section and performs the returned [`OutboundAction`]s after
//! releasing the lock.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::chunk::FileSendJob;
use crate::file::FileState;
use crate::game::GameState;
use crate::group::GroupState;
use crate::identity::PeerId;
use crate::peers::PeerDirectory;
use crate::protocol::{Avatar, GameResult, LikeAction, Message, MessageKind, Symbol};
use crate::reliable::PendingAcks;
use crate::router::{Inbound, Router};
use crate::social::SocialState;
use crate::token::{self, Scope};
use crate::wire::{DecodeError, EncodeError};

/// Fixed UDP port shared by every peer.
pub const DEFAULT_PORT: u16 = 50999;

/// Current wall-clock time in epoch seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Protocol timing and sizing knobs. Deserialized from the host's config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timings {
    /// Peer liveness window.
    pub peer_ttl_secs: u64,
    /// Post retention and post/like/file token lifetime.
    pub post_ttl_secs: u64,
    /// Lifetime of follow/chat/group/game tokens.
    pub token_ttl_secs: u64,
    pub broadcast_interval_secs: u64,
    /// Every n-th announce tick is a full PROFILE, the rest are PINGs.
    pub profile_every: u64,
    /// Minimum gap between PROFILE re-announces triggered by unknown pingers.
    pub reannounce_secs: u64,
    pub ack_sweep_secs: u64,
    pub ack_resend_secs: u64,
    pub ack_max_retries: u32,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    /// Games and incoming transfers idle this long are dropped by cleanup.
    pub session_idle_ttl_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            peer_ttl_secs: 60,
            post_ttl_secs: 3600,
            token_ttl_secs: 60,
            broadcast_interval_secs: 1,
            profile_every: 3,
            reannounce_secs: 3,
            ack_sweep_secs: 1,
            ack_resend_secs: 2,
            ack_max_retries: 3,
            chunk_size: 256,
            chunk_delay_ms: 200,
            session_idle_ttl_secs: 900,
        }
    }
}

impl Timings {
    /// Cleanup sweep period: half the peer TTL.
    pub fn cleanup_interval_secs(&self) -> u64 {
        (self.peer_ttl_secs / 2).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub broadcast_ip: Ipv4Addr,
    pub timings: Timings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast_ip: Ipv4Addr::BROADCAST,
            timings: Timings::default(),
        }
    }
}

/// This peer's own identity as announced in PROFILE.
#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub id: PeerId,
    pub display_name: String,
    pub status: String,
    pub avatar: Option<Avatar>,
}

impl LocalProfile {
    pub fn new(username: &str, ip: IpAddr, display_name: &str) -> Self {
        Self {
            id: PeerId::new(username, ip),
            display_name: display_name.to_string(),
            status: "BROADCASTING".to_string(),
            avatar: None,
        }
    }
}

/// User-visible happenings, for the host to display.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PeerDiscovered {
        id: PeerId,
        display_name: String,
    },
    PeerEvicted {
        id: PeerId,
    },
    NewFollower {
        id: PeerId,
    },
    LostFollower {
        id: PeerId,
    },
    PostReceived {
        from: PeerId,
        timestamp: String,
        content: String,
    },
    PostLiked {
        by: PeerId,
        post_timestamp: String,
        action: LikeAction,
        likes: usize,
    },
    DmReceived {
        from: PeerId,
        message_id: String,
        content: String,
        avatar: Option<Avatar>,
    },
    DeliveryFailed {
        key: String,
        kind: MessageKind,
        to: SocketAddr,
    },
    GroupJoined {
        group_id: String,
        group_name: String,
        owner: PeerId,
    },
    GroupLeft {
        group_id: String,
        group_name: String,
    },
    GroupMessage {
        group_id: String,
        from: PeerId,
        content: String,
    },
    GameInvite {
        game_id: String,
        from: PeerId,
        my_symbol: Symbol,
    },
    GameMove {
        game_id: String,
        from: PeerId,
        position: usize,
        symbol: Symbol,
    },
    /// `result` is from this peer's point of view; `Forfeit` covers either side giving up.
    GameEnded {
        game_id: String,
        opponent: PeerId,
        result: GameResult,
        winning_line: Option<[usize; 3]>,
    },
    FileOffered {
        file_id: String,
        from: PeerId,
        filename: String,
        filesize: u64,
        description: String,
    },
    FileReceived {
        file_id: String,
        from: PeerId,
        filename: String,
        data: Vec<u8>,
        /// `None` when the offer carried no digest.
        verified: Option<bool>,
    },
    FileDelivered {
        file_id: String,
        to: PeerId,
    },
}

/// Action for host to perform.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    Send {
        to: SocketAddr,
        kind: MessageKind,
        bytes: Vec<u8>,
    },
    /// Spawn a chunk-sending task for an accepted file.
    StartFileSend(FileSendJob),
    Notify(Event),
}

/// Main state aggregate. Every collection the protocol mutates lives here.
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) profile: LocalProfile,
    pub(crate) router: Router,
    pub(crate) peers: PeerDirectory,
    pub(crate) acks: PendingAcks,
    pub(crate) social: SocialState,
    pub(crate) groups: GroupState,
    pub(crate) files: FileState,
    pub(crate) games: GameState,
    announce_ticks: u64,
    pub(crate) last_reannounce: Option<f64>,
}

impl Node {
    pub fn new(profile: LocalProfile, config: NodeConfig) -> Self {
        let acks = PendingAcks::new(
            config.timings.ack_resend_secs as f64,
            config.timings.ack_max_retries,
        );
        Self {
            config,
            profile,
            router: Router::standard(),
            peers: PeerDirectory::new(),
            acks,
            social: SocialState::default(),
            groups: GroupState::default(),
            files: FileState::default(),
            games: GameState::default(),
            announce_ticks: 0,
            last_reannounce: None,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.profile.id
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn pending_acks(&self) -> &PendingAcks {
        &self.acks
    }

    /// Replace or add a handler in the dispatch table.
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Process one received datagram.
    pub fn handle_datagram(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        now: f64,
    ) -> Result<Vec<OutboundAction>, DispatchError> {
        let message = Message::decode(bytes).map_err(|e| match e {
            DecodeError::UnknownType(t) => DispatchError::UnknownType(t),
            e => DispatchError::Decode(e),
        })?;
        if let Some(sender) = message.sender() {
            if *sender == self.profile.id {
                return Err(DispatchError::Loopback);
            }
            if sender.ip() != Some(source.ip()) {
                return Err(DispatchError::Spoofed {
                    claimed: sender.clone(),
                    addr: source,
                });
            }
        }
        let kind = message.kind();
        let handler = self
            .router
            .handler(kind)
            .ok_or_else(|| DispatchError::UnknownType(kind.to_string()))?;
        tracing::debug!(%kind, from = %source, "recv");
        let mut out = Vec::new();
        handler(
            self,
            Inbound {
                message,
                source,
                now,
            },
            &mut out,
        )?;
        Ok(out)
    }

    /// Announce tick: PROFILE every `profile_every` ticks, PING otherwise.
    pub fn announce(&mut self, now: f64) -> Result<Vec<OutboundAction>, EncodeError> {
        let every = self.config.timings.profile_every.max(1);
        let full = self.announce_ticks % every == 0;
        self.announce_ticks = self.announce_ticks.wrapping_add(1);
        let mut out = Vec::new();
        if full {
            self.push_profile(&mut out, now)?;
        } else {
            let ping = Message::Ping {
                from: self.profile.id.clone(),
            };
            self.emit(&mut out, self.broadcast_addr(), &ping, now)?;
        }
        Ok(out)
    }

    /// Ack sweep tick: resend overdue messages, report give-ups.
    pub fn sweep_acks(&mut self, now: f64) -> Vec<OutboundAction> {
        let sweep = self.acks.sweep(now);
        let mut out = Vec::with_capacity(sweep.resend.len() + sweep.exhausted.len());
        for p in sweep.resend {
            tracing::debug!(kind = %p.kind, to = %p.destination, retry = p.retries, "resend");
            out.push(OutboundAction::Send {
                to: p.destination,
                kind: p.kind,
                bytes: p.bytes,
            });
        }
        for (key, p) in sweep.exhausted {
            out.push(OutboundAction::Notify(Event::DeliveryFailed {
                key,
                kind: p.kind,
                to: p.destination,
            }));
        }
        out
    }

    /// Cleanup tick: evict stale peers, expired posts, idle games and transfers.
    pub fn cleanup(&mut self, now: f64) -> Vec<OutboundAction> {
        let t = &self.config.timings;
        let (peer_ttl, post_ttl, idle_ttl) = (
            t.peer_ttl_secs as f64,
            t.post_ttl_secs as f64,
            t.session_idle_ttl_secs as f64,
        );
        let out: Vec<OutboundAction> = self
            .peers
            .evict_stale(now, peer_ttl)
            .into_iter()
            .map(|p| OutboundAction::Notify(Event::PeerEvicted { id: p.id }))
            .collect();
        self.social.purge_posts(now, post_ttl);
        let games = self.games.drop_idle(now, idle_ttl);
        let files = self.files.drop_idle(now, idle_ttl);
        if games + files > 0 {
            tracing::info!(games, transfers = files, "dropped idle sessions");
        }
        out
    }

    pub(crate) fn push_profile(
        &mut self,
        out: &mut Vec<OutboundAction>,
        now: f64,
    ) -> Result<(), EncodeError> {
        let profile = Message::Profile {
            from: self.profile.id.clone(),
            display_name: self.profile.display_name.clone(),
            status: self.profile.status.clone(),
            avatar: self.profile.avatar.clone(),
        };
        self.last_reannounce = Some(now);
        self.emit(out, self.broadcast_addr(), &profile, now)
    }

    /// Encode and queue a message; ACK-tracked types are registered for retry.
    pub(crate) fn emit(
        &mut self,
        out: &mut Vec<OutboundAction>,
        to: SocketAddr,
        msg: &Message,
        now: f64,
    ) -> Result<(), EncodeError> {
        let bytes = msg.encode()?;
        let kind = msg.kind();
        if kind.requires_ack() {
            if let Some(key) = msg.ack_key() {
                self.acks.track(key, kind, bytes.clone(), to, now);
            }
        }
        out.push(OutboundAction::Send { to, kind, bytes });
        Ok(())
    }

    pub(crate) fn push_ack(
        &self,
        out: &mut Vec<OutboundAction>,
        key: &str,
        to: SocketAddr,
    ) -> Result<(), EncodeError> {
        let ack = Message::Ack {
            message_id: key.to_string(),
            status: "RECEIVED".to_string(),
        };
        out.push(OutboundAction::Send {
            to,
            kind: MessageKind::Ack,
            bytes: ack.encode()?,
        });
        Ok(())
    }

    pub(crate) fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.config.broadcast_ip), self.config.port)
    }

    /// Unicast address of a known peer.
    pub(crate) fn peer_addr(&self, id: &PeerId) -> Result<SocketAddr, CoreError> {
        self.peers
            .get(id)
            .map(|p| SocketAddr::new(p.address, self.config.port))
            .ok_or_else(|| CoreError::UnknownPeer(id.clone()))
    }

    /// Address embedded in an id, for replies to peers that may not be in the directory.
    pub(crate) fn id_addr(&self, id: &PeerId) -> Option<SocketAddr> {
        id.ip().map(|ip| SocketAddr::new(ip, self.config.port))
    }

    pub(crate) fn issue_token(&self, scope: Scope, now: f64) -> String {
        let ttl = match scope {
            Scope::Broadcast | Scope::File => self.config.timings.post_ttl_secs,
            _ => self.config.timings.token_ttl_secs,
        };
        token::issue(&self.profile.id, scope, ttl as f64, now)
    }
}

/// Operation failures reported to the caller; no state is changed when one is returned.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("unknown group {0}")]
    UnknownGroup(String),
    #[error("only the owner can change group {0}")]
    NotGroupOwner(String),
    #[error("not a member of group {0}")]
    NotGroupMember(String),
    #[error("no received post with timestamp {0}")]
    UnknownPost(String),
    #[error("post {0} is already in the requested like state")]
    LikeUnchanged(String),
    #[error("no direct message with id {0}")]
    UnknownMessage(String),
    #[error("unknown game {0}")]
    UnknownGame(String),
    #[error("game {0} already exists")]
    GameExists(String),
    #[error("not your turn in game {0}")]
    NotYourTurn(String),
    #[error("position {0} is off the board")]
    InvalidPosition(usize),
    #[error("cell {0} is already taken")]
    CellOccupied(usize),
    #[error("no pending file offer {0}")]
    UnknownFileOffer(String),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// Why an inbound datagram was dropped. Never fatal to the receive loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("decode error: {0}")]
    Decode(DecodeError),
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("identity {claimed} does not match source address {addr}")]
    Spoofed { claimed: PeerId, addr: SocketAddr },
    #[error("own message looped back")]
    Loopback,
    #[error("{kind} rejected: {reason}")]
    Unauthorized {
        kind: MessageKind,
        reason: &'static str,
    },
    #[error("failed to encode reply: {0}")]
    Reply(#[from] EncodeError),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const T0: f64 = 1_700_000_000.0;

    pub(crate) fn node(name: &str, ip: &str) -> Node {
        let profile = LocalProfile::new(name, ip.parse().unwrap(), name);
        let config = NodeConfig {
            broadcast_ip: "10.0.0.255".parse().unwrap(),
            ..NodeConfig::default()
        };
        Node::new(profile, config)
    }

    pub(crate) fn source(n: &Node) -> SocketAddr {
        SocketAddr::new(n.id().ip().unwrap(), DEFAULT_PORT)
    }

    /// Make `a` and `b` know each other via PROFILE exchange.
    pub(crate) fn introduce(a: &mut Node, b: &mut Node, now: f64) {
        fn announce_to(from: &mut Node, to: &mut Node, now: f64) {
            let mut out = Vec::new();
            from.push_profile(&mut out, now).unwrap();
            deliver_to(to, source(from), &out, now);
        }
        announce_to(a, b, now);
        announce_to(b, a, now);
    }

    /// Feed every `Send` in `actions` into `to`, returning what `to` produced.
    pub(crate) fn deliver_to(
        to: &mut Node,
        from: SocketAddr,
        actions: &[OutboundAction],
        now: f64,
    ) -> Vec<OutboundAction> {
        let mut produced = Vec::new();
        for a in actions {
            if let OutboundAction::Send { bytes, .. } = a {
                if let Ok(mut r) = to.handle_datagram(bytes, from, now) {
                    produced.append(&mut r);
                }
            }
        }
        produced
    }

    pub(crate) fn sends(actions: &[OutboundAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send { bytes, .. } => Message::decode(bytes).ok(),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn events(actions: &[OutboundAction]) -> Vec<Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn spoofed_source_rejected() {
        let mut a = node("alice", "10.0.0.1");
        let bytes = Message::Ping {
            from: PeerId::from("bob@10.0.0.2"),
        }
        .encode()
        .unwrap();
        let wrong: SocketAddr = "10.0.0.66:50999".parse().unwrap();
        assert!(matches!(
            a.handle_datagram(&bytes, wrong, T0),
            Err(DispatchError::Spoofed { .. })
        ));
    }

    #[test]
    fn own_broadcast_is_loopback() {
        let mut a = node("alice", "10.0.0.1");
        let out = a.announce(T0).unwrap();
        let OutboundAction::Send { bytes, .. } = &out[0] else {
            panic!("expected send")
        };
        assert!(matches!(
            a.handle_datagram(bytes, source(&a), T0),
            Err(DispatchError::Loopback)
        ));
    }

    #[test]
    fn garbage_and_unknown_types_are_errors_not_panics() {
        let mut a = node("alice", "10.0.0.1");
        let src: SocketAddr = "10.0.0.2:50999".parse().unwrap();
        assert!(matches!(
            a.handle_datagram(&[0xff, 0x00], src, T0),
            Err(DispatchError::Decode(_))
        ));
        assert!(matches!(
            a.handle_datagram(b"TYPE: HELLO\nFROM: b@10.0.0.2\n\n", src, T0),
            Err(DispatchError::UnknownType(_))
        ));
        assert!(matches!(
            a.handle_datagram(b"TYPE: DM\nFROM: b@10.0.0.2\n\n", src, T0),
            Err(DispatchError::Decode(_))
        ));
    }

    #[test]
    fn announce_cycles_profile_then_pings() {
        let mut a = node("alice", "10.0.0.1");
        let kinds: Vec<MessageKind> = (0..6)
            .map(|i| sends(&a.announce(T0 + i as f64).unwrap())[0].kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::Profile,
                MessageKind::Ping,
                MessageKind::Ping,
                MessageKind::Profile,
                MessageKind::Ping,
                MessageKind::Ping,
            ]
        );
    }

    #[test]
    fn announce_goes_to_broadcast_address() {
        let mut a = node("alice", "10.0.0.1");
        let out = a.announce(T0).unwrap();
        assert!(matches!(
            &out[0],
            OutboundAction::Send { to, .. } if *to == "10.0.0.255:50999".parse::<SocketAddr>().unwrap()
        ));
    }

    #[test]
    fn cleanup_evicts_silent_peers_only() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        let mut c = node("carol", "10.0.0.3");
        introduce(&mut a, &mut b, T0);
        introduce(&mut a, &mut c, T0);
        let profile = c.announce(T0 + 1.0).unwrap(); // tick 0
        deliver_to(&mut a, source(&c), &profile, T0 + 50.0);

        let out = a.cleanup(T0 + 70.0);
        assert_eq!(
            events(&out),
            vec![Event::PeerEvicted { id: b.id().clone() }]
        );
        assert!(a.peers().contains(c.id()));
    }
}
