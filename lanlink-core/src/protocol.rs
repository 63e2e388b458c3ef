//! Wire protocol: message types and their field layout.
//!
//! Every message decodes into a [`Message`] variant with its required fields checked. The
//! sender identity travels as `USER_ID` for PING/PROFILE/POST and as `FROM` for everything
//! else; after decoding it is always the variant's `from` field.

use std::fmt;
use std::str::FromStr;

use crate::identity::{join_id_list, parse_id_list, PeerId};
use crate::wire::{self, DecodeError, EncodeError, Fields};

/// The `TYPE` tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Ping,
    Profile,
    Ack,
    Follow,
    Unfollow,
    Post,
    Like,
    Dm,
    GroupCreate,
    GroupUpdate,
    GroupMessage,
    TictactoeInvite,
    TictactoeMove,
    TictactoeResult,
    FileOffer,
    FileAccepted,
    FileChunk,
    FileReceived,
}

impl MessageKind {
    pub const ALL: [MessageKind; 18] = [
        MessageKind::Ping,
        MessageKind::Profile,
        MessageKind::Ack,
        MessageKind::Follow,
        MessageKind::Unfollow,
        MessageKind::Post,
        MessageKind::Like,
        MessageKind::Dm,
        MessageKind::GroupCreate,
        MessageKind::GroupUpdate,
        MessageKind::GroupMessage,
        MessageKind::TictactoeInvite,
        MessageKind::TictactoeMove,
        MessageKind::TictactoeResult,
        MessageKind::FileOffer,
        MessageKind::FileAccepted,
        MessageKind::FileChunk,
        MessageKind::FileReceived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::Profile => "PROFILE",
            MessageKind::Ack => "ACK",
            MessageKind::Follow => "FOLLOW",
            MessageKind::Unfollow => "UNFOLLOW",
            MessageKind::Post => "POST",
            MessageKind::Like => "LIKE",
            MessageKind::Dm => "DM",
            MessageKind::GroupCreate => "GROUP_CREATE",
            MessageKind::GroupUpdate => "GROUP_UPDATE",
            MessageKind::GroupMessage => "GROUP_MESSAGE",
            MessageKind::TictactoeInvite => "TICTACTOE_INVITE",
            MessageKind::TictactoeMove => "TICTACTOE_MOVE",
            MessageKind::TictactoeResult => "TICTACTOE_RESULT",
            MessageKind::FileOffer => "FILE_OFFER",
            MessageKind::FileAccepted => "FILE_ACCEPTED",
            MessageKind::FileChunk => "FILE_CHUNK",
            MessageKind::FileReceived => "FILE_RECEIVED",
        }
    }

    /// Types registered with the reliable-delivery layer when sent.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            MessageKind::Follow
                | MessageKind::Unfollow
                | MessageKind::Dm
                | MessageKind::TictactoeInvite
                | MessageKind::TictactoeMove
                | MessageKind::TictactoeResult
                | MessageKind::FileChunk
        )
    }

    /// Types subject to the debug packet-loss injector.
    pub fn is_lossy(self) -> bool {
        matches!(
            self,
            MessageKind::TictactoeInvite
                | MessageKind::TictactoeMove
                | MessageKind::TictactoeResult
                | MessageKind::FileOffer
                | MessageKind::FileAccepted
                | MessageKind::FileChunk
                | MessageKind::FileReceived
        )
    }

    /// Field carrying the sender's id, if the type has one.
    pub fn identity_field(self) -> Option<&'static str> {
        match self {
            MessageKind::Ack => None,
            MessageKind::Ping | MessageKind::Profile | MessageKind::Post => Some("USER_ID"),
            _ => Some("FROM"),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Opaque avatar blob; `data` is base64 when `encoding` says so.
#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub mime_type: String,
    pub encoding: String,
    pub data: String,
}

impl Avatar {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self {
            mime_type: mime_type.to_string(),
            encoding: "base64".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode for display. Non-base64 encodings are returned as raw text bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine;
        if self.encoding.eq_ignore_ascii_case("base64") {
            base64::engine::general_purpose::STANDARD.decode(&self.data)
        } else {
            Ok(self.data.as_bytes().to_vec())
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LikeAction {
    Like,
    Unlike,
}

impl LikeAction {
    fn as_str(self) -> &'static str {
        match self {
            LikeAction::Like => "LIKE",
            LikeAction::Unlike => "UNLIKE",
        }
    }
}

impl FromStr for LikeAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "LIKE" => Ok(LikeAction::Like),
            "UNLIKE" => Ok(LikeAction::Unlike),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    pub fn opposite(self) -> Self {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Symbol::X => "X",
            Symbol::O => "O",
        })
    }
}

impl FromStr for Symbol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "X" => Ok(Symbol::X),
            "O" => Ok(Symbol::O),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GameResult {
    Win,
    Loss,
    Draw,
    Forfeit,
}

impl GameResult {
    fn as_str(self) -> &'static str {
        match self {
            GameResult::Win => "WIN",
            GameResult::Loss => "LOSS",
            GameResult::Draw => "DRAW",
            GameResult::Forfeit => "FORFEIT",
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameResult {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "WIN" => Ok(GameResult::Win),
            "LOSS" => Ok(GameResult::Loss),
            "DRAW" => Ok(GameResult::Draw),
            "FORFEIT" => Ok(GameResult::Forfeit),
            _ => Err(()),
        }
    }
}

/// FOLLOW and UNFOLLOW share one layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowRequest {
    pub message_id: String,
    pub from: PeerId,
    pub to: PeerId,
    pub timestamp: f64,
    pub token: String,
}

/// All wire message types.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping {
        from: PeerId,
    },
    Profile {
        from: PeerId,
        display_name: String,
        status: String,
        avatar: Option<Avatar>,
    },
    Ack {
        message_id: String,
        status: String,
    },
    Follow(FollowRequest),
    Unfollow(FollowRequest),
    Post {
        message_id: String,
        from: PeerId,
        content: String,
        ttl: u64,
        /// Post identity: kept exactly as transmitted.
        timestamp: String,
        token: String,
    },
    Like {
        from: PeerId,
        to: PeerId,
        post_timestamp: String,
        action: LikeAction,
        timestamp: f64,
        token: String,
    },
    Dm {
        message_id: String,
        from: PeerId,
        to: PeerId,
        content: String,
        timestamp: f64,
        token: String,
        avatar: Option<Avatar>,
    },
    GroupCreate {
        from: PeerId,
        group_id: String,
        group_name: String,
        members: Vec<PeerId>,
        timestamp: f64,
        token: String,
    },
    GroupUpdate {
        from: PeerId,
        group_id: String,
        group_name: String,
        add: Vec<PeerId>,
        remove: Vec<PeerId>,
        /// Owner's full roster after the update; absent from older senders.
        members: Option<Vec<PeerId>>,
        timestamp: f64,
        token: String,
    },
    GroupMessage {
        from: PeerId,
        group_id: String,
        content: String,
        timestamp: f64,
        token: String,
    },
    TictactoeInvite {
        message_id: String,
        from: PeerId,
        to: PeerId,
        game_id: String,
        symbol: Symbol,
        timestamp: f64,
        token: String,
    },
    TictactoeMove {
        message_id: String,
        from: PeerId,
        to: PeerId,
        game_id: String,
        /// Signed so out-of-range positions reach the handler (and get ACKed) instead of failing decode.
        position: i64,
        symbol: Symbol,
        turn: u32,
        token: String,
    },
    TictactoeResult {
        message_id: String,
        from: PeerId,
        to: PeerId,
        game_id: String,
        result: GameResult,
        symbol: Symbol,
        timestamp: f64,
        winning_line: Option<[usize; 3]>,
    },
    FileOffer {
        from: PeerId,
        to: PeerId,
        file_id: String,
        filename: String,
        filesize: u64,
        filetype: String,
        description: String,
        timestamp: f64,
        token: String,
        /// SHA-256 of the whole payload, lowercase hex.
        hash: Option<String>,
    },
    FileAccepted {
        from: PeerId,
        to: PeerId,
        file_id: String,
        timestamp: f64,
    },
    FileChunk {
        message_id: String,
        from: PeerId,
        to: PeerId,
        file_id: String,
        chunk_index: usize,
        total_chunks: usize,
        chunk_size: usize,
        token: String,
        /// Base64 chunk bytes.
        data: String,
    },
    FileReceived {
        from: PeerId,
        to: PeerId,
        file_id: String,
        status: String,
        timestamp: f64,
    },
}

/// ACK key for a file chunk: distinct from the chunk's own message id.
pub fn chunk_ack_key(file_id: &str, chunk_index: usize) -> String {
    format!("{file_id}_chunk_{chunk_index}")
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping { .. } => MessageKind::Ping,
            Message::Profile { .. } => MessageKind::Profile,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Follow(_) => MessageKind::Follow,
            Message::Unfollow(_) => MessageKind::Unfollow,
            Message::Post { .. } => MessageKind::Post,
            Message::Like { .. } => MessageKind::Like,
            Message::Dm { .. } => MessageKind::Dm,
            Message::GroupCreate { .. } => MessageKind::GroupCreate,
            Message::GroupUpdate { .. } => MessageKind::GroupUpdate,
            Message::GroupMessage { .. } => MessageKind::GroupMessage,
            Message::TictactoeInvite { .. } => MessageKind::TictactoeInvite,
            Message::TictactoeMove { .. } => MessageKind::TictactoeMove,
            Message::TictactoeResult { .. } => MessageKind::TictactoeResult,
            Message::FileOffer { .. } => MessageKind::FileOffer,
            Message::FileAccepted { .. } => MessageKind::FileAccepted,
            Message::FileChunk { .. } => MessageKind::FileChunk,
            Message::FileReceived { .. } => MessageKind::FileReceived,
        }
    }

    /// Canonical sender id. `None` only for ACK.
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            Message::Ack { .. } => None,
            Message::Follow(r) | Message::Unfollow(r) => Some(&r.from),
            Message::Ping { from }
            | Message::Profile { from, .. }
            | Message::Post { from, .. }
            | Message::Like { from, .. }
            | Message::Dm { from, .. }
            | Message::GroupCreate { from, .. }
            | Message::GroupUpdate { from, .. }
            | Message::GroupMessage { from, .. }
            | Message::TictactoeInvite { from, .. }
            | Message::TictactoeMove { from, .. }
            | Message::TictactoeResult { from, .. }
            | Message::FileOffer { from, .. }
            | Message::FileAccepted { from, .. }
            | Message::FileChunk { from, .. }
            | Message::FileReceived { from, .. } => Some(from),
        }
    }

    /// Key the receiver will echo back in its ACK, for ACK-tracked types.
    pub fn ack_key(&self) -> Option<String> {
        match self {
            Message::FileChunk {
                file_id,
                chunk_index,
                ..
            } => Some(chunk_ack_key(file_id, *chunk_index)),
            Message::Follow(r) | Message::Unfollow(r) => Some(r.message_id.clone()),
            Message::Dm { message_id, .. }
            | Message::TictactoeInvite { message_id, .. }
            | Message::TictactoeMove { message_id, .. }
            | Message::TictactoeResult { message_id, .. } => Some(message_id.clone()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        wire::encode_fields(&self.to_fields())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_fields(&wire::decode_fields(bytes)?)
    }

    pub fn to_fields(&self) -> Fields {
        let kind = self.kind();
        let mut w = Writer(Fields::new());
        w.put("TYPE", kind);
        if let (Some(field), Some(from)) = (kind.identity_field(), self.sender()) {
            w.put(field, from);
        }
        match self {
            Message::Ping { .. } => {}
            Message::Profile {
                display_name,
                status,
                avatar,
                ..
            } => {
                w.put("DISPLAY_NAME", display_name);
                w.put("STATUS", status);
                w.avatar(avatar.as_ref());
            }
            Message::Ack { message_id, status } => {
                w.put("MESSAGE_ID", message_id);
                w.put("STATUS", status);
            }
            Message::Follow(r) | Message::Unfollow(r) => {
                w.put("MESSAGE_ID", &r.message_id);
                w.put("TO", &r.to);
                w.put("TIMESTAMP", r.timestamp);
                w.put("TOKEN", &r.token);
            }
            Message::Post {
                message_id,
                content,
                ttl,
                timestamp,
                token,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("CONTENT", content);
                w.put("TTL", ttl);
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::Like {
                to,
                post_timestamp,
                action,
                timestamp,
                token,
                ..
            } => {
                w.put("TO", to);
                w.put("POST_TIMESTAMP", post_timestamp);
                w.put("ACTION", action.as_str());
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::Dm {
                message_id,
                to,
                content,
                timestamp,
                token,
                avatar,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("TO", to);
                w.put("CONTENT", content);
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
                w.avatar(avatar.as_ref());
            }
            Message::GroupCreate {
                group_id,
                group_name,
                members,
                timestamp,
                token,
                ..
            } => {
                w.put("GROUP_ID", group_id);
                w.put("GROUP_NAME", group_name);
                w.put("MEMBERS", join_id_list(members));
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::GroupUpdate {
                group_id,
                group_name,
                add,
                remove,
                members,
                timestamp,
                token,
                ..
            } => {
                w.put("GROUP_ID", group_id);
                w.put("GROUP_NAME", group_name);
                w.put("ADD", join_id_list(add));
                w.put("REMOVE", join_id_list(remove));
                if let Some(members) = members {
                    w.put("MEMBERS", join_id_list(members));
                }
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::GroupMessage {
                group_id,
                content,
                timestamp,
                token,
                ..
            } => {
                w.put("GROUP_ID", group_id);
                w.put("CONTENT", content);
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::TictactoeInvite {
                message_id,
                to,
                game_id,
                symbol,
                timestamp,
                token,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("TO", to);
                w.put("GAMEID", game_id);
                w.put("SYMBOL", symbol);
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
            }
            Message::TictactoeMove {
                message_id,
                to,
                game_id,
                position,
                symbol,
                turn,
                token,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("TO", to);
                w.put("GAMEID", game_id);
                w.put("POSITION", position);
                w.put("SYMBOL", symbol);
                w.put("TURN", turn);
                w.put("TOKEN", token);
            }
            Message::TictactoeResult {
                message_id,
                to,
                game_id,
                result,
                symbol,
                timestamp,
                winning_line,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("TO", to);
                w.put("GAMEID", game_id);
                w.put("RESULT", result);
                w.put("SYMBOL", symbol);
                w.put("TIMESTAMP", timestamp);
                if let Some([a, b, c]) = winning_line {
                    w.put("WINNING_LINE", format!("{a},{b},{c}"));
                }
            }
            Message::FileOffer {
                to,
                file_id,
                filename,
                filesize,
                filetype,
                description,
                timestamp,
                token,
                hash,
                ..
            } => {
                w.put("TO", to);
                w.put("FILEID", file_id);
                w.put("FILENAME", filename);
                w.put("FILESIZE", filesize);
                w.put("FILETYPE", filetype);
                w.put("DESCRIPTION", description);
                w.put("TIMESTAMP", timestamp);
                w.put("TOKEN", token);
                if let Some(hash) = hash {
                    w.put("FILEHASH", hash);
                }
            }
            Message::FileAccepted {
                to,
                file_id,
                timestamp,
                ..
            } => {
                w.put("TO", to);
                w.put("FILEID", file_id);
                w.put("TIMESTAMP", timestamp);
            }
            Message::FileChunk {
                message_id,
                to,
                file_id,
                chunk_index,
                total_chunks,
                chunk_size,
                token,
                data,
                ..
            } => {
                w.put("MESSAGE_ID", message_id);
                w.put("TO", to);
                w.put("FILEID", file_id);
                w.put("CHUNK_INDEX", chunk_index);
                w.put("TOTAL_CHUNKS", total_chunks);
                w.put("CHUNK_SIZE", chunk_size);
                w.put("TOKEN", token);
                w.put("DATA", data);
            }
            Message::FileReceived {
                to,
                file_id,
                status,
                timestamp,
                ..
            } => {
                w.put("TO", to);
                w.put("FILEID", file_id);
                w.put("STATUS", status);
                w.put("TIMESTAMP", timestamp);
            }
        }
        w.0
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, DecodeError> {
        let r = Reader(fields);
        let kind: MessageKind = r.req("TYPE")?.parse()?;
        let from = || -> Result<PeerId, DecodeError> {
            let field = kind.identity_field().unwrap_or("FROM");
            r.req(field).map(PeerId::from)
        };
        let follow = || -> Result<FollowRequest, DecodeError> {
            Ok(FollowRequest {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                from: from()?,
                to: r.peer("TO")?,
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            })
        };
        Ok(match kind {
            MessageKind::Ping => Message::Ping { from: from()? },
            MessageKind::Profile => Message::Profile {
                from: from()?,
                display_name: r.opt("DISPLAY_NAME").unwrap_or("Unknown").to_string(),
                status: r.opt("STATUS").unwrap_or_default().to_string(),
                avatar: r.avatar(),
            },
            MessageKind::Ack => Message::Ack {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                status: r.opt("STATUS").unwrap_or("RECEIVED").to_string(),
            },
            MessageKind::Follow => Message::Follow(follow()?),
            MessageKind::Unfollow => Message::Unfollow(follow()?),
            MessageKind::Post => Message::Post {
                message_id: r.opt("MESSAGE_ID").unwrap_or_default().to_string(),
                from: from()?,
                content: r.req("CONTENT")?.to_string(),
                ttl: r.opt_parse("TTL")?.unwrap_or(0),
                timestamp: r.req("TIMESTAMP")?.to_string(),
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::Like => Message::Like {
                from: from()?,
                to: r.peer("TO")?,
                post_timestamp: r.req("POST_TIMESTAMP")?.to_string(),
                action: r.parse("ACTION")?,
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::Dm => Message::Dm {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                from: from()?,
                to: r.peer("TO")?,
                content: r.req("CONTENT")?.to_string(),
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
                avatar: r.avatar(),
            },
            MessageKind::GroupCreate => Message::GroupCreate {
                from: from()?,
                group_id: r.req("GROUP_ID")?.to_string(),
                group_name: r.req("GROUP_NAME")?.to_string(),
                members: parse_id_list(r.req("MEMBERS")?),
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::GroupUpdate => Message::GroupUpdate {
                from: from()?,
                group_id: r.req("GROUP_ID")?.to_string(),
                group_name: r.opt("GROUP_NAME").unwrap_or_default().to_string(),
                add: parse_id_list(r.opt("ADD").unwrap_or_default()),
                remove: parse_id_list(r.opt("REMOVE").unwrap_or_default()),
                members: r.opt("MEMBERS").map(parse_id_list),
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::GroupMessage => Message::GroupMessage {
                from: from()?,
                group_id: r.req("GROUP_ID")?.to_string(),
                content: r.req("CONTENT")?.to_string(),
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::TictactoeInvite => Message::TictactoeInvite {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                from: from()?,
                to: r.peer("TO")?,
                game_id: r.req("GAMEID")?.to_string(),
                symbol: r.parse("SYMBOL")?,
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::TictactoeMove => Message::TictactoeMove {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                from: from()?,
                to: r.peer("TO")?,
                game_id: r.req("GAMEID")?.to_string(),
                position: r.parse("POSITION")?,
                symbol: r.parse("SYMBOL")?,
                turn: r.parse("TURN")?,
                token: r.req("TOKEN")?.to_string(),
            },
            MessageKind::TictactoeResult => Message::TictactoeResult {
                message_id: r.req("MESSAGE_ID")?.to_string(),
                from: from()?,
                to: r.peer("TO")?,
                game_id: r.req("GAMEID")?.to_string(),
                result: r.parse("RESULT")?,
                symbol: r.parse("SYMBOL")?,
                timestamp: r.opt_parse("TIMESTAMP")?.unwrap_or(0.0),
                winning_line: r.winning_line()?,
            },
            MessageKind::FileOffer => Message::FileOffer {
                from: from()?,
                to: r.peer("TO")?,
                file_id: r.req("FILEID")?.to_string(),
                filename: r.req("FILENAME")?.to_string(),
                filesize: r.parse("FILESIZE")?,
                filetype: r
                    .opt("FILETYPE")
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                description: r.opt("DESCRIPTION").unwrap_or_default().to_string(),
                timestamp: r.parse("TIMESTAMP")?,
                token: r.req("TOKEN")?.to_string(),
                hash: r.opt("FILEHASH").map(str::to_string),
            },
            MessageKind::FileAccepted => Message::FileAccepted {
                from: from()?,
                to: r.peer("TO")?,
                file_id: r.req("FILEID")?.to_string(),
                timestamp: r.opt_parse("TIMESTAMP")?.unwrap_or(0.0),
            },
            MessageKind::FileChunk => Message::FileChunk {
                message_id: r.opt("MESSAGE_ID").unwrap_or_default().to_string(),
                from: from()?,
                to: r.peer("TO")?,
                file_id: r.req("FILEID")?.to_string(),
                chunk_index: r.parse("CHUNK_INDEX")?,
                total_chunks: r.parse("TOTAL_CHUNKS")?,
                chunk_size: r.opt_parse("CHUNK_SIZE")?.unwrap_or(0),
                token: r.req("TOKEN")?.to_string(),
                data: r.req("DATA")?.to_string(),
            },
            MessageKind::FileReceived => Message::FileReceived {
                from: from()?,
                to: r.peer("TO")?,
                file_id: r.req("FILEID")?.to_string(),
                status: r.opt("STATUS").unwrap_or("COMPLETE").to_string(),
                timestamp: r.opt_parse("TIMESTAMP")?.unwrap_or(0.0),
            },
        })
    }
}

struct Writer(Fields);

impl Writer {
    fn put(&mut self, key: &str, value: impl fmt::Display) {
        self.0.insert(key.to_string(), value.to_string());
    }

    fn avatar(&mut self, avatar: Option<&Avatar>) {
        if let Some(a) = avatar {
            self.put("AVATAR_TYPE", &a.mime_type);
            self.put("AVATAR_ENCODING", &a.encoding);
            self.put("AVATAR_DATA", &a.data);
        }
    }
}

struct Reader<'a>(&'a Fields);

impl<'a> Reader<'a> {
    fn opt(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).map(String::as_str)
    }

    fn req(&self, key: &'static str) -> Result<&'a str, DecodeError> {
        self.opt(key).ok_or(DecodeError::MissingField(key))
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<T, DecodeError> {
        let raw = self.req(key)?;
        raw.parse().map_err(|_| DecodeError::InvalidField {
            field: key,
            value: raw.to_string(),
        })
    }

    fn opt_parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, DecodeError> {
        match self.opt(key) {
            None | Some("") => Ok(None),
            Some(_) => self.parse(key).map(Some),
        }
    }

    fn peer(&self, key: &'static str) -> Result<PeerId, DecodeError> {
        self.req(key).map(PeerId::from)
    }

    fn avatar(&self) -> Option<Avatar> {
        let data = self.opt("AVATAR_DATA").filter(|d| !d.is_empty())?;
        Some(Avatar {
            mime_type: self.opt("AVATAR_TYPE").unwrap_or_default().to_string(),
            encoding: self.opt("AVATAR_ENCODING").unwrap_or("base64").to_string(),
            data: data.to_string(),
        })
    }

    fn winning_line(&self) -> Result<Option<[usize; 3]>, DecodeError> {
        let Some(raw) = self.opt("WINNING_LINE").filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let invalid = || DecodeError::InvalidField {
            field: "WINNING_LINE",
            value: raw.to_string(),
        };
        let cells: Vec<usize> = raw
            .split(',')
            .map(|c| c.trim().parse().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let line: [usize; 3] = cells.try_into().map_err(|_| invalid())?;
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PeerId {
        PeerId::from("alice@10.0.0.1")
    }

    fn bob() -> PeerId {
        PeerId::from("bob@10.0.0.2")
    }

    #[test]
    fn ping_uses_user_id() {
        let bytes = Message::Ping { from: alice() }.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("USER_ID: alice@10.0.0.1"));
        assert!(!text.contains("FROM"));
        assert_eq!(Message::decode(&bytes).unwrap().sender(), Some(&alice()));
    }

    #[test]
    fn dm_uses_from_and_round_trips() {
        let msg = Message::Dm {
            message_id: "0123456789abcdef".into(),
            from: alice(),
            to: bob(),
            content: "hi".into(),
            timestamp: 1_700_000_000.5,
            token: "alice@10.0.0.1|1700000060.5|chat".into(),
            avatar: Some(Avatar::from_bytes("image/png", b"\x89PNG")),
        };
        let bytes = msg.encode().unwrap();
        assert!(String::from_utf8(bytes.clone()).unwrap().contains("FROM: alice@10.0.0.1"));
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        let Message::Dm { avatar, .. } = decoded else { panic!("expected DM") };
        assert_eq!(avatar.unwrap().decode().unwrap(), b"\x89PNG");
    }

    #[test]
    fn chunk_ack_key_is_composite() {
        let msg = Message::FileChunk {
            message_id: "feedfacefeedface".into(),
            from: alice(),
            to: bob(),
            file_id: "abcd1234".into(),
            chunk_index: 7,
            total_chunks: 9,
            chunk_size: 256,
            token: "alice@10.0.0.1|1|file".into(),
            data: "AAAA".into(),
        };
        assert_eq!(msg.ack_key().as_deref(), Some("abcd1234_chunk_7"));
        assert!(msg.kind().requires_ack());
    }

    #[test]
    fn broadcast_kinds_are_not_ack_tracked() {
        for kind in [
            MessageKind::Ping,
            MessageKind::Profile,
            MessageKind::Post,
            MessageKind::Like,
            MessageKind::GroupCreate,
            MessageKind::GroupUpdate,
            MessageKind::GroupMessage,
        ] {
            assert!(!kind.requires_ack(), "{kind}");
        }
    }

    #[test]
    fn missing_required_field_is_error() {
        let raw = b"TYPE: DM\nFROM: alice@10.0.0.1\nTO: bob@10.0.0.2\n\n";
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::MissingField(_))
        ));
    }

    #[test]
    fn unknown_type_is_error() {
        assert!(matches!(
            Message::decode(b"TYPE: REVOKE\nFROM: a@1.1.1.1\n\n"),
            Err(DecodeError::UnknownType(t)) if t == "REVOKE"
        ));
    }

    #[test]
    fn bad_number_is_error() {
        let raw = b"TYPE: TICTACTOE_MOVE\nFROM: a@1.1.1.1\nTO: b@2.2.2.2\nGAMEID: g1\nMESSAGE_ID: m\nPOSITION: four\nSYMBOL: X\nTURN: 1\nTOKEN: t\n\n";
        assert!(matches!(
            Message::decode(raw),
            Err(DecodeError::InvalidField { field: "POSITION", .. })
        ));
    }

    #[test]
    fn result_winning_line() {
        let msg = Message::TictactoeResult {
            message_id: "m1".into(),
            from: alice(),
            to: bob(),
            game_id: "g7".into(),
            result: GameResult::Win,
            symbol: Symbol::X,
            timestamp: 1.0,
            winning_line: Some([0, 4, 8]),
        };
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(text.contains("WINNING_LINE: 0,4,8"));
        assert_eq!(Message::decode(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn group_update_members_optional() {
        let raw = b"TYPE: GROUP_UPDATE\nFROM: a@1.1.1.1\nGROUP_ID: g\nGROUP_NAME: G\nADD: b@2.2.2.2\nREMOVE: \nTIMESTAMP: 5\nTOKEN: t\n\n";
        let Message::GroupUpdate { add, remove, members, .. } = Message::decode(raw).unwrap() else {
            panic!("expected GROUP_UPDATE");
        };
        assert_eq!(add, vec![PeerId::from("b@2.2.2.2")]);
        assert!(remove.is_empty());
        assert!(members.is_none());
    }
}
