//! LAN peer protocol engine.
//! Host-driven: no I/O; host passes datagrams, timer ticks and user operations, and receives actions.

pub mod chunk;
pub mod core;
pub mod discovery;
pub mod file;
pub mod game;
pub mod group;
pub mod identity;
pub mod integrity;
pub mod peers;
pub mod protocol;
pub mod reliable;
pub mod router;
pub mod social;
pub mod token;
pub mod wire;

pub use crate::core::{
    unix_now, CoreError, DispatchError, Event, LocalProfile, Node, NodeConfig, OutboundAction,
    Timings, DEFAULT_PORT,
};
pub use chunk::FileSendJob;
pub use identity::PeerId;
pub use protocol::{Avatar, GameResult, Message, MessageKind, Symbol};
pub use router::{Handler, Inbound, Router};
