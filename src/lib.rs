mod agent;
mod bootstrap;
mod channel;
mod config;
mod dispatcher;
mod election;
mod membership;
mod messenger;
mod order;
mod peer;
mod suppressor;
mod wire;

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use agent::{ClusterAgent, CommandHandler, DEFAULT_SUB_DOMAIN};
pub use bootstrap::{MembershipScheme, MulticastScheme, WkaScheme};
pub use channel::{ChannelHandler, NodeChannel};
pub use config::{ClusterConfig, MemberAddress, MulticastConfig, SchemeKind};
pub use dispatcher::{MembershipEventDispatcher, MembershipListener};
pub use election::{CoordinatorElection, ElectionTransition};
pub use membership::{GroupManagementAgent, MembershipTable, TableRegistry};
pub use messenger::{FaultyMember, GroupMessenger, SendOptions, SendReport};
pub use peer::{Peer, PeerProperties};
pub use suppressor::DuplicateSuppressor;
pub use wire::{Envelope, MessageId, Payload, WirePeer};

/// Errors that can occur in the clustering layer
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] rkyv::rancor::Error),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("send timeout")]
    Timeout,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("invalid configuration parameter {name}: {value}")]
    InvalidParameter { name: String, value: String },

    #[error("command execution failed: {0}")]
    CommandFailed(String),

    #[error("channel shutdown")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Milliseconds since the UNIX epoch.
pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Domain tags are opaque byte strings; two peers interact only when they match.
pub(crate) fn domains_match(a: &[u8], b: &[u8]) -> bool {
    a == b
}
