use std::fmt;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use uuid::Uuid;

use crate::peer::{Peer, PeerProperties};
use crate::{ClusterError, Result};

/// Message option flags carried on every wire unit
pub mod flags {
    /// Dedupe this message on the receiving side
    pub const AT_MOST_ONCE: u32 = 1 << 0;
    /// Deliver in sender order within the domain
    pub const PRESERVE_ORDER: u32 = 1 << 1;
    /// Membership traffic rather than application data
    pub const MEMBERSHIP_MSG: u32 = 1 << 2;
    /// Sender blocks until the receiver acknowledges
    pub const SYNC_ACK: u32 = 1 << 3;
    /// This unit answers a correlated request rather than initiating one
    pub const REPLY: u32 = 1 << 4;
}

/// Unique identifier attached to every transmitted unit; the receiving
/// duplicate suppressor keys on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).as_simple())
    }
}

/// Wire form of a peer record
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
pub struct WirePeer {
    pub host: String,
    pub port: u16,
    pub domain: Vec<u8>,
    pub sub_domain: Option<String>,
    pub alive_since: u64,
    pub properties: Vec<(String, String)>,
}

impl From<&Peer> for WirePeer {
    fn from(peer: &Peer) -> Self {
        Self {
            host: peer.host().to_string(),
            port: peer.port(),
            domain: peer.domain().to_vec(),
            sub_domain: peer.sub_domain().map(str::to_string),
            alive_since: peer.alive_since(),
            properties: peer
                .properties()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl WirePeer {
    pub fn into_peer(self) -> Peer {
        let properties: PeerProperties = self.properties.into_iter().collect();
        let peer = Peer::new(self.host, self.port, self.domain)
            .with_alive_since(self.alive_since)
            .with_properties(properties);
        match self.sub_domain {
            Some(sub) => peer.with_sub_domain(sub),
            None => peer,
        }
    }
}

/// Payload variants understood by the channel
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
pub enum Payload {
    /// Request to join a group; answered with the authoritative member list
    Join { joiner: WirePeer },
    /// Authoritative list of current members
    MemberList { members: Vec<WirePeer> },
    /// Announcement that a member just joined
    MemberJoined { member: WirePeer },
    /// A member is leaving the group
    Leave { leaver: WirePeer },
    /// Periodic liveness announcement
    Heartbeat { peer: WirePeer },
    /// Claim of the per-domain coordinator role
    CoordinatorAnnounce { coordinator: WirePeer },
    /// Request for initialization state from a neighbour
    InitRequest { request: Vec<u8> },
    /// Opaque application command
    Command { command: Vec<u8> },
    /// Response payload for a correlated request
    Response { response: Vec<u8> },
    /// Bare acknowledgment for a correlated request
    Ack,
}

/// One transmitted unit: identifier + domain tag + option flags + payload.
/// Socket addresses travel as strings for rkyv compatibility.
#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
pub struct Envelope {
    pub id: [u8; 16],
    pub domain: Vec<u8>,
    pub options: u32,
    /// Listening address (`host:port`) of the sending node
    pub sender: String,
    /// Per-sender delivery sequence; 0 when ordering is not requested
    pub sequence: u64,
    /// Correlates a request with its response; 0 when none
    pub correlation: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(domain: Vec<u8>, options: u32, payload: Payload) -> Self {
        Self {
            id: *MessageId::new().as_bytes(),
            domain,
            options,
            sender: String::new(),
            sequence: 0,
            correlation: 0,
            payload,
        }
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from_bytes(self.id)
    }

    pub fn has_option(&self, flag: u32) -> bool {
        self.options & flag != 0
    }

    pub fn is_reply(&self) -> bool {
        self.has_option(flags::REPLY)
    }
}

/// Serialize an envelope into a length-prefixed frame.
///
/// Serialization failure is a hard error surfaced to the caller, distinct
/// from any network failure.
pub fn encode_frame(envelope: &Envelope, max_size: usize) -> Result<Vec<u8>> {
    let data = rkyv::to_bytes::<rkyv::rancor::Error>(envelope)?;
    if data.len() > max_size {
        return Err(ClusterError::MessageTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Deserialize the body of a frame (length prefix already consumed).
pub fn decode_body(data: &[u8]) -> Result<Envelope> {
    // rkyv's zero-copy access requires the buffer to meet the archive's
    // alignment; a frame body sliced past the length prefix is not aligned,
    // so copy into an aligned buffer before validating.
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(data);
    let envelope = rkyv::from_bytes::<Envelope, rkyv::rancor::Error>(&aligned)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_uniqueness() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_envelope_frame_round_trip() {
        let peer = Peer::new("10.0.0.1", 4000, "grp1");
        let envelope = Envelope::new(
            b"grp1".to_vec(),
            flags::MEMBERSHIP_MSG | flags::AT_MOST_ONCE,
            Payload::Join {
                joiner: WirePeer::from(&peer),
            },
        );

        let frame = encode_frame(&envelope, 1024 * 1024).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded = decode_body(&frame[4..]).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.domain, b"grp1");
        assert!(decoded.has_option(flags::AT_MOST_ONCE));
        assert!(decoded.has_option(flags::MEMBERSHIP_MSG));
        assert!(!decoded.has_option(flags::SYNC_ACK));
        match decoded.payload {
            Payload::Join { joiner } => {
                assert_eq!(joiner.host, "10.0.0.1");
                assert_eq!(joiner.port, 4000);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_frame_size_limit() {
        let envelope = Envelope::new(
            b"grp1".to_vec(),
            0,
            Payload::Command {
                command: vec![0u8; 4096],
            },
        );
        let err = encode_frame(&envelope, 16).unwrap_err();
        assert!(matches!(err, ClusterError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_wire_peer_round_trip() {
        let mut props = PeerProperties::new();
        props.insert("httpPort", "9763");
        let peer = Peer::new("10.0.0.9", 4100, "grp2")
            .with_sub_domain("worker")
            .with_properties(props)
            .with_alive_since(42);

        let restored = WirePeer::from(&peer).into_peer();
        assert_eq!(restored, peer);
        assert_eq!(restored.sub_domain(), Some("worker"));
        assert_eq!(restored.alive_since(), 42);
        assert_eq!(restored.properties().get("httpPort"), Some("9763"));
    }
}
