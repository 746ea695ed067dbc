//! Binary wire protocol between peers.
//!
//! Every message is a bincode-encoded [`Frame`]: a correlation id plus
//! either a [`Request`] or the matching [`Reply`]. Frames travel as binary
//! WebSocket messages over the peer's TCP connection; the caller matches
//! replies to requests by id.
//!
//! Position identifiers cross the wire as opaque byte sequences — only
//! `entwine_core::position` knows their layout. Sync patches are
//! bincode-encoded operation lists compressed with LZ4, since a patch after
//! a long partition can replay an entire history.

use entwine_core::Loc;
use serde::{Deserialize, Serialize};

/// Operation kind carried in patches and durable records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    Insert = 1,
    Delete = 2,
}

/// One replicated operation, as stored and as shipped in patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub atom: char,
    /// Serialized position identifier (opaque bytes).
    pub pos: Vec<u8>,
    /// The issuing replica's logical clock for this operation.
    pub clock: u64,
}

impl Operation {
    pub fn insert(atom: char, pos: Vec<u8>, clock: u64) -> Self {
        Self { kind: OpKind::Insert, atom, pos, clock }
    }

    pub fn delete(atom: char, pos: Vec<u8>, clock: u64) -> Self {
        Self { kind: OpKind::Delete, atom, pos, clock }
    }
}

/// Arguments for the Insert and Delete RPCs.
///
/// The sender's cursor rides along so the receiver can render it without a
/// separate round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditArgs {
    /// Serialized position identifier.
    pub pos: Vec<u8>,
    pub atom: char,
    /// Issuer's logical clock at the moment of issue.
    pub clock: u64,
    pub cursor: Loc,
    /// Issuer's transport address (`host:port`).
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectArgs {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPhaseOneArgs {
    /// The initiator.
    pub client_id: String,
    /// Initiator's own clock.
    pub sender_clock: u64,
    /// Initiator's view of the receiver's clock.
    pub receiver_clock: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPhaseOneReply {
    /// True when the receiver is behind and wants a phase-two patch.
    pub phase_two: bool,
    /// Receiver's view of the initiator's clock (patch range start).
    pub requester_clock: u64,
    /// LZ4 patch payload; empty when the initiator is up to date.
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPhaseTwoArgs {
    pub client_id: String,
    /// LZ4 patch payload.
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorArgs {
    pub cursor: Loc,
    /// Issuer's clock; receivers drop updates at or behind the last op
    /// they applied from the issuer.
    pub clock: u64,
    pub client_id: String,
}

/// The RPC surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Insert(EditArgs),
    Delete(EditArgs),
    Connect(ConnectArgs),
    Disconnect(DisconnectArgs),
    SyncPhaseOne(SyncPhaseOneArgs),
    SyncPhaseTwo(SyncPhaseTwoArgs),
    CursorUpdate(CursorArgs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    SyncPhaseOne(SyncPhaseOneReply),
    /// Handler-side failure (e.g. divergence); the document is unchanged.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    Request(Request),
    Reply(Reply),
}

/// Wire envelope: correlation id plus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub body: FrameBody,
}

impl Frame {
    pub fn request(id: u64, request: Request) -> Self {
        Self { id, body: FrameBody::Request(request) }
    }

    pub fn reply(id: u64, reply: Reply) -> Self {
        Self { id, body: FrameBody::Reply(reply) }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Encode a patch: bincode, then LZ4 with a length prefix. An empty patch
/// is the empty byte sequence.
pub fn encode_patch(ops: &[Operation]) -> Result<Vec<u8>, ProtocolError> {
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    let raw = bincode::serde::encode_to_vec(ops, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Decode a patch produced by [`encode_patch`].
pub fn decode_patch(bytes: &[u8]) -> Result<Vec<Operation>, ProtocolError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    let (ops, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(ops)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    Compression(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::Compression(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
