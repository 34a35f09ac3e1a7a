//! Sessions: bidirectional, FIFO-ordered message channels between flows.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;
use crate::flow::{FlowId, PeerId};

/// A session identifier, unique on the node that allocated it.
///
/// Derived deterministically from the owning flow's id and a per-flow
/// ordinal, so that replaying a transition allocates the same id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw session id received on the wire.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The raw wire value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Derive the id of the `ordinal`-th session allocated by `flow_id`.
    ///
    /// FNV-1a over the flow UUID folded with the ordinal. Deterministic so
    /// the pure transition function can allocate session ids without RNG.
    pub fn derive(flow_id: &FlowId, ordinal: u64) -> Self {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for byte in flow_id.as_uuid().as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for byte in ordinal.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        Self(hash)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Message kinds carried in a session envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageKind {
    /// Application payload.
    Data,
    /// Session initiation; payload is a serialized [`InitialSessionMessage`].
    Init,
    /// Orderly end of the sender's side of the session.
    End,
    /// The sender's flow errored; payload is a serialized [`FlowError`].
    Reject,
    /// Initiation accepted; `peer_session_id` carries the responder's id.
    Confirm,
}

/// The broker payload exchanged between nodes for one session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// The recipient's session id (routing key). For `Init` this is the
    /// initiator's id, adopted by the receiver as the peer reference.
    pub session_id: SessionId,
    /// The sender's session id, where the recipient does not know it yet.
    pub peer_session_id: Option<SessionId>,
    /// Per-session send sequence for `Data`/`End`; FIFO delivery is checked
    /// against it.
    pub sequence_number: u64,
    /// Stable replay tag; see [`DeduplicationId`].
    pub deduplication_id: String,
    /// Message kind.
    pub kind: SessionMessageKind,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// First message of a new session, carried as the payload of an `Init`
/// envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSessionMessage {
    /// Registered class name of the flow the initiator wants to talk to.
    pub protocol: String,
    /// The initiator's version of that protocol.
    pub protocol_version: u32,
    /// Optional first payload, delivered into the responder's receive buffer.
    pub first_payload: Option<Vec<u8>>,
}

/// Stable tag on an outbound message enabling receivers to drop replays.
///
/// `sender_uuid` identifies the sending process incarnation; it is `None`
/// when the flow was resumed from a checkpoint on a fresh process, telling
/// the receiving de-duplicator to treat the message as possibly-duplicated.
/// Two messages are replays of each other when their [`key`](Self::key)s are
/// equal, regardless of sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationId {
    /// Sending process incarnation, if the flow has not crossed a restart.
    pub sender_uuid: Option<Uuid>,
    /// Per-session seed, derived from the sending flow's id.
    pub seed: String,
    /// Per-session message sequence.
    pub sequence: u64,
    /// Safe-point retry counter; 0 for the first attempt.
    pub retry: u32,
}

impl DeduplicationId {
    /// The replay-detection key: everything except the sender incarnation.
    pub fn key(&self) -> String {
        if self.retry == 0 {
            format!("{}:{}", self.seed, self.sequence)
        } else {
            format!("{}:{}:R{}", self.seed, self.sequence, self.retry)
        }
    }

    /// Parse the wire form produced by [`Display`](std::fmt::Display).
    pub fn parse(s: &str) -> Option<Self> {
        let (sender, rest) = s.split_once('|')?;
        let sender_uuid = match sender {
            "null" => None,
            other => Some(Uuid::parse_str(other).ok()?),
        };
        let mut parts = rest.split(':');
        let seed = parts.next()?.to_owned();
        let sequence = parts.next()?.parse().ok()?;
        let retry = match parts.next() {
            Some(r) => r.strip_prefix('R')?.parse().ok()?,
            None => 0,
        };
        Some(Self {
            sender_uuid,
            seed,
            sequence,
            retry,
        })
    }

    /// The replay-detection key of an envelope's deduplication id string.
    pub fn key_of(envelope_id: &str) -> String {
        match envelope_id.split_once('|') {
            Some((_, rest)) => rest.to_owned(),
            None => envelope_id.to_owned(),
        }
    }
}

impl std::fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sender_uuid {
            Some(uuid) => write!(f, "{}|{}", uuid, self.key()),
            None => write!(f, "null|{}", self.key()),
        }
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    /// Allocated locally; nothing sent yet. A session leaves this phase only
    /// by an `Init` send committed atomically with a checkpoint write.
    Uninitiated,
    /// `Init` sent, awaiting the counterparty's `Confirm`.
    Initiating {
        /// Payload carried in the `Init` message, if any.
        first_payload: Option<Vec<u8>>,
        /// Data payloads queued locally until the session is confirmed.
        backlog: Vec<Vec<u8>>,
    },
    /// Confirmed and open in both directions.
    Initiated {
        /// The counterparty's session id; outbound envelopes are addressed
        /// to it.
        peer_session_id: SessionId,
        /// The counterparty sent `End`; no more data will arrive.
        has_seen_end_of_session: bool,
        /// Payloads delivered but not yet consumed by a receive.
        receive_buffer: VecDeque<Vec<u8>>,
        /// Highest contiguous inbound sequence delivered, for replay drops.
        last_received_seq: Option<u64>,
        /// A `Reject` arrived while the flow was not waiting on this session.
        pending_error: Option<FlowError>,
    },
    /// Closed locally; any further inbound traffic is a protocol error.
    Closed,
}

/// Per-session state stored in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// This node's id for the session.
    pub session_id: SessionId,
    /// The counterparty node.
    pub peer: PeerId,
    /// Protocol (registered flow class) this session speaks.
    pub protocol: String,
    /// Protocol version announced in the initiation.
    pub protocol_version: u32,
    /// Deduplication seed for messages this side sends.
    pub deduplication_seed: String,
    /// Next outbound `Data`/`End` sequence number.
    pub next_sending_seq: u64,
    /// Lifecycle phase.
    pub phase: SessionPhase,
}

impl SessionState {
    /// A freshly allocated, locally initiated session.
    pub fn uninitiated(
        session_id: SessionId,
        peer: PeerId,
        protocol: impl Into<String>,
        protocol_version: u32,
        deduplication_seed: String,
    ) -> Self {
        Self {
            session_id,
            peer,
            protocol: protocol.into(),
            protocol_version,
            deduplication_seed,
            next_sending_seq: 0,
            phase: SessionPhase::Uninitiated,
        }
    }

    /// A session created by a counterparty initiation, open from the start.
    pub fn initiated_by_peer(
        session_id: SessionId,
        peer: PeerId,
        peer_session_id: SessionId,
        protocol: impl Into<String>,
        protocol_version: u32,
        deduplication_seed: String,
        first_payload: Option<Vec<u8>>,
    ) -> Self {
        let mut receive_buffer = VecDeque::new();
        let last_received_seq = first_payload.as_ref().map(|_| 0);
        if let Some(payload) = first_payload {
            receive_buffer.push_back(payload);
        }
        Self {
            session_id,
            peer,
            protocol: protocol.into(),
            protocol_version,
            deduplication_seed,
            next_sending_seq: 0,
            phase: SessionPhase::Initiated {
                peer_session_id,
                has_seen_end_of_session: false,
                receive_buffer,
                last_received_seq,
                pending_error: None,
            },
        }
    }

    /// Whether the session is open for sending.
    pub fn is_open(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Uninitiated
                | SessionPhase::Initiating { .. }
                | SessionPhase::Initiated { .. }
        )
    }

    /// Whether a receive on this session can complete right now.
    pub fn has_buffered_payload(&self) -> bool {
        matches!(
            &self.phase,
            SessionPhase::Initiated { receive_buffer, .. } if !receive_buffer.is_empty()
        )
    }
}
