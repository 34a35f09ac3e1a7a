//! Checkpoint blob encoding.
//!
//! A checkpoint is persisted as a versioned binary envelope: a fixed header
//! (codec version, flow UUID, last suspend sequence) followed by
//! length-prefixed sections for the flow state, the sub-flow stack, the
//! session table, progress metadata, and the error state. The runtime treats
//! section contents as opaque bytes keyed by the header version; the default
//! codec serializes sections as JSON.
//!
//! A blob whose version is newer than the codec supports is refused outright,
//! which is fatal for the affected flow but leaves the blob intact for a
//! newer node.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, ErrorState, FlowState, SubFlowFrame};
use crate::error::{Error, Result};
use crate::flow::{FlowId, InvocationContext, PeerId};
use crate::session::{SessionId, SessionState};

/// Header size: version (4) + flow UUID (16) + last suspend sequence (8).
const HEADER_LEN: usize = 4 + 16 + 8;

/// Encodes checkpoints to persisted blobs and back.
///
/// Supplied by the host; [`JsonCheckpointCodec`] is the default. The encoding
/// must be deterministic: replaying a transition must produce a byte-equal
/// `PersistCheckpoint` image.
pub trait CheckpointCodec: Send + Sync + 'static {
    /// Highest blob version this codec reads and the version it writes.
    fn version(&self) -> u32;

    /// Encode a checkpoint into a blob.
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>>;

    /// Decode a blob, refusing versions newer than [`version`](Self::version).
    fn decode(&self, blob: &[u8]) -> Result<Checkpoint>;
}

/// Progress and invocation metadata section.
///
/// Everything that must round-trip but has no section of its own in the blob
/// layout travels with the progress section.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressSection {
    progress_step: Option<String>,
    invocation_context: InvocationContext,
    our_identity: PeerId,
    start_args: Vec<u8>,
    next_session_ordinal: u64,
    soft_lock_id: Option<Uuid>,
}

/// The default JSON-sectioned checkpoint codec, blob version 1.
#[derive(Debug, Clone, Default)]
pub struct JsonCheckpointCodec;

impl JsonCheckpointCodec {
    /// Blob version written by this codec.
    pub const VERSION: u32 = 1;
}

impl CheckpointCodec for JsonCheckpointCodec {
    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let flow_state = serde_json::to_vec(&checkpoint.flow_state)?;
        let sub_flow_stack = serde_json::to_vec(&checkpoint.sub_flow_stack)?;
        let sessions = serde_json::to_vec(&checkpoint.sessions)?;
        let progress = serde_json::to_vec(&ProgressSection {
            progress_step: checkpoint.progress_step.clone(),
            invocation_context: checkpoint.invocation_context.clone(),
            our_identity: checkpoint.our_identity.clone(),
            start_args: checkpoint.start_args.clone(),
            next_session_ordinal: checkpoint.next_session_ordinal,
            soft_lock_id: checkpoint.soft_lock_id,
        })?;
        let error_state = serde_json::to_vec(&checkpoint.error_state)?;

        let sections = [
            flow_state.as_slice(),
            sub_flow_stack.as_slice(),
            sessions.as_slice(),
            progress.as_slice(),
            error_state.as_slice(),
        ];

        let body_len: usize = sections.iter().map(|s| 4 + s.len()).sum();
        let mut blob = Vec::with_capacity(HEADER_LEN + body_len);
        blob.extend_from_slice(&Self::VERSION.to_le_bytes());
        blob.extend_from_slice(checkpoint.flow_id.as_uuid().as_bytes());
        blob.extend_from_slice(&checkpoint.number_of_suspends.to_le_bytes());
        for section in sections {
            blob.extend_from_slice(&(section.len() as u32).to_le_bytes());
            blob.extend_from_slice(section);
        }
        Ok(blob)
    }

    fn decode(&self, blob: &[u8]) -> Result<Checkpoint> {
        let mut reader = BlobReader::new(blob);

        let version = reader.u32()?;
        if version > self.version() {
            return Err(Error::UnsupportedCheckpointVersion {
                found: version,
                supported: self.version(),
            });
        }
        let flow_id = FlowId::from_uuid(Uuid::from_bytes(reader.uuid()?));
        let number_of_suspends = reader.u64()?;

        let flow_state: FlowState = decode_section(&mut reader, flow_id, "flow state")?;
        let sub_flow_stack: Vec<SubFlowFrame> =
            decode_section(&mut reader, flow_id, "sub-flow stack")?;
        let sessions: std::collections::BTreeMap<SessionId, SessionState> =
            decode_section(&mut reader, flow_id, "sessions")?;
        let progress: ProgressSection = decode_section(&mut reader, flow_id, "progress")?;
        let error_state: ErrorState = decode_section(&mut reader, flow_id, "error state")?;

        Ok(Checkpoint {
            flow_id,
            invocation_context: progress.invocation_context,
            our_identity: progress.our_identity,
            start_args: progress.start_args,
            sub_flow_stack,
            sessions,
            flow_state,
            error_state,
            number_of_suspends,
            progress_step: progress.progress_step,
            next_session_ordinal: progress.next_session_ordinal,
            soft_lock_id: progress.soft_lock_id,
        })
    }
}

fn decode_section<T: serde::de::DeserializeOwned>(
    reader: &mut BlobReader<'_>,
    flow_id: FlowId,
    what: &str,
) -> Result<T> {
    let section = reader.section().ok_or_else(|| Error::CheckpointDecode {
        flow_id,
        reason: format!("truncated blob at {what} section"),
    })?;
    serde_json::from_slice(&section).map_err(|e| Error::CheckpointDecode {
        flow_id,
        reason: format!("{what}: {e}"),
    })
}

struct BlobReader<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn new(blob: &'a [u8]) -> Self {
        Self { blob, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.blob.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| Error::storage_permanent("checkpoint blob shorter than its header"))
    }

    fn u64(&mut self) -> Result<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| Error::storage_permanent("checkpoint blob shorter than its header"))
    }

    fn uuid(&mut self) -> Result<[u8; 16]> {
        self.take(16)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::storage_permanent("checkpoint blob shorter than its header"))
    }

    fn section(&mut self) -> Option<Vec<u8>> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().ok()?) as usize;
        Some(self.take(len)?.to_vec())
    }
}
