//! Events delivered to flow workers and the I/O requests flows suspend on.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;
use crate::flow::PeerId;
use crate::session::{SessionEnvelope, SessionId};

/// A request user code suspends on.
///
/// Part of the persisted `Started` state: the transition function matches
/// arriving events against the pending request to decide when to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum FlowIoRequest {
    /// Send one payload per session; resumes once the sends are recorded.
    Send {
        /// Payload per target session.
        sessions: BTreeMap<SessionId, Vec<u8>>,
    },
    /// Park until every listed session has at least one buffered payload.
    Receive {
        /// Sessions to receive from.
        sessions: BTreeSet<SessionId>,
    },
    /// [`Send`](FlowIoRequest::Send) then [`Receive`](FlowIoRequest::Receive)
    /// on the same sessions in one suspension.
    SendAndReceive {
        /// Payload per target session; the reply is awaited on each.
        sessions: BTreeMap<SessionId, Vec<u8>>,
    },
    /// Send end-of-session and close the listed sessions.
    CloseSessions {
        /// Sessions to close.
        sessions: BTreeSet<SessionId>,
    },
    /// Park until the node observes the given ledger transaction as
    /// committed.
    WaitForLedgerCommit {
        /// Opaque transaction id.
        tx_id: String,
    },
    /// Park until every initiating session has been confirmed by its
    /// counterparty.
    WaitForSessionConfirmations,
    /// Run a host-provided asynchronous operation; parks until its
    /// completion event arrives.
    ExecuteAsync {
        /// Opaque operation handle, resolved by the host.
        operation: String,
    },
    /// Park for at least the given duration.
    Sleep {
        /// How long to sleep.
        duration: Duration,
    },
    /// Suspend solely to persist a checkpoint, even inside idempotent
    /// frames.
    ForceCheckpoint,
}

impl FlowIoRequest {
    /// Sessions this request waits to receive on.
    pub fn awaited_sessions(&self) -> BTreeSet<SessionId> {
        match self {
            FlowIoRequest::Receive { sessions } => sessions.clone(),
            FlowIoRequest::SendAndReceive { sessions } => sessions.keys().copied().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Session payloads this request sends, if any.
    pub fn outbound_payloads(&self) -> Option<&BTreeMap<SessionId, Vec<u8>>> {
        match self {
            FlowIoRequest::Send { sessions } | FlowIoRequest::SendAndReceive { sessions } => {
                Some(sessions)
            }
            _ => None,
        }
    }
}

/// An event delivered to a flow worker.
///
/// Events are not persisted; they serialize the work of one flow through its
/// inbox. The `Suspend` and sub-flow events are posted synchronously by the
/// worker itself while user code is paused.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Make progress: resume a satisfied request, or re-perform the pending
    /// request's sends after a restart or safe-point retry.
    DoRemainingWork,
    /// A session message arrived for this flow.
    DeliverSessionMessage {
        /// The local session the message is addressed to.
        session_id: SessionId,
        /// The wire envelope.
        message: SessionEnvelope,
    },
    /// Something went wrong; the transition classifies and reacts.
    Error {
        /// The error to classify.
        error: FlowError,
    },
    /// User code reached an I/O request.
    Suspend {
        /// The request to suspend on.
        io_request: FlowIoRequest,
        /// The checkpoint write may be skipped for this suspension.
        may_skip_checkpoint: bool,
        /// Serialized user state machine.
        continuation: Vec<u8>,
    },
    /// User code returned its result.
    FlowFinish {
        /// The flow's result payload.
        result: Vec<u8>,
        /// Soft-lock id to release, if the flow declared one.
        soft_lock_id: Option<Uuid>,
    },
    /// User code entered a sub-flow.
    EnterSubFlow {
        /// Registered class name of the sub-flow.
        flow_class: String,
        /// Sub-flow version tag.
        version: u32,
        /// The sub-flow's side effects are safe to replay.
        is_idempotent: bool,
        /// The sub-flow participates in wait-timeout retries.
        is_timed: bool,
    },
    /// User code left the current sub-flow.
    LeaveSubFlow,
    /// User code asked for a new session towards a peer.
    InitiateFlow {
        /// The counterparty node.
        peer: PeerId,
    },
    /// A host-side asynchronous operation finished.
    AsyncOperationCompletion {
        /// Operation result payload.
        result: Vec<u8>,
    },
    /// A sleep timer fired.
    WakeUpFromSleep,
    /// Discard in-memory progress and restart from the last persisted
    /// checkpoint.
    RetryFlowFromSafePoint,
}
