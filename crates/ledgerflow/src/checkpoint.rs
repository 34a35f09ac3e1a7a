//! The persisted, resumable state of a flow.

use std::collections::BTreeMap;

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;
use crate::event::FlowIoRequest;
use crate::flow::{FlowId, InvocationContext, PeerId};
use crate::session::{SessionId, SessionState};

/// One frame of the sub-flow stack; the top is the currently executing
/// sub-flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFlowFrame {
    /// Registered class name of the (sub-)flow.
    pub flow_class: String,
    /// Version tag of the flow class.
    pub version: u32,
    /// Side effects of this frame are safe to replay; suspensions under it
    /// skip checkpoint writes.
    pub is_idempotent: bool,
    /// This frame participates in wait-timeout safe-point retries.
    pub is_timed: bool,
}

/// Where the flow is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    /// Persisted before any user code ran, so a crash before the first
    /// suspend still leaves a replayable record.
    Unstarted,
    /// Suspended on an I/O request.
    Started {
        /// The request the flow is parked on. Kept in persistent state so an
        /// arriving session message can be matched against a pending receive.
        io_request: FlowIoRequest,
        /// The serialized user state machine, produced by the flow registry's
        /// continuation codec.
        continuation: Vec<u8>,
    },
    /// Finished with a result.
    Completed {
        /// The flow's result payload.
        result: Vec<u8>,
    },
    /// Terminated with an error; the checkpoint is retained for the hospital.
    Failed {
        /// The terminal error.
        error: FlowError,
    },
}

impl FlowState {
    /// The request the flow is currently suspended on, if any.
    pub fn pending_request(&self) -> Option<&FlowIoRequest> {
        match self {
            FlowState::Started { io_request, .. } => Some(io_request),
            _ => None,
        }
    }
}

/// Error bookkeeping for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ErrorState {
    /// No errors observed.
    Clean,
    /// The flow hit one or more errors awaiting propagation or operator
    /// attention.
    Errored {
        /// Errors to propagate, oldest first. Never empty.
        errors: NonEmpty<FlowError>,
        /// How many times the hospital has admitted this flow.
        hospital_visits: u32,
    },
}

impl ErrorState {
    /// Record `error`, creating or extending the errored state.
    pub fn record(&mut self, error: FlowError) {
        match self {
            ErrorState::Clean => {
                *self = ErrorState::Errored {
                    errors: NonEmpty::new(error),
                    hospital_visits: 0,
                };
            }
            ErrorState::Errored { errors, .. } => errors.push(error),
        }
    }

    /// Whether any error has been recorded.
    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }
}

/// The persisted, resumable state of one flow.
///
/// Created `Unstarted` before any user code runs, rewritten at every
/// persisted suspension, and removed when the flow finishes — unless it
/// finished `Failed`, in which case it is retained for the hospital.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The flow this checkpoint belongs to.
    pub flow_id: FlowId,
    /// The invocation the flow was started with.
    pub invocation_context: InvocationContext,
    /// The identity this node runs the flow as.
    pub our_identity: PeerId,
    /// Start request payload, kept so an `Unstarted` flow can be replayed
    /// from scratch after a crash.
    pub start_args: Vec<u8>,
    /// Sub-flow frames, bottom (the root flow) first.
    pub sub_flow_stack: Vec<SubFlowFrame>,
    /// All sessions this flow owns, by local session id.
    pub sessions: BTreeMap<SessionId, SessionState>,
    /// Lifecycle state.
    pub flow_state: FlowState,
    /// Error bookkeeping.
    pub error_state: ErrorState,
    /// Count of persisted suspensions. Strictly increases across persisted
    /// revisions of the same flow.
    pub number_of_suspends: u64,
    /// Human-readable progress step last reported by user code.
    pub progress_step: Option<String>,
    /// Ordinal for deriving the next locally allocated session id.
    pub next_session_ordinal: u64,
    /// Soft-lock id declared by the flow; write-once, released on terminal
    /// finish or abort.
    pub soft_lock_id: Option<Uuid>,
}

impl Checkpoint {
    /// A fresh `Unstarted` checkpoint with the root flow frame in place.
    pub fn unstarted(
        flow_id: FlowId,
        invocation_context: InvocationContext,
        our_identity: PeerId,
        root: SubFlowFrame,
        start_args: Vec<u8>,
    ) -> Self {
        Self {
            flow_id,
            invocation_context,
            our_identity,
            start_args,
            sub_flow_stack: vec![root],
            sessions: BTreeMap::new(),
            flow_state: FlowState::Unstarted,
            error_state: ErrorState::Clean,
            number_of_suspends: 0,
            progress_step: None,
            next_session_ordinal: 0,
            soft_lock_id: None,
        }
    }

    /// The currently executing sub-flow frame.
    pub fn top_frame(&self) -> Option<&SubFlowFrame> {
        self.sub_flow_stack.last()
    }

    /// The root flow frame.
    pub fn root_frame(&self) -> Option<&SubFlowFrame> {
        self.sub_flow_stack.first()
    }

    /// Whether any frame on the stack is idempotent, which makes the current
    /// suspension checkpoint-skippable.
    pub fn has_idempotent_frame(&self) -> bool {
        self.sub_flow_stack.iter().any(|f| f.is_idempotent)
    }

    /// Whether any frame on the stack declares a wait-timeout.
    pub fn is_timed(&self) -> bool {
        self.sub_flow_stack.iter().any(|f| f.is_timed)
    }

    /// Sessions that are still open towards their counterparty.
    pub fn open_sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values().filter(|s| s.is_open())
    }

    /// An introspection view of this checkpoint.
    pub fn view(&self) -> CheckpointView {
        CheckpointView {
            flow_id: self.flow_id,
            status: match &self.flow_state {
                FlowState::Unstarted => FlowStatus::Unstarted,
                FlowState::Started { .. } => FlowStatus::Suspended,
                FlowState::Completed { .. } => FlowStatus::Completed,
                FlowState::Failed { .. } => FlowStatus::Failed,
            },
            number_of_suspends: self.number_of_suspends,
            progress_step: self.progress_step.clone(),
            session_count: self.sessions.len(),
            sub_flow_depth: self.sub_flow_stack.len(),
            errored: self.error_state.is_errored(),
        }
    }
}

/// Coarse lifecycle status for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Persisted but no user code has run yet.
    Unstarted,
    /// Parked on an I/O request.
    Suspended,
    /// Finished with a result.
    Completed,
    /// Terminated with an error.
    Failed,
}

/// Read-only snapshot of a flow's checkpoint for operators and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointView {
    /// The flow.
    pub flow_id: FlowId,
    /// Coarse lifecycle status.
    pub status: FlowStatus,
    /// Persisted suspension count.
    pub number_of_suspends: u64,
    /// Last reported progress step.
    pub progress_step: Option<String>,
    /// Number of sessions the flow owns.
    pub session_count: usize,
    /// Depth of the sub-flow stack.
    pub sub_flow_depth: usize,
    /// Whether the flow has recorded errors.
    pub errored: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(idempotent: bool, timed: bool) -> SubFlowFrame {
        SubFlowFrame {
            flow_class: "test".into(),
            version: 1,
            is_idempotent: idempotent,
            is_timed: timed,
        }
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::unstarted(
            FlowId::random(),
            InvocationContext::rpc("tester"),
            PeerId::new("alice"),
            frame(false, false),
            vec![],
        )
    }

    #[test]
    fn unstarted_checkpoint_shape() {
        let cp = checkpoint();
        assert_eq!(cp.flow_state, FlowState::Unstarted);
        assert_eq!(cp.error_state, ErrorState::Clean);
        assert_eq!(cp.number_of_suspends, 0);
        assert_eq!(cp.sub_flow_stack.len(), 1);
        assert_eq!(cp.view().status, FlowStatus::Unstarted);
    }

    #[test]
    fn idempotent_and_timed_look_at_every_frame() {
        let mut cp = checkpoint();
        assert!(!cp.has_idempotent_frame());
        assert!(!cp.is_timed());

        cp.sub_flow_stack.push(frame(true, false));
        cp.sub_flow_stack.push(frame(false, true));
        assert!(cp.has_idempotent_frame());
        assert!(cp.is_timed());
    }

    #[test]
    fn error_state_accumulates() {
        let mut state = ErrorState::Clean;
        assert!(!state.is_errored());

        state.record(FlowError::exception("first"));
        state.record(FlowError::Cancelled);

        match &state {
            ErrorState::Errored {
                errors,
                hospital_visits,
            } => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors.first(), &FlowError::exception("first"));
                assert_eq!(*hospital_visits, 0);
            }
            ErrorState::Clean => panic!("expected errored state"),
        }
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let mut cp = checkpoint();
        cp.flow_state = FlowState::Started {
            io_request: FlowIoRequest::ForceCheckpoint,
            continuation: b"{\"state\":\"x\"}".to_vec(),
        };
        cp.progress_step = Some("signing".into());

        let json = serde_json::to_vec(&cp).unwrap();
        let back: Checkpoint = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, cp);
    }
}
