//! The pure transition function.
//!
//! `transition(ctx, state, event)` maps a flow's state and one event to a new
//! state, an ordered list of side-effect [`Action`]s, and a [`Continuation`]
//! telling the worker what to do next. It performs no I/O, reads no clocks and
//! draws no randomness: identical inputs produce identical outputs, which is
//! what makes replay after a crash deterministic and lets the whole decision
//! layer be tested without mocks.
//!
//! Side-effect ordering rules, checkpoint-skip rules for idempotent frames,
//! session FIFO delivery, and the error taxonomy all live here; everything
//! impure (storage, bus, timers) lives behind the actions.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::action::{Action, RetryPolicy};
use crate::checkpoint::{Checkpoint, FlowState, SubFlowFrame};
use crate::error::{ErrorSeverity, FlowError};
use crate::event::{Event, FlowIoRequest};
use crate::flow::{PeerId, ResumeValue};
use crate::session::{
    DeduplicationId, InitialSessionMessage, SessionEnvelope, SessionId, SessionMessageKind,
    SessionPhase, SessionState,
};

/// Static inputs to a transition, fixed for the duration of one call.
///
/// Threading `now` and the retry policy through as parameters keeps the
/// function pure: the same `(ctx, state, event)` triple always produces the
/// same result.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Wall-clock instant the event is being processed at.
    pub now: OffsetDateTime,
    /// Safe-point retry policy.
    pub retry_policy: RetryPolicy,
    /// Wait-timeout applied to timed flows that did not declare their own.
    pub default_flow_timeout: Duration,
}

/// The in-memory shadow of a flow held by its worker.
///
/// Wraps the checkpoint with per-incarnation bookkeeping that is never
/// persisted: the process sender UUID, the safe-point retry counter, and the
/// acknowledgement backlog of delivered-but-uncommitted inbound messages.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionState {
    /// The checkpoint image this worker is operating on.
    pub checkpoint: Checkpoint,
    /// Sending process incarnation; `None` when the flow was resumed from a
    /// checkpoint on a fresh process, marking its sends possibly-duplicated.
    pub sender_uuid: Option<Uuid>,
    /// Safe-point retries taken by this incarnation.
    pub retry_count: u32,
    /// Deduplication keys of inbound messages delivered to the flow but not
    /// yet acknowledged; flushed at the next persisted suspension.
    pub pending_acks: Vec<String>,
    /// The pending I/O request's sends have been performed by this
    /// incarnation. Reset on resume-from-checkpoint so the request is
    /// re-performed with identical deduplication ids.
    pub io_request_performed: bool,
    /// Sends happened under an idempotent frame since the last checkpoint;
    /// forces a persist when the outermost idempotent frame returns.
    pub idempotent_side_effects: bool,
    /// Wait-timeout declared by user code, overriding the configured default.
    pub flow_timeout: Option<Duration>,
    /// The checkpoint has been removed; the flow is terminal.
    pub is_removed: bool,
}

impl TransitionState {
    /// State for a flow whose events are processed by the process that
    /// created it.
    pub fn new(checkpoint: Checkpoint, sender_uuid: Option<Uuid>) -> Self {
        Self {
            checkpoint,
            sender_uuid,
            retry_count: 0,
            pending_acks: Vec::new(),
            io_request_performed: false,
            idempotent_side_effects: false,
            flow_timeout: None,
            is_removed: false,
        }
    }

    /// State for a flow restored from a persisted checkpoint on a fresh
    /// process. Sends carry a null sender UUID until the next persisted
    /// suspension.
    pub fn resumed_from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self::new(checkpoint, None)
    }
}

/// What the worker does after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Park on the inbox and wait for the next event.
    ProcessEvents,
    /// Hand the value back to user code, which runs until its next yield.
    Resume(ResumeValue),
    /// Raise the error inside user code.
    Throw(FlowError),
    /// Terminate the worker and release its resources.
    Abort,
}

/// The output of one transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// The successor state.
    pub state: TransitionState,
    /// Side effects, applied strictly in order.
    pub actions: Vec<Action>,
    /// What the worker does next.
    pub continuation: Continuation,
}

/// Apply one event to a flow's state.
pub fn transition(
    ctx: &TransitionContext,
    state: &TransitionState,
    event: &Event,
) -> TransitionResult {
    let mut t = Transition {
        ctx,
        state: state.clone(),
        actions: Vec::new(),
    };

    // An errored flow only reacts to retries and further errors.
    if state.checkpoint.error_state.is_errored()
        && !matches!(event, Event::RetryFlowFromSafePoint | Event::Error { .. })
    {
        return t.done(Continuation::ProcessEvents);
    }

    match event {
        Event::DoRemainingWork => t.do_remaining_work(),
        Event::DeliverSessionMessage {
            session_id,
            message,
        } => t.deliver_session_message(*session_id, message),
        Event::Error { error } => t.fail(error.clone()),
        Event::Suspend {
            io_request,
            may_skip_checkpoint,
            continuation,
        } => t.suspend(io_request, *may_skip_checkpoint, continuation.clone()),
        Event::FlowFinish {
            result,
            soft_lock_id,
        } => t.flow_finish(result.clone(), *soft_lock_id),
        Event::EnterSubFlow {
            flow_class,
            version,
            is_idempotent,
            is_timed,
        } => t.enter_sub_flow(SubFlowFrame {
            flow_class: flow_class.clone(),
            version: *version,
            is_idempotent: *is_idempotent,
            is_timed: *is_timed,
        }),
        Event::LeaveSubFlow => t.leave_sub_flow(),
        Event::InitiateFlow { peer } => t.initiate_flow(peer.clone()),
        Event::AsyncOperationCompletion { result } => t.async_completion(result.clone()),
        Event::WakeUpFromSleep => t.wake_up(),
        // The executor short-circuits safe-point retries to reload the
        // persisted image; this arm only restores transaction discipline if
        // one ever reaches the pure function.
        Event::RetryFlowFromSafePoint => {
            t.actions.push(Action::RollbackTransaction);
            t.actions.push(Action::CreateTransaction);
            t.done(Continuation::ProcessEvents)
        }
    }
}

enum ReceiveCheck {
    Ready,
    NotReady,
    Failed(FlowError),
}

struct Transition<'a> {
    ctx: &'a TransitionContext,
    state: TransitionState,
    actions: Vec<Action>,
}

impl Transition<'_> {
    fn done(self, continuation: Continuation) -> TransitionResult {
        TransitionResult {
            state: self.state,
            actions: self.actions,
            continuation,
        }
    }

    // ------------------------------------------------------------------
    // Event handlers
    // ------------------------------------------------------------------

    fn do_remaining_work(mut self) -> TransitionResult {
        match &self.state.checkpoint.flow_state {
            FlowState::Unstarted => {
                self.actions.push(Action::SignalFlowHasStarted);
                self.done(Continuation::Resume(ResumeValue::Start))
            }
            FlowState::Completed { .. } | FlowState::Failed { .. } => {
                self.done(Continuation::ProcessEvents)
            }
            FlowState::Started { io_request, .. } => {
                let io = io_request.clone();

                if !self.state.io_request_performed {
                    // Restored incarnation: re-perform the pending request's
                    // sends. Sequences come from the persisted image, so the
                    // envelopes carry the same deduplication keys as the
                    // originals.
                    let sends = match self.collect_session_sends(&io) {
                        Ok(sends) => sends,
                        Err(e) => return self.fail(e),
                    };
                    self.note_idempotent_side_effects(&sends);
                    push_sends(&mut self.actions, sends);
                    if let FlowIoRequest::Sleep { duration } = &io {
                        self.actions.push(Action::SleepUntil {
                            at: self.ctx.now + *duration,
                        });
                    }
                    if self.state.checkpoint.is_timed() {
                        self.actions.push(Action::ScheduleFlowTimeout {
                            timeout: self.effective_timeout(),
                        });
                    }
                    self.state.io_request_performed = true;
                }

                self.try_resume(&io)
            }
        }
    }

    fn try_resume(mut self, io: &FlowIoRequest) -> TransitionResult {
        match io {
            FlowIoRequest::Send { .. }
            | FlowIoRequest::CloseSessions { .. }
            | FlowIoRequest::ForceCheckpoint => {
                self.done(Continuation::Resume(ResumeValue::Acknowledged))
            }
            FlowIoRequest::Receive { .. } | FlowIoRequest::SendAndReceive { .. } => {
                let awaited = io.awaited_sessions();
                match check_receive(&self.state.checkpoint, &awaited) {
                    ReceiveCheck::Ready => {
                        let payloads = pop_payloads(&mut self.state.checkpoint, &awaited);
                        self.done(Continuation::Resume(ResumeValue::Payloads(payloads)))
                    }
                    ReceiveCheck::NotReady => self.done(Continuation::ProcessEvents),
                    ReceiveCheck::Failed(e) => self.done(Continuation::Throw(e)),
                }
            }
            FlowIoRequest::WaitForSessionConfirmations => {
                let initiating = self
                    .state
                    .checkpoint
                    .sessions
                    .values()
                    .any(|s| matches!(s.phase, SessionPhase::Initiating { .. }));
                if initiating {
                    self.done(Continuation::ProcessEvents)
                } else {
                    self.done(Continuation::Resume(ResumeValue::Acknowledged))
                }
            }
            FlowIoRequest::Sleep { .. }
            | FlowIoRequest::ExecuteAsync { .. }
            | FlowIoRequest::WaitForLedgerCommit { .. } => self.done(Continuation::ProcessEvents),
        }
    }

    fn suspend(
        mut self,
        io: &FlowIoRequest,
        may_skip_checkpoint: bool,
        continuation_blob: Vec<u8>,
    ) -> TransitionResult {
        if let Err(e) = prepare_sessions(&mut self.state.checkpoint, io) {
            return self.fail(e);
        }
        self.state.checkpoint.flow_state = FlowState::Started {
            io_request: io.clone(),
            continuation: continuation_blob,
        };

        let force = matches!(io, FlowIoRequest::ForceCheckpoint);
        let skip =
            (may_skip_checkpoint || self.state.checkpoint.has_idempotent_frame()) && !force;

        let awaited = io.awaited_sessions();
        let bypass = if awaited.is_empty() || force {
            ReceiveCheck::NotReady
        } else {
            check_receive(&self.state.checkpoint, &awaited)
        };

        let persist = !skip && !matches!(bypass, ReceiveCheck::Ready);
        let image = if persist {
            self.state.checkpoint.number_of_suspends += 1;
            // Captured before send sequences advance: replaying from this
            // image re-stamps identical deduplication ids.
            Some(Box::new(self.state.checkpoint.clone()))
        } else {
            None
        };

        let sends = match self.collect_session_sends(io) {
            Ok(sends) => sends,
            Err(e) => return self.fail(e),
        };
        self.note_idempotent_side_effects(&sends);
        self.state.io_request_performed = true;

        if let Some(image) = image {
            self.push_pending_dedup_facts();
            self.actions.push(Action::PersistCheckpoint(image));
        }
        push_sends(&mut self.actions, sends);
        if let FlowIoRequest::Sleep { duration } = io {
            self.actions.push(Action::SleepUntil {
                at: self.ctx.now + *duration,
            });
        }
        self.flush_acknowledgements();
        if persist {
            self.actions.push(Action::CommitTransaction);
            self.actions.push(Action::CreateTransaction);
        }
        if self.state.checkpoint.is_timed() && !matches!(bypass, ReceiveCheck::Ready) {
            self.actions.push(Action::ScheduleFlowTimeout {
                timeout: self.effective_timeout(),
            });
        }

        match bypass {
            ReceiveCheck::Ready => {
                let payloads = pop_payloads(&mut self.state.checkpoint, &awaited);
                self.done(Continuation::Resume(ResumeValue::Payloads(payloads)))
            }
            ReceiveCheck::Failed(e) => self.done(Continuation::Throw(e)),
            ReceiveCheck::NotReady => self.done(Continuation::ProcessEvents),
        }
    }

    fn deliver_session_message(
        mut self,
        session_id: SessionId,
        message: &SessionEnvelope,
    ) -> TransitionResult {
        let dedup_key = DeduplicationId::key_of(&message.deduplication_id);
        let Some(session) = self.state.checkpoint.sessions.get_mut(&session_id) else {
            return self.fail(FlowError::UnexpectedSessionMessage { session_id });
        };

        match message.kind {
            SessionMessageKind::Init => {
                self.fail(FlowError::DuplicateSessionInit { session_id })
            }
            SessionMessageKind::Confirm => {
                let flushed = match &mut session.phase {
                    SessionPhase::Initiating { backlog, .. } => {
                        let Some(peer_session_id) = message.peer_session_id else {
                            return self.fail(FlowError::internal(
                                "session confirmation without a peer session id",
                            ));
                        };
                        let backlog = std::mem::take(backlog);
                        session.phase = SessionPhase::Initiated {
                            peer_session_id,
                            has_seen_end_of_session: false,
                            receive_buffer: Default::default(),
                            last_received_seq: None,
                            pending_error: None,
                        };
                        let mut sends = Vec::with_capacity(backlog.len());
                        for payload in backlog {
                            sends.push(data_envelope(
                                session,
                                payload,
                                self.state.sender_uuid,
                                self.state.retry_count,
                            ));
                        }
                        Some(sends)
                    }
                    // Replayed confirmation: acknowledge and move on.
                    _ => None,
                };
                self.state.pending_acks.push(dedup_key);

                if let Some(sends) = flushed {
                    self.note_idempotent_side_effects(&sends);
                    push_sends(&mut self.actions, sends);
                }

                if matches!(
                    self.state.checkpoint.flow_state.pending_request(),
                    Some(FlowIoRequest::WaitForSessionConfirmations)
                ) {
                    self.try_resume(&FlowIoRequest::WaitForSessionConfirmations)
                } else {
                    self.done(Continuation::ProcessEvents)
                }
            }
            SessionMessageKind::Data => {
                match &mut session.phase {
                    SessionPhase::Initiated {
                        receive_buffer,
                        last_received_seq,
                        ..
                    } => {
                        let expected = last_received_seq.map_or(0, |s| s + 1);
                        if message.sequence_number < expected {
                            // Replay of an already-delivered message.
                            self.state.pending_acks.push(dedup_key);
                            return self.done(Continuation::ProcessEvents);
                        }
                        if message.sequence_number > expected {
                            // Gap: leave unacknowledged so the bus redelivers
                            // the missing prefix first.
                            return self.done(Continuation::ProcessEvents);
                        }
                        receive_buffer.push_back(message.payload.clone());
                        *last_received_seq = Some(message.sequence_number);
                        self.state.pending_acks.push(dedup_key);
                    }
                    _ => {
                        return self.fail(FlowError::UnexpectedSessionMessage { session_id });
                    }
                }
                self.resume_if_receive_satisfied(session_id)
            }
            SessionMessageKind::End => {
                match &mut session.phase {
                    SessionPhase::Initiated {
                        has_seen_end_of_session,
                        ..
                    } => {
                        *has_seen_end_of_session = true;
                        self.state.pending_acks.push(dedup_key);
                    }
                    SessionPhase::Closed => {
                        self.state.pending_acks.push(dedup_key);
                        return self.done(Continuation::ProcessEvents);
                    }
                    _ => {
                        return self.fail(FlowError::UnexpectedSessionMessage { session_id });
                    }
                }
                self.resume_if_receive_satisfied(session_id)
            }
            SessionMessageKind::Reject => {
                let error: FlowError = serde_json::from_slice(&message.payload)
                    .unwrap_or_else(|_| FlowError::internal("counterparty flow errored"));
                self.state.pending_acks.push(dedup_key);

                let parked_on_session = match self.state.checkpoint.flow_state.pending_request() {
                    Some(FlowIoRequest::WaitForSessionConfirmations) => true,
                    Some(io) => io.awaited_sessions().contains(&session_id),
                    None => false,
                };
                if let Some(session) = self.state.checkpoint.sessions.get_mut(&session_id) {
                    if parked_on_session {
                        session.phase = SessionPhase::Closed;
                        return self.done(Continuation::Throw(error));
                    }
                    match &mut session.phase {
                        SessionPhase::Initiated { pending_error, .. } => {
                            *pending_error = Some(error);
                        }
                        phase => *phase = SessionPhase::Closed,
                    }
                }
                self.done(Continuation::ProcessEvents)
            }
        }
    }

    fn resume_if_receive_satisfied(mut self, session_id: SessionId) -> TransitionResult {
        let awaited = match self.state.checkpoint.flow_state.pending_request() {
            Some(io) => io.awaited_sessions(),
            None => return self.done(Continuation::ProcessEvents),
        };
        if !awaited.contains(&session_id) {
            return self.done(Continuation::ProcessEvents);
        }
        match check_receive(&self.state.checkpoint, &awaited) {
            ReceiveCheck::Ready => {
                let payloads = pop_payloads(&mut self.state.checkpoint, &awaited);
                self.done(Continuation::Resume(ResumeValue::Payloads(payloads)))
            }
            ReceiveCheck::NotReady => self.done(Continuation::ProcessEvents),
            ReceiveCheck::Failed(e) => self.done(Continuation::Throw(e)),
        }
    }

    fn enter_sub_flow(mut self, frame: SubFlowFrame) -> TransitionResult {
        let was_skipping = self.state.checkpoint.has_idempotent_frame();
        let entering_idempotent = frame.is_idempotent;
        self.state.checkpoint.sub_flow_stack.push(frame);

        // Crossing from checkpointing into idempotent territory persists
        // first, so the replay-safe region has a safe point right before it.
        if !was_skipping && entering_idempotent {
            self.persist_boundary();
        }
        self.done(Continuation::Resume(ResumeValue::Acknowledged))
    }

    fn leave_sub_flow(mut self) -> TransitionResult {
        if self.state.checkpoint.sub_flow_stack.len() <= 1 {
            return self.fail(FlowError::internal("sub-flow stack underflow"));
        }
        let Some(popped) = self.state.checkpoint.sub_flow_stack.pop() else {
            return self.fail(FlowError::internal("sub-flow stack underflow"));
        };

        if popped.is_idempotent
            && !self.state.checkpoint.has_idempotent_frame()
            && self.state.idempotent_side_effects
        {
            self.state.idempotent_side_effects = false;
            self.persist_boundary();
        }
        self.done(Continuation::Resume(ResumeValue::Acknowledged))
    }

    fn initiate_flow(mut self, peer: PeerId) -> TransitionResult {
        let cp = &mut self.state.checkpoint;
        let Some(root) = cp.root_frame().cloned() else {
            return self.fail(FlowError::internal("flow has no root frame"));
        };
        let ordinal = cp.next_session_ordinal;
        cp.next_session_ordinal += 1;

        let session_id = SessionId::derive(&cp.flow_id, ordinal);
        let seed = if ordinal == 0 {
            cp.flow_id.to_string()
        } else {
            format!("{}-{}", cp.flow_id, ordinal)
        };
        cp.sessions.insert(
            session_id,
            SessionState::uninitiated(session_id, peer, root.flow_class, root.version, seed),
        );
        self.done(Continuation::Resume(ResumeValue::Session(session_id)))
    }

    fn flow_finish(mut self, result: Vec<u8>, soft_lock_id: Option<Uuid>) -> TransitionResult {
        let lock_id = soft_lock_id.or(self.state.checkpoint.soft_lock_id);
        self.state.checkpoint.flow_state = FlowState::Completed { result };

        let ends = self.close_open_sessions();

        self.push_pending_dedup_facts();
        self.actions.push(Action::RemoveCheckpoint);
        self.actions.push(Action::ReleaseSoftLocks { lock_id });
        push_sends(&mut self.actions, ends);
        self.flush_acknowledgements();
        if self.state.checkpoint.is_timed() {
            self.actions.push(Action::CancelFlowTimeout);
        }
        self.actions.push(Action::CommitTransaction);

        self.state.is_removed = true;
        self.done(Continuation::Abort)
    }

    fn async_completion(self, result: Vec<u8>) -> TransitionResult {
        match self.state.checkpoint.flow_state.pending_request() {
            Some(FlowIoRequest::ExecuteAsync { .. })
            | Some(FlowIoRequest::WaitForLedgerCommit { .. }) => {
                self.done(Continuation::Resume(ResumeValue::AsyncResult(result)))
            }
            _ => self.done(Continuation::ProcessEvents),
        }
    }

    fn wake_up(self) -> TransitionResult {
        match self.state.checkpoint.flow_state.pending_request() {
            Some(FlowIoRequest::Sleep { .. }) => {
                self.done(Continuation::Resume(ResumeValue::Acknowledged))
            }
            _ => self.done(Continuation::ProcessEvents),
        }
    }

    /// Classify and react to an error, per the propagation policy.
    fn fail(mut self, error: FlowError) -> TransitionResult {
        match error.severity() {
            ErrorSeverity::Unrecoverable => {
                self.actions.push(Action::HaltProcess);
                self.done(Continuation::Abort)
            }
            ErrorSeverity::Retryable
                if self.ctx.retry_policy.allows(self.state.retry_count + 1) =>
            {
                let backoff = self.ctx.retry_policy.backoff(self.state.retry_count + 1);
                self.actions.push(Action::RollbackTransaction);
                self.actions.push(Action::CreateTransaction);
                self.actions.push(Action::ScheduleEvent {
                    event: Box::new(Event::RetryFlowFromSafePoint),
                    after: Some(backoff),
                });
                self.done(Continuation::ProcessEvents)
            }
            _ => {
                let cp = &mut self.state.checkpoint;
                cp.error_state.record(error.clone());
                if let crate::checkpoint::ErrorState::Errored { hospital_visits, .. } =
                    &mut cp.error_state
                {
                    *hospital_visits += 1;
                }
                // A user-visible failure is terminal; other fatal errors keep
                // the suspended continuation so a hospital-driven retry can
                // resume from it.
                if error.severity() == ErrorSeverity::UserVisible {
                    cp.flow_state = FlowState::Failed {
                        error: error.clone(),
                    };
                }
                cp.number_of_suspends += 1;
                let image = Box::new(cp.clone());

                let rejects = self.reject_open_sessions(&error);

                self.push_pending_dedup_facts();
                self.actions.push(Action::PersistCheckpoint(image));
                self.actions.push(Action::PropagateErrors { sends: rejects });
                self.flush_acknowledgements();
                if self.state.checkpoint.is_timed() {
                    self.actions.push(Action::CancelFlowTimeout);
                }
                self.actions.push(Action::CommitTransaction);
                self.done(Continuation::Abort)
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn effective_timeout(&self) -> Duration {
        self.state
            .flow_timeout
            .unwrap_or(self.ctx.default_flow_timeout)
    }

    fn persist_boundary(&mut self) {
        self.state.checkpoint.number_of_suspends += 1;
        let image = Box::new(self.state.checkpoint.clone());
        self.push_pending_dedup_facts();
        self.actions.push(Action::PersistCheckpoint(image));
        self.flush_acknowledgements();
        self.actions.push(Action::CommitTransaction);
        self.actions.push(Action::CreateTransaction);
    }

    fn push_pending_dedup_facts(&mut self) {
        if !self.state.pending_acks.is_empty() {
            self.actions.push(Action::UpdateDeduplicationId {
                deduplication_ids: self.state.pending_acks.clone(),
            });
        }
    }

    fn flush_acknowledgements(&mut self) {
        if !self.state.pending_acks.is_empty() {
            self.actions.push(Action::AcknowledgeMessages {
                deduplication_ids: std::mem::take(&mut self.state.pending_acks),
            });
        }
    }

    fn note_idempotent_side_effects(&mut self, sends: &[(PeerId, SessionEnvelope)]) {
        if !sends.is_empty() && self.state.checkpoint.has_idempotent_frame() {
            self.state.idempotent_side_effects = true;
        }
    }

    /// Build the outbound envelopes for the given request, advancing session
    /// send sequences on the live checkpoint.
    fn collect_session_sends(
        &mut self,
        io: &FlowIoRequest,
    ) -> Result<Vec<(PeerId, SessionEnvelope)>, FlowError> {
        let sender = self.state.sender_uuid;
        let retry = self.state.retry_count;
        let cp = &mut self.state.checkpoint;
        let mut sends = Vec::new();

        match io {
            FlowIoRequest::Send { sessions } | FlowIoRequest::SendAndReceive { sessions } => {
                for (session_id, payload) in sessions {
                    let session = cp
                        .sessions
                        .get_mut(session_id)
                        .ok_or(FlowError::UnexpectedSessionMessage {
                            session_id: *session_id,
                        })?;
                    match &mut session.phase {
                        SessionPhase::Initiating { .. } if session.next_sending_seq == 0 => {
                            sends.push(init_envelope(
                                session,
                                Some(payload.clone()),
                                sender,
                                retry,
                            )?);
                        }
                        SessionPhase::Initiating { backlog, .. } => {
                            // Confirmation still outstanding; flushed by the
                            // Confirm transition.
                            backlog.push(payload.clone());
                        }
                        SessionPhase::Initiated { .. } => {
                            sends.push(data_envelope(session, payload.clone(), sender, retry));
                        }
                        SessionPhase::Uninitiated | SessionPhase::Closed => {
                            return Err(FlowError::UnexpectedSessionMessage {
                                session_id: *session_id,
                            });
                        }
                    }
                }
            }
            FlowIoRequest::Receive { sessions } => {
                for session_id in sessions {
                    let session = cp
                        .sessions
                        .get_mut(session_id)
                        .ok_or(FlowError::UnexpectedSessionMessage {
                            session_id: *session_id,
                        })?;
                    if matches!(session.phase, SessionPhase::Initiating { .. })
                        && session.next_sending_seq == 0
                    {
                        sends.push(init_envelope(session, None, sender, retry)?);
                    }
                }
            }
            FlowIoRequest::CloseSessions { sessions } => {
                for session_id in sessions {
                    let session = cp
                        .sessions
                        .get_mut(session_id)
                        .ok_or(FlowError::UnexpectedSessionMessage {
                            session_id: *session_id,
                        })?;
                    match &session.phase {
                        SessionPhase::Initiated { .. } => {
                            sends.push(end_envelope(session, sender, retry));
                            session.phase = SessionPhase::Closed;
                        }
                        SessionPhase::Closed => {}
                        // Never confirmed: close locally, the counterparty's
                        // own timeout reaps its half.
                        _ => session.phase = SessionPhase::Closed,
                    }
                }
            }
            _ => {}
        }
        Ok(sends)
    }

    fn close_open_sessions(&mut self) -> Vec<(PeerId, SessionEnvelope)> {
        let sender = self.state.sender_uuid;
        let retry = self.state.retry_count;
        let mut sends = Vec::new();
        for session in self.state.checkpoint.sessions.values_mut() {
            match &session.phase {
                SessionPhase::Initiated { .. } => {
                    sends.push(end_envelope(session, sender, retry));
                    session.phase = SessionPhase::Closed;
                }
                SessionPhase::Closed => {}
                _ => session.phase = SessionPhase::Closed,
            }
        }
        sends
    }

    fn reject_open_sessions(&mut self, error: &FlowError) -> Vec<(PeerId, SessionEnvelope)> {
        let sender = self.state.sender_uuid;
        let retry = self.state.retry_count;
        let visible = error.visible_to_peer();
        let payload = serde_json::to_vec(&visible).unwrap_or_default();

        let mut sends = Vec::new();
        for session in self.state.checkpoint.sessions.values_mut() {
            if let SessionPhase::Initiated {
                peer_session_id, ..
            } = session.phase
            {
                let seq = session.next_sending_seq;
                session.next_sending_seq += 1;
                let dedup = DeduplicationId {
                    sender_uuid: sender,
                    seed: session.deduplication_seed.clone(),
                    sequence: seq,
                    retry,
                };
                sends.push((
                    session.peer.clone(),
                    SessionEnvelope {
                        session_id: peer_session_id,
                        peer_session_id: Some(session.session_id),
                        sequence_number: seq,
                        deduplication_id: dedup.to_string(),
                        kind: SessionMessageKind::Reject,
                        payload: payload.clone(),
                    },
                ));
                session.phase = SessionPhase::Closed;
            }
        }
        sends
    }
}

// ----------------------------------------------------------------------
// Free helpers
// ----------------------------------------------------------------------

/// Convert sessions the request touches out of `Uninitiated`, so the phase
/// change is part of the checkpoint image committed atomically with the
/// initiation send.
fn prepare_sessions(cp: &mut Checkpoint, io: &FlowIoRequest) -> Result<(), FlowError> {
    let mut touched: BTreeSet<SessionId> = io.awaited_sessions();
    if let Some(payloads) = io.outbound_payloads() {
        touched.extend(payloads.keys().copied());
    }

    for session_id in touched {
        let session = cp
            .sessions
            .get_mut(&session_id)
            .ok_or(FlowError::UnexpectedSessionMessage { session_id })?;
        match &session.phase {
            SessionPhase::Closed => {
                return Err(FlowError::UnexpectedSessionMessage { session_id });
            }
            SessionPhase::Uninitiated => {
                let first_payload = io
                    .outbound_payloads()
                    .and_then(|p| p.get(&session_id))
                    .cloned();
                session.phase = SessionPhase::Initiating {
                    first_payload,
                    backlog: Vec::new(),
                };
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_receive(cp: &Checkpoint, awaited: &BTreeSet<SessionId>) -> ReceiveCheck {
    for session_id in awaited {
        let Some(session) = cp.sessions.get(session_id) else {
            return ReceiveCheck::Failed(FlowError::UnexpectedSessionMessage {
                session_id: *session_id,
            });
        };
        match &session.phase {
            SessionPhase::Initiated {
                receive_buffer,
                has_seen_end_of_session,
                pending_error,
                ..
            } => {
                if let Some(error) = pending_error {
                    return ReceiveCheck::Failed(error.clone());
                }
                if receive_buffer.is_empty() {
                    if *has_seen_end_of_session {
                        return ReceiveCheck::Failed(FlowError::UnexpectedEndOfSession {
                            session_id: *session_id,
                        });
                    }
                    return ReceiveCheck::NotReady;
                }
            }
            SessionPhase::Uninitiated | SessionPhase::Initiating { .. } => {
                return ReceiveCheck::NotReady;
            }
            SessionPhase::Closed => {
                return ReceiveCheck::Failed(FlowError::UnexpectedSessionMessage {
                    session_id: *session_id,
                });
            }
        }
    }
    ReceiveCheck::Ready
}

/// Pop one buffered payload per awaited session, preserving per-session FIFO
/// order. Only called after [`check_receive`] returned `Ready`.
fn pop_payloads(
    cp: &mut Checkpoint,
    awaited: &BTreeSet<SessionId>,
) -> BTreeMap<SessionId, Vec<u8>> {
    let mut payloads = BTreeMap::new();
    for session_id in awaited {
        if let Some(session) = cp.sessions.get_mut(session_id) {
            if let SessionPhase::Initiated { receive_buffer, .. } = &mut session.phase {
                if let Some(payload) = receive_buffer.pop_front() {
                    payloads.insert(*session_id, payload);
                }
            }
        }
    }
    payloads
}

fn init_envelope(
    session: &mut SessionState,
    first_payload: Option<Vec<u8>>,
    sender: Option<Uuid>,
    retry: u32,
) -> Result<(PeerId, SessionEnvelope), FlowError> {
    let initial = InitialSessionMessage {
        protocol: session.protocol.clone(),
        protocol_version: session.protocol_version,
        first_payload,
    };
    let payload = serde_json::to_vec(&initial)
        .map_err(|e| FlowError::internal(format!("failed to encode session initiation: {e}")))?;

    let seq = session.next_sending_seq;
    session.next_sending_seq += 1;
    let dedup = DeduplicationId {
        sender_uuid: sender,
        seed: session.deduplication_seed.clone(),
        sequence: seq,
        retry,
    };
    Ok((
        session.peer.clone(),
        SessionEnvelope {
            session_id: session.session_id,
            peer_session_id: None,
            sequence_number: seq,
            deduplication_id: dedup.to_string(),
            kind: SessionMessageKind::Init,
            payload,
        },
    ))
}

fn data_envelope(
    session: &mut SessionState,
    payload: Vec<u8>,
    sender: Option<Uuid>,
    retry: u32,
) -> (PeerId, SessionEnvelope) {
    let peer_session_id = match session.phase {
        SessionPhase::Initiated {
            peer_session_id, ..
        } => peer_session_id,
        // Unreachable by construction; fall back to addressing our own id.
        _ => session.session_id,
    };
    let seq = session.next_sending_seq;
    session.next_sending_seq += 1;
    let dedup = DeduplicationId {
        sender_uuid: sender,
        seed: session.deduplication_seed.clone(),
        sequence: seq,
        retry,
    };
    (
        session.peer.clone(),
        SessionEnvelope {
            session_id: peer_session_id,
            peer_session_id: Some(session.session_id),
            sequence_number: seq,
            deduplication_id: dedup.to_string(),
            kind: SessionMessageKind::Data,
            payload,
        },
    )
}

fn end_envelope(
    session: &mut SessionState,
    sender: Option<Uuid>,
    retry: u32,
) -> (PeerId, SessionEnvelope) {
    let peer_session_id = match session.phase {
        SessionPhase::Initiated {
            peer_session_id, ..
        } => peer_session_id,
        _ => session.session_id,
    };
    let seq = session.next_sending_seq;
    session.next_sending_seq += 1;
    let dedup = DeduplicationId {
        sender_uuid: sender,
        seed: session.deduplication_seed.clone(),
        sequence: seq,
        retry,
    };
    (
        session.peer.clone(),
        SessionEnvelope {
            session_id: peer_session_id,
            peer_session_id: Some(session.session_id),
            sequence_number: seq,
            deduplication_id: dedup.to_string(),
            kind: SessionMessageKind::End,
            payload: Vec::new(),
        },
    )
}

fn push_sends(actions: &mut Vec<Action>, sends: Vec<(PeerId, SessionEnvelope)>) {
    if sends.len() > 1 {
        actions.push(Action::SendMultiple { sends });
    } else if let Some((peer, envelope)) = sends.into_iter().next() {
        if envelope.kind == SessionMessageKind::Init {
            actions.push(Action::SendInitial { peer, envelope });
        } else {
            actions.push(Action::SendExisting { peer, envelope });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ErrorState;
    use crate::flow::{FlowId, InvocationContext};

    fn ctx() -> TransitionContext {
        TransitionContext {
            now: OffsetDateTime::UNIX_EPOCH,
            retry_policy: RetryPolicy::default(),
            default_flow_timeout: Duration::from_secs(30),
        }
    }

    fn root_frame(idempotent: bool, timed: bool) -> SubFlowFrame {
        SubFlowFrame {
            flow_class: "test-flow".into(),
            version: 1,
            is_idempotent: idempotent,
            is_timed: timed,
        }
    }

    fn fresh_state(idempotent: bool) -> TransitionState {
        let flow_id = FlowId::random();
        let cp = Checkpoint::unstarted(
            flow_id,
            InvocationContext::rpc("tester"),
            PeerId::new("alice"),
            root_frame(idempotent, false),
            vec![],
        );
        TransitionState::new(cp, Some(Uuid::new_v4()))
    }

    /// Runs the flow up to owning one uninitiated session towards "bob".
    fn state_with_session(idempotent: bool) -> (TransitionState, SessionId) {
        let state = fresh_state(idempotent);
        let result = transition(
            &ctx(),
            &state,
            &Event::InitiateFlow {
                peer: PeerId::new("bob"),
            },
        );
        let session_id = match &result.continuation {
            Continuation::Resume(ResumeValue::Session(id)) => *id,
            other => panic!("expected session resume, got {other:?}"),
        };
        (result.state, session_id)
    }

    fn confirmed(mut state: TransitionState, session_id: SessionId) -> TransitionState {
        let session = state.checkpoint.sessions.get_mut(&session_id).unwrap();
        session.phase = SessionPhase::Initiated {
            peer_session_id: SessionId::from_raw(7777),
            has_seen_end_of_session: false,
            receive_buffer: Default::default(),
            last_received_seq: None,
            pending_error: None,
        };
        state
    }

    fn suspend_event(io: FlowIoRequest) -> Event {
        Event::Suspend {
            io_request: io,
            may_skip_checkpoint: false,
            continuation: b"blob".to_vec(),
        }
    }

    fn data_message(session: SessionId, seq: u64, payload: &[u8]) -> Event {
        Event::DeliverSessionMessage {
            session_id: session,
            message: SessionEnvelope {
                session_id: session,
                peer_session_id: Some(SessionId::from_raw(7777)),
                sequence_number: seq,
                deduplication_id: format!("peer-seed:{seq}"),
                kind: SessionMessageKind::Data,
                payload: payload.to_vec(),
            },
        }
    }

    #[test]
    fn transition_is_pure() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);
        let event = suspend_event(FlowIoRequest::SendAndReceive {
            sessions: BTreeMap::from([(session_id, b"ping".to_vec())]),
        });

        let first = transition(&ctx(), &state, &event);
        let second = transition(&ctx(), &state, &event);
        assert_eq!(first, second);
    }

    #[test]
    fn unstarted_flow_resumes_with_start() {
        let state = fresh_state(false);
        let result = transition(&ctx(), &state, &Event::DoRemainingWork);

        assert_eq!(result.actions, vec![Action::SignalFlowHasStarted]);
        assert_eq!(
            result.continuation,
            Continuation::Resume(ResumeValue::Start)
        );
    }

    #[test]
    fn first_send_initiates_session_and_persists() {
        let (state, session_id) = state_with_session(false);
        let result = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Send {
                sessions: BTreeMap::from([(session_id, b"ping".to_vec())]),
            }),
        );

        assert_eq!(result.continuation, Continuation::ProcessEvents);
        assert_eq!(result.state.checkpoint.number_of_suspends, 1);

        // Persist first, then the initiation, then the transaction boundary.
        match &result.actions[0] {
            Action::PersistCheckpoint(image) => {
                assert_eq!(image.number_of_suspends, 1);
                // The image carries the pre-send sequence so replay re-stamps
                // the same deduplication id.
                assert_eq!(image.sessions[&session_id].next_sending_seq, 0);
                assert!(matches!(
                    image.sessions[&session_id].phase,
                    SessionPhase::Initiating { .. }
                ));
            }
            other => panic!("expected persist first, got {other:?}"),
        }
        match &result.actions[1] {
            Action::SendInitial { peer, envelope } => {
                assert_eq!(peer, &PeerId::new("bob"));
                assert_eq!(envelope.kind, SessionMessageKind::Init);
                assert_eq!(envelope.sequence_number, 0);
                let initial: InitialSessionMessage =
                    serde_json::from_slice(&envelope.payload).unwrap();
                assert_eq!(initial.first_payload, Some(b"ping".to_vec()));
                assert_eq!(initial.protocol, "test-flow");
            }
            other => panic!("expected initiation send, got {other:?}"),
        }
        assert_eq!(result.actions[2], Action::CommitTransaction);
        assert_eq!(result.actions[3], Action::CreateTransaction);

        // Live state advanced past the sent sequence.
        assert_eq!(
            result.state.checkpoint.sessions[&session_id].next_sending_seq,
            1
        );
    }

    #[test]
    fn idempotent_frame_skips_checkpoint() {
        let (state, session_id) = state_with_session(true);
        let state = confirmed(state, session_id);
        let result = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Send {
                sessions: BTreeMap::from([(session_id, b"ping".to_vec())]),
            }),
        );

        assert!(
            !result
                .actions
                .iter()
                .any(|a| matches!(a, Action::PersistCheckpoint(_))),
            "idempotent suspension must not persist: {:?}",
            result.actions
        );
        assert_eq!(result.state.checkpoint.number_of_suspends, 0);
        assert!(result.state.idempotent_side_effects);
    }

    #[test]
    fn force_checkpoint_overrides_idempotent_skip() {
        let (state, _) = state_with_session(true);
        let result = transition(&ctx(), &state, &suspend_event(FlowIoRequest::ForceCheckpoint));

        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint(_))));
        assert_eq!(result.state.checkpoint.number_of_suspends, 1);
    }

    #[test]
    fn receive_bypasses_suspension_when_buffered() {
        let (state, session_id) = state_with_session(false);
        let mut state = confirmed(state, session_id);
        if let SessionPhase::Initiated {
            receive_buffer,
            last_received_seq,
            ..
        } = &mut state
            .checkpoint
            .sessions
            .get_mut(&session_id)
            .unwrap()
            .phase
        {
            receive_buffer.push_back(b"pong".to_vec());
            *last_received_seq = Some(0);
        }

        let result = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Receive {
                sessions: BTreeSet::from([session_id]),
            }),
        );

        assert_eq!(
            result.continuation,
            Continuation::Resume(ResumeValue::Payloads(BTreeMap::from([(
                session_id,
                b"pong".to_vec()
            )])))
        );
        assert!(
            !result
                .actions
                .iter()
                .any(|a| matches!(a, Action::PersistCheckpoint(_))),
            "bypassed receive must not checkpoint"
        );
    }

    #[test]
    fn multi_session_receive_resumes_only_when_all_ready() {
        let (state, first) = state_with_session(false);
        let result = transition(
            &ctx(),
            &state,
            &Event::InitiateFlow {
                peer: PeerId::new("carol"),
            },
        );
        let second = match &result.continuation {
            Continuation::Resume(ResumeValue::Session(id)) => *id,
            other => panic!("expected session resume, got {other:?}"),
        };
        let state = confirmed(confirmed(result.state, first), second);

        // Park on both sessions.
        let parked = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Receive {
                sessions: BTreeSet::from([first, second]),
            }),
        );
        assert_eq!(parked.continuation, Continuation::ProcessEvents);

        // First message: still parked.
        let one = transition(&ctx(), &parked.state, &data_message(first, 0, b"m1"));
        assert_eq!(one.continuation, Continuation::ProcessEvents);

        // Second message: resumes with both payloads.
        let two = transition(&ctx(), &one.state, &data_message(second, 0, b"m2"));
        assert_eq!(
            two.continuation,
            Continuation::Resume(ResumeValue::Payloads(BTreeMap::from([
                (first, b"m1".to_vec()),
                (second, b"m2".to_vec()),
            ])))
        );
    }

    #[test]
    fn per_session_fifo_is_preserved_and_replays_dropped() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);

        let a = transition(&ctx(), &state, &data_message(session_id, 0, b"a"));
        let b = transition(&ctx(), &a.state, &data_message(session_id, 1, b"b"));
        // Replay of seq 0 is dropped but re-acknowledged.
        let replay = transition(&ctx(), &b.state, &data_message(session_id, 0, b"a"));

        let session = &replay.state.checkpoint.sessions[&session_id];
        match &session.phase {
            SessionPhase::Initiated { receive_buffer, .. } => {
                let buffered: Vec<_> = receive_buffer.iter().cloned().collect();
                assert_eq!(buffered, vec![b"a".to_vec(), b"b".to_vec()]);
            }
            other => panic!("unexpected phase {other:?}"),
        }
        assert_eq!(replay.state.pending_acks.len(), 3);
    }

    #[test]
    fn entering_idempotent_sub_flow_persists_first() {
        let state = fresh_state(false);
        let result = transition(
            &ctx(),
            &state,
            &Event::EnterSubFlow {
                flow_class: "child".into(),
                version: 1,
                is_idempotent: true,
                is_timed: false,
            },
        );

        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint(_))));
        assert_eq!(
            result.continuation,
            Continuation::Resume(ResumeValue::Acknowledged)
        );
        assert_eq!(result.state.checkpoint.sub_flow_stack.len(), 2);
    }

    #[test]
    fn leaving_idempotent_sub_flow_persists_when_it_sent() {
        let state = fresh_state(false);
        let entered = transition(
            &ctx(),
            &state,
            &Event::EnterSubFlow {
                flow_class: "child".into(),
                version: 1,
                is_idempotent: true,
                is_timed: false,
            },
        );

        // No side effects inside the child: leaving does not persist.
        let left_clean = transition(&ctx(), &entered.state, &Event::LeaveSubFlow);
        assert!(!left_clean
            .actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint(_))));

        // With side effects recorded, leaving persists.
        let mut dirty = entered.state.clone();
        dirty.idempotent_side_effects = true;
        let left_dirty = transition(&ctx(), &dirty, &Event::LeaveSubFlow);
        assert!(left_dirty
            .actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint(_))));
        assert!(!left_dirty.state.idempotent_side_effects);
    }

    #[test]
    fn finish_removes_checkpoint_and_ends_sessions() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);

        let result = transition(
            &ctx(),
            &state,
            &Event::FlowFinish {
                result: b"done".to_vec(),
                soft_lock_id: None,
            },
        );

        assert_eq!(result.continuation, Continuation::Abort);
        assert!(result.state.is_removed);
        assert_eq!(result.actions[0], Action::RemoveCheckpoint);
        assert!(matches!(
            result.actions[1],
            Action::ReleaseSoftLocks { lock_id: None }
        ));
        match &result.actions[2] {
            Action::SendExisting { envelope, .. } => {
                assert_eq!(envelope.kind, SessionMessageKind::End);
            }
            other => panic!("expected end-of-session send, got {other:?}"),
        }
        assert_eq!(*result.actions.last().unwrap(), Action::CommitTransaction);
    }

    #[test]
    fn reject_throws_into_parked_flow() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);
        let parked = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Receive {
                sessions: BTreeSet::from([session_id]),
            }),
        );

        let rejection = FlowError::exception("NotAuthorised");
        let result = transition(
            &ctx(),
            &parked.state,
            &Event::DeliverSessionMessage {
                session_id,
                message: SessionEnvelope {
                    session_id,
                    peer_session_id: Some(SessionId::from_raw(7777)),
                    sequence_number: 0,
                    deduplication_id: "peer-seed:0".into(),
                    kind: SessionMessageKind::Reject,
                    payload: serde_json::to_vec(&rejection).unwrap(),
                },
            },
        );

        assert_eq!(result.continuation, Continuation::Throw(rejection));
    }

    #[test]
    fn end_of_session_fails_pending_receive() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);
        let parked = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::Receive {
                sessions: BTreeSet::from([session_id]),
            }),
        );

        let result = transition(
            &ctx(),
            &parked.state,
            &Event::DeliverSessionMessage {
                session_id,
                message: SessionEnvelope {
                    session_id,
                    peer_session_id: Some(SessionId::from_raw(7777)),
                    sequence_number: 0,
                    deduplication_id: "peer-seed:0".into(),
                    kind: SessionMessageKind::End,
                    payload: vec![],
                },
            },
        );

        assert_eq!(
            result.continuation,
            Continuation::Throw(FlowError::UnexpectedEndOfSession { session_id })
        );
    }

    #[test]
    fn unknown_session_message_errors_the_flow() {
        let state = fresh_state(false);
        let bogus = SessionId::from_raw(999);
        let result = transition(&ctx(), &state, &data_message(bogus, 0, b"x"));

        assert_eq!(result.continuation, Continuation::Abort);
        assert!(result.state.checkpoint.error_state.is_errored());
        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, Action::PersistCheckpoint(_))));
        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, Action::PropagateErrors { .. })));
    }

    #[test]
    fn retryable_error_schedules_safe_point_retry() {
        let state = fresh_state(false);
        let result = transition(
            &ctx(),
            &state,
            &Event::Error {
                error: FlowError::Retryable {
                    message: "db deadlock".into(),
                },
            },
        );

        assert_eq!(result.continuation, Continuation::ProcessEvents);
        assert_eq!(result.actions[0], Action::RollbackTransaction);
        assert_eq!(result.actions[1], Action::CreateTransaction);
        assert!(matches!(
            &result.actions[2],
            Action::ScheduleEvent { event, after: Some(_) }
                if matches!(**event, Event::RetryFlowFromSafePoint)
        ));
        assert!(!result.state.checkpoint.error_state.is_errored());
    }

    #[test]
    fn unrecoverable_error_halts_the_process() {
        let state = fresh_state(false);
        let result = transition(
            &ctx(),
            &state,
            &Event::Error {
                error: FlowError::Unrecoverable {
                    message: "metaspace".into(),
                },
            },
        );

        assert_eq!(result.actions, vec![Action::HaltProcess]);
        assert_eq!(result.continuation, Continuation::Abort);
    }

    #[test]
    fn errored_flow_ignores_ordinary_events() {
        let mut state = fresh_state(false);
        state.checkpoint.error_state = ErrorState::Errored {
            errors: nonempty::NonEmpty::new(FlowError::exception("boom")),
            hospital_visits: 1,
        };

        let result = transition(&ctx(), &state, &Event::DoRemainingWork);
        assert_eq!(result.continuation, Continuation::ProcessEvents);
        assert!(result.actions.is_empty());
    }

    #[test]
    fn timed_flow_arms_timeout_on_suspend() {
        let flow_id = FlowId::random();
        let cp = Checkpoint::unstarted(
            flow_id,
            InvocationContext::rpc("tester"),
            PeerId::new("alice"),
            root_frame(false, true),
            vec![],
        );
        let mut state = TransitionState::new(cp, Some(Uuid::new_v4()));
        state.flow_timeout = Some(Duration::from_secs(30));

        let init = transition(
            &ctx(),
            &state,
            &Event::InitiateFlow {
                peer: PeerId::new("notary"),
            },
        );
        let session_id = match init.continuation {
            Continuation::Resume(ResumeValue::Session(id)) => id,
            other => panic!("expected session resume, got {other:?}"),
        };

        let result = transition(
            &ctx(),
            &init.state,
            &suspend_event(FlowIoRequest::SendAndReceive {
                sessions: BTreeMap::from([(session_id, b"notarise".to_vec())]),
            }),
        );

        assert!(result.actions.iter().any(|a| matches!(
            a,
            Action::ScheduleFlowTimeout { timeout } if *timeout == Duration::from_secs(30)
        )));
    }

    #[test]
    fn close_sessions_sends_end_and_closes() {
        let (state, session_id) = state_with_session(false);
        let state = confirmed(state, session_id);

        let closed = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::CloseSessions {
                sessions: BTreeSet::from([session_id]),
            }),
        );

        let sent_end = closed.actions.iter().any(|a| {
            matches!(a, Action::SendExisting { envelope, .. } if envelope.kind == SessionMessageKind::End)
        });
        assert!(sent_end, "{:?}", closed.actions);
        assert_eq!(
            closed.state.checkpoint.sessions[&session_id].phase,
            SessionPhase::Closed
        );

        // The close parks once; the follow-up work event resumes it.
        assert_eq!(closed.continuation, Continuation::ProcessEvents);
        let resumed = transition(&ctx(), &closed.state, &Event::DoRemainingWork);
        assert_eq!(
            resumed.continuation,
            Continuation::Resume(ResumeValue::Acknowledged)
        );
    }

    #[test]
    fn ledger_commit_wait_resumes_on_async_completion() {
        let state = fresh_state(false);
        let parked = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::WaitForLedgerCommit {
                tx_id: "tx-123".into(),
            }),
        );
        assert_eq!(parked.continuation, Continuation::ProcessEvents);

        let resumed = transition(
            &ctx(),
            &parked.state,
            &Event::AsyncOperationCompletion {
                result: b"tx-123".to_vec(),
            },
        );
        assert_eq!(
            resumed.continuation,
            Continuation::Resume(ResumeValue::AsyncResult(b"tx-123".to_vec()))
        );
    }

    #[test]
    fn resend_after_restore_reuses_sequences_with_retry_marker() {
        let (state, session_id) = state_with_session(false);
        let suspended = transition(
            &ctx(),
            &state,
            &suspend_event(FlowIoRequest::SendAndReceive {
                sessions: BTreeMap::from([(session_id, b"ping".to_vec())]),
            }),
        );
        let first_envelope = suspended
            .actions
            .iter()
            .find_map(|a| match a {
                Action::SendInitial { envelope, .. } => Some(envelope.clone()),
                _ => None,
            })
            .expect("initial send");

        // Simulate a safe-point restore: persisted image + reset incarnation.
        let image = suspended
            .actions
            .iter()
            .find_map(|a| match a {
                Action::PersistCheckpoint(image) => Some((**image).clone()),
                _ => None,
            })
            .expect("persisted image");
        let mut restored = TransitionState::resumed_from_checkpoint(image);
        restored.retry_count = 1;

        let retried = transition(&ctx(), &restored, &Event::DoRemainingWork);
        let second_envelope = retried
            .actions
            .iter()
            .find_map(|a| match a {
                Action::SendInitial { envelope, .. } => Some(envelope.clone()),
                _ => None,
            })
            .expect("re-sent initiation");

        let first = DeduplicationId::parse(&first_envelope.deduplication_id).unwrap();
        let second = DeduplicationId::parse(&second_envelope.deduplication_id).unwrap();
        assert_eq!(second.seed, first.seed);
        assert_eq!(second.sequence, first.sequence);
        assert_eq!(second.retry, 1);
        assert_eq!(second.sender_uuid, None);
    }
}
