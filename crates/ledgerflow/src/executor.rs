//! Transition execution with store-transaction discipline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::action::executor::ActionExecutor;
use crate::action::RetryPolicy;
use crate::clock::Clock;
use crate::codec::CheckpointCodec;
use crate::error::{Error, FlowError, Result};
use crate::event::Event;
use crate::store::{CheckpointStore, StoreTransaction};
use crate::transition::{
    transition, Continuation, TransitionContext, TransitionResult, TransitionState,
};

/// The inner transition function as seen by an interceptor.
pub type TransitionFn<'a> =
    &'a dyn Fn(&TransitionContext, &TransitionState, &Event) -> TransitionResult;

/// Wraps the pure transition function.
///
/// Interceptors stack: each sees the same inputs as the function it wraps and
/// must preserve its transaction contract — the actions it returns must leave
/// the transaction in the same open/closed state the wrapped transition's
/// would have.
pub trait TransitionInterceptor: Send + Sync + 'static {
    /// Run the transition, delegating to `next` for the wrapped layer.
    fn intercept(
        &self,
        ctx: &TransitionContext,
        state: &TransitionState,
        event: &Event,
        next: TransitionFn<'_>,
    ) -> TransitionResult;
}

/// Logs every transition at debug level.
pub struct LoggingInterceptor;

impl TransitionInterceptor for LoggingInterceptor {
    fn intercept(
        &self,
        ctx: &TransitionContext,
        state: &TransitionState,
        event: &Event,
        next: TransitionFn<'_>,
    ) -> TransitionResult {
        let result = next(ctx, state, event);
        debug!(
            flow_id = %state.checkpoint.flow_id,
            event = event_name(event),
            actions = result.actions.len(),
            continuation = continuation_name(&result.continuation),
            "Transition"
        );
        result
    }
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::DoRemainingWork => "DoRemainingWork",
        Event::DeliverSessionMessage { .. } => "DeliverSessionMessage",
        Event::Error { .. } => "Error",
        Event::Suspend { .. } => "Suspend",
        Event::FlowFinish { .. } => "FlowFinish",
        Event::EnterSubFlow { .. } => "EnterSubFlow",
        Event::LeaveSubFlow => "LeaveSubFlow",
        Event::InitiateFlow { .. } => "InitiateFlow",
        Event::AsyncOperationCompletion { .. } => "AsyncOperationCompletion",
        Event::WakeUpFromSleep => "WakeUpFromSleep",
        Event::RetryFlowFromSafePoint => "RetryFlowFromSafePoint",
    }
}

fn continuation_name(continuation: &Continuation) -> &'static str {
    match continuation {
        Continuation::ProcessEvents => "ProcessEvents",
        Continuation::Resume(_) => "Resume",
        Continuation::Throw(_) => "Throw",
        Continuation::Abort => "Abort",
    }
}

/// Drives one event through the pure transition and its actions, enforcing
/// the transaction discipline:
///
/// 1. A transaction is open on entry to every transition.
/// 2. `CommitTransaction`/`CreateTransaction` actions move the suspension
///    boundary.
/// 3. A failure during action execution rolls back; transient failures
///    schedule a safe-point retry, permanent ones re-enter the transition as
///    an error event.
pub(crate) struct TransitionExecutor<S: CheckpointStore> {
    pub store: S,
    pub codec: Arc<dyn CheckpointCodec>,
    pub clock: Arc<dyn Clock>,
    pub retry_policy: RetryPolicy,
    pub default_flow_timeout: Duration,
    pub interceptors: Vec<Arc<dyn TransitionInterceptor>>,
    pub actions: ActionExecutor<S>,
}

impl<S: CheckpointStore> TransitionExecutor<S> {
    pub async fn execute(
        &self,
        state: &mut TransitionState,
        event: &Event,
        tx: &mut Option<S::Tx>,
    ) -> Result<Continuation> {
        // Safe-point retries reload persisted state instead of running the
        // pure function; everything impure about them lives here.
        if matches!(event, Event::RetryFlowFromSafePoint) {
            return self.retry_from_safe_point(state, tx).await;
        }

        if tx.is_none() {
            *tx = Some(self.store.begin().await?);
        }

        let ctx = self.transition_context();
        let result = self.run_transition(&ctx, state, event);

        match self.apply_all(&result, tx).await {
            Ok(()) => {
                *state = result.state;
                Ok(result.continuation)
            }
            Err(Error::HaltRequested) => Err(Error::HaltRequested),
            Err(e) if e.is_transient() => {
                warn!(
                    flow_id = %state.checkpoint.flow_id,
                    error = %e,
                    "Transient failure applying actions, scheduling safe-point retry"
                );
                self.rollback(tx).await;
                let backoff = self.retry_policy.backoff(state.retry_count + 1);
                self.actions.handle.enqueue(
                    state.checkpoint.flow_id,
                    Event::RetryFlowFromSafePoint,
                    Some(backoff),
                );
                Ok(Continuation::ProcessEvents)
            }
            Err(e) => {
                error!(
                    flow_id = %state.checkpoint.flow_id,
                    error = %e,
                    "Permanent failure applying actions"
                );
                self.rollback(tx).await;
                *tx = Some(self.store.begin().await?);

                // Convert to an error event and re-enter the transition once;
                // its own failure path decides errored-state and propagation.
                let error_event = Event::Error {
                    error: FlowError::from(e),
                };
                let ctx = self.transition_context();
                let result = self.run_transition(&ctx, state, &error_event);
                match self.apply_all(&result, tx).await {
                    Ok(()) => {
                        *state = result.state;
                        Ok(result.continuation)
                    }
                    Err(second) => {
                        error!(
                            flow_id = %state.checkpoint.flow_id,
                            error = %second,
                            "Failed to record flow error, aborting worker"
                        );
                        self.rollback(tx).await;
                        state
                            .checkpoint
                            .error_state
                            .record(FlowError::from(second));
                        Ok(Continuation::Abort)
                    }
                }
            }
        }
    }

    fn transition_context(&self) -> TransitionContext {
        TransitionContext {
            now: self.clock.now(),
            retry_policy: self.retry_policy.clone(),
            default_flow_timeout: self.default_flow_timeout,
        }
    }

    fn run_transition(
        &self,
        ctx: &TransitionContext,
        state: &TransitionState,
        event: &Event,
    ) -> TransitionResult {
        fn call(
            interceptors: &[Arc<dyn TransitionInterceptor>],
            ctx: &TransitionContext,
            state: &TransitionState,
            event: &Event,
        ) -> TransitionResult {
            match interceptors.split_first() {
                None => transition(ctx, state, event),
                Some((head, rest)) => {
                    head.intercept(ctx, state, event, &|c, s, e| call(rest, c, s, e))
                }
            }
        }
        call(&self.interceptors, ctx, state, event)
    }

    async fn apply_all(&self, result: &TransitionResult, tx: &mut Option<S::Tx>) -> Result<()> {
        for action in &result.actions {
            self.actions.apply(action.clone(), tx).await?;
        }
        Ok(())
    }

    async fn rollback(&self, tx: &mut Option<S::Tx>) {
        if let Some(open) = tx.take() {
            if let Err(e) = open.rollback().await {
                warn!(error = %e, "Rollback failed");
            }
        }
    }

    /// Discard in-memory progress and reload the last persisted checkpoint.
    ///
    /// The restored incarnation keeps its sender UUID (same process) but
    /// bumps the retry counter, so re-performed sends carry the incremented
    /// retry marker in their deduplication ids. The worker rebuilds the user
    /// state machine from the restored continuation afterwards.
    async fn retry_from_safe_point(
        &self,
        state: &mut TransitionState,
        tx: &mut Option<S::Tx>,
    ) -> Result<Continuation> {
        let flow_id = state.checkpoint.flow_id;
        self.rollback(tx).await;

        let mut fresh = self.store.begin().await?;
        let Some(blob) = fresh.get(flow_id).await? else {
            // Nothing persisted to restore; the flow is already terminal.
            return Err(Error::UnknownFlow(flow_id));
        };
        let mut checkpoint = self.codec.decode(&blob)?;
        // A retried flow gets a clean error slate; the hospital tracks its
        // history.
        checkpoint.error_state = crate::checkpoint::ErrorState::Clean;

        let retry_count = state.retry_count + 1;
        debug!(flow_id = %flow_id, retry = retry_count, "Restored flow from safe point");

        *state = TransitionState {
            checkpoint,
            sender_uuid: state.sender_uuid,
            retry_count,
            pending_acks: Vec::new(),
            io_request_performed: false,
            idempotent_side_effects: false,
            flow_timeout: state.flow_timeout,
            is_removed: false,
        };
        *tx = Some(fresh);
        Ok(Continuation::ProcessEvents)
    }
}
