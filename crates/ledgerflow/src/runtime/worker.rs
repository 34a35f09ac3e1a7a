//! Per-flow worker: owns the event loop and the user state machine.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use super::manager::{FlowOutcome, ManagerShared};
use super::registry::FlowRegistry;
use crate::checkpoint::{ErrorState, FlowState};
use crate::error::{Error, FlowError, Result};
use crate::event::Event;
use crate::executor::TransitionExecutor;
use crate::flow::{FlowContext, FlowId, FlowYield, ResumeValue, RunnableFlow};
use crate::hospital::Hospital;
use crate::store::{CheckpointStore, StoreTransaction};
use crate::transition::{Continuation, TransitionState};

enum WorkerStep {
    Running,
    Terminated,
}

/// One worker per live flow.
///
/// The worker is the only place a flow's events are processed: it pulls from
/// a FIFO inbox, drives each event through the transition executor, and runs
/// user code between `Resume` and the next yield — all on one task, so a
/// single flow is strictly single-threaded while the pool multiplexes many
/// workers.
///
/// Between two suspension points the worker holds exactly one open store
/// transaction in `tx`; suspension-boundary actions move it.
pub(crate) struct FlowWorker<S: CheckpointStore> {
    flow_id: FlowId,
    state: TransitionState,
    logic: Option<Box<dyn RunnableFlow>>,
    ctx: FlowContext,
    executor: TransitionExecutor<S>,
    tx: Option<S::Tx>,
    inbox: mpsc::Receiver<Event>,
    shutdown: watch::Receiver<bool>,
    registry: Arc<FlowRegistry>,
    shared: Arc<ManagerShared>,
    hospital: Arc<dyn Hospital>,
    hospitalized: bool,
}

impl<S: CheckpointStore> FlowWorker<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: TransitionState,
        ctx: FlowContext,
        executor: TransitionExecutor<S>,
        inbox: mpsc::Receiver<Event>,
        shutdown: watch::Receiver<bool>,
        registry: Arc<FlowRegistry>,
        shared: Arc<ManagerShared>,
        hospital: Arc<dyn Hospital>,
    ) -> Self {
        let hospitalized = state.checkpoint.error_state.is_errored();
        Self {
            flow_id: state.checkpoint.flow_id,
            state,
            logic: None,
            ctx,
            executor,
            tx: None,
            inbox,
            shutdown,
            registry,
            shared,
            hospital,
            hospitalized,
        }
    }

    /// Run until the flow terminates or shutdown is signalled.
    pub(crate) async fn run(mut self) {
        debug!(flow_id = %self.flow_id, "Flow worker started");

        let mut terminal = false;
        loop {
            tokio::select! {
                maybe_event = self.inbox.recv() => match maybe_event {
                    Some(event) => match self.handle(event).await {
                        Ok(WorkerStep::Running) => {}
                        Ok(WorkerStep::Terminated) => {
                            terminal = true;
                            break;
                        }
                        Err(e) => {
                            error!(
                                flow_id = %self.flow_id,
                                error = %e,
                                "Unrecoverable failure, worker stopping"
                            );
                            terminal = true;
                            break;
                        }
                    },
                    None => break,
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        debug!(flow_id = %self.flow_id, "Flow worker shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(open) = self.tx.take() {
            let _ = open.rollback().await;
        }

        if terminal {
            let outcome = self.outcome();
            match &outcome {
                Ok(_) => {
                    if self.hospitalized {
                        self.hospital.discharge(self.flow_id).await;
                    }
                }
                Err(reason) => {
                    if self.state.checkpoint.error_state.is_errored()
                        && !matches!(reason, FlowError::Cancelled)
                    {
                        self.hospital
                            .admit(self.flow_id, reason.clone(), self.state.checkpoint.view())
                            .await;
                    }
                }
            }
            self.shared.finish_worker(self.flow_id, Some(outcome));
        } else {
            self.shared.finish_worker(self.flow_id, None);
        }
        debug!(flow_id = %self.flow_id, terminal, "Flow worker stopped");
    }

    /// Process one inbox event to quiescence.
    ///
    /// Suspensions, sub-flow boundaries, and the events they trigger are
    /// handled synchronously in this loop — user code and its transitions
    /// run back-to-back on this task until the flow parks or aborts.
    async fn handle(&mut self, mut event: Event) -> Result<WorkerStep> {
        loop {
            if matches!(event, Event::RetryFlowFromSafePoint)
                && self.state.checkpoint.error_state.is_errored()
            {
                self.hospitalized = true;
            }

            let continuation = match self
                .executor
                .execute(&mut self.state, &event, &mut self.tx)
                .await
            {
                Ok(continuation) => continuation,
                Err(Error::HaltRequested) => return Err(Error::HaltRequested),
                Err(e) => {
                    error!(flow_id = %self.flow_id, error = %e, "Transition execution failed");
                    self.state.checkpoint.error_state.record(FlowError::from(e));
                    return Ok(WorkerStep::Terminated);
                }
            };

            if matches!(event, Event::RetryFlowFromSafePoint) {
                // State was reloaded from the persisted image; the user state
                // machine must be rebuilt from the restored continuation.
                self.logic = None;
                self.ctx = FlowContext::new(
                    self.flow_id,
                    self.ctx.our_identity.clone(),
                    self.state.checkpoint.invocation_context.clone(),
                    self.ctx.initial_session,
                );
                event = Event::DoRemainingWork;
                continue;
            }

            match continuation {
                Continuation::ProcessEvents => {
                    if matches!(event, Event::Suspend { .. }) {
                        // The suspension's sends are done; check immediately
                        // whether the request can already resume.
                        event = Event::DoRemainingWork;
                        continue;
                    }
                    return Ok(WorkerStep::Running);
                }
                Continuation::Resume(value) => {
                    event = self.drive(value);
                }
                Continuation::Throw(error) => {
                    event = self.drive(ResumeValue::Failed(error));
                }
                Continuation::Abort => return Ok(WorkerStep::Terminated),
            }
        }
    }

    /// Run user code from its previous pause point to the next yield and map
    /// the yield to an event.
    fn drive(&mut self, resume: ResumeValue) -> Event {
        if self.logic.is_none() {
            match self.registry.rebuild(&self.state.checkpoint) {
                Ok(logic) => self.logic = Some(logic),
                Err(e) => {
                    return Event::Error {
                        error: FlowError::from(e),
                    }
                }
            }
        }

        let advanced = {
            let Some(logic) = self.logic.as_mut() else {
                return Event::Error {
                    error: FlowError::internal("flow logic missing after rebuild"),
                };
            };
            logic.advance(&mut self.ctx, resume)
        };

        // Fold context side-channels into the transient state.
        if let Some(step) = self.ctx.progress() {
            self.state.checkpoint.progress_step = Some(step.to_owned());
        }
        if let Some(timeout) = self.ctx.timeout_override() {
            self.state.flow_timeout = Some(timeout);
        }
        if let Some(lock_id) = self.ctx.soft_lock_id() {
            self.state.checkpoint.soft_lock_id.get_or_insert(lock_id);
        }

        match advanced {
            Ok(FlowYield::Io {
                request,
                may_skip_checkpoint,
            }) => {
                let continuation = match self.logic.as_ref().map(|l| l.encode()) {
                    Some(Ok(blob)) => blob,
                    Some(Err(e)) => {
                        return Event::Error {
                            error: FlowError::from(e),
                        }
                    }
                    None => {
                        return Event::Error {
                            error: FlowError::internal("flow logic missing at suspension"),
                        }
                    }
                };
                Event::Suspend {
                    io_request: request,
                    may_skip_checkpoint,
                    continuation,
                }
            }
            Ok(FlowYield::EnterSubFlow {
                flow_class,
                version,
                is_idempotent,
                is_timed,
            }) => Event::EnterSubFlow {
                flow_class,
                version,
                is_idempotent,
                is_timed,
            },
            Ok(FlowYield::LeaveSubFlow) => Event::LeaveSubFlow,
            Ok(FlowYield::InitiateSession { peer }) => Event::InitiateFlow { peer },
            Ok(FlowYield::Finish(result)) => Event::FlowFinish {
                result,
                soft_lock_id: self.ctx.soft_lock_id(),
            },
            Err(error) => Event::Error { error },
        }
    }

    fn outcome(&self) -> FlowOutcome {
        match (&self.state.checkpoint.flow_state, &self.state.checkpoint.error_state) {
            (FlowState::Completed { result }, ErrorState::Clean) => Ok(result.clone()),
            (FlowState::Failed { error }, _) => Err(error.clone()),
            (_, ErrorState::Errored { errors, .. }) => Err(errors.last().clone()),
            _ => Err(FlowError::internal("flow aborted without a result")),
        }
    }
}
