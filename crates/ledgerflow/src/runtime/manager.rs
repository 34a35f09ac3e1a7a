//! Flow manager: lifecycle, routing, and the observable surface of the
//! runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::registry::FlowRegistry;
use super::worker::FlowWorker;
use crate::action::executor::ActionExecutor;
use crate::bus::{InMemoryBus, MessageBus};
use crate::checkpoint::{Checkpoint, CheckpointView, SubFlowFrame};
use crate::clock::{Clock, SystemClock};
use crate::codec::{CheckpointCodec, JsonCheckpointCodec};
use crate::error::{Error, FlowError, Result};
use crate::event::Event;
use crate::executor::{TransitionExecutor, TransitionInterceptor};
use crate::flow::{FlowContext, FlowId, FlowLogic, InvocationContext, InvocationOrigin, PeerId};
use crate::hospital::{Hospital, RecordingHospital};
use crate::session::{
    DeduplicationId, InitialSessionMessage, SessionEnvelope, SessionId, SessionMessageKind,
    SessionState,
};
use crate::store::{CheckpointStore, StoreTransaction};
use crate::transition::TransitionState;

/// The result a finished flow hands to its completion future.
pub type FlowOutcome = std::result::Result<Vec<u8>, FlowError>;

/// Completion future of one flow.
pub struct FlowCompletion {
    rx: oneshot::Receiver<FlowOutcome>,
}

impl FlowCompletion {
    /// Wait for the flow to finish.
    pub async fn wait(self) -> FlowOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(FlowError::internal("flow worker went away")))
    }
}

/// Handle returned by [`FlowManager::start_flow`].
pub struct StartedFlow {
    /// The assigned flow id.
    pub flow_id: FlowId,
    /// Resolves when the flow completes or fails.
    pub completion: FlowCompletion,
}

/// Events injected by the host process.
#[derive(Debug, Clone)]
pub enum ExternalEvent {
    /// A host-side asynchronous operation finished.
    AsyncOperationCompleted {
        /// The flow waiting on it.
        flow_id: FlowId,
        /// Operation result payload.
        result: Vec<u8>,
    },
    /// A ledger transaction the flow is waiting on was committed.
    LedgerCommitted {
        /// The flow waiting on it.
        flow_id: FlowId,
        /// The committed transaction id.
        tx_id: String,
    },
    /// Wake a sleeping flow early.
    WakeUp {
        /// The flow to wake.
        flow_id: FlowId,
    },
}

/// Counts live workers; shutdown waits for it to reach zero.
pub(crate) struct ShutdownGate {
    active: Mutex<usize>,
    notify: Notify,
}

impl ShutdownGate {
    fn new() -> Self {
        Self {
            active: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    fn register(&self) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    pub(crate) fn count_down(&self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.active.lock().unwrap_or_else(|p| p.into_inner()) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared between the manager, its workers, and action executors.
pub(crate) struct ManagerShared {
    flows: Mutex<HashMap<FlowId, mpsc::Sender<Event>>>,
    sessions: Mutex<HashMap<SessionId, FlowId>>,
    completions: Mutex<HashMap<FlowId, oneshot::Sender<FlowOutcome>>>,
    started: Mutex<HashSet<FlowId>>,
    timeouts: Mutex<HashMap<FlowId, JoinHandle<()>>>,
    /// Deduplication keys of inbound messages whose processing has been
    /// committed; replays are dropped before reaching a flow.
    seen_inbound: Mutex<HashSet<String>>,
    /// Initiation dedup key to the responder it created, for re-confirming
    /// replayed initiations.
    init_routes: Mutex<HashMap<String, (FlowId, SessionId)>>,
    pub(crate) gate: ShutdownGate,
}

impl ManagerShared {
    fn new() -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            started: Mutex::new(HashSet::new()),
            timeouts: Mutex::new(HashMap::new()),
            seen_inbound: Mutex::new(HashSet::new()),
            init_routes: Mutex::new(HashMap::new()),
            gate: ShutdownGate::new(),
        }
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn inbox_of(&self, flow_id: FlowId) -> Option<mpsc::Sender<Event>> {
        self.lock(&self.flows).get(&flow_id).cloned()
    }

    fn session_route(&self, session_id: SessionId) -> Option<FlowId> {
        self.lock(&self.sessions).get(&session_id).copied()
    }

    fn is_seen(&self, key: &str) -> bool {
        self.lock(&self.seen_inbound).contains(key)
    }

    /// Remove every trace of a worker. `outcome` resolves the completion
    /// future for terminal exits and is `None` for shutdown detaches.
    pub(crate) fn finish_worker(&self, flow_id: FlowId, outcome: Option<FlowOutcome>) {
        self.lock(&self.flows).remove(&flow_id);
        self.lock(&self.sessions).retain(|_, f| *f != flow_id);
        if let Some(handle) = self.lock(&self.timeouts).remove(&flow_id) {
            handle.abort();
        }
        if let Some(outcome) = outcome {
            if let Some(sender) = self.lock(&self.completions).remove(&flow_id) {
                let _ = sender.send(outcome);
            }
        }
        self.gate.count_down();
    }
}

/// Shared-state handle given to action executors and timers.
#[derive(Clone)]
pub(crate) struct RuntimeHandle {
    shared: Arc<ManagerShared>,
    clock: Arc<dyn Clock>,
}

impl RuntimeHandle {
    /// Deliver an event to a flow's inbox, optionally after a delay.
    ///
    /// Detached delivery: ordering against other enqueues is not guaranteed,
    /// so this is only used for timer-like events.
    pub(crate) fn enqueue(&self, flow_id: FlowId, event: Event, after: Option<Duration>) {
        let shared = Arc::clone(&self.shared);
        let timer = after.map(|delay| self.clock.timer(delay));
        tokio::spawn(async move {
            if let Some(timer) = timer {
                timer.await;
            }
            if let Some(inbox) = shared.inbox_of(flow_id) {
                let _ = inbox.send(event).await;
            }
        });
    }

    pub(crate) fn register_session(&self, session_id: SessionId, flow_id: FlowId) {
        self.shared
            .lock(&self.shared.sessions)
            .insert(session_id, flow_id);
    }

    pub(crate) fn mark_seen(&self, keys: &[String]) {
        self.shared
            .lock(&self.shared.seen_inbound)
            .extend(keys.iter().cloned());
    }

    pub(crate) fn signal_started(&self, flow_id: FlowId) {
        self.shared.lock(&self.shared.started).insert(flow_id);
        debug!(flow_id = %flow_id, "Flow has started");
    }

    /// Arm (replacing any previous) the wait-timeout of a timed flow.
    pub(crate) fn arm_flow_timeout(&self, flow_id: FlowId, timeout: Duration) {
        let shared = Arc::clone(&self.shared);
        let timer = self.clock.timer(timeout);
        let task = tokio::spawn(async move {
            timer.await;
            warn!(flow_id = %flow_id, "Timed flow made no progress, retrying from safe point");
            if let Some(inbox) = shared.inbox_of(flow_id) {
                let _ = inbox.send(Event::RetryFlowFromSafePoint).await;
            }
        });
        if let Some(previous) = self
            .shared
            .lock(&self.shared.timeouts)
            .insert(flow_id, task)
        {
            previous.abort();
        }
    }

    pub(crate) fn cancel_flow_timeout(&self, flow_id: FlowId) {
        if let Some(task) = self.shared.lock(&self.shared.timeouts).remove(&flow_id) {
            task.abort();
        }
    }
}

/// Registers, starts, resumes, routes and kills flows.
///
/// One manager per node process. On [`start`](Self::start) it subscribes to
/// the message bus and reconstructs a worker for every non-terminal
/// checkpoint in the store, so flows survive process restarts.
pub struct FlowManager<S: CheckpointStore> {
    store: S,
    codec: Arc<dyn CheckpointCodec>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    hospital: Arc<dyn Hospital>,
    registry: Arc<FlowRegistry>,
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
    config: RuntimeConfig,
    our_identity: PeerId,
    sender_uuid: Uuid,
    shared: Arc<ManagerShared>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: CheckpointStore> Clone for FlowManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            codec: Arc::clone(&self.codec),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            hospital: Arc::clone(&self.hospital),
            registry: Arc::clone(&self.registry),
            interceptors: self.interceptors.clone(),
            config: self.config.clone(),
            our_identity: self.our_identity.clone(),
            sender_uuid: self.sender_uuid,
            shared: Arc::clone(&self.shared),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}

impl<S: CheckpointStore> FlowManager<S> {
    /// Create a builder for a manager running flows as `identity`.
    pub fn builder(store: S, identity: impl Into<PeerId>) -> FlowManagerBuilder<S> {
        FlowManagerBuilder::new(store, identity.into())
    }

    /// Subscribe to the bus and resume persisted flows.
    pub async fn start(&self) -> Result<usize> {
        let (inbound_tx, mut inbound_rx) =
            mpsc::unbounded_channel::<(PeerId, SessionEnvelope)>();
        self.bus.subscribe(
            self.our_identity.clone(),
            Arc::new(move |peer, envelope| {
                let _ = inbound_tx.send((peer, envelope));
            }),
        );

        let manager = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = inbound_rx.recv() => match inbound {
                        Some((peer, envelope)) => manager.route_inbound(peer, envelope).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let resumed = self.resume_flows().await?;
        info!(
            identity = %self.our_identity,
            flows = self.registry.len(),
            resumed,
            "Flow manager started"
        );
        Ok(resumed)
    }

    /// Start a new flow of the registered class `flow_class`.
    ///
    /// The `Unstarted` checkpoint is committed before any user code runs, so
    /// a crash before the first suspension still leaves a replayable record.
    pub async fn start_flow(
        &self,
        flow_class: &str,
        args: Vec<u8>,
        invocation: InvocationContext,
    ) -> Result<StartedFlow> {
        let entry = self.registry.entry(flow_class)?;
        let flow_id = FlowId::random();
        let checkpoint = Checkpoint::unstarted(
            flow_id,
            invocation,
            self.our_identity.clone(),
            SubFlowFrame {
                flow_class: entry.name().to_owned(),
                version: entry.version(),
                is_idempotent: entry.is_idempotent(),
                is_timed: entry.is_timed(),
            },
            args,
        );

        let mut tx = self.store.begin().await?;
        tx.add(flow_id, self.codec.encode(&checkpoint)?).await?;
        tx.commit().await?;

        let completion = self.spawn_worker(
            TransitionState::new(checkpoint, Some(self.sender_uuid)),
            true,
        );
        self.send_to_flow(flow_id, Event::DoRemainingWork).await?;

        Ok(StartedFlow {
            flow_id,
            completion,
        })
    }

    /// Kill a live flow. It completes its current transition, then aborts.
    pub async fn kill_flow(&self, flow_id: FlowId) -> Result<()> {
        self.send_to_flow(
            flow_id,
            Event::Error {
                error: FlowError::Cancelled,
            },
        )
        .await
    }

    /// Inject a host-side event.
    pub async fn external_event(&self, event: ExternalEvent) -> Result<()> {
        match event {
            ExternalEvent::AsyncOperationCompleted { flow_id, result } => {
                self.send_to_flow(flow_id, Event::AsyncOperationCompletion { result })
                    .await
            }
            ExternalEvent::LedgerCommitted { flow_id, tx_id } => {
                self.send_to_flow(
                    flow_id,
                    Event::AsyncOperationCompletion {
                        result: tx_id.into_bytes(),
                    },
                )
                .await
            }
            ExternalEvent::WakeUp { flow_id } => {
                self.send_to_flow(flow_id, Event::WakeUpFromSleep).await
            }
        }
    }

    /// Retry an errored flow from its last persisted checkpoint.
    pub async fn retry_flow(&self, flow_id: FlowId) -> Result<()> {
        if self.shared.inbox_of(flow_id).is_some() {
            return self.send_to_flow(flow_id, Event::RetryFlowFromSafePoint).await;
        }

        // The worker aborted at admission time; rebuild it from storage.
        let mut tx = self.store.begin().await?;
        let blob = tx.get(flow_id).await?.ok_or(Error::UnknownFlow(flow_id))?;
        tx.rollback().await?;
        let checkpoint = self.codec.decode(&blob)?;

        self.spawn_worker(TransitionState::resumed_from_checkpoint(checkpoint), false);
        self.send_to_flow(flow_id, Event::RetryFlowFromSafePoint).await
    }

    /// A read-only view of a flow's persisted checkpoint.
    pub async fn snapshot(&self, flow_id: FlowId) -> Result<Option<CheckpointView>> {
        let mut tx = self.store.begin().await?;
        let blob = tx.get(flow_id).await?;
        tx.rollback().await?;
        match blob {
            Some(blob) => Ok(Some(self.codec.decode(&blob)?.view())),
            None => Ok(None),
        }
    }

    /// Signal shutdown and wait (bounded) for live flows to park.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(self.config.shutdown_timeout, self.shared.gate.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout exceeded, abandoning remaining workers"
            );
        }
        for (_, task) in self.shared.lock(&self.shared.timeouts).drain() {
            task.abort();
        }
        info!(identity = %self.our_identity, "Flow manager stopped");
        Ok(())
    }

    /// Scan the checkpoint store and reconstruct a worker for every
    /// non-terminal checkpoint.
    pub async fn resume_flows(&self) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let stored = tx.list().await?;
        tx.rollback().await?;

        let mut resumed = 0;
        for (flow_id, blob) in stored {
            if self.shared.inbox_of(flow_id).is_some() {
                continue;
            }
            let checkpoint = match self.codec.decode(&blob) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(flow_id = %flow_id, error = %e, "Cannot decode stored checkpoint");
                    self.hospital
                        .admit(
                            flow_id,
                            FlowError::internal(format!("undecodable checkpoint: {e}")),
                            undecodable_view(flow_id),
                        )
                        .await;
                    continue;
                }
            };

            self.spawn_worker(TransitionState::resumed_from_checkpoint(checkpoint), false);
            self.send_to_flow(flow_id, Event::DoRemainingWork).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
        }
    }

    async fn send_to_flow(&self, flow_id: FlowId, event: Event) -> Result<()> {
        let inbox = self
            .shared
            .inbox_of(flow_id)
            .ok_or(Error::UnknownFlow(flow_id))?;
        inbox
            .send(event)
            .await
            .map_err(|_| Error::InboxClosed(flow_id))
    }

    /// Wire up inbox, routing table entries, and the worker task for a flow.
    fn spawn_worker(&self, state: TransitionState, with_completion: bool) -> FlowCompletion {
        let flow_id = state.checkpoint.flow_id;
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.inbox_capacity);

        self.shared.lock(&self.shared.flows).insert(flow_id, inbox_tx);
        {
            let mut sessions = self.shared.lock(&self.shared.sessions);
            for session_id in state.checkpoint.sessions.keys() {
                sessions.insert(*session_id, flow_id);
            }
        }
        let (completion_tx, completion_rx) = oneshot::channel();
        if with_completion {
            self.shared
                .lock(&self.shared.completions)
                .insert(flow_id, completion_tx);
        }
        self.shared.gate.register();

        let initial_session = match state.checkpoint.invocation_context.origin {
            InvocationOrigin::Peer => Some(SessionId::derive(&flow_id, 0)),
            _ => None,
        };
        let ctx = FlowContext::new(
            flow_id,
            self.our_identity.clone(),
            state.checkpoint.invocation_context.clone(),
            initial_session,
        );

        let executor = TransitionExecutor {
            store: self.store.clone(),
            codec: Arc::clone(&self.codec),
            clock: Arc::clone(&self.clock),
            retry_policy: self.config.retry_policy.clone(),
            default_flow_timeout: self.config.default_flow_timeout,
            interceptors: self.interceptors.clone(),
            actions: ActionExecutor {
                flow_id,
                store: self.store.clone(),
                codec: Arc::clone(&self.codec),
                bus: Arc::clone(&self.bus),
                clock: Arc::clone(&self.clock),
                handle: self.handle(),
            },
        };

        let worker = FlowWorker::new(
            state,
            ctx,
            executor,
            inbox_rx,
            self.shutdown_rx.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.shared),
            Arc::clone(&self.hospital),
        );
        tokio::spawn(worker.run());

        FlowCompletion { rx: completion_rx }
    }

    async fn route_inbound(&self, peer: PeerId, envelope: SessionEnvelope) {
        if envelope.kind == SessionMessageKind::Init {
            if let Err(e) = self.handle_session_init(peer, envelope).await {
                error!(error = %e, "Failed to handle session initiation");
            }
            return;
        }

        let key = DeduplicationId::key_of(&envelope.deduplication_id);
        if self.shared.is_seen(&key) {
            // Replay of a message whose processing is already committed;
            // re-acknowledge so the sender stops.
            let _ = self.bus.acknowledge(&[key]).await;
            return;
        }

        let Some(flow_id) = self.shared.session_route(envelope.session_id) else {
            warn!(
                session_id = %envelope.session_id,
                kind = ?envelope.kind,
                "Dropping message for unknown session"
            );
            return;
        };
        let session_id = envelope.session_id;
        if let Err(e) = self
            .send_to_flow(
                flow_id,
                Event::DeliverSessionMessage {
                    session_id,
                    message: envelope,
                },
            )
            .await
        {
            warn!(flow_id = %flow_id, error = %e, "Failed to deliver session message");
        }
    }

    /// Build a responder flow for an inbound session initiation.
    async fn handle_session_init(&self, peer: PeerId, envelope: SessionEnvelope) -> Result<()> {
        let init: InitialSessionMessage = serde_json::from_slice(&envelope.payload)?;
        let key = DeduplicationId::key_of(&envelope.deduplication_id);
        let initiator_session = envelope.session_id;

        // Replayed initiation: the responder exists, re-confirm.
        let existing = self.shared.lock(&self.shared.init_routes).get(&key).copied();
        if let Some((flow_id, responder_session)) = existing {
            self.send_confirm(&peer, initiator_session, responder_session, flow_id)
                .await?;
            return Ok(());
        }

        let Some(entry) = self.registry.responder_for(&init.protocol).cloned() else {
            warn!(protocol = %init.protocol, peer = %peer, "No responder registered");
            return self
                .send_reject(
                    &peer,
                    initiator_session,
                    &key,
                    FlowError::internal("counterparty flow errored"),
                )
                .await;
        };
        if init.protocol_version > entry.version() {
            return self
                .send_reject(
                    &peer,
                    initiator_session,
                    &key,
                    FlowError::ProtocolVersionMismatch {
                        supported: entry.version(),
                        received: init.protocol_version,
                    },
                )
                .await;
        }

        let flow_id = FlowId::random();
        let responder_session = SessionId::derive(&flow_id, 0);
        let mut checkpoint = Checkpoint::unstarted(
            flow_id,
            InvocationContext::peer(&peer),
            self.our_identity.clone(),
            SubFlowFrame {
                flow_class: entry.name().to_owned(),
                version: entry.version(),
                is_idempotent: entry.is_idempotent(),
                is_timed: entry.is_timed(),
            },
            Vec::new(),
        );
        checkpoint.sessions.insert(
            responder_session,
            SessionState::initiated_by_peer(
                responder_session,
                peer.clone(),
                initiator_session,
                init.protocol.clone(),
                init.protocol_version,
                flow_id.to_string(),
                init.first_payload,
            ),
        );
        checkpoint.next_session_ordinal = 1;

        let mut tx = self.store.begin().await?;
        tx.add(flow_id, self.codec.encode(&checkpoint)?).await?;
        tx.record_deduplication_ids(std::slice::from_ref(&key))
            .await?;
        tx.commit().await?;

        self.handle().mark_seen(std::slice::from_ref(&key));
        self.shared
            .lock(&self.shared.init_routes)
            .insert(key, (flow_id, responder_session));

        info!(
            flow_id = %flow_id,
            protocol = %init.protocol,
            peer = %peer,
            "Started responder flow"
        );

        self.spawn_worker(
            TransitionState::new(checkpoint, Some(self.sender_uuid)),
            false,
        );
        self.send_confirm(&peer, initiator_session, responder_session, flow_id)
            .await?;
        self.send_to_flow(flow_id, Event::DoRemainingWork).await
    }

    async fn send_confirm(
        &self,
        peer: &PeerId,
        initiator_session: SessionId,
        responder_session: SessionId,
        flow_id: FlowId,
    ) -> Result<()> {
        let dedup = DeduplicationId {
            sender_uuid: Some(self.sender_uuid),
            seed: format!("{flow_id}-confirm"),
            sequence: 0,
            retry: 0,
        };
        self.bus
            .send(
                peer,
                SessionEnvelope {
                    session_id: initiator_session,
                    peer_session_id: Some(responder_session),
                    sequence_number: 0,
                    deduplication_id: dedup.to_string(),
                    kind: SessionMessageKind::Confirm,
                    payload: Vec::new(),
                },
            )
            .await
    }

    async fn send_reject(
        &self,
        peer: &PeerId,
        initiator_session: SessionId,
        init_key: &str,
        error: FlowError,
    ) -> Result<()> {
        let dedup = DeduplicationId {
            sender_uuid: Some(self.sender_uuid),
            seed: format!("{init_key}-reject"),
            sequence: 0,
            retry: 0,
        };
        self.bus
            .send(
                peer,
                SessionEnvelope {
                    session_id: initiator_session,
                    peer_session_id: None,
                    sequence_number: 0,
                    deduplication_id: dedup.to_string(),
                    kind: SessionMessageKind::Reject,
                    payload: serde_json::to_vec(&error)?,
                },
            )
            .await
    }
}

fn undecodable_view(flow_id: FlowId) -> CheckpointView {
    CheckpointView {
        flow_id,
        status: crate::checkpoint::FlowStatus::Failed,
        number_of_suspends: 0,
        progress_step: None,
        session_count: 0,
        sub_flow_depth: 0,
        errored: true,
    }
}

/// Builder for a [`FlowManager`].
///
/// Register flow classes, wire collaborators, then [`build`](Self::build).
/// Duplicate registrations are reported at build time.
///
/// # Example
///
/// ```ignore
/// let manager = FlowManager::builder(store, "alice")
///     .register::<PaymentFlow>()
///     .register_responder::<PaymentResponder>(PaymentFlow::NAME)
///     .bus(bus)
///     .build()?;
/// manager.start().await?;
/// ```
pub struct FlowManagerBuilder<S: CheckpointStore> {
    store: S,
    identity: PeerId,
    registry: FlowRegistry,
    duplicate_flow_type: Option<String>,
    bus: Option<Arc<dyn MessageBus>>,
    clock: Option<Arc<dyn Clock>>,
    hospital: Option<Arc<dyn Hospital>>,
    codec: Option<Arc<dyn CheckpointCodec>>,
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
    config: RuntimeConfig,
}

impl<S: CheckpointStore> FlowManagerBuilder<S> {
    fn new(store: S, identity: PeerId) -> Self {
        Self {
            store,
            identity,
            registry: FlowRegistry::new(),
            duplicate_flow_type: None,
            bus: None,
            clock: None,
            hospital: None,
            codec: None,
            interceptors: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Register a startable flow class.
    pub fn register<L: FlowLogic>(mut self) -> Self {
        if !self.registry.register::<L>() && self.duplicate_flow_type.is_none() {
            self.duplicate_flow_type = Some(L::NAME.to_owned());
        }
        self
    }

    /// Register a responder answering sessions initiated by
    /// `initiating_protocol`.
    pub fn register_responder<L: FlowLogic>(mut self, initiating_protocol: &str) -> Self {
        if !self.registry.register_responder::<L>(initiating_protocol)
            && self.duplicate_flow_type.is_none()
        {
            self.duplicate_flow_type = Some(L::NAME.to_owned());
        }
        self
    }

    /// Use the given message bus.
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use the given clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use the given hospital.
    pub fn hospital(mut self, hospital: Arc<dyn Hospital>) -> Self {
        self.hospital = Some(hospital);
        self
    }

    /// Use the given checkpoint codec.
    pub fn codec(mut self, codec: Arc<dyn CheckpointCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Stack an interceptor around the transition function.
    pub fn interceptor(mut self, interceptor: Arc<dyn TransitionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Set the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<FlowManager<S>> {
        if let Some(flow_type) = self.duplicate_flow_type {
            return Err(Error::DuplicateFlowType(flow_type));
        }
        let sender_uuid = self.config.sender_uuid.unwrap_or_else(Uuid::new_v4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bus = match self.bus {
            Some(bus) => bus,
            None => Arc::new(InMemoryBus::new().endpoint(self.identity.clone())),
        };

        Ok(FlowManager {
            store: self.store,
            codec: self
                .codec
                .unwrap_or_else(|| Arc::new(JsonCheckpointCodec)),
            bus,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            hospital: self
                .hospital
                .unwrap_or_else(|| Arc::new(RecordingHospital::new())),
            registry: Arc::new(self.registry),
            interceptors: self.interceptors,
            config: self.config,
            our_identity: self.identity,
            sender_uuid,
            shared: Arc::new(ManagerShared::new()),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }
}
