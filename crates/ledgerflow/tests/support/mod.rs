//! Shared harness for the scenario tests.

pub mod flows;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use ledgerflow::{
    FlowError, FlowManager, FlowManagerBuilder, InMemoryBus, InMemoryStore, PeerId,
    RecordingHospital, RetryPolicy, RuntimeConfig, SessionEnvelope, SessionId,
    SessionMessageKind,
};

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ledgerflow=debug")
        .try_init();
}

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fast runtime config for tests.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        retry_policy: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            backoff_cap: Duration::from_millis(200),
        },
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Poll until `check` returns `Some(T)` or the timeout expires.
pub async fn wait_until<T>(timeout: Duration, check: impl Fn() -> Option<T>) -> Result<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// One node: a manager wired to a shared bus and store, with a recording
/// hospital.
pub struct TestNode {
    pub manager: FlowManager<InMemoryStore>,
    pub store: InMemoryStore,
    pub bus: Arc<InMemoryBus>,
    pub hospital: Arc<RecordingHospital>,
}

impl TestNode {
    /// Build and start a node; `register` adds the flow classes under test.
    pub async fn start(
        identity: &str,
        store: InMemoryStore,
        bus: Arc<InMemoryBus>,
        register: impl FnOnce(
            FlowManagerBuilder<InMemoryStore>,
        ) -> FlowManagerBuilder<InMemoryStore>,
    ) -> Result<TestNode> {
        init_test_tracing();
        let hospital = Arc::new(RecordingHospital::new());
        let builder = FlowManager::builder(store.clone(), identity)
            .bus(Arc::new(bus.endpoint(identity)))
            .hospital(hospital.clone())
            .config(test_config());
        let manager = register(builder).build()?;
        manager.start().await?;
        Ok(TestNode {
            manager,
            store,
            bus,
            hospital,
        })
    }

    /// Wait for an envelope of `kind` sent to `peer`, skipping `skip` earlier
    /// matches.
    pub async fn wait_for_sent(
        &self,
        peer: &PeerId,
        kind: SessionMessageKind,
        skip: usize,
    ) -> Result<SessionEnvelope> {
        let bus = self.bus.clone();
        let peer = peer.clone();
        wait_until(DEFAULT_TEST_TIMEOUT, move || {
            bus.sent_to(&peer)
                .into_iter()
                .filter(|e| e.kind == kind)
                .nth(skip)
        })
        .await
    }
}

/// A confirmation for the initiation the node sent, as its peer would answer.
pub fn confirm_envelope(init: &SessionEnvelope, responder_session: u64, seed: &str) -> SessionEnvelope {
    SessionEnvelope {
        session_id: init.session_id,
        peer_session_id: Some(SessionId::from_raw(responder_session)),
        sequence_number: 0,
        deduplication_id: format!("null|{seed}-confirm:0"),
        kind: SessionMessageKind::Confirm,
        payload: Vec::new(),
    }
}

/// A data message addressed to `session`.
pub fn data_envelope(session: SessionId, seq: u64, payload: &[u8], seed: &str) -> SessionEnvelope {
    SessionEnvelope {
        session_id: session,
        peer_session_id: None,
        sequence_number: seq,
        deduplication_id: format!("null|{seed}:{seq}"),
        kind: SessionMessageKind::Data,
        payload: payload.to_vec(),
    }
}

/// An end-of-session message addressed to `session`.
#[allow(dead_code)]
pub fn end_envelope(session: SessionId, seq: u64, seed: &str) -> SessionEnvelope {
    SessionEnvelope {
        session_id: session,
        peer_session_id: None,
        sequence_number: seq,
        deduplication_id: format!("null|{seed}:{seq}"),
        kind: SessionMessageKind::End,
        payload: Vec::new(),
    }
}

/// A rejection carrying a serialized flow error.
pub fn reject_envelope(session: SessionId, error: &FlowError, seed: &str) -> SessionEnvelope {
    SessionEnvelope {
        session_id: session,
        peer_session_id: None,
        sequence_number: 0,
        deduplication_id: format!("null|{seed}-reject:0"),
        kind: SessionMessageKind::Reject,
        payload: serde_json::to_vec(error).expect("flow errors serialize"),
    }
}
