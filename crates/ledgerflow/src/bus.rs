//! Message bus collaborator interface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::flow::PeerId;
use crate::session::SessionEnvelope;

/// Handler invoked for every inbound envelope addressed to a subscriber.
///
/// The first argument is the sending node's identity.
pub type InboundHandler = Arc<dyn Fn(PeerId, SessionEnvelope) + Send + Sync>;

/// The broker the runtime sends session messages through.
///
/// Delivery is at-least-once: an envelope may be redelivered until it is
/// acknowledged, which is why every envelope carries a deduplication id and
/// the manager drops replays before they reach a flow.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Send an envelope to a peer node.
    async fn send(&self, peer: &PeerId, envelope: SessionEnvelope) -> Result<()>;

    /// Acknowledge processed inbound messages so redelivery stops.
    async fn acknowledge(&self, deduplication_ids: &[String]) -> Result<()>;

    /// Register the handler for envelopes addressed to `identity`.
    fn subscribe(&self, identity: PeerId, handler: InboundHandler);
}

#[derive(Default)]
struct BusInner {
    sent: Vec<(PeerId, SessionEnvelope)>,
    acknowledged: Vec<String>,
    handlers: HashMap<PeerId, InboundHandler>,
}

/// Loopback broker connecting nodes in the same process.
///
/// The hub records every send and acknowledgement for assertions and routes
/// envelopes synchronously between subscribed identities. Each node talks to
/// the hub through an [`InMemoryEndpoint`] carrying its own identity, so the
/// receiving side learns who sent what — two managers on one hub behave like
/// two nodes on a broker.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl InMemoryBus {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`MessageBus`] endpoint sending as `identity`.
    pub fn endpoint(&self, identity: impl Into<PeerId>) -> InMemoryEndpoint {
        InMemoryEndpoint {
            identity: identity.into(),
            hub: self.clone(),
        }
    }

    /// Every envelope sent so far, with its recipient, in send order.
    pub fn sent(&self) -> Vec<(PeerId, SessionEnvelope)> {
        self.lock().sent.clone()
    }

    /// Envelopes sent to one peer, in send order.
    pub fn sent_to(&self, peer: &PeerId) -> Vec<SessionEnvelope> {
        self.lock()
            .sent
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Deduplication ids acknowledged so far.
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Inject an inbound envelope as if `from` had sent it to `to`.
    ///
    /// Not recorded in [`sent`](Self::sent); this simulates a remote peer.
    pub fn deliver(&self, from: &PeerId, to: &PeerId, envelope: SessionEnvelope) {
        let handler = self.lock().handlers.get(to).cloned();
        if let Some(handler) = handler {
            handler(from.clone(), envelope);
        }
    }

    fn route(&self, from: &PeerId, to: &PeerId, envelope: SessionEnvelope) {
        let handler = {
            let mut inner = self.lock();
            inner.sent.push((to.clone(), envelope.clone()));
            inner.handlers.get(to).cloned()
        };
        if let Some(handler) = handler {
            handler(from.clone(), envelope);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One node's connection to an [`InMemoryBus`] hub.
#[derive(Clone)]
pub struct InMemoryEndpoint {
    identity: PeerId,
    hub: InMemoryBus,
}

#[async_trait]
impl MessageBus for InMemoryEndpoint {
    async fn send(&self, peer: &PeerId, envelope: SessionEnvelope) -> Result<()> {
        self.hub.route(&self.identity, peer, envelope);
        Ok(())
    }

    async fn acknowledge(&self, deduplication_ids: &[String]) -> Result<()> {
        self.hub
            .lock()
            .acknowledged
            .extend(deduplication_ids.iter().cloned());
        Ok(())
    }

    fn subscribe(&self, identity: PeerId, handler: InboundHandler) {
        self.hub.lock().handlers.insert(identity, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionId, SessionMessageKind};

    fn envelope(seq: u64) -> SessionEnvelope {
        SessionEnvelope {
            session_id: SessionId::from_raw(1),
            peer_session_id: None,
            sequence_number: seq,
            deduplication_id: format!("seed:{seq}"),
            kind: SessionMessageKind::Data,
            payload: b"x".to_vec(),
        }
    }

    #[tokio::test]
    async fn send_records_and_routes_with_sender_identity() {
        let hub = InMemoryBus::new();
        let alice = hub.endpoint("alice");
        let bob = PeerId::new("bob");

        let received: Arc<Mutex<Vec<(PeerId, SessionEnvelope)>>> = Arc::default();
        let sink = Arc::clone(&received);
        hub.endpoint("bob").subscribe(
            bob.clone(),
            Arc::new(move |from, env| sink.lock().unwrap().push((from, env))),
        );

        alice.send(&bob, envelope(0)).await.unwrap();
        alice.send(&bob, envelope(1)).await.unwrap();

        assert_eq!(hub.sent_to(&bob).len(), 2);
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, PeerId::new("alice"));
        assert_eq!(received[0].1.sequence_number, 0);
        assert_eq!(received[1].1.sequence_number, 1);
    }

    #[tokio::test]
    async fn acknowledgements_are_recorded() {
        let hub = InMemoryBus::new();
        hub.endpoint("alice")
            .acknowledge(&["seed:0".to_owned(), "seed:1".to_owned()])
            .await
            .unwrap();
        assert_eq!(hub.acknowledged(), vec!["seed:0", "seed:1"]);
    }
}
