//! Applies transition actions inside the open store transaction.

use std::sync::Arc;

use tracing::debug;

use super::Action;
use crate::bus::MessageBus;
use crate::clock::Clock;
use crate::codec::CheckpointCodec;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::flow::FlowId;
use crate::runtime::manager::RuntimeHandle;
use crate::session::{SessionEnvelope, SessionMessageKind};
use crate::store::{CheckpointStore, StoreTransaction};

/// Performs the side effects a transition decided on.
///
/// Actions are applied strictly in order. Store-touching actions go through
/// the transaction slot threaded in by the transition executor; transaction
/// boundary actions replace its contents. Failures bubble up unclassified —
/// the transition executor decides between rollback-and-retry and hospital
/// escalation based on [`Error::is_transient`].
pub(crate) struct ActionExecutor<S: CheckpointStore> {
    pub flow_id: FlowId,
    pub store: S,
    pub codec: Arc<dyn CheckpointCodec>,
    pub bus: Arc<dyn MessageBus>,
    pub clock: Arc<dyn Clock>,
    pub handle: RuntimeHandle,
}

impl<S: CheckpointStore> ActionExecutor<S> {
    pub async fn apply(&self, action: Action, tx: &mut Option<S::Tx>) -> Result<()> {
        match action {
            Action::PersistCheckpoint(image) => {
                let blob = self.codec.encode(&image)?;
                self.open(tx)?.update(self.flow_id, blob).await
            }
            Action::RemoveCheckpoint => self.open(tx)?.remove(self.flow_id).await,
            Action::UpdateDeduplicationId { deduplication_ids } => {
                self.open(tx)?
                    .record_deduplication_ids(&deduplication_ids)
                    .await?;
                self.handle.mark_seen(&deduplication_ids);
                Ok(())
            }
            Action::SendInitial { peer, envelope } => {
                // The initiator's own id is the routing key for the
                // counterparty's confirmation.
                self.handle.register_session(envelope.session_id, self.flow_id);
                self.send(&peer, envelope).await
            }
            Action::SendExisting { peer, envelope } => self.send(&peer, envelope).await,
            Action::SendMultiple { sends } => {
                for (peer, envelope) in sends {
                    if envelope.kind == SessionMessageKind::Init {
                        self.handle
                            .register_session(envelope.session_id, self.flow_id);
                    }
                    self.send(&peer, envelope).await?;
                }
                Ok(())
            }
            Action::PropagateErrors { sends } => {
                for (peer, envelope) in sends {
                    self.send(&peer, envelope).await?;
                }
                Ok(())
            }
            Action::ScheduleEvent { event, after } => {
                self.handle.enqueue(self.flow_id, *event, after);
                Ok(())
            }
            Action::SleepUntil { at } => {
                let delay = (at - self.clock.now()).try_into().unwrap_or_default();
                self.handle
                    .enqueue(self.flow_id, Event::WakeUpFromSleep, Some(delay));
                Ok(())
            }
            Action::AcknowledgeMessages { deduplication_ids } => {
                self.bus.acknowledge(&deduplication_ids).await
            }
            Action::CreateTransaction => {
                if tx.is_none() {
                    *tx = Some(self.store.begin().await?);
                }
                Ok(())
            }
            Action::CommitTransaction => match tx.take() {
                Some(open) => open.commit().await,
                None => Err(Error::storage_permanent(
                    "commit requested without an open transaction",
                )),
            },
            Action::RollbackTransaction => {
                if let Some(open) = tx.take() {
                    open.rollback().await?;
                }
                Ok(())
            }
            Action::ReleaseSoftLocks { lock_id } => {
                // The vault owns the lock table; releasing is observing the
                // flow's terminal state. Recorded here for traceability.
                if let Some(lock_id) = lock_id {
                    debug!(flow_id = %self.flow_id, lock_id = %lock_id, "Releasing soft locks");
                }
                Ok(())
            }
            Action::SignalFlowHasStarted => {
                self.handle.signal_started(self.flow_id);
                Ok(())
            }
            Action::ScheduleFlowTimeout { timeout } => {
                self.handle.arm_flow_timeout(self.flow_id, timeout);
                Ok(())
            }
            Action::CancelFlowTimeout => {
                self.handle.cancel_flow_timeout(self.flow_id);
                Ok(())
            }
            Action::HaltProcess => Err(Error::HaltRequested),
        }
    }

    fn open<'a>(&self, tx: &'a mut Option<S::Tx>) -> Result<&'a mut S::Tx> {
        tx.as_mut().ok_or_else(|| {
            Error::storage_permanent("store action outside an open transaction")
        })
    }

    async fn send(&self, peer: &crate::flow::PeerId, envelope: SessionEnvelope) -> Result<()> {
        debug!(
            flow_id = %self.flow_id,
            peer = %peer,
            session_id = %envelope.session_id,
            kind = ?envelope.kind,
            seq = envelope.sequence_number,
            "Sending session message"
        );
        self.bus.send(peer, envelope).await
    }
}
