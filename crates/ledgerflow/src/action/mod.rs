//! Side effects produced by the transition function.
//!
//! A transition returns an ordered list of [`Action`]s; the
//! [`ActionExecutor`](executor) applies them one at a time inside the open
//! store transaction. Every action is idempotent with respect to its
//! `(flow_id, number_of_suspends)` key, so a crash-and-replay never
//! double-persists and duplicated sends carry identical deduplication ids.

pub(crate) mod executor;
mod retry;

use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

pub use retry::RetryPolicy;

use crate::checkpoint::Checkpoint;
use crate::event::Event;
use crate::flow::PeerId;
use crate::session::SessionEnvelope;

/// One unit of side effect, applied in order by the action executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the given checkpoint image through the open transaction.
    ///
    /// The image is captured by the transition before send sequences advance,
    /// so replaying from it re-stamps identical deduplication ids.
    PersistCheckpoint(Box<Checkpoint>),
    /// Delete the flow's checkpoint.
    RemoveCheckpoint,
    /// Send a session-initiation envelope.
    SendInitial {
        /// The counterparty node.
        peer: PeerId,
        /// `Init` envelope carrying the [`InitialSessionMessage`](crate::session::InitialSessionMessage).
        envelope: SessionEnvelope,
    },
    /// Send an envelope on an established session.
    SendExisting {
        /// The counterparty node.
        peer: PeerId,
        /// The envelope to send.
        envelope: SessionEnvelope,
    },
    /// Send several envelopes produced by one transition.
    SendMultiple {
        /// Envelopes in send order.
        sends: Vec<(PeerId, SessionEnvelope)>,
    },
    /// Enqueue an event back to this flow, optionally after a delay.
    ScheduleEvent {
        /// The event to deliver.
        event: Box<Event>,
        /// Delay before delivery; `None` delivers as soon as possible.
        after: Option<Duration>,
    },
    /// Arm a wake-up for a sleeping flow.
    SleepUntil {
        /// When to deliver `WakeUpFromSleep`.
        at: OffsetDateTime,
    },
    /// Acknowledge delivered inbound messages to the bus so redelivery
    /// stops.
    AcknowledgeMessages {
        /// Deduplication ids of the messages being acknowledged.
        deduplication_ids: Vec<String>,
    },
    /// Send `Reject` envelopes carrying the flow's errors to its peers.
    PropagateErrors {
        /// Prepared reject envelopes.
        sends: Vec<(PeerId, SessionEnvelope)>,
    },
    /// Open a fresh store transaction (suspension boundary).
    CreateTransaction,
    /// Commit the open store transaction.
    CommitTransaction,
    /// Roll back the open store transaction.
    RollbackTransaction,
    /// Release the soft locks held under the flow's lock id.
    ReleaseSoftLocks {
        /// The lock id to release; `None` when the flow never declared one.
        lock_id: Option<Uuid>,
    },
    /// Tell the manager the flow has started executing user code.
    SignalFlowHasStarted,
    /// Arm (or re-arm) the timed-flow timeout.
    ScheduleFlowTimeout {
        /// Expiry after which the manager enqueues a safe-point retry.
        timeout: Duration,
    },
    /// Disarm the timed-flow timeout.
    CancelFlowTimeout,
    /// Persist deduplication ids of processed inbound messages so replays
    /// are dropped after a restart.
    UpdateDeduplicationId {
        /// Deduplication keys to record.
        deduplication_ids: Vec<String>,
    },
    /// An unrecoverable error: flush logs and halt the process.
    HaltProcess,
}

impl Action {
    /// Whether this action writes through the store transaction.
    pub fn touches_store(&self) -> bool {
        matches!(
            self,
            Action::PersistCheckpoint(_)
                | Action::RemoveCheckpoint
                | Action::UpdateDeduplicationId { .. }
        )
    }
}
