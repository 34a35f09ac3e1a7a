//! Durable flow state machine runtime for a distributed-ledger node.
//!
//! Ledgerflow runs long-lived user workflows ("flows") that message
//! counterparty nodes, persist their progress as checkpoints, and resume
//! after a process restart:
//!
//! - **Pure functional core** — [`transition`] maps `(state, event)` to
//!   `(state', actions, continuation)` deterministically with no side effects
//! - **Explicit continuations** — user code is a serializable state machine;
//!   the continuation in a checkpoint is the machine itself, not a frozen
//!   stack
//! - **Transactional effects** — checkpoint writes and message sends for the
//!   same suspension commit atomically; replays carry stable deduplication
//!   ids
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          FlowWorker (per flow)                       │
//! │                                                                      │
//! │   inbox ──► TransitionExecutor ──► transition(state, event)          │
//! │                    │                     │                           │
//! │                    │                     ├─ actions ─► ActionExecutor│
//! │                    │                     │   (persist, send, ack,    │
//! │                    │                     │    commit, timers)        │
//! │                    │                     └─ continuation             │
//! │                    │                        Resume ─► user code runs │
//! │                    │                        until its next yield     │
//! │                    └─ one open store transaction between suspensions │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`FlowManager`] owns the `FlowId → worker` and `SessionId → FlowId`
//! tables, reconstructs workers from the checkpoint store at startup, and
//! routes inbound session messages.
//!
//! # Example
//!
//! ```ignore
//! use ledgerflow::{FlowLogic, FlowManager, FlowYield, InvocationContext, ResumeValue};
//!
//! let manager = FlowManager::builder(store, "alice")
//!     .register::<PaymentFlow>()
//!     .register_responder::<PaymentResponder>(PaymentFlow::NAME)
//!     .build()?;
//! manager.start().await?;
//!
//! let started = manager
//!     .start_flow(PaymentFlow::NAME, args, InvocationContext::rpc("admin"))
//!     .await?;
//! let result = started.completion.wait().await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres` — Enables [`PgCheckpointStore`] for production use with
//!   PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

mod action;
mod bus;
mod checkpoint;
mod clock;
mod codec;
mod error;
mod event;
mod executor;
mod flow;
pub mod hospital;
pub mod runtime;
mod session;
pub mod store;
mod transition;

pub use action::{Action, RetryPolicy};
pub use bus::{InMemoryBus, InMemoryEndpoint, InboundHandler, MessageBus};
pub use checkpoint::{
    Checkpoint, CheckpointView, ErrorState, FlowState, FlowStatus, SubFlowFrame,
};
pub use clock::{Clock, SystemClock};
pub use codec::{CheckpointCodec, JsonCheckpointCodec};
pub use error::{Error, ErrorSeverity, FlowError, Result};
pub use event::{Event, FlowIoRequest};
pub use executor::{LoggingInterceptor, TransitionFn, TransitionInterceptor};
pub use flow::{
    FlowContext, FlowId, FlowLogic, FlowYield, InvocationContext, InvocationOrigin, PeerId,
    ResumeValue,
};
pub use hospital::{Hospital, RecordingHospital};
pub use runtime::{
    ExternalEvent, FlowCompletion, FlowManager, FlowManagerBuilder, FlowOutcome, RuntimeConfig,
    StartedFlow,
};
pub use session::{
    DeduplicationId, InitialSessionMessage, SessionEnvelope, SessionId, SessionMessageKind,
    SessionPhase, SessionState,
};
#[cfg(feature = "postgres")]
pub use store::PgCheckpointStore;
pub use store::{CheckpointStore, InMemoryStore, StoreTransaction};
pub use transition::{
    transition, Continuation, TransitionContext, TransitionResult, TransitionState,
};
