//! Error types for ledgerflow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowId;
use crate::session::SessionId;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors surfaced by the runtime.
///
/// These are distinct from [`FlowError`]: an `Error` concerns the machinery
/// (storage, codecs, routing), while a `FlowError` is part of a flow's own
/// state and travels through transitions and across sessions as data.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize runtime data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to decode a persisted checkpoint blob.
    ///
    /// Includes the flow the blob belongs to; the checkpoint itself is left
    /// untouched in the store for the hospital.
    #[error("failed to decode checkpoint for flow {flow_id}: {reason}")]
    CheckpointDecode {
        /// The flow whose checkpoint failed to decode.
        flow_id: FlowId,
        /// Human-readable decode failure.
        reason: String,
    },

    /// A checkpoint blob was written by a newer codec than this node supports.
    ///
    /// Fatal for the affected flow; the blob is never partially decoded.
    #[error("checkpoint version {found} is newer than supported version {supported}")]
    UnsupportedCheckpointVersion {
        /// Version tag found in the blob header.
        found: u32,
        /// Highest version this codec understands.
        supported: u32,
    },

    /// Flow type was not registered in the flow registry.
    #[error("unknown flow type: {0}")]
    UnknownFlowType(String),

    /// Flow type was registered more than once.
    #[error("duplicate flow type registration: {0}")]
    DuplicateFlowType(String),

    /// No live or persisted flow with this id.
    #[error("unknown flow: {0}")]
    UnknownFlow(FlowId),

    /// No route for an inbound session message.
    #[error("no flow registered for session {0}")]
    UnknownSession(SessionId),

    /// Storage backend failure.
    ///
    /// `transient` distinguishes retryable conditions (deadlock, connection
    /// loss) from permanent corruption; the transition executor rolls back and
    /// retries from the last safe point on transient failures.
    #[error("storage error: {message}")]
    Storage {
        /// Backend-specific description.
        message: String,
        /// Whether a retry from the last safe point may succeed.
        transient: bool,
    },

    /// PostgreSQL storage error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Message bus failure.
    #[error("message bus error: {0}")]
    Bus(String),

    /// The flow worker's inbox closed unexpectedly.
    #[error("event inbox closed for flow {0}")]
    InboxClosed(FlowId),

    /// An unrecoverable error asked for a process halt.
    ///
    /// Reported upward instead of calling `abort` directly so the manager can
    /// flush logs first and tests can observe the request.
    #[error("process halt requested")]
    HaltRequested,
}

impl Error {
    /// Create a transient storage error.
    pub fn storage_transient(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent storage error.
    pub fn storage_permanent(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a retry from the last persisted checkpoint may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Storage { transient, .. } => *transient,
            Error::Bus(_) => true,
            #[cfg(feature = "postgres")]
            Error::Postgres(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

/// How an error affects the flow that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Process-wide failure; halt after flushing logs.
    Unrecoverable,
    /// The flow cannot continue; checkpoint is retained and the flow is
    /// admitted to the hospital.
    Fatal,
    /// A retry from the last persisted checkpoint may succeed.
    Retryable,
    /// Expected business failure; propagates to the counterparty and the
    /// initiator's result future, no hospital admission.
    UserVisible,
}

/// Flow-level errors.
///
/// These are values, not control flow: they are stored in errored checkpoints,
/// serialized into `Reject` session messages, and delivered into user code as
/// a resume value so catch handlers can observe them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowError {
    /// A user-thrown, counterparty-visible exception.
    #[error("flow exception: {message}")]
    FlowException {
        /// Message propagated to peers verbatim.
        message: String,
    },

    /// The invocation context lacks a required permission.
    #[error("permission denied: {permission}")]
    PermissionDenied {
        /// The permission that was checked.
        permission: String,
    },

    /// A session ended while the flow was still expecting data on it.
    #[error("unexpected end of session {session_id}")]
    UnexpectedEndOfSession {
        /// The session that ended.
        session_id: SessionId,
    },

    /// A message arrived for a session the flow does not know or has closed.
    #[error("unexpected message on session {session_id}")]
    UnexpectedSessionMessage {
        /// The offending session id.
        session_id: SessionId,
    },

    /// A second session-initiation arrived with an already-used session id.
    #[error("duplicate session initiation for {session_id}")]
    DuplicateSessionInit {
        /// The duplicated session id.
        session_id: SessionId,
    },

    /// The counterparty speaks a newer protocol version than we support.
    #[error("protocol version mismatch: supported {supported}, received {received}")]
    ProtocolVersionMismatch {
        /// Highest version this node supports for the protocol.
        supported: u32,
        /// Version the counterparty announced.
        received: u32,
    },

    /// The flow was killed from the outside.
    #[error("flow cancelled")]
    Cancelled,

    /// Transient infrastructure failure surfaced at the flow layer.
    #[error("retryable failure: {message}")]
    Retryable {
        /// What failed.
        message: String,
    },

    /// Virtual-machine-level failure; the process must halt.
    #[error("unrecoverable failure: {message}")]
    Unrecoverable {
        /// What failed.
        message: String,
    },

    /// Internal invariant violation or unclassified failure.
    #[error("internal flow error: {message}")]
    Internal {
        /// What failed.
        message: String,
    },
}

impl FlowError {
    /// Shorthand for a user-visible [`FlowError::FlowException`].
    pub fn exception(message: impl Into<String>) -> Self {
        FlowError::FlowException {
            message: message.into(),
        }
    }

    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        FlowError::Internal {
            message: message.into(),
        }
    }

    /// Classify the error per the runtime's propagation policy.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FlowError::Unrecoverable { .. } => ErrorSeverity::Unrecoverable,
            FlowError::Retryable { .. } => ErrorSeverity::Retryable,
            FlowError::FlowException { .. } | FlowError::PermissionDenied { .. } => {
                ErrorSeverity::UserVisible
            }
            _ => ErrorSeverity::Fatal,
        }
    }

    /// The form of this error a counterparty is allowed to see.
    ///
    /// User-visible errors propagate verbatim; everything else collapses to an
    /// opaque message so internal details never cross the wire.
    pub fn visible_to_peer(&self) -> FlowError {
        match self.severity() {
            ErrorSeverity::UserVisible => self.clone(),
            _ => FlowError::internal("counterparty flow errored"),
        }
    }
}

impl From<Error> for FlowError {
    fn from(e: Error) -> Self {
        if e.is_transient() {
            FlowError::Retryable {
                message: e.to_string(),
            }
        } else {
            FlowError::Internal {
                message: e.to_string(),
            }
        }
    }
}
