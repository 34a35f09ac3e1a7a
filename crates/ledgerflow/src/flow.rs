//! Core flow traits and identity types.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::FlowError;
use crate::event::FlowIoRequest;
use crate::session::SessionId;

/// A flow instance identifier.
///
/// Assigned by the flow manager when a flow starts and stable across restarts;
/// the checkpoint store is keyed by it.
///
/// # Example
///
/// ```
/// use ledgerflow::FlowId;
///
/// let id = FlowId::random();
/// assert_ne!(id, FlowId::random());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Generate a fresh flow id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for FlowId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Identity of a node on the network.
///
/// Opaque to the runtime; the message bus resolves it to a transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identity from its well-known name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where a flow invocation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOrigin {
    /// Started through the node's API surface by a named actor.
    Rpc,
    /// Started by a counterparty's session initiation.
    Peer,
    /// Started by the node's own scheduler.
    Scheduled,
}

/// Context a flow was invoked with.
///
/// Persisted in the checkpoint so a resumed flow keeps the identity and
/// permissions of its original invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    /// How the flow was started.
    pub origin: InvocationOrigin,
    /// The actor (RPC user, peer identity, scheduler name) that started it.
    pub actor: String,
    /// Permissions granted to this invocation.
    pub permissions: BTreeSet<String>,
}

impl InvocationContext {
    /// Context for an API-started flow.
    pub fn rpc(actor: impl Into<String>) -> Self {
        Self {
            origin: InvocationOrigin::Rpc,
            actor: actor.into(),
            permissions: BTreeSet::new(),
        }
    }

    /// Context for a flow started by a counterparty initiation.
    pub fn peer(peer: &PeerId) -> Self {
        Self {
            origin: InvocationOrigin::Peer,
            actor: peer.to_string(),
            permissions: BTreeSet::new(),
        }
    }

    /// Grant a permission.
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }
}

/// What user code yields back to the worker at a pause point.
///
/// Each yield maps to exactly one runtime event; the worker posts it
/// synchronously and drives the transition before user code runs again.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowYield {
    /// Suspend on an I/O request. The worker serializes the flow's state
    /// machine as the continuation for the resulting checkpoint.
    Io {
        /// The request to suspend on.
        request: FlowIoRequest,
        /// Caller asserts replaying past this point is safe, so the
        /// checkpoint write may be skipped.
        may_skip_checkpoint: bool,
    },
    /// Enter a sub-flow frame.
    EnterSubFlow {
        /// Registered class name of the sub-flow.
        flow_class: String,
        /// Sub-flow version tag.
        version: u32,
        /// Whether the sub-flow's side effects are safe to replay.
        is_idempotent: bool,
        /// Whether the sub-flow participates in wait-timeout retries.
        is_timed: bool,
    },
    /// Leave the current sub-flow frame.
    LeaveSubFlow,
    /// Allocate a new session towards a counterparty.
    ///
    /// Resumes with [`ResumeValue::Session`]; no message is sent until the
    /// first I/O request that uses the session.
    InitiateSession {
        /// The counterparty node.
        peer: PeerId,
    },
    /// The flow has produced its result and is done.
    Finish(Vec<u8>),
}

impl FlowYield {
    /// Suspend on `request` with a mandatory checkpoint.
    pub fn io(request: FlowIoRequest) -> Self {
        FlowYield::Io {
            request,
            may_skip_checkpoint: false,
        }
    }

    /// Suspend on `request`, allowing the checkpoint write to be skipped.
    pub fn io_skipping_checkpoint(request: FlowIoRequest) -> Self {
        FlowYield::Io {
            request,
            may_skip_checkpoint: true,
        }
    }
}

/// The value user code is resumed with after a suspension.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeValue {
    /// First entry into the flow.
    Start,
    /// The previous request completed with nothing to return.
    Acknowledged,
    /// Payloads for a satisfied `Receive`/`SendAndReceive`, one per session.
    Payloads(BTreeMap<SessionId, Vec<u8>>),
    /// The session allocated by `InitiateSession`.
    Session(SessionId),
    /// Result of an asynchronous operation or ledger-commit wait.
    AsyncResult(Vec<u8>),
    /// The previous request failed; a catch handler may observe this and
    /// continue, otherwise return the error to fail the flow.
    Failed(FlowError),
}

/// Mutable per-flow context handed to user code on every advance.
///
/// Carries identity and invocation data, and collects the side-channel
/// declarations (progress, soft locks, timeouts) the runtime folds into the
/// flow's state after each yield.
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// This flow's id.
    pub flow_id: FlowId,
    /// The identity this node runs flows as.
    pub our_identity: PeerId,
    /// The invocation this flow was started with.
    pub invocation: InvocationContext,
    /// Session created by the counterparty initiation, for responder flows.
    pub initial_session: Option<SessionId>,
    progress: Option<String>,
    soft_lock_id: Option<Uuid>,
    timeout_override: Option<Duration>,
}

impl FlowContext {
    pub(crate) fn new(
        flow_id: FlowId,
        our_identity: PeerId,
        invocation: InvocationContext,
        initial_session: Option<SessionId>,
    ) -> Self {
        Self {
            flow_id,
            our_identity,
            invocation,
            initial_session,
            progress: None,
            soft_lock_id: None,
            timeout_override: None,
        }
    }

    /// Check that the invocation carries `permission`.
    pub fn check_flow_permission(&self, permission: &str) -> Result<(), FlowError> {
        if self.invocation.permissions.contains(permission) {
            Ok(())
        } else {
            Err(FlowError::PermissionDenied {
                permission: permission.to_owned(),
            })
        }
    }

    /// Record the human-readable step the flow is currently on.
    pub fn set_progress(&mut self, step: impl Into<String>) {
        self.progress = Some(step.into());
    }

    /// Declare that this flow holds soft locks under `lock_id`.
    ///
    /// Sticky: the first declaration wins and later calls are ignored. The
    /// lock id is released when the flow finishes or aborts.
    pub fn declare_soft_lock(&mut self, lock_id: Uuid) {
        if self.soft_lock_id.is_none() {
            self.soft_lock_id = Some(lock_id);
        }
    }

    /// Override the wait-timeout for a timed flow.
    pub fn update_timed_flow_timeout(&mut self, timeout: Duration) {
        self.timeout_override = Some(timeout);
    }

    pub(crate) fn progress(&self) -> Option<&str> {
        self.progress.as_deref()
    }

    pub(crate) fn soft_lock_id(&self) -> Option<Uuid> {
        self.soft_lock_id
    }

    pub(crate) fn timeout_override(&self) -> Option<Duration> {
        self.timeout_override
    }
}

/// User flow logic: an explicit, serializable state machine.
///
/// A flow is written as a resumable state machine rather than blocking code:
/// [`advance`](FlowLogic::advance) runs from the previous pause point to the
/// next [`FlowYield`], and the value of `self` *is* the continuation — the
/// runtime serializes it into the checkpoint at every suspension and
/// deserializes it on resume, so a flow survives process restarts mid-run.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// enum Payment {
///     Requesting { amount: u64 },
///     AwaitingReceipt { session: SessionId },
/// }
///
/// impl FlowLogic for Payment {
///     const NAME: &'static str = "payment";
///     const VERSION: u32 = 1;
///
///     fn start(_invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError> {
///         Ok(Payment::Requesting { amount: parse(args)? })
///     }
///
///     fn advance(&mut self, ctx: &mut FlowContext, resume: ResumeValue)
///         -> Result<FlowYield, FlowError>
///     {
///         match (&*self, resume) {
///             (Payment::Requesting { .. }, ResumeValue::Start) => {
///                 Ok(FlowYield::InitiateSession { peer: PeerId::new("bank") })
///             }
///             // ...
///         }
///     }
/// }
/// ```
pub trait FlowLogic: Serialize + DeserializeOwned + Send + 'static {
    /// Registered class name. Must be stable across deployments; peers use it
    /// to address session initiations.
    const NAME: &'static str;

    /// Flow version tag, checked against counterparty initiations.
    const VERSION: u32 = 1;

    /// Whether this flow's side effects are safe to replay.
    ///
    /// Idempotent flows skip intermediate checkpoint writes.
    const IDEMPOTENT: bool = false;

    /// Whether this flow declares a wait-timeout that triggers a safe-point
    /// retry when no progress is made.
    const TIMED: bool = false;

    /// Construct the flow's initial state.
    ///
    /// `args` is the start request payload for API-started flows, empty for
    /// responder flows (the initiation payload is delivered through the
    /// initial session instead).
    fn start(invocation: &InvocationContext, args: &[u8]) -> Result<Self, FlowError>;

    /// Run user code from the previous pause point to the next yield.
    ///
    /// Must not block: long waits are expressed as I/O requests so the
    /// runtime can park the flow and checkpoint it.
    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError>;
}

/// Object-safe face of [`FlowLogic`] used by the worker.
///
/// The blanket impl erases the concrete flow type; the registry recovers it
/// from the continuation blob on resume.
pub(crate) trait RunnableFlow: Send {
    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError>;

    /// Serialize the state machine into a continuation blob.
    fn encode(&self) -> crate::Result<Vec<u8>>;
}

impl<L: FlowLogic> RunnableFlow for L {
    fn advance(
        &mut self,
        ctx: &mut FlowContext,
        resume: ResumeValue,
    ) -> Result<FlowYield, FlowError> {
        FlowLogic::advance(self, ctx, resume)
    }

    fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
