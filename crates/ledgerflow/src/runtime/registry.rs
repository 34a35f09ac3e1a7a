//! Flow registry: name/version dispatch without reflection.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, FlowState};
use crate::error::{Error, FlowError, Result};
use crate::flow::{FlowLogic, InvocationContext, RunnableFlow};

/// Type-erased registry entry for one flow class.
///
/// Captures the concrete [`FlowLogic`] type at registration so the manager
/// can construct new instances and decode continuation blobs by name alone.
pub(crate) trait FlowEntry: Send + Sync {
    /// Registered class name.
    fn name(&self) -> &'static str;

    /// Flow version tag.
    fn version(&self) -> u32;

    /// Whether the flow's side effects are safe to replay.
    fn is_idempotent(&self) -> bool;

    /// Whether the flow declares a wait-timeout.
    fn is_timed(&self) -> bool;

    /// Construct a fresh instance from a start request.
    fn construct(
        &self,
        invocation: &InvocationContext,
        args: &[u8],
    ) -> std::result::Result<Box<dyn RunnableFlow>, FlowError>;

    /// Decode a continuation blob back into a runnable state machine.
    fn decode(&self, blob: &[u8]) -> Result<Box<dyn RunnableFlow>>;
}

/// Typed entry that captures a concrete flow type at registration.
struct TypedFlowEntry<L: FlowLogic> {
    _marker: PhantomData<fn() -> L>,
}

impl<L: FlowLogic> FlowEntry for TypedFlowEntry<L> {
    fn name(&self) -> &'static str {
        L::NAME
    }

    fn version(&self) -> u32 {
        L::VERSION
    }

    fn is_idempotent(&self) -> bool {
        L::IDEMPOTENT
    }

    fn is_timed(&self) -> bool {
        L::TIMED
    }

    fn construct(
        &self,
        invocation: &InvocationContext,
        args: &[u8],
    ) -> std::result::Result<Box<dyn RunnableFlow>, FlowError> {
        Ok(Box::new(L::start(invocation, args)?))
    }

    fn decode(&self, blob: &[u8]) -> Result<Box<dyn RunnableFlow>> {
        let logic: L = serde_json::from_slice(blob)?;
        Ok(Box::new(logic))
    }
}

/// Registry mapping flow class names to their entries.
///
/// Built once at startup; the manager dispatches start requests and inbound
/// session initiations by name, and rebuilds state machines from checkpoints
/// through the same entries. No reflective lookup happens at runtime.
pub(crate) struct FlowRegistry {
    entries: HashMap<&'static str, Arc<dyn FlowEntry>>,
    /// Responder entries keyed by the initiating protocol they answer.
    responders: HashMap<String, Arc<dyn FlowEntry>>,
}

impl FlowRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            responders: HashMap::new(),
        }
    }

    /// Register a startable flow class. Returns `false` on duplicates.
    pub(crate) fn register<L: FlowLogic>(&mut self) -> bool {
        let entry: Arc<dyn FlowEntry> = Arc::new(TypedFlowEntry::<L> {
            _marker: PhantomData,
        });
        self.insert(entry)
    }

    /// Register a responder flow answering sessions initiated by
    /// `initiating_protocol`. Returns `false` on duplicates.
    pub(crate) fn register_responder<L: FlowLogic>(
        &mut self,
        initiating_protocol: impl Into<String>,
    ) -> bool {
        let entry: Arc<dyn FlowEntry> = Arc::new(TypedFlowEntry::<L> {
            _marker: PhantomData,
        });
        let initiating = initiating_protocol.into();
        if self.responders.contains_key(&initiating) {
            return false;
        }
        if !self.insert(Arc::clone(&entry)) {
            return false;
        }
        self.responders.insert(initiating, entry);
        true
    }

    fn insert(&mut self, entry: Arc<dyn FlowEntry>) -> bool {
        let name = entry.name();
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries.insert(name, entry);
        true
    }

    /// Look up a flow class by name.
    pub(crate) fn entry(&self, name: &str) -> Result<&Arc<dyn FlowEntry>> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownFlowType(name.to_owned()))
    }

    /// The responder entry for an inbound initiation, if one is registered.
    pub(crate) fn responder_for(&self, initiating_protocol: &str) -> Option<&Arc<dyn FlowEntry>> {
        self.responders.get(initiating_protocol)
    }

    /// Rebuild the user state machine a checkpoint was suspended with.
    pub(crate) fn rebuild(&self, checkpoint: &Checkpoint) -> Result<Box<dyn RunnableFlow>> {
        let root = checkpoint
            .root_frame()
            .ok_or_else(|| Error::CheckpointDecode {
                flow_id: checkpoint.flow_id,
                reason: "checkpoint has no root flow frame".into(),
            })?;
        let entry = self.entry(&root.flow_class)?;

        match &checkpoint.flow_state {
            FlowState::Unstarted => entry
                .construct(&checkpoint.invocation_context, &checkpoint.start_args)
                .map_err(|e| Error::CheckpointDecode {
                    flow_id: checkpoint.flow_id,
                    reason: format!("failed to construct unstarted flow: {e}"),
                }),
            FlowState::Started { continuation, .. } => {
                entry
                    .decode(continuation)
                    .map_err(|e| Error::CheckpointDecode {
                        flow_id: checkpoint.flow_id,
                        reason: format!("failed to decode continuation: {e}"),
                    })
            }
            _ => Err(Error::CheckpointDecode {
                flow_id: checkpoint.flow_id,
                reason: "flow is terminal".into(),
            }),
        }
    }

    /// Number of registered flow classes.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
