//! Flow hospital collaborator interface.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use crate::checkpoint::CheckpointView;
use crate::error::FlowError;
use crate::flow::FlowId;

/// Quarantine for errored flows.
///
/// The runtime admits a flow when it fails fatally or exhausts its safe-point
/// retries; the checkpoint stays in the store for operator attention. A
/// discharged flow is one whose later retry recovered.
#[async_trait]
pub trait Hospital: Send + Sync + 'static {
    /// Admit an errored flow with its terminal error and checkpoint view.
    async fn admit(&self, flow_id: FlowId, reason: FlowError, checkpoint: CheckpointView);

    /// Note that a previously admitted flow recovered.
    async fn discharge(&self, flow_id: FlowId);
}

/// One recorded admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// The admitted flow.
    pub flow_id: FlowId,
    /// Why it was admitted.
    pub reason: FlowError,
    /// Checkpoint view at admission time.
    pub checkpoint: CheckpointView,
}

/// Hospital that records admissions and discharges for inspection.
#[derive(Clone, Default)]
pub struct RecordingHospital {
    admissions: Arc<Mutex<Vec<Admission>>>,
    discharges: Arc<Mutex<Vec<FlowId>>>,
}

impl RecordingHospital {
    /// Create an empty hospital.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admissions so far, in admission order.
    pub fn admissions(&self) -> Vec<Admission> {
        self.admissions.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Discharges so far, in discharge order.
    pub fn discharges(&self) -> Vec<FlowId> {
        self.discharges.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Hospital for RecordingHospital {
    async fn admit(&self, flow_id: FlowId, reason: FlowError, checkpoint: CheckpointView) {
        warn!(flow_id = %flow_id, reason = %reason, "Flow admitted to hospital");
        self.admissions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Admission {
                flow_id,
                reason,
                checkpoint,
            });
    }

    async fn discharge(&self, flow_id: FlowId) {
        self.discharges
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(flow_id);
    }
}
