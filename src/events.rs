use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::monitor::ErrorEvent;
use crate::patcher::ApplicationResult;
use crate::pipeline::PipelineStatus;
use crate::session::SessionStatus;

/// Notifications published by the orchestrator for UI and ops consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardianEvent {
    Started,
    Stopped,
    ConfigUpdated {
        policy: PolicyConfig,
    },
    SessionStarted {
        session_id: String,
        error: ErrorEvent,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    PatchesGenerated {
        session_id: String,
        proposals: usize,
        confidence: u8,
        agreement_score: u8,
    },
    ApprovalRequired {
        session_id: String,
        description: String,
    },
    PatchesApplied {
        session_id: String,
        application_id: String,
        result: ApplicationResult,
    },
    RebuildCompleted {
        session_id: String,
        pipeline_id: String,
        status: PipelineStatus,
    },
    SessionCompleted {
        session_id: String,
        duration_ms: u64,
    },
    SessionFailed {
        session_id: String,
        reason: String,
    },
    PatchRejected {
        session_id: String,
        reason: String,
    },
    RolledBack {
        session_id: String,
        application_id: String,
    },
}

impl GuardianEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Started | Self::Stopped | Self::ConfigUpdated { .. } => None,
            Self::SessionStarted { session_id, .. }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::PatchesGenerated { session_id, .. }
            | Self::ApprovalRequired { session_id, .. }
            | Self::PatchesApplied { session_id, .. }
            | Self::RebuildCompleted { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::PatchRejected { session_id, .. }
            | Self::RolledBack { session_id, .. } => Some(session_id),
        }
    }
}
