//! Guardian sessions and the append-only JSONL session journal.
//!
//! A session ties one [`ErrorEvent`] to everything the guardian did about it.
//! Archived sessions are written one per line:
//! ```jsonl
//! {"id":"5f0c...","status":"completed","error":{...},"started_at":"2024-01-01T00:00:00Z",...}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use uuid::Uuid;

use crate::monitor::ErrorEvent;
use crate::patcher::PatchApplication;
use crate::pipeline::BuildPipeline;
use crate::proposal::ProposalComparison;

/// Lifecycle of one healing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Analyzing,
    GeneratingPatch,
    ApplyingPatch,
    Rebuilding,
    Completed,
    Failed,
    RolledBack,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analyzing => write!(f, "analyzing"),
            Self::GeneratingPatch => write!(f, "generating_patch"),
            Self::ApplyingPatch => write!(f, "applying_patch"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianSession {
    pub id: String,
    pub error: ErrorEvent,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ProposalComparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<PatchApplication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<BuildPipeline>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub requires_manual_intervention: bool,
}

impl GuardianSession {
    pub fn new(error: ErrorEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            error,
            status: SessionStatus::Analyzing,
            comparison: None,
            application: None,
            pipeline: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            failure_reason: None,
            requires_manual_intervention: false,
        }
    }

    /// Stamp end time and duration.
    pub fn finish(&mut self, status: SessionStatus) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }

    /// Terminal failure that needs an operator
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.requires_manual_intervention = true;
        self.finish(SessionStatus::Failed);
    }
}

/// Append-only JSONL file of archived sessions.
pub struct SessionJournal {
    path: PathBuf,
}

impl SessionJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a single session as one line.
    pub fn append(&self, session: &GuardianSession) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Load every archived session. A missing file is an empty journal.
    pub fn load_all(&self) -> std::io::Result<Vec<GuardianSession>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let reader = BufReader::new(file);
        let mut sessions = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let session: GuardianSession = serde_json::from_str(trimmed)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            sessions.push(session);
        }
        Ok(sessions)
    }
}
