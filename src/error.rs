//! Error types for each guardian stage.
//!
//! Failures inside one unit of work (a single agent call, a single file patch)
//! are converted into partial results by the owning stage. Only stage-level
//! failures reach [`GuardianError`], which the orchestrator catches once at the
//! session boundary.

use std::path::PathBuf;

/// Failure of a single reasoning-agent consultation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent timed out after {0}ms")]
    Timeout(u64),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed agent response: {0}")]
    Malformed(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
}

/// Failure of the patch generation stage as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("no reasoning agents configured")]
    NoAgents,
    #[error("all {attempted} agents failed: {}", .errors.join("; "))]
    AllAgentsFailed {
        attempted: usize,
        errors: Vec<String>,
    },
}

/// Failure of one file patch. Recorded on the application, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum PatchOpError {
    #[error("file already exists")]
    AlreadyExists,
    #[error("file not found")]
    NotFound,
    #[error("modify requires content or a line range")]
    NothingToApply,
    #[error("line range {start}-{end} out of bounds for {len} lines")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },
    #[error("path escapes project root")]
    OutsideRoot,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-level failure of the patch application engine.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("patch application not found: {0}")]
    NotFound(String),
    #[error("cannot roll back application {id} in status {status}")]
    InvalidStatus { id: String, status: String },
    #[error("backup directory missing: {}", .0.display())]
    BackupMissing(PathBuf),
    #[error("backup failed for {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("restore failed for {}: {source}", .path.display())]
    Restore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest error: {0}")]
    Manifest(String),
}

/// Failure of the build pipeline runner outside of a recorded step.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process supervisor error: {0}")]
    Supervisor(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level orchestration error.
#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("error event not found: {0}")]
    ErrorNotFound(String),
    #[error("session {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: String,
        expected: String,
    },
    #[error("session {0} has no patch application")]
    NoApplication(String),
    #[error("session {0} has no proposal to apply")]
    NoProposal(String),
    #[error("{failed} of {total} patches failed to apply")]
    PatchesFailed { failed: usize, total: usize },
    #[error("build step `{step}` failed: {reason}")]
    BuildFailed { step: String, reason: String },
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
