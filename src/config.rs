use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;
use crate::monitor::Severity;

/// Guardian configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// Admission and approval policy (live-mutable)
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Error monitor buffers and sources
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Reasoning agents and context gathering
    #[serde(default)]
    pub proposals: ProposalConfig,

    /// Patch application engine paths
    #[serde(default)]
    pub patcher: PatcherConfig,

    /// Rebuild and restart commands
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Optional JSONL journal of archived sessions
    #[serde(default)]
    pub history_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default = "default_true")]
    pub require_approval: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_severity_threshold")]
    pub severity_threshold: Severity,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_apply: false,
            require_approval: true,
            max_retries: default_max_retries(),
            cooldown_secs: default_cooldown_secs(),
            severity_threshold: default_severity_threshold(),
        }
    }
}

impl PolicyConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Partial policy update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub auto_apply: Option<bool>,
    pub require_approval: Option<bool>,
    pub max_retries: Option<u32>,
    pub cooldown_secs: Option<u64>,
    pub severity_threshold: Option<Severity>,
}

impl PolicyUpdate {
    pub fn apply_to(&self, policy: &mut PolicyConfig) {
        if let Some(v) = self.auto_apply {
            policy.auto_apply = v;
        }
        if let Some(v) = self.require_approval {
            policy.require_approval = v;
        }
        if let Some(v) = self.max_retries {
            policy.max_retries = v;
        }
        if let Some(v) = self.cooldown_secs {
            policy.cooldown_secs = v;
        }
        if let Some(v) = self.severity_threshold {
            policy.severity_threshold = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_log_buffer_limit")]
    pub log_buffer_limit: usize,
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
    #[serde(default = "default_dedupe_lookback")]
    pub dedupe_lookback: usize,
    /// Log file to tail, if any
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_tail_interval_ms")]
    pub tail_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            log_buffer_limit: default_log_buffer_limit(),
            dedupe_window_secs: default_dedupe_window_secs(),
            dedupe_lookback: default_dedupe_lookback(),
            log_file: None,
            tail_interval_ms: default_tail_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConfig {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Lines of source shown either side of the failing line
    #[serde(default = "default_context_radius")]
    pub context_radius: usize,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    #[serde(default = "default_compiler_config_file")]
    pub compiler_config_file: String,
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            agent_timeout_secs: default_agent_timeout_secs(),
            context_radius: default_context_radius(),
            manifest_file: default_manifest_file(),
            compiler_config_file: default_compiler_config_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherConfig {
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            backup_root: default_backup_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_project_root")]
    pub working_dir: PathBuf,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_typecheck_command")]
    pub typecheck_command: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_dir: default_project_root(),
            install_command: default_install_command(),
            typecheck_command: default_typecheck_command(),
            build_command: default_build_command(),
            start_command: default_start_command(),
            grace_period_ms: default_grace_period_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            output_cap_bytes: default_output_cap_bytes(),
        }
    }
}

impl PipelineConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_severity_threshold() -> Severity {
    Severity::Medium
}

fn default_history_limit() -> usize {
    100
}

fn default_log_buffer_limit() -> usize {
    1000
}

fn default_dedupe_window_secs() -> u64 {
    5
}

fn default_dedupe_lookback() -> usize {
    10
}

fn default_tail_interval_ms() -> u64 {
    500
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_agent_timeout_secs() -> u64 {
    60
}

fn default_context_radius() -> usize {
    10
}

fn default_manifest_file() -> String {
    "package.json".to_string()
}

fn default_compiler_config_file() -> String {
    "tsconfig.json".to_string()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from(".guardian/backups")
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_typecheck_command() -> String {
    "npx tsc --noEmit".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_start_command() -> String {
    "npm start".to_string()
}

fn default_grace_period_ms() -> u64 {
    2000
}

fn default_settle_delay_ms() -> u64 {
    3000
}

fn default_output_cap_bytes() -> usize {
    10 * 1024 * 1024
}

impl GuardianConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GuardianConfig = toml::from_str(&content)?;
        config.validate()?;
        info!(
            agents = config.proposals.agents.len(),
            project_root = %config.patcher.project_root.display(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Create a configuration rooted at the given project directory
    pub fn for_project(project_root: PathBuf) -> Self {
        Self {
            patcher: PatcherConfig {
                backup_root: project_root.join(".guardian").join("backups"),
                project_root: project_root.clone(),
            },
            pipeline: PipelineConfig {
                working_dir: project_root,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.max_retries == 0 {
            return Err(ConfigError::Invalid("policy.max_retries must be at least 1".into()));
        }
        if self.pipeline.output_cap_bytes == 0 {
            return Err(ConfigError::Invalid("pipeline.output_cap_bytes must be positive".into()));
        }
        for (name, cmd) in [
            ("install_command", &self.pipeline.install_command),
            ("typecheck_command", &self.pipeline.typecheck_command),
            ("build_command", &self.pipeline.build_command),
            ("start_command", &self.pipeline.start_command),
        ] {
            if cmd.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("pipeline.{} is empty", name)));
            }
        }
        Ok(())
    }
}
