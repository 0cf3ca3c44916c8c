//! Ordered rebuild/restart pipeline.
//!
//! Steps run strictly in the order they are appended. The first failing step
//! aborts the pipeline; steps that were not requested are never recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub name: String,
    pub command: String,
    pub status: StepStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPipeline {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub steps: Vec<BuildStep>,
    pub status: PipelineStatus,
    pub total_duration_ms: u64,
}

impl BuildPipeline {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            steps: Vec::new(),
            status: PipelineStatus::Pending,
            total_duration_ms: 0,
        }
    }

    pub fn failed_step(&self) -> Option<&BuildStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

/// Captured result of one shell command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Executes shell commands for pipeline steps
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        output_cap: usize,
    ) -> Result<CommandOutput, PipelineError>;
}

/// Runs commands through `sh -c`, capturing stdout then stderr
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

/// Read up to `cap` bytes, then drain the rest so the child never blocks on a full pipe
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut reader).take(cap as u64).read_to_end(&mut buf).await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(buf)
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        output_cap: usize,
    ) -> Result<CommandOutput, PipelineError> {
        let spawn_err = |source| PipelineError::Spawn {
            command: command.to_string(),
            source,
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(
            async {
                match stdout {
                    Some(s) => read_capped(s, output_cap).await,
                    None => Ok(Vec::new()),
                }
            },
            async {
                match stderr {
                    Some(s) => read_capped(s, output_cap).await,
                    None => Ok(Vec::new()),
                }
            }
        );
        let status = child.wait().await.map_err(spawn_err)?;

        let mut combined = out.map_err(spawn_err)?;
        combined.extend(err.map_err(spawn_err)?);
        combined.truncate(output_cap);

        Ok(CommandOutput {
            success: status.success(),
            exit_code: status.code(),
            output: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Install,
    TypeCheck,
    Build,
    Restart,
}

impl StepKind {
    fn name(self) -> &'static str {
        match self {
            Self::Install => "install_dependencies",
            Self::TypeCheck => "type_check",
            Self::Build => "build",
            Self::Restart => "restart_server",
        }
    }
}

/// Runs rebuild pipelines and owns restarts of the managed server
pub struct BuildPipelineRunner {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    supervisor: Arc<dyn ProcessSupervisor>,
    /// Serialises pipelines and restarts against the single server handle
    lock: Mutex<()>,
}

impl BuildPipelineRunner {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            runner,
            supervisor,
            lock: Mutex::new(()),
        }
    }

    fn command_for(&self, kind: StepKind) -> &str {
        match kind {
            StepKind::Install => &self.config.install_command,
            StepKind::TypeCheck => &self.config.typecheck_command,
            StepKind::Build => &self.config.build_command,
            StepKind::Restart => &self.config.start_command,
        }
    }

    /// Run the requested steps in fixed order. Rebuild always means
    /// type-check followed by build.
    pub async fn execute_pipeline(
        &self,
        needs_reinstall: bool,
        needs_rebuild: bool,
        needs_restart: bool,
    ) -> BuildPipeline {
        let _serial = self.lock.lock().await;

        let mut plan = Vec::new();
        if needs_reinstall {
            plan.push(StepKind::Install);
        }
        if needs_rebuild {
            plan.push(StepKind::TypeCheck);
            plan.push(StepKind::Build);
        }
        if needs_restart {
            plan.push(StepKind::Restart);
        }

        let mut pipeline = BuildPipeline::new();
        pipeline.status = PipelineStatus::Running;
        let started = Instant::now();
        info!(pipeline_id = %pipeline.id, steps = plan.len(), "build pipeline started");

        for kind in plan {
            pipeline.steps.push(BuildStep {
                name: kind.name().to_string(),
                command: self.command_for(kind).to_string(),
                status: StepStatus::Running,
                output: String::new(),
                error: None,
                duration_ms: 0,
            });

            let step_started = Instant::now();
            let outcome = match kind {
                StepKind::Restart => self
                    .restart_server()
                    .await
                    .map(|pid| (true, format!("server started (pid {})", pid), None)),
                _ => self
                    .runner
                    .run(
                        self.command_for(kind),
                        &self.config.working_dir,
                        self.config.output_cap_bytes,
                    )
                    .await
                    .map(|out| {
                        let reason = (!out.success).then(|| match out.exit_code {
                            Some(code) => format!("exited with code {}", code),
                            None => "terminated by signal".to_string(),
                        });
                        (out.success, out.output, reason)
                    }),
            };

            let Some(step) = pipeline.steps.last_mut() else {
                break;
            };
            step.duration_ms = step_started.elapsed().as_millis() as u64;
            match outcome {
                Ok((true, output, _)) => {
                    step.status = StepStatus::Success;
                    step.output = output;
                    info!(step = %step.name, duration_ms = step.duration_ms, "build step succeeded");
                }
                Ok((false, output, reason)) => {
                    step.status = StepStatus::Failed;
                    step.output = output;
                    step.error = reason;
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(e.to_string());
                }
            }

            if step.status == StepStatus::Failed {
                error!(
                    step = %step.name,
                    error = step.error.as_deref().unwrap_or("unknown"),
                    "build step failed, aborting pipeline"
                );
                pipeline.status = PipelineStatus::Failed;
                break;
            }
        }

        if pipeline.status == PipelineStatus::Running {
            pipeline.status = PipelineStatus::Success;
        }
        pipeline.total_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            pipeline_id = %pipeline.id,
            status = ?pipeline.status,
            duration_ms = pipeline.total_duration_ms,
            "build pipeline finished"
        );
        pipeline
    }

    /// Terminate any previous server, spawn a new one, then wait for it to settle.
    async fn restart_server(&self) -> Result<u32, PipelineError> {
        if self.supervisor.is_running().await {
            info!("stopping previous server process");
            self.supervisor.stop(self.config.grace_period()).await?;
        }
        let pid = self.supervisor.start().await?;
        tokio::time::sleep(self.config.settle_delay()).await;
        Ok(pid)
    }

    /// Operator restart outside of any session or pipeline bookkeeping
    pub async fn quick_restart(&self) -> Result<u32, PipelineError> {
        let _serial = self.lock.lock().await;
        info!("quick restart requested");
        self.restart_server().await
    }
}
