use async_trait::async_trait;
use guardian_agent::config::{PipelineConfig, PolicyConfig, PolicyUpdate, ProposalConfig};
use guardian_agent::error::{AgentError, PipelineError};
use guardian_agent::events::GuardianEvent;
use guardian_agent::llm::ReasoningAgent;
use guardian_agent::monitor::{ErrorKind, ReportOverrides, Severity};
use guardian_agent::patcher::{ApplicationStatus, PatchEngine};
use guardian_agent::pipeline::{BuildPipelineRunner, CommandOutput, CommandRunner};
use guardian_agent::proposal::{FilePatch, PatchAction, PatchProposalService, Solution};
use guardian_agent::session::SessionStatus;
use guardian_agent::supervisor::ProcessSupervisor;
use guardian_agent::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Agent that always answers with the same text
struct ScriptedAgent {
    reply: Result<String, String>,
}

#[async_trait]
impl ReasoningAgent for ScriptedAgent {
    fn id(&self) -> String {
        "scripted".to_string()
    }

    async fn consult(&self, _prompt: &str) -> Result<String, AgentError> {
        self.reply.clone().map_err(AgentError::Unavailable)
    }
}

struct StubRunner {
    fail: bool,
}

#[async_trait]
impl CommandRunner for StubRunner {
    async fn run(&self, command: &str, _: &Path, _: usize) -> Result<CommandOutput, PipelineError> {
        Ok(CommandOutput {
            success: !self.fail,
            exit_code: Some(if self.fail { 1 } else { 0 }),
            output: format!("{} output", command),
        })
    }
}

struct StubSupervisor;

#[async_trait]
impl ProcessSupervisor for StubSupervisor {
    async fn start(&self) -> Result<u32, PipelineError> {
        Ok(4242)
    }
    async fn stop(&self, _: Duration) -> Result<(), PipelineError> {
        Ok(())
    }
    async fn is_running(&self) -> bool {
        false
    }
}

fn build_guardian(
    reply: Result<&str, &str>,
    build_fails: bool,
    policy: PolicyConfig,
) -> (Arc<Guardian>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let agent: Arc<dyn ReasoningAgent> = Arc::new(ScriptedAgent {
        reply: reply.map(str::to_string).map_err(str::to_string),
    });
    let proposals = PatchProposalService::new(vec![agent], ProposalConfig::default(), root.clone());
    let patcher = Arc::new(PatchEngine::new(root.clone(), root.join(".guardian/backups")));
    let pipeline = Arc::new(BuildPipelineRunner::new(
        PipelineConfig {
            working_dir: root,
            grace_period_ms: 0,
            settle_delay_ms: 0,
            ..Default::default()
        },
        Arc::new(StubRunner { fail: build_fails }),
        Arc::new(StubSupervisor),
    ));
    let guardian = Guardian::new(
        policy,
        Arc::new(ErrorMonitor::default()),
        proposals,
        patcher,
        pipeline,
    );
    (Arc::new(guardian), dir)
}

fn unattended() -> PolicyConfig {
    PolicyConfig {
        auto_apply: true,
        require_approval: false,
        cooldown_secs: 0,
        severity_threshold: Severity::Medium,
        ..Default::default()
    }
}

/// Wait for the first event that `pick` accepts
async fn wait_for<T>(
    rx: &mut broadcast::Receiver<GuardianEvent>,
    mut pick: impl FnMut(&GuardianEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .unwrap()
}

/// Missing module log line → dependency/critical event → session completes
/// with the manual-review fallback when the agent reply has no JSON.
#[tokio::test]
async fn test_missing_module_completes_with_fallback_solution() {
    let (guardian, _dir) = build_guardian(Ok("I am not sure what went wrong."), false, unattended());
    let mut events = guardian.subscribe();
    guardian.start(None);

    guardian
        .monitor()
        .process_text("Error: Cannot find module 'left-pad'");

    let error = wait_for(&mut events, |e| match e {
        GuardianEvent::SessionStarted { error, .. } => Some(error.clone()),
        _ => None,
    })
    .await;
    assert_eq!(error.kind, ErrorKind::Dependency);
    assert_eq!(error.severity, Severity::Critical);

    let session_id = wait_for(&mut events, |e| match e {
        GuardianEvent::SessionCompleted { session_id, .. } => Some(session_id.clone()),
        _ => None,
    })
    .await;

    let session = guardian.get_session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let comparison = session.comparison.unwrap();
    assert!(comparison.recommended.degraded);
    assert!(comparison.merged.solution.patches.is_empty());
    assert!(session.pipeline.unwrap().steps.is_empty());
    guardian.stop();
}

/// Same scenario with a failing build: the session fails deterministically.
#[tokio::test]
async fn test_missing_module_fails_when_build_fails() {
    let reply = r#"```json
{"description":"install it","rootCause":"left-pad is not in package.json dependencies",
 "steps":["add dependency"],
 "patches":[{"file":"package.json","action":"create","content":"{\"dependencies\":{\"left-pad\":\"1.3.0\"}}","description":"manifest"}],
 "needsReinstall":true,"needsRebuild":true,"needsRestart":true}
```"#;
    let (guardian, dir) = build_guardian(Ok(reply), true, unattended());
    let mut events = guardian.subscribe();
    guardian.start(None);

    guardian
        .monitor()
        .process_text("Error: Cannot find module 'left-pad'");

    let (session_id, reason) = wait_for(&mut events, |e| match e {
        GuardianEvent::SessionFailed { session_id, reason } => {
            Some((session_id.clone(), reason.clone()))
        }
        _ => None,
    })
    .await;
    assert!(reason.contains("install_dependencies"));

    let session = guardian.get_session(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.requires_manual_intervention);
    assert_eq!(session.pipeline.unwrap().steps.len(), 1);

    // the failed session's patch can still be rolled back
    assert!(dir.path().join("package.json").exists());
    guardian.rollback(&session_id).await.unwrap();
    assert!(!dir.path().join("package.json").exists());
    guardian.stop();
}

/// Two identical errors one second apart produce one event and one session.
#[tokio::test]
async fn test_duplicate_errors_create_one_session() {
    let policy = PolicyConfig {
        cooldown_secs: 0,
        ..Default::default()
    };
    let (guardian, _dir) = build_guardian(Ok("{}"), false, policy);
    let mut events = guardian.subscribe();
    guardian.start(None);

    guardian.monitor().process_text("TypeError: user.wallet is undefined");
    tokio::time::sleep(Duration::from_secs(1)).await;
    guardian.monitor().process_text("TypeError: user.wallet is undefined");

    wait_for(&mut events, |e| match e {
        GuardianEvent::ApprovalRequired { .. } => Some(()),
        _ => None,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(guardian.monitor().history().len(), 1);
    assert_eq!(guardian.active_sessions().await.len(), 1);
    assert_eq!(guardian.stats().sessions_started, 1);
    guardian.stop();
}

/// Rejecting a paused session archives it as failed.
#[tokio::test]
async fn test_reject_paused_session() {
    let (guardian, _dir) = build_guardian(Ok("{}"), false, PolicyConfig::default());
    let error = guardian
        .monitor()
        .report_error("Unhandled rejection in /api/transfer", ReportOverrides::default())
        .unwrap();

    let paused = guardian.handle_error(error, false).await.unwrap();
    assert_eq!(paused.status, SessionStatus::GeneratingPatch);

    guardian
        .reject_patch(&paused.id, Some("not safe".to_string()))
        .await
        .unwrap();

    assert!(guardian.active_sessions().await.is_empty());
    let history = guardian.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SessionStatus::Failed);
    assert!(history[0].requires_manual_intervention);
    assert_eq!(history[0].failure_reason.as_deref(), Some("not safe"));
}

/// Best-effort apply: the second of three patches fails, the others land.
#[tokio::test]
async fn test_partial_patch_application() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.ts"), "export const a = 1;\n").unwrap();
    let engine = PatchEngine::new(dir.path().to_path_buf(), dir.path().join("backups"));

    let patch = |file: &str, action, content: Option<&str>| FilePatch {
        file: file.to_string(),
        action,
        content: content.map(str::to_string),
        line_start: None,
        line_end: None,
        description: String::new(),
    };
    let solution = Solution {
        patches: vec![
            patch("a.ts", PatchAction::Modify, Some("export const a = 2;\n")),
            patch("missing.ts", PatchAction::Modify, Some("x")),
            patch("b.ts", PatchAction::Create, Some("export const b = 1;\n")),
        ],
        ..Default::default()
    };

    let application = engine.apply_patches(&solution).await.unwrap();
    let result = application.result.unwrap();
    assert!(!result.success);
    assert_eq!(application.status, ApplicationStatus::Failed);
    assert_eq!(result.applied_patches.len(), 2);
    assert_eq!(result.failed_patches.len(), 1);
    assert_eq!(result.failed_patches[0].file, "missing.ts");

    let rolled = engine.rollback(&application.id).await.unwrap();
    assert_eq!(rolled.status, ApplicationStatus::RolledBack);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.ts")).unwrap(),
        "export const a = 1;\n"
    );
    assert!(!dir.path().join("b.ts").exists());
}

/// Low severity events never open a session.
#[tokio::test]
async fn test_below_threshold_is_ignored() {
    let (guardian, _dir) = build_guardian(Ok("{}"), false, unattended());
    guardian.start(None);

    guardian.monitor().report_error(
        "cache miss ratio high",
        ReportOverrides {
            severity: Some(Severity::Low),
            ..Default::default()
        },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(guardian.active_sessions().await.is_empty());
    assert!(guardian.history().await.is_empty());
    assert_eq!(guardian.stats().sessions_started, 0);
    assert_eq!(guardian.stats().events_dropped, 1);
    guardian.stop();
}

/// A policy passed to start is in force before the first event arrives.
#[tokio::test]
async fn test_start_with_policy_update() {
    let (guardian, _dir) = build_guardian(Ok("{}"), false, unattended());
    let mut events = guardian.subscribe();
    guardian.start(Some(PolicyUpdate {
        severity_threshold: Some(Severity::Critical),
        ..Default::default()
    }));

    let policy = wait_for(&mut events, |e| match e {
        GuardianEvent::ConfigUpdated { policy } => Some(policy.clone()),
        GuardianEvent::Started => panic!("started before the policy was applied"),
        _ => None,
    })
    .await;
    assert_eq!(policy.severity_threshold, Severity::Critical);
    wait_for(&mut events, |e| matches!(e, GuardianEvent::Started).then_some(())).await;

    guardian
        .monitor()
        .process_text("TypeError: user.wallet is undefined");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(guardian.active_sessions().await.is_empty());
    assert_eq!(guardian.stats().sessions_started, 0);
    guardian.stop();
}

/// Configuration round trip through TOML.
#[test]
fn test_config_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guardian.toml");
    std::fs::write(
        &path,
        r#"
            [policy]
            require_approval = false
            severity_threshold = "critical"

            [[proposals.agents]]
            id = "primary"
            base_url = "https://api.example.com"
            api_key_env = "PRIMARY_KEY"
            model = "model-a"
        "#,
    )
    .unwrap();

    let config = GuardianConfig::from_file(&path).unwrap();
    assert!(!config.policy.require_approval);
    assert_eq!(config.policy.severity_threshold, Severity::Critical);
    assert_eq!(config.proposals.agents.len(), 1);
    assert_eq!(config.proposals.agents[0].max_tokens, 4096);
}
