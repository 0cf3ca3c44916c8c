//! Guardian orchestrator: the session state machine.
//!
//! ```text
//! analyzing -> generating_patch -> [approval] -> applying_patch -> rebuilding -> completed
//!                  \________________________________\_______________\-> failed
//! ```
//! Any non-terminal session may also end `rolled_back`. The orchestrator owns
//! all cross-component sequencing; each stage finishes before the next begins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionGate;
use crate::config::{GuardianConfig, PolicyConfig, PolicyUpdate};
use crate::error::GuardianError;
use crate::events::GuardianEvent;
use crate::llm::ReasoningAgent;
use crate::metrics::GuardianStats;
use crate::monitor::{ErrorEvent, ErrorMonitor};
use crate::patcher::PatchEngine;
use crate::pipeline::{BuildPipelineRunner, PipelineStatus, ShellRunner};
use crate::proposal::PatchProposalService;
use crate::session::{GuardianSession, SessionJournal, SessionStatus};
use crate::supervisor::ShellSupervisor;

const EVENT_CAPACITY: usize = 256;

pub struct Guardian {
    monitor: Arc<ErrorMonitor>,
    proposals: PatchProposalService,
    patcher: Arc<PatchEngine>,
    pipeline: Arc<BuildPipelineRunner>,
    policy: Mutex<PolicyConfig>,
    gate: AdmissionGate,
    stats: Mutex<GuardianStats>,
    active: RwLock<HashMap<String, GuardianSession>>,
    history: RwLock<Vec<GuardianSession>>,
    journal: Option<SessionJournal>,
    events: broadcast::Sender<GuardianEvent>,
    running: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Guardian {
    pub fn new(
        policy: PolicyConfig,
        monitor: Arc<ErrorMonitor>,
        proposals: PatchProposalService,
        patcher: Arc<PatchEngine>,
        pipeline: Arc<BuildPipelineRunner>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            monitor,
            proposals,
            patcher,
            pipeline,
            policy: Mutex::new(policy),
            gate: AdmissionGate::new(),
            stats: Mutex::new(GuardianStats::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            journal: None,
            events,
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Wire every component from configuration, using shell execution for
    /// build steps and the managed server.
    pub fn from_config(config: &GuardianConfig, agents: Vec<Arc<dyn ReasoningAgent>>) -> Self {
        let monitor = Arc::new(ErrorMonitor::new(config.monitor.clone()));
        let proposals = PatchProposalService::new(
            agents,
            config.proposals.clone(),
            config.patcher.project_root.clone(),
        );
        let patcher = Arc::new(PatchEngine::new(
            config.patcher.project_root.clone(),
            config.patcher.backup_root.clone(),
        ));
        let supervisor = ShellSupervisor::new(
            config.pipeline.start_command.clone(),
            config.pipeline.working_dir.clone(),
        )
        .with_output_sink(Arc::clone(&monitor));
        let pipeline = Arc::new(BuildPipelineRunner::new(
            config.pipeline.clone(),
            Arc::new(ShellRunner),
            Arc::new(supervisor),
        ));

        let guardian = Self::new(config.policy.clone(), monitor, proposals, patcher, pipeline);
        match &config.history_file {
            Some(path) => guardian.with_journal(SessionJournal::new(path.clone())),
            None => guardian,
        }
    }

    /// Persist archived sessions, preloading whatever the journal already holds.
    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        match journal.load_all() {
            Ok(previous) => {
                info!(path = %journal.path().display(), sessions = previous.len(), "session journal loaded");
                self.history = RwLock::new(previous);
            }
            Err(e) => warn!(path = %journal.path().display(), error = %e, "session journal unreadable, starting empty"),
        }
        self.journal = Some(journal);
        self
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardianEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: GuardianEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the monitor and react to every event it publishes. A policy
    /// update, when given, is merged before the listener begins. Starting
    /// twice only applies the update.
    pub fn start(self: &Arc<Self>, policy: Option<PolicyUpdate>) {
        if let Some(update) = policy {
            self.update_config(update);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            info!("guardian already running");
            return;
        }
        self.monitor.start();

        let mut rx = self.monitor.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(guardian) = weak.upgrade() else {
                            break;
                        };
                        guardian.on_error_detected(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "guardian lagged behind error monitor");
                        if let Some(guardian) = weak.upgrade() {
                            lock(&guardian.stats).events_dropped += skipped;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("guardian listener exited");
        });
        *lock(&self.listener) = Some(handle);

        let policy = self.config();
        info!(
            threshold = %policy.severity_threshold,
            auto_apply = policy.auto_apply,
            require_approval = policy.require_approval,
            "guardian started"
        );
        self.emit(GuardianEvent::Started);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("guardian already stopped");
            return;
        }
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
        self.monitor.stop();
        info!("guardian stopped");
        self.emit(GuardianEvent::Stopped);
    }

    pub fn config(&self) -> PolicyConfig {
        lock(&self.policy).clone()
    }

    /// Apply a partial policy update and return the resulting policy.
    pub fn update_config(&self, update: PolicyUpdate) -> PolicyConfig {
        let policy = {
            let mut policy = lock(&self.policy);
            update.apply_to(&mut policy);
            policy.clone()
        };
        info!(?update, "guardian policy updated");
        self.emit(GuardianEvent::ConfigUpdated {
            policy: policy.clone(),
        });
        policy
    }

    /// Restart the managed server outside of any session.
    pub async fn restart_server(&self) -> Result<u32, GuardianError> {
        let pid = self.pipeline.quick_restart().await?;
        info!(pid, "managed server restarted");
        Ok(pid)
    }

    pub fn stats(&self) -> GuardianStats {
        lock(&self.stats).clone()
    }

    /// In-flight sessions, oldest first
    pub async fn active_sessions(&self) -> Vec<GuardianSession> {
        let mut sessions: Vec<GuardianSession> =
            self.active.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub async fn history(&self) -> Vec<GuardianSession> {
        self.history.read().await.clone()
    }

    pub async fn get_session(&self, id: &str) -> Option<GuardianSession> {
        if let Some(session) = self.active.read().await.get(id) {
            return Some(session.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
    }

    async fn on_error_detected(self: &Arc<Self>, event: ErrorEvent) {
        if !self.is_running() {
            return;
        }
        let policy = self.config();
        let in_flight = self
            .active
            .read()
            .await
            .values()
            .any(|s| s.error.message == event.message);

        if let Err(rejection) = self.gate.check(&event, &policy, in_flight) {
            info!(error_id = %event.id, reason = %rejection, "error not admitted");
            lock(&self.stats).record_event(false);
            return;
        }
        lock(&self.stats).record_event(true);

        // Register before spawning so a repeat of the same message sees it in flight.
        let session_id = self.begin_session(event).await;
        let guardian = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = guardian.drive(&session_id, policy.auto_apply).await {
                warn!(session_id = %session_id, error = %e, "session ended abnormally");
            }
        });
    }

    /// Run one error through the full session lifecycle.
    ///
    /// Returns the session as it stands when the flow stops: paused in
    /// `generating_patch` awaiting approval, or terminal.
    pub async fn handle_error(
        &self,
        error: ErrorEvent,
        auto_apply: bool,
    ) -> Result<GuardianSession, GuardianError> {
        let session_id = self.begin_session(error).await;
        self.drive(&session_id, auto_apply).await
    }

    /// Start a session for an error already in the monitor history,
    /// bypassing admission.
    pub async fn trigger(&self, error_id: &str) -> Result<GuardianSession, GuardianError> {
        let error = self
            .monitor
            .find_event(error_id)
            .ok_or_else(|| GuardianError::ErrorNotFound(error_id.to_string()))?;
        info!(error_id = %error_id, "manual trigger");
        self.handle_error(error, true).await
    }

    async fn begin_session(&self, error: ErrorEvent) -> String {
        let session = GuardianSession::new(error.clone());
        let session_id = session.id.clone();
        self.active
            .write()
            .await
            .insert(session_id.clone(), session);
        lock(&self.stats).record_started();

        info!(
            session_id = %session_id,
            error_id = %error.id,
            error_kind = ?error.kind,
            severity = %error.severity,
            "session started"
        );
        self.emit(GuardianEvent::SessionStarted {
            session_id: session_id.clone(),
            error,
        });
        session_id
    }

    async fn drive(
        &self,
        session_id: &str,
        auto_apply: bool,
    ) -> Result<GuardianSession, GuardianError> {
        let error = self
            .transition(session_id, None, SessionStatus::GeneratingPatch)
            .await?
            .error;

        let comparison = match self.proposals.generate_patches(&error).await {
            Ok(comparison) => comparison,
            Err(e) => return self.fail_session(session_id, e.into()).await,
        };

        let (proposals, confidence, agreement, description) = (
            comparison.proposals.len(),
            comparison.merged.confidence,
            comparison.agreement_score,
            comparison.merged.solution.description.clone(),
        );
        self.update_session(session_id, |s| s.comparison = Some(comparison))
            .await?;
        info!(
            session_id = %session_id,
            proposals,
            confidence,
            agreement_score = agreement,
            "patches generated"
        );
        self.emit(GuardianEvent::PatchesGenerated {
            session_id: session_id.to_string(),
            proposals,
            confidence,
            agreement_score: agreement,
        });

        if self.config().require_approval && !auto_apply {
            info!(session_id = %session_id, "awaiting approval");
            self.emit(GuardianEvent::ApprovalRequired {
                session_id: session_id.to_string(),
                description,
            });
            return self
                .get_session(session_id)
                .await
                .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()));
        }

        self.transition(session_id, None, SessionStatus::ApplyingPatch)
            .await?;
        self.apply_and_finish(session_id).await
    }

    /// Resume a session paused for approval.
    pub async fn approve_patch(&self, session_id: &str) -> Result<GuardianSession, GuardianError> {
        {
            let active = self.active.read().await;
            let session = active
                .get(session_id)
                .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
            if session.comparison.is_none() {
                return Err(GuardianError::NoProposal(session_id.to_string()));
            }
        }
        self.transition(
            session_id,
            Some(SessionStatus::GeneratingPatch),
            SessionStatus::ApplyingPatch,
        )
        .await?;
        info!(session_id = %session_id, "patch approved");
        self.apply_and_finish(session_id).await
    }

    /// Fail a session paused for approval on operator request.
    pub async fn reject_patch(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<GuardianSession, GuardianError> {
        let mut session = {
            let mut active = self.active.write().await;
            let paused = active
                .get(session_id)
                .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
            // Only a session waiting on approval can be rejected; later stages
            // are already touching the project.
            if paused.status != SessionStatus::GeneratingPatch {
                return Err(GuardianError::InvalidState {
                    id: session_id.to_string(),
                    actual: paused.status.to_string(),
                    expected: SessionStatus::GeneratingPatch.to_string(),
                });
            }
            if paused.comparison.is_none() {
                return Err(GuardianError::NoProposal(session_id.to_string()));
            }
            active
                .remove(session_id)
                .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?
        };

        let reason = reason.unwrap_or_else(|| "rejected by operator".to_string());
        session.fail(reason.clone());
        lock(&self.stats).record_failed();
        info!(session_id = %session_id, reason = %reason, "patch rejected");

        self.archive(session.clone()).await;
        self.emit(GuardianEvent::PatchRejected {
            session_id: session_id.to_string(),
            reason,
        });
        Ok(session)
    }

    /// Restore the files touched by a session's patch application.
    pub async fn rollback(&self, session_id: &str) -> Result<GuardianSession, GuardianError> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
        let application_id = session
            .application
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or_else(|| GuardianError::NoApplication(session_id.to_string()))?;

        let application = self.patcher.rollback(&application_id).await?;

        let in_flight = self.active.write().await.remove(session_id);
        let rolled_back = match in_flight {
            Some(mut session) => {
                session.application = Some(application);
                session.finish(SessionStatus::RolledBack);
                self.archive(session.clone()).await;
                session
            }
            None => {
                let updated = {
                    let mut history = self.history.write().await;
                    let entry = history
                        .iter_mut()
                        .rev()
                        .find(|s| s.id == session_id)
                        .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
                    entry.application = Some(application);
                    entry.status = SessionStatus::RolledBack;
                    entry.clone()
                };
                self.journal_append(&updated);
                updated
            }
        };

        lock(&self.stats).record_rolled_back();
        info!(session_id = %session_id, application_id = %application_id, "session rolled back");
        self.emit(GuardianEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: SessionStatus::RolledBack,
        });
        self.emit(GuardianEvent::RolledBack {
            session_id: session_id.to_string(),
            application_id,
        });
        Ok(rolled_back)
    }

    async fn apply_and_finish(&self, session_id: &str) -> Result<GuardianSession, GuardianError> {
        match self.apply_stage(session_id).await {
            Ok(()) => self.complete_session(session_id).await,
            Err(e @ GuardianError::SessionNotFound(_)) => Err(e),
            Err(e) => self.fail_session(session_id, e).await,
        }
    }

    /// applying_patch -> rebuilding. Any error here fails the session.
    async fn apply_stage(&self, session_id: &str) -> Result<(), GuardianError> {
        let solution = self
            .get_session(session_id)
            .await
            .and_then(|s| s.comparison)
            .map(|c| c.merged.solution)
            .ok_or_else(|| GuardianError::NoProposal(session_id.to_string()))?;

        let application = self.patcher.apply_patches(&solution).await?;
        let result = application.result.clone().unwrap_or_default();
        let application_id = application.id.clone();
        self.update_session(session_id, |s| s.application = Some(application))
            .await?;
        self.emit(GuardianEvent::PatchesApplied {
            session_id: session_id.to_string(),
            application_id,
            result: result.clone(),
        });

        if !result.success {
            return Err(GuardianError::PatchesFailed {
                failed: result.failed_patches.len(),
                total: solution.patches.len(),
            });
        }

        self.transition(session_id, None, SessionStatus::Rebuilding)
            .await?;
        let pipeline = self
            .pipeline
            .execute_pipeline(
                solution.needs_reinstall,
                solution.needs_rebuild,
                solution.needs_restart,
            )
            .await;
        lock(&self.stats).record_rebuild();

        let failure = pipeline.failed_step().map(|step| GuardianError::BuildFailed {
            step: step.name.clone(),
            reason: step.error.clone().unwrap_or_else(|| "unknown".to_string()),
        });
        let (pipeline_id, status) = (pipeline.id.clone(), pipeline.status);
        self.update_session(session_id, |s| s.pipeline = Some(pipeline))
            .await?;
        self.emit(GuardianEvent::RebuildCompleted {
            session_id: session_id.to_string(),
            pipeline_id,
            status,
        });

        match failure {
            Some(e) => Err(e),
            None if status == PipelineStatus::Failed => Err(GuardianError::BuildFailed {
                step: "pipeline".to_string(),
                reason: "pipeline failed".to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn complete_session(&self, session_id: &str) -> Result<GuardianSession, GuardianError> {
        let mut session = self
            .active
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
        session.finish(SessionStatus::Completed);

        self.gate.record_success(&session.error.message);
        lock(&self.stats).record_completed();
        let duration_ms = session.duration_ms.unwrap_or_default();
        info!(session_id = %session_id, duration_ms, "session completed");

        self.archive(session.clone()).await;
        self.emit(GuardianEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: SessionStatus::Completed,
        });
        self.emit(GuardianEvent::SessionCompleted {
            session_id: session_id.to_string(),
            duration_ms,
        });
        Ok(session)
    }

    /// Session boundary: every stage failure lands here as a terminal session.
    async fn fail_session(
        &self,
        session_id: &str,
        cause: GuardianError,
    ) -> Result<GuardianSession, GuardianError> {
        let mut session = self
            .active
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
        let reason = cause.to_string();
        session.fail(reason.clone());

        let attempts = self.gate.record_failure(&session.error.message);
        lock(&self.stats).record_failed();
        error!(
            session_id = %session_id,
            attempts,
            reason = %reason,
            "session failed, manual intervention required"
        );

        self.archive(session.clone()).await;
        self.emit(GuardianEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: SessionStatus::Failed,
        });
        self.emit(GuardianEvent::SessionFailed {
            session_id: session_id.to_string(),
            reason,
        });
        Ok(session)
    }

    /// Move an active session to `next`, optionally requiring its current status.
    async fn transition(
        &self,
        session_id: &str,
        expected: Option<SessionStatus>,
        next: SessionStatus,
    ) -> Result<GuardianSession, GuardianError> {
        let snapshot = {
            let mut active = self.active.write().await;
            let session = active
                .get_mut(session_id)
                .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
            if let Some(expected) = expected {
                if session.status != expected {
                    return Err(GuardianError::InvalidState {
                        id: session_id.to_string(),
                        actual: session.status.to_string(),
                        expected: expected.to_string(),
                    });
                }
            }
            session.status = next;
            session.clone()
        };

        info!(session_id = %session_id, status = %next, "session status changed");
        self.emit(GuardianEvent::SessionStatusChanged {
            session_id: session_id.to_string(),
            status: next,
        });
        Ok(snapshot)
    }

    async fn update_session<F>(&self, session_id: &str, f: F) -> Result<(), GuardianError>
    where
        F: FnOnce(&mut GuardianSession),
    {
        let mut active = self.active.write().await;
        let session = active
            .get_mut(session_id)
            .ok_or_else(|| GuardianError::SessionNotFound(session_id.to_string()))?;
        f(session);
        Ok(())
    }

    async fn archive(&self, session: GuardianSession) {
        self.journal_append(&session);
        self.history.write().await.push(session);
    }

    fn journal_append(&self, session: &GuardianSession) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(session) {
                warn!(session_id = %session.id, error = %e, "failed to journal session");
            }
        }
    }
}

impl Drop for Guardian {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}
