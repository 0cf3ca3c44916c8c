//! Patch application engine.
//!
//! Every application snapshots the files it will modify or delete into its own
//! backup directory before touching anything, then applies patches one by one.
//! A failed patch never stops the next one; rollback restores the snapshot.
//!
//! Backup layout:
//! ```text
//! <backup_root>/<application_id>/manifest.json
//! <backup_root>/<application_id>/<original relative path>
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ApplyError, PatchOpError};
use crate::proposal::{FilePatch, PatchAction, Solution};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applying => write!(f, "applying"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationResult {
    pub success: bool,
    pub applied_patches: Vec<String>,
    pub failed_patches: Vec<PatchFailure>,
    pub duration_ms: u64,
}

/// One application of a solution's patches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchApplication {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub patches: Vec<FilePatch>,
    pub status: ApplicationStatus,
    pub backup_path: PathBuf,
    #[serde(default)]
    pub result: Option<ApplicationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    file: String,
    action: PatchAction,
    backed_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupManifest {
    application_id: String,
    timestamp: DateTime<Utc>,
    entries: Vec<ManifestEntry>,
}

/// Applies file patches under a project root with backup-based rollback
pub struct PatchEngine {
    project_root: PathBuf,
    backup_root: PathBuf,
    applications: RwLock<HashMap<String, PatchApplication>>,
}

impl PatchEngine {
    /// `project_root` is made absolute against the working directory, so
    /// absolute patch targets are judged the same way however the root was written.
    pub fn new(project_root: PathBuf, backup_root: PathBuf) -> Self {
        Self {
            project_root: absolutize(&project_root),
            backup_root,
            applications: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a patch target to (absolute target, path relative to root).
    /// Rejects anything that would land outside the project root.
    fn resolve(&self, file: &str) -> Result<(PathBuf, PathBuf), PatchOpError> {
        let path = Path::new(file);
        let relative = if path.is_absolute() {
            absolutize(path)
                .strip_prefix(&self.project_root)
                .map_err(|_| PatchOpError::OutsideRoot)?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };

        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => return Err(PatchOpError::OutsideRoot),
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(PatchOpError::OutsideRoot);
        }
        Ok((self.project_root.join(&clean), clean))
    }

    async fn store(&self, application: &PatchApplication) {
        self.applications
            .write()
            .await
            .insert(application.id.clone(), application.clone());
    }

    /// Snapshot, then apply every patch best-effort.
    ///
    /// Returns `Err` only when the snapshot itself cannot be written, in which
    /// case no file has been touched. Per-file failures are reported in the
    /// result and make the final status `failed`.
    pub async fn apply_patches(&self, solution: &Solution) -> Result<PatchApplication, ApplyError> {
        let id = Uuid::new_v4().to_string();
        let mut application = PatchApplication {
            id: id.clone(),
            timestamp: Utc::now(),
            patches: solution.patches.clone(),
            status: ApplicationStatus::Pending,
            backup_path: self.backup_root.join(&id),
            result: None,
        };
        self.store(&application).await;

        application.status = ApplicationStatus::Applying;
        self.store(&application).await;
        info!(
            application_id = %id,
            patches = application.patches.len(),
            "applying patches"
        );

        let started = Instant::now();

        if let Err(e) = self.snapshot(&application).await {
            error!(application_id = %id, error = %e, "backup failed, no patches applied");
            application.status = ApplicationStatus::Failed;
            self.store(&application).await;
            return Err(e);
        }

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for patch in &application.patches {
            match self.apply_one(patch).await {
                Ok(()) => {
                    info!(file = %patch.file, action = %patch.action, "patch applied");
                    applied.push(patch.file.clone());
                }
                Err(e) => {
                    warn!(file = %patch.file, action = %patch.action, error = %e, "patch failed");
                    failed.push(PatchFailure {
                        file: patch.file.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let success = failed.is_empty();
        application.status = if success {
            ApplicationStatus::Applied
        } else {
            ApplicationStatus::Failed
        };
        application.result = Some(ApplicationResult {
            success,
            applied_patches: applied,
            failed_patches: failed,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.store(&application).await;

        info!(
            application_id = %id,
            status = %application.status,
            "patch application finished"
        );
        Ok(application)
    }

    /// Copy every existing modify/delete target into the backup directory and
    /// write the manifest.
    async fn snapshot(&self, application: &PatchApplication) -> Result<(), ApplyError> {
        let dir = &application.backup_path;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ApplyError::Backup {
                path: dir.clone(),
                source,
            })?;

        let mut entries = Vec::new();
        for patch in &application.patches {
            let mut backed_up = false;
            if patch.action != PatchAction::Create {
                if let Ok((target, relative)) = self.resolve(&patch.file) {
                    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                        let backup = dir.join(&relative);
                        copy_with_parents(&target, &backup)
                            .await
                            .map_err(|source| ApplyError::Backup {
                                path: target.clone(),
                                source,
                            })?;
                        backed_up = true;
                    }
                }
            }
            entries.push(ManifestEntry {
                file: patch.file.clone(),
                action: patch.action,
                backed_up,
            });
        }

        let manifest = BackupManifest {
            application_id: application.id.clone(),
            timestamp: application.timestamp,
            entries,
        };
        let data = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ApplyError::Manifest(e.to_string()))?;
        let manifest_path = dir.join(MANIFEST_FILE);
        tokio::fs::write(&manifest_path, data)
            .await
            .map_err(|source| ApplyError::Backup {
                path: manifest_path,
                source,
            })?;
        Ok(())
    }

    async fn apply_one(&self, patch: &FilePatch) -> Result<(), PatchOpError> {
        let (target, _) = self.resolve(&patch.file)?;
        let exists = tokio::fs::try_exists(&target).await?;

        match patch.action {
            PatchAction::Create => {
                if exists {
                    return Err(PatchOpError::AlreadyExists);
                }
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, patch.content.as_deref().unwrap_or_default()).await?;
            }
            PatchAction::Modify => {
                if !exists {
                    return Err(PatchOpError::NotFound);
                }
                match (patch.line_range(), &patch.content) {
                    (None, Some(content)) => tokio::fs::write(&target, content).await?,
                    (Some((start, end)), replacement) => {
                        let original = tokio::fs::read_to_string(&target).await?;
                        let spliced = splice_lines(&original, start, end, replacement.as_deref())?;
                        tokio::fs::write(&target, spliced).await?;
                    }
                    (None, None) => return Err(PatchOpError::NothingToApply),
                }
            }
            PatchAction::Delete => {
                if !exists {
                    warn!(file = %patch.file, "delete target already absent");
                    return Ok(());
                }
                tokio::fs::remove_file(&target).await?;
            }
        }
        Ok(())
    }

    /// Restore an application's snapshot and remove the files it created.
    pub async fn rollback(&self, application_id: &str) -> Result<PatchApplication, ApplyError> {
        let mut application = self
            .get_application(application_id)
            .await
            .ok_or_else(|| ApplyError::NotFound(application_id.to_string()))?;

        if !matches!(
            application.status,
            ApplicationStatus::Applied | ApplicationStatus::Failed
        ) {
            return Err(ApplyError::InvalidStatus {
                id: application_id.to_string(),
                status: application.status.to_string(),
            });
        }

        let dir = application.backup_path.clone();
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(ApplyError::BackupMissing(dir));
        }

        let raw = tokio::fs::read(dir.join(MANIFEST_FILE))
            .await
            .map_err(|e| ApplyError::Manifest(e.to_string()))?;
        let manifest: BackupManifest =
            serde_json::from_slice(&raw).map_err(|e| ApplyError::Manifest(e.to_string()))?;
        info!(
            application_id = %manifest.application_id,
            snapshot_taken = %manifest.timestamp,
            entries = manifest.entries.len(),
            "restoring backup"
        );

        for entry in manifest.entries.iter().filter(|e| e.backed_up) {
            let Ok((target, relative)) = self.resolve(&entry.file) else {
                continue;
            };
            copy_with_parents(&dir.join(&relative), &target)
                .await
                .map_err(|source| ApplyError::Restore {
                    path: target.clone(),
                    source,
                })?;
            info!(file = %entry.file, "file restored from backup");
        }

        let applied = application
            .result
            .as_ref()
            .map(|r| r.applied_patches.clone())
            .unwrap_or_default();
        for entry in manifest
            .entries
            .iter()
            .filter(|e| e.action == PatchAction::Create && applied.contains(&e.file))
        {
            let Ok((target, _)) = self.resolve(&entry.file) else {
                continue;
            };
            match tokio::fs::remove_file(&target).await {
                Ok(()) => info!(file = %entry.file, "created file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ApplyError::Restore {
                        path: target,
                        source,
                    })
                }
            }
        }

        application.status = ApplicationStatus::RolledBack;
        self.store(&application).await;
        info!(application_id = %application_id, "patch application rolled back");
        Ok(application)
    }

    pub async fn get_application(&self, id: &str) -> Option<PatchApplication> {
        self.applications.read().await.get(id).cloned()
    }

    /// All applications, oldest first
    pub async fn list_applications(&self) -> Vec<PatchApplication> {
        let mut all: Vec<PatchApplication> =
            self.applications.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.timestamp);
        all
    }
}

async fn copy_with_parents(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}

/// Absolute, lexically normalised form of `path`. Touches no filesystem.
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Replace 1-based inclusive lines `start..=end` with `replacement` (or remove
/// them). Keeps the file's line terminator and its trailing newline.
fn splice_lines(
    original: &str,
    start: usize,
    end: usize,
    replacement: Option<&str>,
) -> Result<String, PatchOpError> {
    let lines: Vec<&str> = original.lines().collect();
    if start == 0 || start > end || end > lines.len() {
        return Err(PatchOpError::RangeOutOfBounds {
            start,
            end,
            len: lines.len(),
        });
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..start - 1]);
    if let Some(text) = replacement {
        out.extend(text.lines());
    }
    out.extend_from_slice(&lines[end..]);

    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let mut result = out.join(eol);
    if original.ends_with('\n') && !result.is_empty() {
        result.push_str(eol);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, PatchEngine) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let engine = PatchEngine::new(root, dir.path().join("backups"));
        (dir, engine)
    }

    fn root(engine: &PatchEngine) -> &Path {
        &engine.project_root
    }

    fn patch(file: &str, action: PatchAction, content: Option<&str>) -> FilePatch {
        FilePatch {
            file: file.to_string(),
            action,
            content: content.map(str::to_string),
            line_start: None,
            line_end: None,
            description: String::new(),
        }
    }

    fn solution(patches: Vec<FilePatch>) -> Solution {
        Solution {
            patches,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_and_rollback_round_trip() {
        let (_tmp, engine) = engine();
        let r = root(&engine).to_path_buf();
        std::fs::create_dir_all(r.join("server")).unwrap();
        std::fs::write(r.join("server/routes.ts"), b"old routes\n").unwrap();
        std::fs::write(r.join("legacy.ts"), b"legacy").unwrap();

        let app = engine
            .apply_patches(&solution(vec![
                patch("server/routes.ts", PatchAction::Modify, Some("new routes\n")),
                patch("legacy.ts", PatchAction::Delete, None),
                patch("server/health.ts", PatchAction::Create, Some("ok")),
            ]))
            .await
            .unwrap();

        assert_eq!(app.status, ApplicationStatus::Applied);
        assert!(app.result.as_ref().unwrap().success);
        assert_eq!(std::fs::read_to_string(r.join("server/routes.ts")).unwrap(), "new routes\n");
        assert!(!r.join("legacy.ts").exists());
        assert!(r.join("server/health.ts").exists());
        assert!(app.backup_path.join("manifest.json").exists());

        let rolled = engine.rollback(&app.id).await.unwrap();
        assert_eq!(rolled.status, ApplicationStatus::RolledBack);
        assert_eq!(std::fs::read(r.join("server/routes.ts")).unwrap(), b"old routes\n");
        assert_eq!(std::fs::read(r.join("legacy.ts")).unwrap(), b"legacy");
        assert!(!r.join("server/health.ts").exists());
    }

    #[tokio::test]
    async fn test_partial_failure_is_best_effort() {
        let (_tmp, engine) = engine();
        let r = root(&engine).to_path_buf();
        std::fs::write(r.join("a.ts"), "a").unwrap();
        std::fs::write(r.join("c.ts"), "c").unwrap();

        let app = engine
            .apply_patches(&solution(vec![
                patch("a.ts", PatchAction::Modify, Some("A")),
                patch("missing.ts", PatchAction::Modify, Some("B")),
                patch("c.ts", PatchAction::Modify, Some("C")),
            ]))
            .await
            .unwrap();

        let result = app.result.unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.applied_patches, vec!["a.ts", "c.ts"]);
        assert_eq!(result.failed_patches.len(), 1);
        assert_eq!(result.failed_patches[0].file, "missing.ts");
        assert_eq!(std::fs::read_to_string(r.join("c.ts")).unwrap(), "C");

        // failed applications can still be rolled back
        engine.rollback(&app.id).await.unwrap();
        assert_eq!(std::fs::read_to_string(r.join("a.ts")).unwrap(), "a");
    }

    #[tokio::test]
    async fn test_create_never_overwrites() {
        let (_tmp, engine) = engine();
        let r = root(&engine).to_path_buf();
        std::fs::write(r.join("exists.ts"), "keep").unwrap();

        let app = engine
            .apply_patches(&solution(vec![patch("exists.ts", PatchAction::Create, Some("x"))]))
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
        assert!(app.result.as_ref().unwrap().failed_patches[0]
            .error
            .contains("already exists"));

        // rollback must not delete a file this application did not create
        engine.rollback(&app.id).await.unwrap();
        assert_eq!(std::fs::read_to_string(r.join("exists.ts")).unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_modify_line_range() {
        let (_tmp, engine) = engine();
        let r = root(&engine).to_path_buf();
        std::fs::write(r.join("f.ts"), "one\ntwo\nthree\nfour\n").unwrap();

        let mut p = patch("f.ts", PatchAction::Modify, Some("TWO\nTHREE"));
        p.line_start = Some(2);
        p.line_end = Some(3);
        let app = engine.apply_patches(&solution(vec![p])).await.unwrap();
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert_eq!(
            std::fs::read_to_string(r.join("f.ts")).unwrap(),
            "one\nTWO\nTHREE\nfour\n"
        );

        let mut bad = patch("f.ts", PatchAction::Modify, Some("x"));
        bad.line_start = Some(3);
        bad.line_end = Some(9);
        let app = engine.apply_patches(&solution(vec![bad])).await.unwrap();
        assert!(app.result.unwrap().failed_patches[0].error.contains("out of bounds"));
    }

    #[tokio::test]
    async fn test_modify_requires_content_or_range() {
        let (_tmp, engine) = engine();
        std::fs::write(root(&engine).join("f.ts"), "x").unwrap();
        let app = engine
            .apply_patches(&solution(vec![patch("f.ts", PatchAction::Modify, None)]))
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_failure() {
        let (_tmp, engine) = engine();
        let app = engine
            .apply_patches(&solution(vec![patch("gone.ts", PatchAction::Delete, None)]))
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Applied);
    }

    #[tokio::test]
    async fn test_paths_outside_root_rejected() {
        let (_tmp, engine) = engine();
        let app = engine
            .apply_patches(&solution(vec![
                patch("../escape.ts", PatchAction::Create, Some("x")),
                patch("/etc/passwd", PatchAction::Delete, None),
            ]))
            .await
            .unwrap();
        let result = app.result.unwrap();
        assert_eq!(result.failed_patches.len(), 2);
        assert!(result.failed_patches[0].error.contains("escapes project root"));
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_accepted() {
        let (_tmp, engine) = engine();
        let target = root(&engine).join("inside.ts");
        let app = engine
            .apply_patches(&solution(vec![patch(
                target.to_str().unwrap(),
                PatchAction::Create,
                Some("x"),
            )]))
            .await
            .unwrap();
        assert_eq!(app.status, ApplicationStatus::Applied);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_rollback_rules() {
        let (_tmp, engine) = engine();
        assert!(matches!(
            engine.rollback("nope").await,
            Err(ApplyError::NotFound(_))
        ));

        let app = engine
            .apply_patches(&solution(vec![patch("n.ts", PatchAction::Create, Some("x"))]))
            .await
            .unwrap();
        engine.rollback(&app.id).await.unwrap();
        // already rolled back
        assert!(matches!(
            engine.rollback(&app.id).await,
            Err(ApplyError::InvalidStatus { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_without_backup_fails() {
        let (_tmp, engine) = engine();
        let app = engine
            .apply_patches(&solution(vec![patch("n.ts", PatchAction::Create, Some("x"))]))
            .await
            .unwrap();
        std::fs::remove_dir_all(&app.backup_path).unwrap();
        assert!(matches!(
            engine.rollback(&app.id).await,
            Err(ApplyError::BackupMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_list_applications() {
        let (_tmp, engine) = engine();
        engine.apply_patches(&solution(Vec::new())).await.unwrap();
        engine.apply_patches(&solution(Vec::new())).await.unwrap();
        let all = engine.list_applications().await;
        assert_eq!(all.len(), 2);
        assert!(engine.get_application(&all[0].id).await.is_some());
    }

    #[test]
    fn test_splice_lines_remove_only() {
        assert_eq!(splice_lines("a\nb\nc", 2, 2, None).unwrap(), "a\nc");
        assert!(splice_lines("a", 0, 1, None).is_err());
        assert!(splice_lines("a\nb", 2, 1, None).is_err());
    }

    #[test]
    fn test_splice_lines_keeps_crlf() {
        assert_eq!(
            splice_lines("a\r\nb\r\nc\r\nd\r\n", 2, 2, Some("B")).unwrap(),
            "a\r\nB\r\nc\r\nd\r\n"
        );
        assert_eq!(
            splice_lines("a\r\nb\r\nc", 1, 2, Some("x\r\ny\r\nz")).unwrap(),
            "x\r\ny\r\nz\r\nc"
        );
        assert_eq!(splice_lines("a\nb\n", 1, 1, Some("A")).unwrap(), "A\nb\n");
    }

    #[tokio::test]
    async fn test_modify_line_range_crlf_file() {
        let (_tmp, engine) = engine();
        let target = root(&engine).join("win.ts");
        std::fs::write(&target, "one\r\ntwo\r\nthree\r\n").unwrap();

        let mut p = patch("win.ts", PatchAction::Modify, Some("TWO"));
        p.line_start = Some(2);
        p.line_end = Some(2);
        let app = engine.apply_patches(&solution(vec![p])).await.unwrap();

        assert_eq!(app.status, ApplicationStatus::Applied);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "one\r\nTWO\r\nthree\r\n"
        );
    }

    #[test]
    fn test_relative_root_accepts_absolute_target_inside() {
        let engine = PatchEngine::new(PathBuf::from("."), PathBuf::from("backups"));
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(engine.project_root, cwd);

        let (target, relative) = engine
            .resolve(cwd.join("routes.ts").to_str().unwrap())
            .unwrap();
        assert_eq!(relative, PathBuf::from("routes.ts"));
        assert_eq!(target, cwd.join("routes.ts"));

        let (_, nested) = engine
            .resolve(cwd.join("./src/api.ts").to_str().unwrap())
            .unwrap();
        assert_eq!(nested, PathBuf::from("src/api.ts"));

        let dotted = format!("{}/../outside.ts", cwd.display());
        assert!(matches!(engine.resolve(&dotted), Err(PatchOpError::OutsideRoot)));
        assert!(engine.resolve("/definitely/not/here.ts").is_err());
    }
}
