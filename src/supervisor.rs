use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::ingest::spawn_line_forwarder;
use crate::monitor::ErrorMonitor;

/// Owns the single managed application server process.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn the server. Fails if a previous handle is still alive.
    async fn start(&self) -> Result<u32, PipelineError>;

    /// Ask the server to terminate, force-killing it after `grace`.
    async fn stop(&self, grace: Duration) -> Result<(), PipelineError>;

    async fn is_running(&self) -> bool;
}

/// Supervisor that runs the server through `sh -c`
pub struct ShellSupervisor {
    command: String,
    working_dir: PathBuf,
    child: Mutex<Option<Child>>,
    output_sink: Option<Arc<ErrorMonitor>>,
}

impl ShellSupervisor {
    pub fn new(command: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            working_dir,
            child: Mutex::new(None),
            output_sink: None,
        }
    }

    /// Feed the server's stdout/stderr into the error monitor
    pub fn with_output_sink(mut self, monitor: Arc<ErrorMonitor>) -> Self {
        self.output_sink = Some(monitor);
        self
    }
}

fn still_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Signal the whole process group led by `pid`. The server runs in its own
/// group, so whatever `sh -c` forked receives the signal too.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // kill(0, ..) would hit our own group
    if pid == 0 {
        return Ok(());
    }
    // SAFETY: kill(2) on the group we created at spawn time.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: u32) -> std::io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: u32) -> std::io::Result<()> {
    child.start_kill()
}

/// Kill anything left in the group once the leader is gone.
#[cfg(unix)]
fn sweep_group(pid: u32) {
    if let Err(e) = signal_group(pid, libc::SIGKILL) {
        warn!(pid, error = %e, "failed to kill server process group");
    }
}

#[cfg(not(unix))]
fn sweep_group(_pid: u32) {}

#[async_trait]
impl ProcessSupervisor for ShellSupervisor {
    async fn start(&self) -> Result<u32, PipelineError> {
        let mut guard = self.child.lock().await;
        if let Some(existing) = guard.as_mut() {
            if still_running(existing) {
                return Err(PipelineError::Supervisor(
                    "previous server process is still running".to_string(),
                ));
            }
        }

        let (stdout, stderr) = if self.output_sink.is_some() {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if let Some(monitor) = &self.output_sink {
            if let Some(out) = child.stdout.take() {
                spawn_line_forwarder(out, Arc::clone(monitor));
            }
            if let Some(err) = child.stderr.take() {
                spawn_line_forwarder(err, Arc::clone(monitor));
            }
        }

        let pid = child.id().unwrap_or_default();
        info!(pid, command = %self.command, "server process started");
        *guard = Some(child);
        Ok(pid)
    }

    async fn stop(&self, grace: Duration) -> Result<(), PipelineError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if !still_running(&mut child) {
            return Ok(());
        }

        let pid = child.id().unwrap_or_default();
        if let Err(e) = terminate(&mut child, pid) {
            warn!(pid, error = %e, "SIGTERM failed");
        }

        let result = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, status = %status, "server process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(PipelineError::Supervisor(e.to_string())),
            Err(_) => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "server ignored SIGTERM, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| PipelineError::Supervisor(e.to_string()))
            }
        };
        sweep_group(pid);
        result
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => still_running(child),
            None => false,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Live processes whose command line is exactly `cmdline`. Zombies have an
    /// empty cmdline and are not counted.
    #[cfg(target_os = "linux")]
    fn live_processes(cmdline: &str) -> usize {
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
            .filter(|raw| String::from_utf8_lossy(raw).replace('\0', " ").trim() == cmdline)
            .count()
    }

    #[cfg(target_os = "linux")]
    async fn wait_until_gone(cmdline: &str) -> usize {
        for _ in 0..40 {
            if live_processes(cmdline) == 0 {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        live_processes(cmdline)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ShellSupervisor::new("sleep 30", dir.path().to_path_buf());
        assert!(!sup.is_running().await);

        let pid = sup.start().await.unwrap();
        assert!(pid > 0);
        assert!(sup.is_running().await);
        assert!(sup.start().await.is_err());

        sup.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!sup.is_running().await);
        // stopping twice is harmless
        sup.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_terminates_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ShellSupervisor::new("sleep 317; echo done", dir.path().to_path_buf());
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(live_processes("sleep 317"), 1);

        sup.stop(Duration::from_millis(500)).await.unwrap();
        assert_eq!(wait_until_gone("sleep 317").await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_kills_group_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ShellSupervisor::new("trap '' TERM; sleep 318; echo done", dir.path().to_path_buf());
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(live_processes("sleep 318"), 1);

        sup.stop(Duration::from_millis(300)).await.unwrap();
        assert!(!sup.is_running().await);
        assert_eq!(wait_until_gone("sleep 318").await, 0);
    }

    #[tokio::test]
    async fn test_output_forwarded_to_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Arc::new(ErrorMonitor::default());
        monitor.start();
        let mut rx = monitor.subscribe();

        let sup = ShellSupervisor::new(
            "echo \"Error: Cannot find module 'left-pad'\" 1>&2; sleep 5",
            dir.path().to_path_buf(),
        )
        .with_output_sink(Arc::clone(&monitor));
        sup.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.message, "Cannot find module 'left-pad'");
        sup.stop(Duration::from_secs(1)).await.unwrap();
    }
}
