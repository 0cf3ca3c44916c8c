//! Feeds for the error monitor: child process pipes, tailed log files,
//! process panics and the application's own tracing output.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{debug, warn, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::monitor::{ErrorKind, ErrorMonitor, ReportOverrides, ReportedError, Severity};

/// Forward every line read from `reader` into the monitor until EOF.
pub fn spawn_line_forwarder<R>(reader: R, monitor: Arc<ErrorMonitor>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    monitor.process_text(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "line forwarder stopped");
                    break;
                }
            }
        }
    })
}

/// Follow a log file from its current end, polling every `interval`.
/// A file that shrinks is treated as rotated and re-read from the start.
pub fn tail_file(path: PathBuf, monitor: Arc<ErrorMonitor>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let mut partial: Vec<u8> = Vec::new();
        debug!(path = %path.display(), offset, "tailing log file");

        loop {
            tokio::time::sleep(interval).await;

            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if len < offset {
                debug!(path = %path.display(), "log file truncated, restarting from top");
                offset = 0;
                partial.clear();
            }
            if len == offset {
                continue;
            }

            let chunk = match read_from(&path, offset).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read log file");
                    continue;
                }
            };
            offset += chunk.len() as u64;
            partial.extend_from_slice(&chunk);

            if let Some(complete) = take_complete_lines(&mut partial) {
                monitor.process_text(&complete);
            }
        }
    })
}

/// Drain every newline-terminated line from `partial` and decode it.
/// An unterminated tail stays behind as raw bytes, so a multi-byte
/// character split across two reads is decoded whole.
fn take_complete_lines(partial: &mut Vec<u8>) -> Option<String> {
    let cut = partial.iter().rposition(|&b| b == b'\n')?;
    let complete: Vec<u8> = partial.drain(..=cut).collect();
    Some(String::from_utf8_lossy(&complete).into_owned())
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Report panics to the monitor as critical runtime errors, then defer to
/// whatever hook was installed before.
pub fn install_panic_hook(monitor: Arc<ErrorMonitor>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };

        let mut overrides = ReportOverrides {
            kind: Some(ErrorKind::Runtime),
            severity: Some(Severity::Critical),
            ..Default::default()
        };
        if let Some(location) = info.location() {
            overrides.file = Some(location.file().to_string());
            overrides.line = Some(location.line() as usize);
        }
        overrides
            .metadata
            .insert("origin".to_string(), Value::String("panic".to_string()));

        let thread = std::thread::current();
        monitor.report_error(
            ReportedError {
                message,
                stack_trace: thread.name().map(|name| format!("thread '{}'", name)),
            },
            overrides,
        );
        previous(info);
    }));
}

/// Tracing layer that reports ERROR events from the host application.
///
/// Events emitted by this crate are skipped so the guardian never reacts to
/// its own failure logs.
pub struct MonitorLayer {
    monitor: Arc<ErrorMonitor>,
    own_target: &'static str,
}

impl MonitorLayer {
    pub fn new(monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            monitor,
            own_target: env!("CARGO_CRATE_NAME"),
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut rendered = String::new();
        let _ = write!(rendered, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(rendered));
        }
    }
}

impl<S: Subscriber> Layer<S> for MonitorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() != Level::ERROR || meta.target().starts_with(self.own_target) {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let Some(message) = collector.message else {
            return;
        };

        let mut metadata = collector.fields;
        metadata.insert(
            "target".to_string(),
            Value::String(meta.target().to_string()),
        );
        let overrides = ReportOverrides {
            file: meta.file().map(str::to_string),
            line: meta.line().map(|l| l as usize),
            metadata,
            ..Default::default()
        };
        self.monitor.report_error(message, overrides);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn running_monitor() -> Arc<ErrorMonitor> {
        let monitor = Arc::new(ErrorMonitor::default());
        monitor.start();
        monitor
    }

    #[tokio::test]
    async fn test_line_forwarder_feeds_monitor() {
        let monitor = running_monitor();
        let input: &[u8] = b"listening on 3000\nError: listen EADDRINUSE: address already in use :::3000\n";
        spawn_line_forwarder(input, Arc::clone(&monitor))
            .await
            .unwrap();

        let history = monitor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].severity, Severity::Critical);
        assert_eq!(monitor.recent_logs(10).len(), 2);
    }

    #[tokio::test]
    async fn test_tail_file_reads_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "Error: old failure before tailing\n").unwrap();

        let monitor = running_monitor();
        let mut rx = monitor.subscribe();
        let handle = tail_file(path.clone(), Arc::clone(&monitor), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "Error: Cannot find module 'express'").unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ErrorKind::Dependency);
        // The pre-existing line was never read
        assert_eq!(monitor.history().len(), 1);
        handle.abort();
    }

    #[test]
    fn test_take_complete_lines_keeps_split_utf8() {
        let mut partial = Vec::new();
        partial.extend_from_slice(b"Error: caf\xC3");
        assert!(take_complete_lines(&mut partial).is_none());

        partial.extend_from_slice(b"\xA9 failed\nnext");
        let text = take_complete_lines(&mut partial).unwrap();
        assert_eq!(text, "Error: café failed\n");
        assert!(!text.contains('\u{FFFD}'));
        assert_eq!(partial, b"next");
    }

    #[tokio::test]
    async fn test_tail_file_multibyte_split_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let monitor = running_monitor();
        let mut rx = monitor.subscribe();
        let handle = tail_file(path.clone(), Arc::clone(&monitor), Duration::from_millis(20));

        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.write_all(b"Error: caf\xC3").unwrap();
        f.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.write_all(b"\xA9 crashed\n").unwrap();
        f.flush().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.message.contains("café"));
        assert!(!event.message.contains('\u{FFFD}'));
        handle.abort();
    }

    #[test]
    fn test_monitor_layer_reports_foreign_errors_only() {
        let monitor = Arc::new(ErrorMonitor::default());
        let subscriber =
            tracing_subscriber::registry().with(MonitorLayer::new(Arc::clone(&monitor)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "host_app::db", table = "users", "query failed");
            tracing::warn!(target: "host_app::db", "slow query");
            tracing::error!(target: "guardian_agent::orchestrator", "session failed");
        });

        let history = monitor.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "query failed");
        assert_eq!(history[0].metadata["table"], "users");
        assert_eq!(history[0].metadata["target"], "host_app::db");
        assert!(history[0].context.as_ref().unwrap().line.is_some());
    }
}
