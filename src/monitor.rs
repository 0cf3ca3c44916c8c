//! Error monitor: turns raw log text and reported exceptions into typed
//! [`ErrorEvent`]s and publishes them on a broadcast channel.

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;

/// Category of a detected error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Runtime,
    Build,
    TypeCheck,
    Dependency,
    Storage,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime => write!(f, "runtime"),
            Self::Build => write!(f, "build"),
            Self::TypeCheck => write!(f, "type-check"),
            Self::Dependency => write!(f, "dependency"),
            Self::Storage => write!(f, "storage"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordinal severity: low < medium < high < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn meets(self, threshold: Severity) -> bool {
        self >= threshold
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Source location an error points at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// A detected error. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            message: message.into(),
            stack_trace: None,
            context: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_stack_trace(mut self, stack: impl Into<String>) -> Self {
        self.stack_trace = Some(stack.into());
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A manually reported error, either from a string or a native error value.
#[derive(Debug, Clone)]
pub struct ReportedError {
    pub message: String,
    pub stack_trace: Option<String>,
}

impl ReportedError {
    /// Flatten an error and its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            stack_trace: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

impl From<&str> for ReportedError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
            stack_trace: None,
        }
    }
}

impl From<String> for ReportedError {
    fn from(message: String) -> Self {
        Self {
            message,
            stack_trace: None,
        }
    }
}

/// Explicit field overrides for [`ErrorMonitor::report_error`]
#[derive(Debug, Clone, Default)]
pub struct ReportOverrides {
    pub kind: Option<ErrorKind>,
    pub severity: Option<Severity>,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub function: Option<String>,
    pub metadata: HashMap<String, Value>,
}

/// What a rule extracted from a matching line
#[derive(Debug, Default)]
struct Extracted {
    message: String,
    stack_trace: Option<String>,
    context: Option<ErrorContext>,
    metadata: HashMap<String, Value>,
    /// Following lines absorbed into this event (stack frames)
    consumed: usize,
}

struct RuleInput<'a> {
    caps: Captures<'a>,
    line: &'a str,
    following: &'a [&'a str],
    recent: &'a VecDeque<String>,
}

type Extractor = fn(&RuleInput<'_>) -> Extracted;

/// One classification rule. Rules are evaluated in order; the first match wins.
struct ClassificationRule {
    name: &'static str,
    pattern: Regex,
    kind: ErrorKind,
    severity: Severity,
    extract: Extractor,
}

fn rule(
    name: &'static str,
    pattern: &str,
    kind: ErrorKind,
    severity: Severity,
    extract: Extractor,
) -> ClassificationRule {
    ClassificationRule {
        name,
        pattern: Regex::new(pattern).expect("classification pattern is valid"),
        kind,
        severity,
        extract,
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        rule(
            "type_check_located",
            r"(?P<file>[\w./\\-]+\.tsx?)\((?P<line>\d+),(?P<col>\d+)\): error (?P<code>TS\d+): (?P<msg>.+)",
            ErrorKind::TypeCheck,
            Severity::High,
            extract_type_check,
        ),
        rule(
            "type_check",
            r"error (?P<code>TS\d+): (?P<msg>.+)",
            ErrorKind::TypeCheck,
            Severity::High,
            extract_type_check,
        ),
        rule(
            "module_not_found",
            r#"(?:Cannot find module|Module not found:.*?Can't resolve) ['"](?P<module>[^'"]+)['"]"#,
            ErrorKind::Dependency,
            Severity::Critical,
            extract_module,
        ),
        rule(
            "storage",
            r#"(?i)(?:ECONNREFUSED|ETIMEDOUT|connection (?:refused|terminated unexpectedly)|database (?:error|connection)|SQLITE_[A-Z]+|relation "[^"]+" does not exist)"#,
            ErrorKind::Storage,
            Severity::Critical,
            extract_line,
        ),
        rule(
            "port_in_use",
            r"EADDRINUSE.*?:(?P<port>\d+)",
            ErrorKind::Runtime,
            Severity::Critical,
            extract_port,
        ),
        rule(
            "package_manager",
            r"(?:npm (?:ERR!|error)|ERR_PNPM_\w+|yarn error|error An unexpected error occurred)",
            ErrorKind::Dependency,
            Severity::High,
            extract_line,
        ),
        rule(
            "build_failure",
            r"(?i)(?:build failed|failed to compile|compilation failed|error during build)",
            ErrorKind::Build,
            Severity::High,
            extract_build,
        ),
        rule(
            "runtime",
            r"^\s*(?:Uncaught\s+)?(?P<name>[A-Z]\w*Error|Error)(?:\s*\[[A-Z_]+\])?: (?P<msg>.+)$",
            ErrorKind::Runtime,
            Severity::High,
            extract_runtime,
        ),
    ]
}

fn stack_frame_pattern() -> Regex {
    Regex::new(r"^\s*at (?:(?P<func>[^\s(]+) \()?(?P<file>[^()\s]+?):(?P<line>\d+):(?P<col>\d+)\)?\s*$")
        .expect("stack frame pattern is valid")
}

fn extract_line(input: &RuleInput<'_>) -> Extracted {
    Extracted {
        message: input.line.trim().to_string(),
        ..Default::default()
    }
}

fn extract_type_check(input: &RuleInput<'_>) -> Extracted {
    let code = input.caps.name("code").map(|m| m.as_str()).unwrap_or_default();
    let msg = input.caps.name("msg").map(|m| m.as_str().trim()).unwrap_or_default();
    let context = input.caps.name("file").map(|file| ErrorContext {
        file: Some(file.as_str().to_string()),
        line: input.caps.name("line").and_then(|l| l.as_str().parse().ok()),
        function: None,
    });
    let mut metadata = HashMap::new();
    metadata.insert("code".to_string(), Value::String(code.to_string()));
    Extracted {
        message: format!("{}: {}", code, msg),
        context,
        metadata,
        ..Default::default()
    }
}

fn extract_module(input: &RuleInput<'_>) -> Extracted {
    let module = input.caps.name("module").map(|m| m.as_str()).unwrap_or_default();
    let mut metadata = HashMap::new();
    metadata.insert("module".to_string(), Value::String(module.to_string()));
    Extracted {
        message: format!("Cannot find module '{}'", module),
        metadata,
        ..Default::default()
    }
}

fn extract_port(input: &RuleInput<'_>) -> Extracted {
    let mut extracted = extract_line(input);
    if let Some(port) = input.caps.name("port").and_then(|p| p.as_str().parse::<u16>().ok()) {
        extracted.metadata.insert("port".to_string(), Value::from(port));
    }
    extracted
}

fn extract_build(input: &RuleInput<'_>) -> Extracted {
    let mut extracted = extract_line(input);
    let tail: Vec<&str> = input
        .recent
        .iter()
        .rev()
        .take(20)
        .rev()
        .map(String::as_str)
        .collect();
    if !tail.is_empty() {
        extracted
            .metadata
            .insert("build_output".to_string(), Value::String(tail.join("\n")));
    }
    extracted
}

fn extract_runtime(input: &RuleInput<'_>) -> Extracted {
    let name = input.caps.name("name").map(|m| m.as_str()).unwrap_or("Error");
    let msg = input.caps.name("msg").map(|m| m.as_str().trim()).unwrap_or_default();

    let frames: Vec<&str> = input
        .following
        .iter()
        .take_while(|l| l.trim_start().starts_with("at "))
        .copied()
        .collect();

    let frame_re = stack_frame_pattern();
    let context = frames.iter().find_map(|frame| {
        frame_re.captures(frame).map(|c| ErrorContext {
            file: c.name("file").map(|m| m.as_str().to_string()),
            line: c.name("line").and_then(|m| m.as_str().parse().ok()),
            function: c.name("func").map(|m| m.as_str().to_string()),
        })
    });

    Extracted {
        message: format!("{}: {}", name, msg),
        stack_trace: if frames.is_empty() {
            None
        } else {
            Some(frames.iter().map(|f| f.trim()).collect::<Vec<_>>().join("\n"))
        },
        context,
        metadata: HashMap::new(),
        consumed: frames.len(),
    }
}

struct MonitorState {
    history: VecDeque<ErrorEvent>,
    log_buffer: VecDeque<String>,
}

/// Watches log text and reported errors, publishing deduplicated events.
pub struct ErrorMonitor {
    config: MonitorConfig,
    rules: Vec<ClassificationRule>,
    running: AtomicBool,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ErrorEvent>,
}

impl ErrorMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            rules: default_rules(),
            running: AtomicBool::new(false),
            state: Mutex::new(MonitorState {
                history: VecDeque::new(),
                log_buffer: VecDeque::new(),
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin classifying log text. Calling twice is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("error monitor already running");
            return;
        }
        info!(rules = self.rules.len(), "error monitor started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("error monitor already stopped");
            return;
        }
        info!("error monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to accepted error events
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.events.subscribe()
    }

    /// Classify a chunk of log text (one or more lines).
    /// Returns the events accepted after deduplication.
    pub fn process_text(&self, text: &str) -> Vec<ErrorEvent> {
        if !self.is_running() {
            return Vec::new();
        }

        let lines: Vec<&str> = text.lines().collect();
        let mut accepted = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            self.push_log_line(line);

            let classified = {
                let state = self.state();
                self.classify(line, &lines[i + 1..], &state.log_buffer)
            };

            let mut skip = 0;
            if let Some((event, consumed)) = classified {
                for frame in &lines[i + 1..i + 1 + consumed] {
                    self.push_log_line(frame);
                }
                skip = consumed;
                if let Some(event) = self.record(event) {
                    accepted.push(event);
                }
            }
            i += 1 + skip;
        }

        accepted
    }

    fn push_log_line(&self, line: &str) {
        let mut state = self.state();
        state.log_buffer.push_back(line.to_string());
        while state.log_buffer.len() > self.config.log_buffer_limit {
            state.log_buffer.pop_front();
        }
    }

    fn classify(
        &self,
        line: &str,
        following: &[&str],
        recent: &VecDeque<String>,
    ) -> Option<(ErrorEvent, usize)> {
        for rule in &self.rules {
            let Some(caps) = rule.pattern.captures(line) else {
                continue;
            };
            let input = RuleInput {
                caps,
                line,
                following,
                recent,
            };
            let extracted = (rule.extract)(&input);
            debug!(rule = rule.name, "log line classified");

            let mut event = ErrorEvent::new(rule.kind, rule.severity, extracted.message);
            event.stack_trace = extracted.stack_trace;
            event.context = extracted.context;
            event.metadata = extracted.metadata;
            event
                .metadata
                .insert("rule".to_string(), Value::String(rule.name.to_string()));
            return Some((event, extracted.consumed));
        }
        None
    }

    /// Normalise a manually reported error and route it through dedupe/publish.
    pub fn report_error(
        &self,
        error: impl Into<ReportedError>,
        overrides: ReportOverrides,
    ) -> Option<ErrorEvent> {
        let reported = error.into();

        let (mut event, _) = {
            let state = self.state();
            self.classify(&reported.message, &[], &state.log_buffer)
        }
        .unwrap_or_else(|| {
            (
                ErrorEvent::new(ErrorKind::Runtime, Severity::High, reported.message.clone()),
                0,
            )
        });

        if reported.stack_trace.is_some() {
            event.stack_trace = reported.stack_trace;
        }
        if let Some(kind) = overrides.kind {
            event.kind = kind;
        }
        if let Some(severity) = overrides.severity {
            event.severity = severity;
        }
        if overrides.file.is_some() || overrides.line.is_some() || overrides.function.is_some() {
            let mut context = event.context.take().unwrap_or_default();
            if overrides.file.is_some() {
                context.file = overrides.file;
            }
            if overrides.line.is_some() {
                context.line = overrides.line;
            }
            if overrides.function.is_some() {
                context.function = overrides.function;
            }
            event.context = Some(context);
        }
        event.metadata.extend(overrides.metadata);
        event
            .metadata
            .insert("source".to_string(), Value::String("report".to_string()));

        self.record(event)
    }

    /// Dedupe against recent history, then store and publish.
    fn record(&self, event: ErrorEvent) -> Option<ErrorEvent> {
        let window_ms = (self.config.dedupe_window_secs * 1000) as i64;
        {
            let mut state = self.state();
            let duplicate = state
                .history
                .iter()
                .rev()
                .take(self.config.dedupe_lookback)
                .any(|prev| {
                    prev.message == event.message
                        && event
                            .timestamp
                            .signed_duration_since(prev.timestamp)
                            .num_milliseconds()
                            .abs()
                            < window_ms
                });
            if duplicate {
                debug!(message = %event.message, "duplicate error suppressed");
                return None;
            }

            state.history.push_back(event.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
        }

        warn!(
            error_id = %event.id,
            kind = %event.kind,
            severity = %event.severity,
            message = %event.message,
            "error detected"
        );
        // No receivers is fine; publishing never blocks on subscribers.
        let _ = self.events.send(event.clone());
        Some(event)
    }

    pub fn history(&self) -> Vec<ErrorEvent> {
        self.state().history.iter().cloned().collect()
    }

    pub fn find_event(&self, id: &str) -> Option<ErrorEvent> {
        self.state().history.iter().find(|e| e.id == id).cloned()
    }

    /// Most recent `n` raw log lines, oldest first
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        let state = self.state();
        let skip = state.log_buffer.len().saturating_sub(n);
        state.log_buffer.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.history.clear();
        state.log_buffer.clear();
        info!("error monitor history cleared");
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
