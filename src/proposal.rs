//! Multi-agent patch proposals.
//!
//! One error is sent to every configured [`ReasoningAgent`] concurrently. Agents
//! that fail or time out are dropped; the survivors are scored, compared, and
//! merged into a single recommended solution.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ProposalConfig;
use crate::error::{AgentError, ProposalError};
use crate::llm::ReasoningAgent;
use crate::monitor::{ErrorEvent, ErrorKind, Severity};

/// Identity the merged solution is attributed to when several agents contributed
pub const MERGED_AGENT_ID: &str = "consensus";

/// Confidence bonus granted to a merged solution
pub const MERGE_BONUS: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for PatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One file change proposed by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    #[serde(alias = "path")]
    pub file: String,
    pub action: PatchAction,
    /// Full replacement content (create/modify), or splice content with a line range
    #[serde(default)]
    pub content: Option<String>,
    /// 1-based inclusive start line for a splice
    #[serde(default, alias = "line_start")]
    pub line_start: Option<usize>,
    /// 1-based inclusive end line for a splice
    #[serde(default, alias = "line_end")]
    pub line_end: Option<usize>,
    #[serde(default)]
    pub description: String,
}

impl FilePatch {
    pub fn line_range(&self) -> Option<(usize, usize)> {
        match (self.line_start, self.line_end) {
            (Some(start), Some(end)) => Some((start, end)),
            (Some(start), None) => Some((start, start)),
            _ => None,
        }
    }
}

/// A proposed fix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "root_cause")]
    pub root_cause: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub patches: Vec<FilePatch>,
    #[serde(
        default,
        alias = "requiresDependencyReinstall",
        alias = "requires_dependency_reinstall",
        alias = "needs_reinstall"
    )]
    pub needs_reinstall: bool,
    #[serde(default, alias = "requiresRebuild", alias = "needs_rebuild")]
    pub needs_rebuild: bool,
    #[serde(default, alias = "requiresRestart", alias = "needs_restart")]
    pub needs_restart: bool,
}

impl Solution {
    /// Placeholder used when an agent reply contains no parseable JSON
    pub fn manual_review(raw: &str) -> Self {
        let excerpt: String = raw.chars().take(500).collect();
        Self {
            description: "Automated analysis could not be parsed; manual review required"
                .to_string(),
            root_cause: excerpt,
            steps: vec!["Review the error and the agent response manually".to_string()],
            patches: Vec::new(),
            needs_reinstall: false,
            needs_rebuild: false,
            needs_restart: false,
        }
    }
}

/// Result of parsing an agent reply
#[derive(Debug, Clone, PartialEq)]
pub enum SolutionParse {
    Parsed(Solution),
    Unparsed { reason: String },
}

impl SolutionParse {
    /// Resolve to a usable solution, falling back to the manual review
    /// placeholder. Returns `true` alongside a degraded solution.
    pub fn into_solution(self, raw: &str) -> (Solution, bool) {
        match self {
            Self::Parsed(solution) => (solution, false),
            Self::Unparsed { reason } => {
                debug!(reason = %reason, "falling back to manual review solution");
                (Solution::manual_review(raw), true)
            }
        }
    }
}

/// Extract a [`Solution`] from free text: a fenced ```json block first, then
/// the outermost `{...}` span. Never panics or propagates a parse error.
pub fn parse_solution(text: &str) -> SolutionParse {
    let fenced = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```")
        .expect("fence pattern is valid");

    let mut last_error = String::from("no JSON object found");

    if let Some(body) = fenced.captures(text).and_then(|c| c.get(1)) {
        match serde_json::from_str::<Solution>(body.as_str()) {
            Ok(solution) => return SolutionParse::Parsed(solution),
            Err(e) => last_error = format!("fenced block: {}", e),
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            match serde_json::from_str::<Solution>(&text[start..=end]) {
                Ok(solution) => return SolutionParse::Parsed(solution),
                Err(e) => last_error = format!("object span: {}", e),
            }
        }
    }

    SolutionParse::Unparsed { reason: last_error }
}

/// Deterministic confidence score in [0, 100]
pub fn score_confidence(solution: &Solution, severity: Severity) -> u8 {
    let mut score: i32 = 50;
    if solution.root_cause.chars().count() > 20 {
        score += 10;
    }
    if !solution.steps.is_empty() {
        score += 10;
    }
    if !solution.patches.is_empty() {
        score += 20;
    }
    score += 5 * solution
        .patches
        .iter()
        .filter(|p| p.content.is_some())
        .count() as i32;
    match severity {
        Severity::Low => score += 10,
        Severity::Critical => score -= 10,
        _ => {}
    }
    score.clamp(0, 100) as u8
}

/// One agent's proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchProposal {
    pub agent: String,
    pub latency_ms: u64,
    pub confidence: u8,
    pub solution: Solution,
    /// The reply was unparseable and `solution` is the manual review placeholder
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub agent: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

/// The solution actually handed to the patch engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedSolution {
    pub agent: String,
    pub confidence: u8,
    pub solution: Solution,
    pub contributing_agents: Vec<String>,
}

/// All proposals for one error, compared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalComparison {
    pub error_id: String,
    pub proposals: Vec<PatchProposal>,
    pub recommended: PatchProposal,
    pub agreement_score: u8,
    pub disagreements: Vec<String>,
    pub analysis: Vec<AgentAnalysis>,
    pub merged: MergedSolution,
}

/// Agreement across proposals in [0, 100].
///
/// Mean of file agreement (files touched by every proposal over all touched
/// files) and step agreement (case-insensitive substring matches over all
/// cross-proposal step pairs). Each half is 100 when there is nothing to compare.
pub fn agreement_score(proposals: &[PatchProposal]) -> u8 {
    if proposals.len() < 2 {
        return 100;
    }

    let file_sets: Vec<HashSet<&str>> = proposals
        .iter()
        .map(|p| p.solution.patches.iter().map(|f| f.file.as_str()).collect())
        .collect();
    let all_files: HashSet<&str> = file_sets.iter().flatten().copied().collect();
    let file_agreement = if all_files.is_empty() {
        100.0
    } else {
        let common = all_files
            .iter()
            .filter(|f| file_sets.iter().all(|set| set.contains(*f)))
            .count();
        common as f64 / all_files.len() as f64 * 100.0
    };

    let lowered: Vec<Vec<String>> = proposals
        .iter()
        .map(|p| p.solution.steps.iter().map(|s| s.to_lowercase()).collect())
        .collect();
    let mut similar = 0usize;
    let mut comparisons = 0usize;
    for i in 0..lowered.len() {
        for j in (i + 1)..lowered.len() {
            for a in &lowered[i] {
                for b in &lowered[j] {
                    comparisons += 1;
                    if a.contains(b.as_str()) || b.contains(a.as_str()) {
                        similar += 1;
                    }
                }
            }
        }
    }
    let step_agreement = if comparisons == 0 {
        100.0
    } else {
        similar as f64 / comparisons as f64 * 100.0
    };

    ((file_agreement + step_agreement) / 2.0).round() as u8
}

fn find_disagreements(proposals: &[PatchProposal]) -> Vec<String> {
    let mut out = Vec::new();
    if proposals.len() < 2 {
        return out;
    }

    let mut files: Vec<&str> = Vec::new();
    for p in proposals {
        for patch in &p.solution.patches {
            if !files.contains(&patch.file.as_str()) {
                files.push(&patch.file);
            }
        }
    }
    for file in files {
        let actions: Vec<Option<PatchAction>> = proposals
            .iter()
            .map(|p| {
                p.solution
                    .patches
                    .iter()
                    .find(|f| f.file == file)
                    .map(|f| f.action)
            })
            .collect();
        if actions.iter().any(Option::is_none) {
            out.push(format!("only some agents change {}", file));
        } else {
            let first = actions[0];
            if actions.iter().any(|a| *a != first) {
                out.push(format!("agents propose different actions for {}", file));
            }
        }
    }

    let flags: [(&str, fn(&Solution) -> bool); 3] = [
        ("dependency reinstall", |s| s.needs_reinstall),
        ("rebuild", |s| s.needs_rebuild),
        ("restart", |s| s.needs_restart),
    ];
    for (name, get) in flags {
        let first = get(&proposals[0].solution);
        if proposals.iter().any(|p| get(&p.solution) != first) {
            out.push(format!("agents disagree on whether a {} is required", name));
        }
    }

    out
}

fn analyze(proposal: &PatchProposal) -> AgentAnalysis {
    let s = &proposal.solution;
    let mut strengths = Vec::new();
    let mut weaknesses = Vec::new();

    if proposal.degraded {
        weaknesses.push("response could not be parsed".to_string());
    }
    if s.patches.is_empty() {
        weaknesses.push("no file patches provided".to_string());
    } else {
        strengths.push(format!("provides {} concrete file patch(es)", s.patches.len()));
    }
    if s.root_cause.chars().count() > 100 {
        strengths.push("detailed root cause analysis".to_string());
    } else if s.root_cause.chars().count() <= 20 {
        weaknesses.push("root cause not explained".to_string());
    }
    if s.steps.len() >= 3 {
        strengths.push("clear step-by-step remediation".to_string());
    } else if s.steps.is_empty() {
        weaknesses.push("no remediation steps".to_string());
    }
    if proposal.confidence >= 80 {
        strengths.push("high confidence".to_string());
    }

    AgentAnalysis {
        agent: proposal.agent.clone(),
        strengths,
        weaknesses,
    }
}

/// Highest confidence wins; ties keep the earliest proposal.
fn recommended_index(proposals: &[PatchProposal]) -> usize {
    let mut best = 0;
    for (i, p) in proposals.iter().enumerate() {
        if p.confidence > proposals[best].confidence {
            best = i;
        }
    }
    best
}

/// Merge proposals. A single proposal is returned unchanged.
pub fn merge_proposals(proposals: &[PatchProposal], recommended: &PatchProposal) -> MergedSolution {
    if proposals.len() == 1 {
        return MergedSolution {
            agent: recommended.agent.clone(),
            confidence: recommended.confidence,
            solution: recommended.solution.clone(),
            contributing_agents: vec![recommended.agent.clone()],
        };
    }

    let mut steps: Vec<String> = Vec::new();
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut seen: HashSet<(String, PatchAction)> = HashSet::new();

    for p in proposals {
        for step in &p.solution.steps {
            if !steps.contains(step) {
                steps.push(step.clone());
            }
        }
        for patch in &p.solution.patches {
            if seen.insert((patch.file.clone(), patch.action)) {
                patches.push(patch.clone());
            }
        }
    }

    MergedSolution {
        agent: MERGED_AGENT_ID.to_string(),
        confidence: recommended.confidence.saturating_add(MERGE_BONUS).min(100),
        solution: Solution {
            description: recommended.solution.description.clone(),
            root_cause: recommended.solution.root_cause.clone(),
            steps,
            patches,
            needs_reinstall: proposals.iter().any(|p| p.solution.needs_reinstall),
            needs_rebuild: proposals.iter().any(|p| p.solution.needs_rebuild),
            needs_restart: proposals.iter().any(|p| p.solution.needs_restart),
        },
        contributing_agents: proposals.iter().map(|p| p.agent.clone()).collect(),
    }
}

/// Compare a non-empty set of proposals for one error
pub fn compare_proposals(error_id: &str, proposals: Vec<PatchProposal>) -> ProposalComparison {
    let recommended = proposals[recommended_index(&proposals)].clone();
    let merged = merge_proposals(&proposals, &recommended);
    ProposalComparison {
        error_id: error_id.to_string(),
        agreement_score: agreement_score(&proposals),
        disagreements: find_disagreements(&proposals),
        analysis: proposals.iter().map(analyze).collect(),
        recommended,
        merged,
        proposals,
    }
}

/// Build the structured prompt sent to every agent
pub fn build_prompt(error: &ErrorEvent, code_context: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("A running application reported an error. Diagnose it and propose a fix.\n\n");
    prompt.push_str(&format!("Error type: {}\n", error.kind));
    prompt.push_str(&format!("Severity: {}\n", error.severity));
    prompt.push_str(&format!("Message: {}\n", error.message));
    if let Some(ctx) = &error.context {
        if let Some(file) = &ctx.file {
            prompt.push_str(&format!("File: {}\n", file));
        }
        if let Some(line) = ctx.line {
            prompt.push_str(&format!("Line: {}\n", line));
        }
        if let Some(function) = &ctx.function {
            prompt.push_str(&format!("Function: {}\n", function));
        }
    }
    if let Some(stack) = &error.stack_trace {
        prompt.push_str(&format!("\nStack trace:\n{}\n", stack));
    }
    if !code_context.is_empty() {
        prompt.push_str(&format!("\nCode context:\n{}\n", code_context));
    }
    prompt.push_str(
        "\nReply with a JSON object in a ```json block with fields: description, rootCause, \
steps (array of strings), patches (array of {file, action: create|modify|delete, content, \
lineStart, lineEnd, description}), needsReinstall, needsRebuild, needsRestart.\n",
    );
    prompt
}

/// Queries reasoning agents and compares their proposals
pub struct PatchProposalService {
    agents: Vec<Arc<dyn ReasoningAgent>>,
    config: ProposalConfig,
    project_root: PathBuf,
    timeout: Duration,
}

impl PatchProposalService {
    pub fn new(
        agents: Vec<Arc<dyn ReasoningAgent>>,
        config: ProposalConfig,
        project_root: PathBuf,
    ) -> Self {
        let timeout = Duration::from_secs(config.agent_timeout_secs);
        Self {
            agents,
            config,
            project_root,
            timeout,
        }
    }

    /// Override the per-agent timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Gather source lines around the failure plus kind-specific config files
    pub async fn gather_context(&self, error: &ErrorEvent) -> String {
        let mut sections = Vec::new();

        if let Some(ctx) = &error.context {
            if let Some(file) = &ctx.file {
                match tokio::fs::read_to_string(self.resolve(file)).await {
                    Ok(source) => {
                        sections.push(format!(
                            "--- {} ---\n{}",
                            file,
                            excerpt(&source, ctx.line, self.config.context_radius)
                        ));
                    }
                    Err(e) => debug!(file = %file, error = %e, "source file unavailable"),
                }
            }
        }

        let extra = match error.kind {
            ErrorKind::Dependency => Some(&self.config.manifest_file),
            ErrorKind::TypeCheck => Some(&self.config.compiler_config_file),
            _ => None,
        };
        if let Some(name) = extra {
            match tokio::fs::read_to_string(self.project_root.join(name)).await {
                Ok(content) => sections.push(format!("--- {} ---\n{}", name, content)),
                Err(e) => debug!(file = %name, error = %e, "config file unavailable"),
            }
        }

        sections.join("\n\n")
    }

    /// Consult every agent concurrently and compare the surviving proposals.
    /// Fails only when no agent produced a reply.
    pub async fn generate_patches(
        &self,
        error: &ErrorEvent,
    ) -> Result<ProposalComparison, ProposalError> {
        if self.agents.is_empty() {
            return Err(ProposalError::NoAgents);
        }

        let code_context = self.gather_context(error).await;
        let prompt = Arc::new(build_prompt(error, &code_context));

        info!(
            error_id = %error.id,
            agents = self.agents.len(),
            context_bytes = code_context.len(),
            "requesting patch proposals"
        );

        let mut set = JoinSet::new();
        for (index, agent) in self.agents.iter().enumerate() {
            let agent = Arc::clone(agent);
            let prompt = Arc::clone(&prompt);
            let timeout = self.timeout;
            set.spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, agent.consult(&prompt))
                    .await
                    .unwrap_or_else(|_| Err(AgentError::Timeout(timeout.as_millis() as u64)));
                (index, agent.id(), started.elapsed(), outcome)
            });
        }

        let mut replies = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, agent, elapsed, Ok(text))) => {
                    replies.push((index, agent, elapsed, text));
                }
                Ok((_, agent, _, Err(e))) => {
                    warn!(agent = %agent, error = %e, "agent consultation failed");
                    errors.push(format!("{}: {}", agent, e));
                }
                Err(e) => {
                    warn!(error = %e, "agent task aborted");
                    errors.push(format!("task: {}", e));
                }
            }
        }

        if replies.is_empty() {
            return Err(ProposalError::AllAgentsFailed {
                attempted: self.agents.len(),
                errors,
            });
        }

        replies.sort_by_key(|(index, ..)| *index);
        let proposals: Vec<PatchProposal> = replies
            .into_iter()
            .map(|(_, agent, elapsed, text)| {
                let (solution, degraded) = parse_solution(&text).into_solution(&text);
                let confidence = score_confidence(&solution, error.severity);
                PatchProposal {
                    agent,
                    latency_ms: elapsed.as_millis() as u64,
                    confidence,
                    solution,
                    degraded,
                }
            })
            .collect();

        let comparison = compare_proposals(&error.id, proposals);
        info!(
            error_id = %error.id,
            proposals = comparison.proposals.len(),
            failed_agents = errors.len(),
            recommended = %comparison.recommended.agent,
            agreement = comparison.agreement_score,
            merged_confidence = comparison.merged.confidence,
            "patch proposals compared"
        );
        Ok(comparison)
    }
}

/// Numbered source excerpt around `line` (1-based); whole file head if unknown
fn excerpt(source: &str, line: Option<usize>, radius: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let (start, end, marked) = match line {
        Some(l) if l >= 1 => (
            l.saturating_sub(radius + 1),
            (l + radius).min(lines.len()),
            Some(l),
        ),
        _ => (0, (radius * 2 + 1).min(lines.len()), None),
    };
    lines
        .iter()
        .enumerate()
        .take(end)
        .skip(start)
        .map(|(i, text)| {
            let n = i + 1;
            let marker = if Some(n) == marked { ">>" } else { "  " };
            format!("{} {:>4} | {}", marker, n, text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
