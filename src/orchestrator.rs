//! The PR run orchestrator.
//!
//! Transforms one accepted webhook event into a complete run: workspace,
//! clone, recipe, image build, streamed container run, section extraction,
//! the two iterative LLM review loops, and the persisted run record. Each
//! run owns three idempotent PR comments (progress, code review, sandbox
//! review), each located by its own HTML marker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::container::{self, ContainerRuntime, ContainerStat, RunEvent, RunOptions};
use crate::error::{Error, Result};
use crate::llm::{prompts, LlmClient};
use crate::platform::PlatformClient;
use crate::recipe;
use crate::review::{self, FileDiff, ReviewIteration, ReviewRequest, ReviewSink};
use crate::sections;
use crate::store::{EventKind, RunStatus, RunStore};
use crate::workspace::{self, Workspace};

/// Family token embedded in every orchestrator-owned comment.
pub const SADGUARD_MARKER: &str = "<!-- sadguard-progress -->";

/// Scan marker of a run's live progress comment.
pub fn progress_marker(run_id: i64) -> String {
    format!("<!-- sadguard-run-{}-progress -->", run_id)
}

/// Scan marker of a run's consolidated code-review comment.
pub fn code_review_marker(run_id: i64) -> String {
    format!("<!-- sadguard-run-{}-code-review -->", run_id)
}

/// Scan marker of a run's consolidated sandbox-review comment.
pub fn sandbox_review_marker(run_id: i64) -> String {
    format!("<!-- sadguard-run-{}-sandbox-review -->", run_id)
}

const GREETING: &str = "Thanks for the pull request! 🎉";

/// Minimum wall time between progress-comment log updates.
const LOG_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
/// Minimum wall time between progress-comment stat updates.
const STAT_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
/// How many trailing log chunks the progress comment shows.
const LOG_TAIL_CHUNKS: usize = 50;

/// Outcome of dispatching one webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The event kind does not trigger a run.
    Ignored,
    /// A run was executed to termination.
    Ran,
}

/// Parsed `pull_request` webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub repository: RepositoryInfo,
    pub pull_request: PullRequestInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub clone_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestInfo {
    pub number: i64,
    /// API URL of the pull request.
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub head: HeadInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeadInfo {
    #[serde(rename = "ref", default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
}

/// The run state machine, wired once at startup with its collaborators.
pub struct Orchestrator {
    platform: Arc<dyn PlatformClient>,
    runtime: Arc<dyn ContainerRuntime>,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn RunStore>,
    image_name: String,
    sandbox_timeout: Duration,
    log_update_interval: Duration,
    stat_update_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        runtime: Arc<dyn ContainerRuntime>,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn RunStore>,
        image_name: impl Into<String>,
        sandbox_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            runtime,
            llm,
            store,
            image_name: image_name.into(),
            sandbox_timeout,
            log_update_interval: LOG_UPDATE_INTERVAL,
            stat_update_interval: STAT_UPDATE_INTERVAL,
        }
    }

    /// Overrides the progress-comment throttles.
    pub fn with_progress_intervals(mut self, log: Duration, stat: Duration) -> Self {
        self.log_update_interval = log;
        self.stat_update_interval = stat;
        self
    }

    /// Dispatches one verified webhook delivery.
    ///
    /// Only `pull_request` events trigger a run; anything else is
    /// acknowledged without work.
    pub async fn handle_event(&self, event: &str, payload: &serde_json::Value) -> Result<Dispatch> {
        if event != "pull_request" {
            tracing::debug!(event, "ignoring event kind");
            return Ok(Dispatch::Ignored);
        }

        let payload: WebhookPayload =
            serde_json::from_value(payload.clone()).map_err(|e| Error::Payload(e.to_string()))?;
        self.run_pull_request(payload).await?;
        Ok(Dispatch::Ran)
    }

    async fn run_pull_request(&self, payload: WebhookPayload) -> Result<()> {
        let repo = payload.repository.full_name.clone();
        let pr = payload.pull_request.number;
        let pr_title = payload.pull_request.title.clone();
        let pr_body = payload.pull_request.body.clone().unwrap_or_default();

        tracing::info!(
            repo,
            pr,
            head = payload.pull_request.head.sha.as_deref().unwrap_or(""),
            "starting PR run"
        );

        self.comment_best_effort(&repo, pr, GREETING).await;
        self.store
            .record_event(&repo, EventKind::PrOpened, pr, serde_json::json!({"review": GREETING}))
            .await?;

        // Diff classification: only modified files contribute diffs, and
        // changes to the sandbox recipe itself are flagged.
        let files = self.platform.list_pr_files(&payload.pull_request.url).await?;
        let mut diffs: Vec<FileDiff> = Vec::new();
        let mut dockerfile_modified = false;
        let mut wrapper_modified = false;
        for file in files {
            if file.status != "modified" {
                continue;
            }
            if file.filename == recipe::DOCKERFILE_PATH {
                dockerfile_modified = true;
                continue;
            }
            if file.filename == recipe::WRAPPER_PATH {
                wrapper_modified = true;
                continue;
            }
            if let Some(patch) = file.patch {
                diffs.push(FileDiff {
                    filename: file.filename,
                    diff: patch,
                });
            }
        }

        if dockerfile_modified && wrapper_modified {
            let warning = ".sadguard/Dockerfile or .sadguard/wrapper.sh is modified.";
            self.comment_best_effort(&repo, pr, warning).await;
            self.store
                .record_event(
                    &repo,
                    EventKind::SadguardConfigModified,
                    pr,
                    serde_json::json!({"error": warning}),
                )
                .await?;
        }

        let run_id = self.store.create_run(&repo, pr, &self.image_name).await?;

        let Some(branch) = payload.pull_request.head.branch.clone() else {
            return self
                .fail_run(
                    run_id,
                    &repo,
                    pr,
                    RunStatus::CloneError,
                    EventKind::CloneError,
                    "Could not determine pull request branch from payload.",
                )
                .await;
        };

        let ws = Workspace::create()?;
        if let Err(e) = workspace::clone_branch(&payload.repository.clone_url, &branch, ws.path()).await
        {
            return self
                .fail_run(run_id, &repo, pr, RunStatus::CloneError, EventKind::CloneError, &e.to_string())
                .await;
        }

        if let Err(e) = recipe::resolve(ws.path()) {
            let message = format!("Error during container build: {}", e);
            return self
                .fail_run(run_id, &repo, pr, RunStatus::BuildError, EventKind::BuildError, &message)
                .await;
        }

        // Pre-run code review over the diffs alone.
        let code_request = ReviewRequest::code_review(
            pr_title.clone(),
            pr_body.clone(),
            diffs.clone(),
            code_review_questions(),
        );
        let sink = StoreSink {
            store: self.store.clone(),
            run_id,
        };
        let code_iterations = review::run_review_loop(self.llm.as_ref(), &code_request, &sink).await;
        self.post_code_review(run_id, &repo, pr, &code_iterations).await;

        if let Err(e) = self
            .runtime
            .build_image(&self.image_name, ws.path(), Some(recipe::DOCKERFILE_PATH))
            .await
        {
            let message = format!("Error during container build: {}", e);
            return self
                .fail_run(run_id, &repo, pr, RunStatus::BuildError, EventKind::BuildError, &message)
                .await;
        }

        let container_id = match self
            .runtime
            .start_container(&self.image_name, &RunOptions::default())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Error while running container: {}", e);
                return self
                    .fail_run(
                        run_id,
                        &repo,
                        pr,
                        RunStatus::ContainerRunError,
                        EventKind::ContainerRunError,
                        &message,
                    )
                    .await;
            }
        };
        self.store.set_run_status(run_id, RunStatus::Running, None).await?;

        // Bounded channel: the log producer cannot outrun the comment
        // writer without backpressure.
        let (events_tx, events_rx) = mpsc::channel(64);
        let reporter = tokio::spawn(progress_reporter(
            self.platform.clone(),
            self.store.clone(),
            run_id,
            repo.clone(),
            pr,
            events_rx,
            self.log_update_interval,
            self.stat_update_interval,
        ));

        let outcome = container::run_to_completion(
            self.runtime.clone(),
            &container_id,
            self.sandbox_timeout,
            events_tx,
        )
        .await;
        let _ = reporter.await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("Error while running container: {}", e);
                return self
                    .fail_run(
                        run_id,
                        &repo,
                        pr,
                        RunStatus::ContainerRunError,
                        EventKind::ContainerRunError,
                        &message,
                    )
                    .await;
            }
        };

        let code_output = sections::extract(&outcome.logs, sections::CODE_OUTPUT);
        let code_error = sections::extract(&outcome.logs, sections::CODE_ERROR);
        let mitm_log = sections::extract(&outcome.logs, sections::MITM_LOG);
        let tcpdump_log = sections::extract(&outcome.logs, sections::TCPDUMP_LOG);

        let mitm_review = if sections::mitm_is_useful(&mitm_log) {
            self.network_review(&mitm_log).await
        } else {
            "Not enough Mitmproxy logs captured.".to_string()
        };
        let tcpdump_review = if sections::tcpdump_is_useful(&tcpdump_log) {
            self.network_review(&tcpdump_log).await
        } else {
            "No / Not enough Tcpdump logs captured.".to_string()
        };

        // Post-run sandbox review over diffs plus runtime observations.
        let sandbox_request = ReviewRequest {
            pr_title,
            pr_body,
            diffs,
            run_results: Some(code_output.clone()),
            analysis_results: Some(format!("{}\n\n{}", mitm_review, tcpdump_review)),
            questions: sandbox_review_questions(),
            max_iterations: review::DEFAULT_MAX_ITERATIONS,
        };
        let sandbox_iterations =
            review::run_review_loop(self.llm.as_ref(), &sandbox_request, &sink).await;

        self.store
            .finish_run(run_id, RunStatus::Completed, outcome.exit_code)
            .await?;
        self.store
            .record_event(
                &repo,
                EventKind::TestsComplete,
                pr,
                serde_json::json!({"result": code_error}),
            )
            .await?;

        let body = sandbox_review_body(
            run_id,
            &sandbox_iterations,
            outcome.exit_code,
            &mitm_review,
            &tcpdump_review,
            &code_output,
            &code_error,
        );
        self.post_sandbox_review(run_id, &repo, pr, &body).await;

        tracing::info!(repo, pr, run_id, exit_code = outcome.exit_code, "PR run complete");
        Ok(())
    }

    /// Records a terminal error: one plain PR comment, one audit event, and
    /// the matching run status. The run ends here without retry.
    async fn fail_run(
        &self,
        run_id: i64,
        repo: &str,
        pr: i64,
        status: RunStatus,
        kind: EventKind,
        message: &str,
    ) -> Result<()> {
        tracing::error!(repo, pr, run_id, message, "run failed");
        self.comment_best_effort(repo, pr, message).await;
        self.store
            .record_event(repo, kind, pr, serde_json::json!({"error": message}))
            .await?;
        self.store.set_run_status(run_id, status, Some(message)).await?;
        Ok(())
    }

    async fn comment_best_effort(&self, repo: &str, pr: i64, body: &str) {
        if let Err(e) = self.platform.create_comment(repo, pr, body).await {
            tracing::warn!(repo, pr, error = %e, "failed to post comment");
        }
    }

    async fn network_review(&self, log: &str) -> String {
        match self.llm.complete(&prompts::network_analysis(log)).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "network analysis failed");
                format!("Network analysis failed: {}", e)
            }
        }
    }

    /// Upserts the consolidated code-review comment and caches its id.
    async fn post_code_review(
        &self,
        run_id: i64,
        repo: &str,
        pr: i64,
        iterations: &[ReviewIteration],
    ) {
        let body = code_review_body(run_id, iterations);
        let marker = code_review_marker(run_id);
        let known_id = self.cached_comment_id(run_id, CommentRole::CodeReview).await;
        match self
            .platform
            .upsert_marked_comment(repo, pr, &body, &marker, known_id)
            .await
        {
            Ok(id) => {
                if known_id != Some(id) {
                    if let Err(e) = self.store.set_code_review_comment(run_id, id).await {
                        tracing::warn!(run_id, error = %e, "failed to cache code-review comment id");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(repo, pr, error = %e, "code-review upsert failed, posting plain comment");
                self.comment_best_effort(repo, pr, &body).await;
            }
        }
    }

    /// Upserts the consolidated sandbox-review comment and caches its id.
    async fn post_sandbox_review(&self, run_id: i64, repo: &str, pr: i64, body: &str) {
        let marker = sandbox_review_marker(run_id);
        let known_id = self.cached_comment_id(run_id, CommentRole::SandboxReview).await;
        match self
            .platform
            .upsert_marked_comment(repo, pr, body, &marker, known_id)
            .await
        {
            Ok(id) => {
                if known_id != Some(id) {
                    if let Err(e) = self.store.set_sandbox_review_comment(run_id, id).await {
                        tracing::warn!(run_id, error = %e, "failed to cache sandbox-review comment id");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(repo, pr, error = %e, "sandbox-review upsert failed, posting plain comment");
                self.comment_best_effort(repo, pr, body).await;
            }
        }
    }

    async fn cached_comment_id(&self, run_id: i64, role: CommentRole) -> Option<u64> {
        let run = self.store.get_run(run_id).await.ok().flatten()?;
        match role {
            CommentRole::CodeReview => run.code_review_comment_id,
            CommentRole::SandboxReview => run.sandbox_review_comment_id,
        }
    }
}

#[derive(Clone, Copy)]
enum CommentRole {
    CodeReview,
    SandboxReview,
}

/// Persists review-loop iterations as `ai_review` rows.
struct StoreSink {
    store: Arc<dyn RunStore>,
    run_id: i64,
}

#[async_trait::async_trait]
impl ReviewSink for StoreSink {
    async fn store_iteration(&self, iteration: u32, content: &str) {
        if let Err(e) = self.store.add_review(self.run_id, "assistant", content).await {
            tracing::warn!(run_id = self.run_id, iteration, error = %e, "failed to persist review iteration");
        }
    }
}

fn code_review_questions() -> Vec<String> {
    [
        "Does the change introduce network connections to external hosts? If so, list probable destinations.",
        "Does the diff introduce elevated permissions, use of privileged operations, or system calls that look suspicious?",
        "Are the new or modified files performing filesystem, subprocess, or network operations that could be abused?",
        "When analyzing tcpdump outputs, ignore promiscuous mode warnings or errors — focus on real flows and suspicious connections.",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn sandbox_review_questions() -> Vec<String> {
    [
        "Does the change introduce network connections to external hosts? If so, list probable destinations.",
        "Does the diff introduce any elevated permissions or privileged operations?",
        "Are the provided tests sufficient to cover new functionality?",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Consumes the driver's event channel and keeps the single progress
/// comment current, throttled to one log update per `log_interval` and one
/// stat update per `stat_interval` of wall time. Platform failures here are
/// swallowed: progress must not crash a run.
#[allow(clippy::too_many_arguments)]
async fn progress_reporter(
    platform: Arc<dyn PlatformClient>,
    store: Arc<dyn RunStore>,
    run_id: i64,
    repo: String,
    pr: i64,
    mut events: mpsc::Receiver<RunEvent>,
    log_interval: Duration,
    stat_interval: Duration,
) {
    let mut tail: VecDeque<String> = VecDeque::new();
    let mut last_update = Instant::now();
    let mut comment_id: Option<u64> = None;

    let marker = progress_marker(run_id);
    while let Some(event) = events.recv().await {
        let body = match event {
            RunEvent::Log(chunk) => {
                tail.push_back(chunk);
                while tail.len() > LOG_TAIL_CHUNKS {
                    tail.pop_front();
                }
                if last_update.elapsed() < log_interval {
                    continue;
                }
                progress_log_body(run_id, &tail)
            }
            RunEvent::Stat(stat) => {
                if last_update.elapsed() < stat_interval {
                    continue;
                }
                progress_stats_body(run_id, &stat)
            }
        };

        match platform
            .upsert_marked_comment(&repo, pr, &body, &marker, comment_id)
            .await
        {
            Ok(id) => {
                if comment_id.is_none() {
                    if let Err(e) = store.set_progress_comment(run_id, id).await {
                        tracing::warn!(run_id, error = %e, "failed to cache progress comment id");
                    }
                }
                comment_id = Some(id);
            }
            Err(e) => {
                tracing::warn!(repo, pr, error = %e, "progress upsert failed");
            }
        }
        last_update = Instant::now();
    }
}

fn progress_log_body(run_id: i64, tail: &VecDeque<String>) -> String {
    let snippet: String = tail.iter().map(String::as_str).collect();
    format!(
        "{}\n{}\n## SadGuard Sandbox Progress\n_Streaming logs below (truncated)_\n\n```\n{}\n```",
        SADGUARD_MARKER,
        progress_marker(run_id),
        snippet
    )
}

fn progress_stats_body(run_id: i64, stat: &ContainerStat) -> String {
    format!(
        "{}\n{}\n## SadGuard Resource Stats\n{}",
        SADGUARD_MARKER,
        progress_marker(run_id),
        stat_summary(stat)
    )
}

fn stat_summary(stat: &ContainerStat) -> String {
    let cpu = stat
        .cpu_percent
        .map(|c| format!("{:.2}%", c))
        .unwrap_or_else(|| "n/a".to_string());
    let fmt = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "n/a".to_string());
    format!(
        "CPU: {} Mem: {} / {} Net RX/TX: {}/{}",
        cpu,
        fmt(stat.mem_usage),
        fmt(stat.mem_limit),
        stat.net_rx,
        stat.net_tx
    )
}

fn code_review_body(run_id: i64, iterations: &[ReviewIteration]) -> String {
    let mut parts = vec![
        SADGUARD_MARKER.to_string(),
        code_review_marker(run_id),
        "## Iterative LLM Code Review".to_string(),
    ];
    for iteration in iterations {
        parts.push(format!("### Iteration {}", iteration.iteration));
        parts.push(iteration.content.clone());
        parts.push("---".to_string());
    }
    parts.join("\n")
}

fn sandbox_review_body(
    run_id: i64,
    iterations: &[ReviewIteration],
    exit_code: i64,
    mitm_review: &str,
    tcpdump_review: &str,
    code_output: &str,
    code_error: &str,
) -> String {
    let mut parts = vec![
        SADGUARD_MARKER.to_string(),
        sandbox_review_marker(run_id),
        "## Iterative LLM Sandbox Review".to_string(),
    ];
    for iteration in iterations {
        parts.push(format!("### Iteration {}", iteration.iteration));
        parts.push(iteration.content.clone());
        parts.push("---".to_string());
    }
    parts.push("## Sandbox Analysis".to_string());
    parts.push(format!("Exit code: {}\n", exit_code));
    parts.push("### Mitmproxy Analysis".to_string());
    parts.push(mitm_review.to_string());
    parts.push("### Tcpdump Analysis".to_string());
    parts.push(tcpdump_review.to_string());
    parts.push("## Complete Test Logs".to_string());
    parts.push(format!("### Unit Tests\n```\n{}\n```", code_output));
    parts.push(format!("### Code Error\n```\n{}\n```", code_error));
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::ReviewAction;

    fn iteration(i: u32, content: &str) -> ReviewIteration {
        ReviewIteration {
            iteration: i,
            content: content.to_string(),
            action: ReviewAction::None,
        }
    }

    #[test]
    fn webhook_payload_parses_with_missing_head_ref() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "repository": {"full_name": "o/r", "clone_url": "https://example.com/o/r.git"},
            "pull_request": {"number": 5, "url": "https://api.example.com/repos/o/r/pulls/5"}
        }))
        .unwrap();

        assert_eq!(payload.pull_request.number, 5);
        assert!(payload.pull_request.head.branch.is_none());
        assert!(payload.pull_request.title.is_empty());
    }

    #[test]
    fn code_review_body_embeds_markers_and_iterations() {
        let body = code_review_body(3, &[iteration(1, "first"), iteration(2, "second")]);
        assert!(body.starts_with(SADGUARD_MARKER));
        assert!(body.contains(&code_review_marker(3)));
        assert!(body.contains("## Iterative LLM Code Review"));
        assert!(body.contains("### Iteration 1\nfirst"));
        assert!(body.contains("### Iteration 2\nsecond"));
    }

    #[test]
    fn sandbox_review_body_carries_exit_code_and_sections() {
        let body = sandbox_review_body(
            3,
            &[iteration(1, "verdict")],
            0,
            "mitm ok",
            "tcpdump ok",
            "3 passed",
            "",
        );
        assert!(body.starts_with(SADGUARD_MARKER));
        assert!(body.contains(&sandbox_review_marker(3)));
        assert!(body.contains("Exit code: 0"));
        assert!(body.contains("### Mitmproxy Analysis\nmitm ok"));
        assert!(body.contains("### Tcpdump Analysis\ntcpdump ok"));
        assert!(body.contains("### Unit Tests\n```\n3 passed\n```"));
    }

    #[test]
    fn progress_log_body_fences_the_tail() {
        let tail: VecDeque<String> = ["a\n", "b\n"].iter().map(|s| s.to_string()).collect();
        let body = progress_log_body(3, &tail);
        assert!(body.starts_with(SADGUARD_MARKER));
        assert!(body.contains(&progress_marker(3)));
        assert!(body.contains("```\na\nb\n\n```"));
    }

    #[test]
    fn scan_markers_are_distinct_per_run_and_role() {
        assert_ne!(progress_marker(1), progress_marker(2));
        assert_ne!(progress_marker(1), code_review_marker(1));
        assert_ne!(code_review_marker(1), sandbox_review_marker(1));
    }

    #[test]
    fn stat_summary_formats_fields() {
        let stat = ContainerStat {
            cpu_percent: Some(12.345),
            mem_usage: Some(512),
            mem_limit: Some(4096),
            net_rx: 10,
            net_tx: 20,
        };
        assert_eq!(stat_summary(&stat), "CPU: 12.35% Mem: 512 / 4096 Net RX/TX: 10/20");
    }

    #[test]
    fn stat_summary_tolerates_missing_samples() {
        let summary = stat_summary(&ContainerStat::default());
        assert!(summary.contains("CPU: n/a"));
        assert!(summary.contains("Mem: n/a / n/a"));
    }
}
