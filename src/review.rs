//! Iterative LLM review loop.
//!
//! Each iteration sends the PR context, all prior iterations, the file
//! diffs, and any runtime observations, then parses a trailing `ACTION:`
//! token to decide whether to iterate again. The loop is bounded by
//! `max_iterations` and treats LLM failures as soft: what has been
//! persisted stays, and the loop simply ends.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::LlmClient;

/// Default iteration bound for a review loop.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// One changed file with its unified diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub filename: String,
    pub diff: String,
}

/// Continuation token parsed from the tail of an LLM reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewAction {
    ReRun,
    ReRunSandbox,
    ReRunCode,
    None,
    Escalate,
}

impl ReviewAction {
    /// Parses a token, defaulting to `None` so a malformed reply cannot
    /// cause a runaway loop.
    pub fn parse(token: &str) -> Self {
        match token.trim().to_lowercase().as_str() {
            "re-run" => Self::ReRun,
            "re-run-sandbox" => Self::ReRunSandbox,
            "re-run-code" => Self::ReRunCode,
            "escalate" => Self::Escalate,
            _ => Self::None,
        }
    }

    /// Whether the loop should run another iteration.
    pub fn continues(self) -> bool {
        matches!(self, Self::ReRun | Self::ReRunSandbox | Self::ReRunCode)
    }
}

/// Extracts the action from the last `ACTION:` line of a reply.
pub fn parse_action(text: &str) -> ReviewAction {
    let re = Regex::new(r"(?m)^ACTION:\s*(.+)$").expect("valid action regex");
    re.captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| ReviewAction::parse(m.as_str()))
        .unwrap_or(ReviewAction::None)
}

/// Inputs to one review loop invocation.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub pr_title: String,
    pub pr_body: String,
    pub diffs: Vec<FileDiff>,
    /// Sandbox run output (post-run reviews only).
    pub run_results: Option<String>,
    /// Network analysis output (post-run reviews only).
    pub analysis_results: Option<String>,
    /// Explicit questions the model must answer each iteration.
    pub questions: Vec<String>,
    pub max_iterations: u32,
}

impl ReviewRequest {
    /// A pre-run request over diffs alone.
    pub fn code_review(
        pr_title: impl Into<String>,
        pr_body: impl Into<String>,
        diffs: Vec<FileDiff>,
        questions: Vec<String>,
    ) -> Self {
        Self {
            pr_title: pr_title.into(),
            pr_body: pr_body.into(),
            diffs,
            run_results: None,
            analysis_results: None,
            questions,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// One completed iteration.
#[derive(Debug, Clone)]
pub struct ReviewIteration {
    pub iteration: u32,
    pub content: String,
    pub action: ReviewAction,
}

/// Persistence seam invoked with each iteration's content before the
/// continuation decision.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn store_iteration(&self, iteration: u32, content: &str);
}

/// Runs the bounded review loop.
///
/// Terminates on `ACTION: none`/`escalate`, on a malformed reply, on an LLM
/// failure, or after `max_iterations` completions, returning the iterations
/// gathered so far in order.
pub async fn run_review_loop(
    llm: &dyn LlmClient,
    request: &ReviewRequest,
    sink: &dyn ReviewSink,
) -> Vec<ReviewIteration> {
    let mut iterations: Vec<ReviewIteration> = Vec::new();
    let mut previous: Vec<String> = Vec::new();

    for iteration in 1..=request.max_iterations {
        let prompt = build_prompt(request, &previous);
        let content = match llm.complete(&prompt).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(iteration, error = %e, "LLM call failed, ending review loop");
                break;
            }
        };

        sink.store_iteration(iteration, &content).await;
        previous.push(content.clone());

        let action = parse_action(&content);
        iterations.push(ReviewIteration {
            iteration,
            content,
            action,
        });

        tracing::debug!(iteration, ?action, "review iteration complete");
        if !action.continues() {
            break;
        }
    }

    iterations
}

/// Assembles one iteration's prompt: preamble, PR context, prior
/// iterations, diffs, optional run and analysis results, questions, and
/// the `ACTION:` tail.
fn build_prompt(request: &ReviewRequest, previous: &[String]) -> String {
    let mut parts: Vec<String> = vec![
        "You are a VULNERABILITY and MALWARE DETECTION expert. Continue the iterative review based on the context provided.".to_string(),
        format!("PR Title: {}", request.pr_title),
        format!("PR Body: {}", request.pr_body),
    ];

    if !previous.is_empty() {
        parts.push(format!("Previous reviews:\n{}", previous.join("\n---\n")));
    }

    let snippets: Vec<String> = request
        .diffs
        .iter()
        .map(|d| format!("===== FILE: {} =====\n{}\n", d.filename, d.diff))
        .collect();
    parts.push(format!("Code diffs:\n{}", snippets.join("\n")));

    if let Some(run_results) = &request.run_results {
        parts.push(format!("Sandbox run results:\n{}", run_results));
    }
    if let Some(analysis_results) = &request.analysis_results {
        parts.push(format!("Analysis results:\n{}", analysis_results));
    }

    if !request.questions.is_empty() {
        let block: Vec<String> = request
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| format!("Q{}: {}", i + 1, q))
            .collect();
        parts.push(format!(
            "Answer the following questions concisely and with recommended actions:\n{}",
            block.join("\n")
        ));
    }

    parts.push(
        "Provide a concise markdown review. For each question above, include a short answer. \
         At the END of your reply include a single line that starts with 'ACTION:' followed by \
         one of the following tokens (lowercase): 're-run', 're-run-sandbox', 're-run-code', \
         'none', or 'escalate'. Example: ACTION: none\n\n\
         If you want another iteration, use 're-run' or the more specific \
         're-run-sandbox'/'re-run-code'. If no further iterations are needed, use 'ACTION: none'."
            .to_string(),
    );

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted LLM returning canned replies in order.
    struct FakeLlm {
        replies: Mutex<Vec<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeLlm {
        fn new(replies: Vec<Result<String>>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(Error::Llm("no scripted reply".to_string())))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        stored: Mutex<Vec<(u32, String)>>,
    }

    #[async_trait]
    impl ReviewSink for RecordingSink {
        async fn store_iteration(&self, iteration: u32, content: &str) {
            self.stored.lock().unwrap().push((iteration, content.to_string()));
        }
    }

    fn request() -> ReviewRequest {
        ReviewRequest::code_review(
            "Add feature",
            "Adds a feature",
            vec![FileDiff {
                filename: "app.py".to_string(),
                diff: "+print('hi')".to_string(),
            }],
            vec!["Does it phone home?".to_string()],
        )
    }

    #[test]
    fn parses_known_tokens() {
        assert_eq!(ReviewAction::parse("re-run"), ReviewAction::ReRun);
        assert_eq!(ReviewAction::parse(" Re-Run-Sandbox "), ReviewAction::ReRunSandbox);
        assert_eq!(ReviewAction::parse("re-run-code"), ReviewAction::ReRunCode);
        assert_eq!(ReviewAction::parse("escalate"), ReviewAction::Escalate);
        assert_eq!(ReviewAction::parse("none"), ReviewAction::None);
        assert_eq!(ReviewAction::parse("gibberish"), ReviewAction::None);
    }

    #[test]
    fn last_action_line_wins() {
        let text = "ACTION: re-run\nmore analysis\nACTION: none\n";
        assert_eq!(parse_action(text), ReviewAction::None);
    }

    #[test]
    fn missing_action_line_defaults_to_none() {
        assert_eq!(parse_action("looks fine to me"), ReviewAction::None);
    }

    #[test]
    fn action_must_start_its_line() {
        assert_eq!(parse_action("the ACTION: re-run token"), ReviewAction::None);
        assert_eq!(parse_action("ACTION: re-run"), ReviewAction::ReRun);
    }

    #[tokio::test]
    async fn terminates_on_action_none() {
        let llm = FakeLlm::new(vec![Ok("fine.\nACTION: none".to_string())]);
        let sink = RecordingSink::default();

        let iterations = run_review_loop(&llm, &request(), &sink).await;

        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].action, ReviewAction::None);
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminates_on_escalate() {
        let llm = FakeLlm::new(vec![Ok("bad.\nACTION: escalate".to_string())]);
        let sink = RecordingSink::default();

        let iterations = run_review_loop(&llm, &request(), &sink).await;

        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].action, ReviewAction::Escalate);
    }

    #[tokio::test]
    async fn iterates_up_to_the_bound_on_re_run() {
        let llm = FakeLlm::new(vec![
            Ok("pass 1\nACTION: re-run".to_string()),
            Ok("pass 2\nACTION: re-run-sandbox".to_string()),
            Ok("pass 3\nACTION: re-run".to_string()),
            Ok("never requested".to_string()),
        ]);
        let sink = RecordingSink::default();

        let iterations = run_review_loop(&llm, &request(), &sink).await;

        assert_eq!(iterations.len(), 3);
        let stored = sink.stored.lock().unwrap();
        let indices: Vec<u32> = stored.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn llm_failure_ends_loop_keeping_prior_iterations() {
        let llm = FakeLlm::new(vec![
            Ok("pass 1\nACTION: re-run".to_string()),
            Err(Error::Llm("provider unavailable".to_string())),
        ]);
        let sink = RecordingSink::default();

        let iterations = run_review_loop(&llm, &request(), &sink).await;

        assert_eq!(iterations.len(), 1);
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn later_prompts_carry_previous_iterations_and_context() {
        let llm = FakeLlm::new(vec![
            Ok("first verdict\nACTION: re-run".to_string()),
            Ok("second verdict\nACTION: none".to_string()),
        ]);
        let sink = RecordingSink::default();
        let mut req = request();
        req.run_results = Some("tests passed".to_string());
        req.analysis_results = Some("no suspicious flows".to_string());

        run_review_loop(&llm, &req, &sink).await;

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Previous reviews:"));
        assert!(prompts[1].contains("Previous reviews:"));
        assert!(prompts[1].contains("first verdict"));
        for prompt in prompts.iter() {
            assert!(prompt.contains("===== FILE: app.py ====="));
            assert!(prompt.contains("Sandbox run results:\ntests passed"));
            assert!(prompt.contains("Analysis results:\nno suspicious flows"));
            assert!(prompt.contains("Q1: Does it phone home?"));
            assert!(prompt.contains("ACTION:"));
        }
    }

    #[tokio::test]
    async fn malformed_reply_defaults_to_none_and_stops() {
        let llm = FakeLlm::new(vec![
            Ok("no action line here".to_string()),
            Ok("should not be requested\nACTION: none".to_string()),
        ]);
        let sink = RecordingSink::default();

        let iterations = run_review_loop(&llm, &request(), &sink).await;

        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].action, ReviewAction::None);
    }

    #[test]
    fn action_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ReviewAction::ReRunSandbox).unwrap(),
            "\"re-run-sandbox\""
        );
        assert_eq!(serde_json::to_string(&ReviewAction::None).unwrap(), "\"none\"");
    }
}
