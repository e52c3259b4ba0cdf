//! Run history persistence.
//!
//! Three tables: an append-only PR event log, one row per run, and the
//! ordered LLM review iterations of each run.

pub mod sql;

pub use sql::SqlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle status of a [`PrRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Running,
    Completed,
    BuildError,
    ContainerRunError,
    CloneError,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::BuildError => "build_error",
            Self::ContainerRunError => "container_run_error",
            Self::CloneError => "clone_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(Self::Building),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "build_error" => Some(Self::BuildError),
            "container_run_error" => Some(Self::ContainerRunError),
            "clone_error" => Some(Self::CloneError),
            _ => None,
        }
    }

    /// A run is terminal iff `finished_at` is set alongside it.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Building | Self::Running)
    }
}

/// Closed vocabulary of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PrOpened,
    SadguardConfigModified,
    CloneError,
    BuildError,
    ContainerRunError,
    TestsComplete,
}

impl EventKind {
    /// Wire tag stored in the event log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrOpened => "PR_OPENED",
            Self::SadguardConfigModified => "SADGUARD_CONFIG_MODIFIED",
            Self::CloneError => "clone_error",
            Self::BuildError => "build_error",
            Self::ContainerRunError => "container_run_error",
            Self::TestsComplete => "TESTS_COMPLETE",
        }
    }
}

/// One pull-request run.
#[derive(Debug, Clone)]
pub struct PrRun {
    pub id: i64,
    pub repo_full_name: String,
    pub pr_number: i64,
    pub run_status: RunStatus,
    pub image_name: String,
    pub progress_comment_id: Option<u64>,
    pub code_review_comment_id: Option<u64>,
    pub sandbox_review_comment_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub notes: Option<String>,
}

/// Store operations the orchestrator needs.
///
/// All writes are short transactions; comment-id fields are written once
/// per run and only the bodies on the platform change afterwards.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Appends one audit event.
    async fn record_event(
        &self,
        repo: &str,
        kind: EventKind,
        pr_number: i64,
        extra: serde_json::Value,
    ) -> Result<()>;

    /// Creates a run in `building` status and returns its id.
    async fn create_run(&self, repo: &str, pr_number: i64, image_name: &str) -> Result<i64>;

    /// Updates the run status, optionally attaching notes.
    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        notes: Option<&str>,
    ) -> Result<()>;

    /// Marks the run terminal with its exit code and finish time.
    async fn finish_run(&self, run_id: i64, status: RunStatus, exit_code: i64) -> Result<()>;

    async fn set_progress_comment(&self, run_id: i64, comment_id: u64) -> Result<()>;

    async fn set_code_review_comment(&self, run_id: i64, comment_id: u64) -> Result<()>;

    async fn set_sandbox_review_comment(&self, run_id: i64, comment_id: u64) -> Result<()>;

    /// Fetches the current run row.
    async fn get_run(&self, run_id: i64) -> Result<Option<PrRun>>;

    /// Appends one LLM review iteration and returns its row id.
    async fn add_review(&self, run_id: i64, role: &str, content: &str) -> Result<i64>;
}
