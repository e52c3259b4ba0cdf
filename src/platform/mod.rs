//! Source-control platform client.
//!
//! The orchestrator talks to the platform through the [`PlatformClient`]
//! trait; production uses the GitHub App implementation, tests substitute
//! fakes.

mod github;

pub use github::GitHubClient;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// One file entry from the PR file list.
#[derive(Debug, Clone, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub contents_url: Option<String>,
}

/// One issue comment on a PR.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

/// Operations the orchestrator needs from the hosted platform.
///
/// Implementations mint short-lived credentials per call; nothing here
/// caches tokens.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// One-shot fetch of the PR's changed files.
    async fn list_pr_files(&self, pr_api_url: &str) -> Result<Vec<PrFile>>;

    /// Creates an issue comment and returns its id.
    async fn create_comment(&self, repo: &str, pr_number: i64, body: &str) -> Result<u64>;

    /// Replaces the body of an existing issue comment.
    async fn edit_comment(&self, repo: &str, comment_id: u64, body: &str) -> Result<()>;

    /// Lists the PR's issue comments.
    async fn list_comments(&self, repo: &str, pr_number: i64) -> Result<Vec<IssueComment>>;

    /// Create-or-edit of a comment identified by `marker`.
    ///
    /// Protocol: edit `known_id` when given (falling through on failure),
    /// else edit the first existing comment whose body contains `marker`,
    /// else create a new comment. Returns the id of the comment written.
    async fn upsert_marked_comment(
        &self,
        repo: &str,
        pr_number: i64,
        body: &str,
        marker: &str,
        known_id: Option<u64>,
    ) -> Result<u64> {
        if let Some(id) = known_id {
            match self.edit_comment(repo, id, body).await {
                Ok(()) => return Ok(id),
                Err(e) => {
                    tracing::warn!(comment_id = id, error = %e, "known comment edit failed, falling back to marker scan");
                }
            }
        }

        match self.list_comments(repo, pr_number).await {
            Ok(comments) => {
                for comment in comments {
                    if comment.body.contains(marker) {
                        self.edit_comment(repo, comment.id, body).await?;
                        return Ok(comment.id);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "comment listing failed, falling back to create");
            }
        }

        self.create_comment(repo, pr_number, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Minimal in-memory platform for exercising the upsert protocol.
    #[derive(Default)]
    struct FakePlatform {
        comments: Mutex<Vec<(u64, String)>>,
        next_id: Mutex<u64>,
        fail_edit_of: Option<u64>,
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn list_pr_files(&self, _pr_api_url: &str) -> Result<Vec<PrFile>> {
            Ok(vec![])
        }

        async fn create_comment(&self, _repo: &str, _pr: i64, body: &str) -> Result<u64> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            self.comments.lock().unwrap().push((*next, body.to_string()));
            Ok(*next)
        }

        async fn edit_comment(&self, _repo: &str, comment_id: u64, body: &str) -> Result<()> {
            if self.fail_edit_of == Some(comment_id) {
                return Err(Error::Platform {
                    status: 404,
                    message: "comment not found".to_string(),
                });
            }
            let mut comments = self.comments.lock().unwrap();
            let entry = comments
                .iter_mut()
                .find(|(id, _)| *id == comment_id)
                .ok_or(Error::Platform {
                    status: 404,
                    message: "comment not found".to_string(),
                })?;
            entry.1 = body.to_string();
            Ok(())
        }

        async fn list_comments(&self, _repo: &str, _pr: i64) -> Result<Vec<IssueComment>> {
            Ok(self
                .comments
                .lock()
                .unwrap()
                .iter()
                .map(|(id, body)| IssueComment {
                    id: *id,
                    body: body.clone(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn upsert_creates_when_no_comment_matches() {
        let platform = FakePlatform::default();
        let id = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nhello", "<!-- m -->", None)
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(platform.comments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_edits_by_known_id() {
        let platform = FakePlatform::default();
        let id = platform.create_comment("o/r", 1, "<!-- m -->\nv1").await.unwrap();

        let written = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv2", "<!-- m -->", Some(id))
            .await
            .unwrap();

        assert_eq!(written, id);
        let comments = platform.comments.lock().unwrap();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.ends_with("v2"));
    }

    #[tokio::test]
    async fn upsert_scans_for_marker_without_known_id() {
        let platform = FakePlatform::default();
        platform.create_comment("o/r", 1, "unrelated").await.unwrap();
        let marked = platform.create_comment("o/r", 1, "<!-- m -->\nv1").await.unwrap();

        let written = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv2", "<!-- m -->", None)
            .await
            .unwrap();

        assert_eq!(written, marked);
        assert_eq!(platform.comments.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upsert_recovers_when_known_id_edit_fails() {
        let platform = FakePlatform {
            fail_edit_of: Some(99),
            ..Default::default()
        };
        let marked = platform.create_comment("o/r", 1, "<!-- m -->\nv1").await.unwrap();

        let written = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv2", "<!-- m -->", Some(99))
            .await
            .unwrap();

        assert_eq!(written, marked);
    }

    #[tokio::test]
    async fn repeated_upserts_return_the_same_id() {
        let platform = FakePlatform::default();
        let first = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv1", "<!-- m -->", None)
            .await
            .unwrap();
        let second = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv2", "<!-- m -->", Some(first))
            .await
            .unwrap();
        let third = platform
            .upsert_marked_comment("o/r", 1, "<!-- m -->\nv3", "<!-- m -->", None)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(platform.comments.lock().unwrap().len(), 1);
    }
}
