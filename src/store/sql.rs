//! MySQL implementation of [`RunStore`] over sqlx.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

use super::{EventKind, PrRun, RunStatus, RunStore};
use crate::error::{Error, Result};

/// SQL-backed run store.
pub struct SqlStore {
    pool: MySqlPool,
}

impl SqlStore {
    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPool::connect(url).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Creates the three tables when absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pr_event (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                repo_full_name VARCHAR(255) NOT NULL,
                event_kind VARCHAR(64) NOT NULL,
                pr_number BIGINT NOT NULL,
                extra JSON NOT NULL,
                timestamp DATETIME NOT NULL,
                INDEX idx_pr_event_repo (repo_full_name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pr_run (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                repo_full_name VARCHAR(255) NOT NULL,
                pr_number BIGINT NOT NULL,
                run_status VARCHAR(32) NOT NULL,
                image_name VARCHAR(255) NOT NULL,
                progress_comment_id BIGINT NULL,
                code_review_comment_id BIGINT NULL,
                sandbox_review_comment_id BIGINT NULL,
                created_at DATETIME NOT NULL,
                finished_at DATETIME NULL,
                exit_code BIGINT NULL,
                notes TEXT NULL,
                INDEX idx_pr_run_repo (repo_full_name, pr_number)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ai_review (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                pr_run_id BIGINT NOT NULL,
                role VARCHAR(32) NOT NULL,
                content LONGTEXT NOT NULL,
                created_at DATETIME NOT NULL,
                INDEX idx_ai_review_run (pr_run_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_comment_column(&self, column: &'static str, run_id: i64, comment_id: u64) -> Result<()> {
        // Column names come from a fixed set, never from input.
        let query = format!("UPDATE pr_run SET {} = ? WHERE id = ?", column);
        sqlx::query(&query)
            .bind(comment_id as i64)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqlStore {
    async fn record_event(
        &self,
        repo: &str,
        kind: EventKind,
        pr_number: i64,
        extra: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pr_event (repo_full_name, event_kind, pr_number, extra, timestamp)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(repo)
        .bind(kind.as_str())
        .bind(pr_number)
        .bind(extra)
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_run(&self, repo: &str, pr_number: i64, image_name: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO pr_run (repo_full_name, pr_number, run_status, image_name, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(repo)
        .bind(pr_number)
        .bind(RunStatus::Building.as_str())
        .bind(image_name)
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }

    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        notes: Option<&str>,
    ) -> Result<()> {
        if status.is_terminal() {
            sqlx::query(
                "UPDATE pr_run SET run_status = ?, notes = COALESCE(?, notes), finished_at = ?
                 WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(notes)
            .bind(Utc::now().naive_utc())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE pr_run SET run_status = ?, notes = COALESCE(?, notes) WHERE id = ?")
                .bind(status.as_str())
                .bind(notes)
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn finish_run(&self, run_id: i64, status: RunStatus, exit_code: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pr_run SET run_status = ?, exit_code = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(Utc::now().naive_utc())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_progress_comment(&self, run_id: i64, comment_id: u64) -> Result<()> {
        self.set_comment_column("progress_comment_id", run_id, comment_id).await
    }

    async fn set_code_review_comment(&self, run_id: i64, comment_id: u64) -> Result<()> {
        self.set_comment_column("code_review_comment_id", run_id, comment_id).await
    }

    async fn set_sandbox_review_comment(&self, run_id: i64, comment_id: u64) -> Result<()> {
        self.set_comment_column("sandbox_review_comment_id", run_id, comment_id).await
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<PrRun>> {
        let row = sqlx::query(
            "SELECT id, repo_full_name, pr_number, run_status, image_name,
                    progress_comment_id, code_review_comment_id, sandbox_review_comment_id,
                    created_at, finished_at, exit_code, notes
             FROM pr_run WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_raw: String = row.try_get("run_status")?;
        let run_status = RunStatus::parse(&status_raw)
            .ok_or_else(|| Error::Config(format!("unknown run status in store: {}", status_raw)))?;

        let created_at: chrono::NaiveDateTime = row.try_get("created_at")?;
        let finished_at: Option<chrono::NaiveDateTime> = row.try_get("finished_at")?;

        Ok(Some(PrRun {
            id: row.try_get("id")?,
            repo_full_name: row.try_get("repo_full_name")?,
            pr_number: row.try_get("pr_number")?,
            run_status,
            image_name: row.try_get("image_name")?,
            progress_comment_id: row
                .try_get::<Option<i64>, _>("progress_comment_id")?
                .map(|id| id as u64),
            code_review_comment_id: row
                .try_get::<Option<i64>, _>("code_review_comment_id")?
                .map(|id| id as u64),
            sandbox_review_comment_id: row
                .try_get::<Option<i64>, _>("sandbox_review_comment_id")?
                .map(|id| id as u64),
            created_at: created_at.and_utc(),
            finished_at: finished_at.map(|t| t.and_utc()),
            exit_code: row.try_get("exit_code")?,
            notes: row.try_get("notes")?,
        }))
    }

    async fn add_review(&self, run_id: i64, role: &str, content: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO ai_review (pr_run_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_id() as i64)
    }
}
