//! Service configuration loaded from the environment.
//!
//! All required variables are validated once at startup; a missing variable
//! is a fatal `Error::Config`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default container deadline for streaming runs.
const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 300;

/// Upper bound on a single LLM completion request.
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 600;

/// Runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    /// GitHub App id used as the JWT issuer.
    pub github_app_id: String,
    /// PEM-encoded RS256 private key for the GitHub App.
    pub github_private_key: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// API key for the LLM provider.
    pub llm_api_key: String,
    /// Database connection URL.
    pub database_url: String,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Tag applied to sandbox images.
    pub image_name: String,
    /// Deadline for a streaming sandbox run.
    pub sandbox_timeout: Duration,
    /// Per-request timeout for LLM completions.
    pub llm_timeout: Duration,
}

impl Config {
    /// Reads configuration from the environment.
    ///
    /// The GitHub private key is read from the file named by
    /// `GITHUB_PRIVATE_KEY_PATH`. The database URL is assembled from the
    /// `DB_HOST`/`DB_NAME`/`DB_USERNAME`/`DB_PASSWORD` variables.
    pub fn from_env() -> Result<Self> {
        let app_id = require("GITHUB_APP_ID")?;
        let key_path = require("GITHUB_PRIVATE_KEY_PATH")?;
        let webhook_secret = require("GITHUB_WEBHOOK_SECRET")?;
        let llm_api_key = require("GOOGLE_AI_STUDIO_KEY")?;

        let db_host = require("DB_HOST")?;
        let db_name = require("DB_NAME")?;
        let db_user = require("DB_USERNAME")?;
        let db_password = require("DB_PASSWORD")?;

        let github_private_key = std::fs::read_to_string(&key_path).map_err(|e| {
            Error::Config(format!("cannot read private key at {}: {}", key_path, e))
        })?;

        let sandbox_timeout = std::env::var("SANDBOX_TIMEOUT_SECS")
            .ok()
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| Error::Config(format!("invalid SANDBOX_TIMEOUT_SECS: {}", v)))
            })
            .transpose()?
            .unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECS);

        Ok(Self {
            github_app_id: app_id,
            github_private_key,
            webhook_secret,
            llm_api_key,
            database_url: format!(
                "mysql://{}:{}@{}/{}",
                db_user, db_password, db_host, db_name
            ),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string()),
            image_name: std::env::var("SANDBOX_IMAGE_NAME")
                .unwrap_or_else(|_| "sandbox-container".to_string()),
            sandbox_timeout: Duration::from_secs(sandbox_timeout),
            llm_timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
        })
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("missing required variable {}", name)))
}
