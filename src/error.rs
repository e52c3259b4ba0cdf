//! Error types for the sadguard service.

use thiserror::Error;

/// Top-level error type for run orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Webhook signature did not match the shared secret.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Webhook payload was missing a required field.
    #[error("malformed webhook payload: {0}")]
    Payload(String),

    /// Cloning the pull-request branch failed.
    #[error("clone failed: {0}")]
    Clone(String),

    /// Building the sandbox image failed.
    #[error("image build failed: {0}")]
    Build(String),

    /// Starting or observing the sandbox container failed.
    #[error("container run failed: {0}")]
    ContainerRun(String),

    /// The source-control platform rejected a request.
    #[error("platform error ({status}): {message}")]
    Platform { status: u16, message: String },

    /// The LLM provider failed or timed out.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error during workspace or recipe operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for run orchestration.
pub type Result<T> = std::result::Result<T, Error>;
