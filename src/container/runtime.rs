//! Container runtime trait and shared types.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stream of decoded stdout/stderr chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::result::Result<String, Error>> + Send>>;

/// Stream of raw stats frames as JSON values.
pub type StatsStream =
    Pin<Box<dyn Stream<Item = std::result::Result<serde_json::Value, Error>> + Send>>;

/// Options for starting a sandbox container.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Host path bind-mounted read-write at `/mnt`.
    pub bind_mount: Option<PathBuf>,
    /// Command override; the image entrypoint runs when absent.
    pub command: Option<Vec<String>>,
}

/// Observed container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Whether the container has stopped producing output for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

/// One parsed resource sample from the stats stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerStat {
    pub cpu_percent: Option<f64>,
    pub mem_usage: Option<u64>,
    pub mem_limit: Option<u64>,
    pub net_rx: u64,
    pub net_tx: u64,
}

/// Operations the driver needs from the container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds `image` from the given context directory, with an optional
    /// Dockerfile path relative to the context.
    async fn build_image(
        &self,
        image: &str,
        context: &Path,
        dockerfile: Option<&str>,
    ) -> Result<()>;

    /// Starts a detached privileged container and returns its id.
    async fn start_container(&self, image: &str, opts: &RunOptions) -> Result<String>;

    /// Reloads the container's current status.
    async fn container_status(&self, id: &str) -> Result<ContainerStatus>;

    /// Waits for the container to stop and returns its exit code.
    async fn wait_exit(&self, id: &str) -> Result<i64>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-removes the container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Follows the container's log endpoint.
    async fn log_stream(&self, id: &str) -> Result<ChunkStream>;

    /// Follows the container's attach endpoint (fallback when the logging
    /// driver refuses reads).
    async fn attach_stream(&self, id: &str) -> Result<ChunkStream>;

    /// Follows the container's stats endpoint.
    async fn stats_stream(&self, id: &str) -> Result<StatsStream>;
}
