//! Sandbox container runtime.
//!
//! [`ContainerRuntime`] is the seam to the container engine; the driver in
//! [`driver`] owns the streaming run loop on top of it.

pub mod docker;
pub mod driver;
mod runtime;

pub use docker::DockerRuntime;
pub use driver::{run_to_completion, RunEvent, RunOutcome};
pub use runtime::{
    ChunkStream, ContainerRuntime, ContainerStat, ContainerStatus, RunOptions, StatsStream,
};
