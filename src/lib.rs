//! SadGuard, a pull-request sandbox guard.
//!
//! On each PR webhook the orchestrator clones the PR branch into an
//! ephemeral workspace, builds a sandbox image from the repository's
//! `.sadguard/` recipe (generating one when absent), runs the tests with
//! network instrumentation inside the container, streams logs and resource
//! stats back to the PR as a single live-updating comment, and drives
//! iterative LLM review loops over the diffs and runtime observations,
//! persisting the full run history.

pub mod config;
pub mod container;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod platform;
pub mod recipe;
pub mod review;
pub mod sections;
pub mod server;
pub mod signature;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use container::{ContainerRuntime, ContainerStat, RunEvent, RunOptions};
pub use error::{Error, Result};
pub use orchestrator::{Dispatch, Orchestrator, WebhookPayload};
pub use platform::{GitHubClient, IssueComment, PlatformClient, PrFile};
pub use review::{FileDiff, ReviewAction, ReviewIteration, ReviewRequest, ReviewSink};
pub use store::{EventKind, PrRun, RunStatus, RunStore, SqlStore};
