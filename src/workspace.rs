//! Ephemeral run workspaces.
//!
//! Each run gets a fresh temp directory that is deleted on every exit path,
//! success or failure, when the workspace is dropped.

use std::path::Path;

use tempfile::TempDir;
use tokio::process::Command;

use crate::error::{Error, Result};

/// A scoped temporary directory holding one run's checkout.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates a fresh workspace directory on local storage.
    pub fn create() -> Result<Self> {
        let dir = TempDir::with_prefix("sadguard-")?;
        Ok(Self { dir })
    }

    /// Returns the workspace root path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Shallow single-branch clone of `branch` from `repo_url` into `dest`.
///
/// Fails with `Error::Clone` carrying git's stderr on a non-zero exit.
pub async fn clone_branch(repo_url: &str, branch: &str, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--branch", branch, "--single-branch", repo_url])
        .arg(dest)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Clone(format!(
            "failed to clone branch '{}': {}",
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    tracing::debug!(repo = repo_url, branch, dest = %dest.display(), "cloned PR branch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    /// Builds a local git repo with one commit on `main`.
    fn seed_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let out = StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@test.invalid"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("app.py"), "print('ok')\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let path = {
            let ws = Workspace::create().unwrap();
            assert!(ws.path().is_dir());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clones_existing_branch() {
        let origin = seed_repo();
        let ws = Workspace::create().unwrap();
        let dest = ws.path().join("checkout");

        clone_branch(origin.path().to_str().unwrap(), "main", &dest)
            .await
            .unwrap();

        assert!(dest.join("app.py").is_file());
    }

    #[tokio::test]
    async fn missing_branch_surfaces_git_stderr() {
        let origin = seed_repo();
        let ws = Workspace::create().unwrap();
        let dest = ws.path().join("checkout");

        let err = clone_branch(origin.path().to_str().unwrap(), "no-such-branch", &dest)
            .await
            .unwrap_err();

        match err {
            Error::Clone(msg) => assert!(msg.contains("no-such-branch")),
            other => panic!("expected Clone error, got {:?}", other),
        }
    }
}
