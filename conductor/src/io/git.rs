//! Git adapter used by the state store and git-backed hooks.
//!
//! Every call is a plain `git` subprocess in a fixed working directory so the
//! exact commands are visible in debug logs.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Result of integrating remote changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Clean,
    /// Rebase stopped on conflicts and was aborted; the local branch is unchanged.
    Conflict(Vec<String>),
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        Ok(name)
    }

    /// Stage the given paths, including deletions.
    pub fn add_paths(&self, paths: &[&Path]) -> Result<()> {
        self.run_with_paths(&["add", "-A"], paths)?;
        Ok(())
    }

    /// True if any of `paths` differ between the index and HEAD.
    pub fn has_staged_changes(&self, paths: &[&Path]) -> Result<bool> {
        let out = self.run_with_paths(&["diff", "--cached", "--name-only"], paths)?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Stage and commit exactly `paths`. Anything else already staged stays
    /// staged and out of the commit.
    ///
    /// If none of the paths changed, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_paths(&self, paths: &[&Path], message: &str) -> Result<bool> {
        self.add_paths(paths)?;
        if !self.has_staged_changes(paths)? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!(message, "committing paths");
        self.run_with_paths(&["commit", "-q", "--only", "-m", message], paths)?;
        Ok(true)
    }

    /// Reset the index entries of `paths` back to HEAD.
    pub fn unstage_paths(&self, paths: &[&Path]) -> Result<()> {
        self.run_with_paths(&["reset", "-q"], paths)?;
        Ok(())
    }

    /// Fetch and rebase local commits onto `remote/branch`.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull_rebase(&self, remote: &str, branch: &str) -> Result<PullOutcome> {
        let output = self.run(&["pull", "--rebase", "--autostash", "-q", remote, branch])?;
        if output.status.success() {
            return Ok(PullOutcome::Clean);
        }
        let conflicts = self.conflicted_paths()?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git pull --rebase failed: {}", stderr.trim()));
        }
        warn!(count = conflicts.len(), "rebase stopped on conflicts, aborting");
        self.rebase_abort()?;
        Ok(PullOutcome::Conflict(conflicts))
    }

    /// Push `branch` to `remote`. Returns false when the remote rejected the push.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<bool> {
        let output = self.run(&["push", "-q", remote, branch])?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("rejected") || stderr.contains("fetch first") {
            debug!("push rejected, remote moved");
            return Ok(false);
        }
        Err(anyhow!("git push failed: {}", stderr.trim()))
    }

    /// Paths with unresolved merge conflicts.
    pub fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn rebase_abort(&self) -> Result<()> {
        self.run_checked(&["rebase", "--abort"])?;
        Ok(())
    }

    /// Rebase the current branch onto `onto`. On conflict the rebase is aborted
    /// and the conflicting paths are returned.
    #[instrument(skip_all, fields(onto))]
    pub fn rebase(&self, onto: &str) -> Result<Vec<String>> {
        let output = self.run(&["rebase", "-q", onto])?;
        if output.status.success() {
            return Ok(Vec::new());
        }
        let conflicts = self.conflicted_paths()?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git rebase {onto} failed: {}", stderr.trim()));
        }
        self.rebase_abort()?;
        Ok(conflicts)
    }

    /// Subjects of commits reachable from HEAD but not from `base`, newest first.
    pub fn commits_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}..HEAD");
        let out = self.run_capture(&["log", "--format=%s", &range])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn run_with_paths(&self, args: &[&str], paths: &[&Path]) -> Result<Output> {
        let rendered: Vec<String> = paths.iter().map(|path| path.display().to_string()).collect();
        let mut full: Vec<&str> = args.to_vec();
        full.push("--");
        full.extend(rendered.iter().map(String::as_str));
        self.run_checked(&full)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
