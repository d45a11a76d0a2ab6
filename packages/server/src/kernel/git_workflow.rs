//! Optional git workflow around worker execution.
//!
//! When enabled on an executor, each job runs on its own branch: the
//! pre-step captures the current branch and checks out a fresh one, the
//! post-step commits the worker's changes (or rolls them back with
//! `git checkout -- .` on failure), and a guarded finalization restores the
//! original branch on every exit path. Rollback never uses byte-level
//! copies.

use std::path::PathBuf;
use std::process::Output;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use super::jobs::{short_id, Job};

/// Pull-request context produced by a worker hook (or its default).
#[derive(Debug, Clone)]
pub struct PrContext {
    pub title: String,
    pub body: String,
}

/// Settings for the git workflow of one executor.
#[derive(Debug, Clone)]
pub struct GitWorkflowOptions {
    /// Repository working directory.
    pub repo_dir: PathBuf,
    /// Branch prefix, e.g. `alephauto` -> `alephauto/<pipeline>-<job>`.
    pub branch_prefix: String,
}

impl Default for GitWorkflowOptions {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            branch_prefix: "alephauto".to_string(),
        }
    }
}

/// Result of a successful git finalization.
#[derive(Debug, Clone)]
pub struct GitOutcome {
    pub branch: String,
    pub base_branch: String,
    pub commit: Option<String>,
}

/// Runs `git` sub-commands for one executor.
#[derive(Debug, Clone)]
pub struct GitWorkflow {
    options: GitWorkflowOptions,
}

impl GitWorkflow {
    pub fn new(options: GitWorkflowOptions) -> Self {
        Self { options }
    }

    /// Pre-step: capture the current branch and check out a job branch.
    pub async fn begin(&self, job: &Job) -> Result<BranchScope> {
        let original_branch = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .context("failed to capture current branch")?;
        let work_branch = self.branch_name(job);

        self.run(&["checkout", "-b", &work_branch])
            .await
            .with_context(|| format!("failed to create branch {work_branch}"))?;

        info!(
            branch = %work_branch,
            base = %original_branch,
            job_id = %job.job_id,
            "created git workflow branch"
        );

        Ok(BranchScope {
            workflow: self.clone(),
            original_branch,
            work_branch,
            restored: false,
        })
    }

    /// Branch names contain only lower-case alphanumerics and hyphens, so
    /// user-influenced identifiers cannot smuggle shell metacharacters.
    fn branch_name(&self, job: &Job) -> String {
        format!(
            "{}/{}-{}",
            sanitize_branch_component(&self.options.branch_prefix),
            sanitize_branch_component(&job.pipeline_id),
            sanitize_branch_component(short_id(&job.job_id)),
        )
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output: Output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.options.repo_dir)
            .output()
            .await
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Scoped acquisition of a work branch: the original branch is restored on
/// all exit paths, success or failure.
pub struct BranchScope {
    workflow: GitWorkflow,
    original_branch: String,
    work_branch: String,
    restored: bool,
}

impl BranchScope {
    pub fn branch(&self) -> &str {
        &self.work_branch
    }

    /// Post-step for a successful execution: commit the worker's changes and
    /// record the PR context, then restore the original branch. Restoration
    /// happens even when the commit fails.
    pub async fn finish_success(mut self, message: &str, pr: &PrContext) -> Result<GitOutcome> {
        let commit = self.commit_all(message).await;
        let restore = self.restore().await;

        let commit = commit?;
        restore?;

        if commit.is_some() {
            info!(
                branch = %self.work_branch,
                pr_title = %pr.title,
                "committed automated changes; pull-request context recorded"
            );
        }

        Ok(GitOutcome {
            branch: self.work_branch.clone(),
            base_branch: self.original_branch.clone(),
            commit,
        })
    }

    /// Post-step for a failed execution: roll back partial changes with the
    /// checkout primitive, then restore the original branch.
    pub async fn finish_failure(mut self) -> Result<()> {
        let rollback = self.workflow.run(&["checkout", "--", "."]).await;
        let restore = self.restore().await;

        if let Err(rollback_error) = rollback {
            warn!(branch = %self.work_branch, error = %rollback_error, "git rollback failed");
        }
        restore
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>> {
        let status = self.workflow.run(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(None);
        }

        self.workflow.run(&["add", "-A"]).await?;
        self.workflow.run(&["commit", "-m", message]).await?;
        let commit = self.workflow.run(&["rev-parse", "HEAD"]).await?;
        Ok(Some(commit))
    }

    async fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.workflow
            .run(&["checkout", &self.original_branch])
            .await
            .with_context(|| format!("failed to restore branch {}", self.original_branch))?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for BranchScope {
    fn drop(&mut self) {
        if !self.restored {
            warn!(
                branch = %self.work_branch,
                original = %self.original_branch,
                "branch scope dropped without restoring the original branch"
            );
        }
    }
}

/// Lower-case alphanumerics and hyphens only; runs of anything else collapse
/// to a single hyphen.
pub fn sanitize_branch_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_hyphen = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            out.push('-');
            last_was_hyphen = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("job");
    }
    out
}
