//! Turning a gated iteration into merged code.
//!
//! Two layers: [`cli::execute_git_cli_release`] pushes the sandbox artifacts
//! to an iteration branch through a disposable clone, and
//! [`execute_iteration_git_release`] wraps it with repository lookup and the
//! pull request find-or-create + squash merge. Every step reports a
//! [`ReleaseCheckpoint`]; every failure is a masked [`ReleaseError`] naming
//! the step so the orchestrator can checkpoint on it.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::mask::mask_secret_in_text;
use crate::core::types::{ErrorDetails, GeneratedFile};
use crate::io::config::{ReleaseConfig, ReleaseMode};
use crate::io::git::CommitAuthor;

pub mod cli;
pub mod gh;

pub use cli::{GitCliOutcome, GitCliRelease, execute_git_cli_release};
pub use gh::GhCliHost;

pub const RELEASE_PHASE: &str = "release";

/// Release failure tagged with the step that failed. Text is already masked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("release step '{step}' failed: {summary}")]
pub struct ReleaseError {
    pub phase: &'static str,
    pub step: &'static str,
    pub summary: String,
    pub details: Option<String>,
}

impl ReleaseError {
    pub fn from_step<S: AsRef<str>>(step: &'static str, err: &anyhow::Error, secrets: &[S]) -> Self {
        let summary = mask_secret_in_text(&err.to_string(), secrets);
        let details = mask_secret_in_text(&format!("{err:#}"), secrets);
        Self {
            phase: RELEASE_PHASE,
            step,
            details: (details != summary).then_some(details),
            summary,
        }
    }

    pub fn error_details(&self) -> ErrorDetails {
        ErrorDetails {
            phase: Some(self.phase.to_string()),
            step: Some(self.step.to_string()),
            summary: Some(self.summary.clone()),
            details: self.details.clone(),
        }
    }
}

/// Progress marker emitted after each successful release step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCheckpoint {
    pub phase: &'static str,
    pub step: &'static str,
    pub summary: String,
    pub duration_ms: u64,
}

/// Run one release step, reporting a checkpoint on success and a tagged error on failure.
pub(crate) fn run_step<T, S: AsRef<str>>(
    step: &'static str,
    secrets: &[S],
    on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
    f: impl FnOnce() -> Result<(T, String)>,
) -> Result<T, ReleaseError> {
    let started = Instant::now();
    match f() {
        Ok((value, summary)) => {
            let checkpoint = ReleaseCheckpoint {
                phase: RELEASE_PHASE,
                step,
                summary: mask_secret_in_text(&summary, secrets),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            info!(step, summary = %checkpoint.summary, "release step done");
            on_checkpoint(&checkpoint);
            Ok(value)
        }
        Err(err) => {
            let err = ReleaseError::from_step(step, &err, secrets);
            warn!(step, error = %err.summary, "release step failed");
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Git hosting API seam.
pub trait GitHost: Send + Sync {
    fn repository(&self, repository: &str) -> Result<RepositoryInfo>;
    fn find_open_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
    ) -> Result<Option<PullRequest>>;
    fn create_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;
    /// Squash-merge and return the merge commit sha.
    fn merge_pull_request(&self, repository: &str, number: u64) -> Result<String>;
}

/// Input to [`execute_iteration_git_release`].
#[derive(Debug, Clone)]
pub struct IterationGitRelease<'a> {
    pub repository: &'a str,
    pub branch: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub artifacts: &'a [GeneratedFile],
    pub author: &'a CommitAuthor,
    /// Token injected into `https://` clone URLs.
    pub token: Option<&'a str>,
    pub secrets: &'a [String],
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    /// True when release is disabled and nothing was pushed.
    pub skipped: bool,
    pub commit_sha: Option<String>,
    pub committed: bool,
    pub pull_request: Option<PullRequest>,
    pub merge_sha: Option<String>,
}

impl ReleaseOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Repository lookup, branch push, pull request and squash merge.
#[instrument(skip_all, fields(repository = request.repository, branch = request.branch))]
pub fn execute_iteration_git_release(
    host: &dyn GitHost,
    request: &IterationGitRelease<'_>,
    on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
) -> Result<ReleaseOutcome, ReleaseError> {
    let secrets = request.secrets;
    let repo = run_step("repository", secrets, on_checkpoint, || {
        let repo = host.repository(request.repository)?;
        let summary = format!("{} (base {})", repo.full_name, repo.default_branch);
        Ok((repo, summary))
    })?;

    let clone_url = authenticated_url(&repo.clone_url, request.token);
    let pushed = execute_git_cli_release(
        &GitCliRelease {
            clone_url: &clone_url,
            base_branch: &repo.default_branch,
            branch: request.branch,
            artifacts: request.artifacts,
            commit_message: request.title,
            author: request.author,
            secrets,
            timeout: request.timeout,
        },
        on_checkpoint,
    )?;

    let mut outcome = ReleaseOutcome {
        skipped: false,
        commit_sha: Some(pushed.commit_sha.clone()),
        committed: pushed.committed,
        pull_request: None,
        merge_sha: None,
    };
    if !pushed.committed && !pushed.branch_existed {
        // The branch equals its base; there is nothing to review or merge.
        info!("no changes to release, pull request skipped");
        return Ok(outcome);
    }

    let pr = run_step("pull_request", secrets, on_checkpoint, || {
        let pr = find_or_create_pull_request(host, request, &repo)?;
        let summary = format!("#{} {}", pr.number, pr.url);
        Ok((pr, summary))
    })?;

    let merge_sha = run_step("merge", secrets, on_checkpoint, || {
        let sha = host.merge_pull_request(&repo.full_name, pr.number)?;
        let summary = format!("squash-merged #{} as {sha}", pr.number);
        Ok((sha, summary))
    })?;

    outcome.pull_request = Some(pr);
    outcome.merge_sha = Some(merge_sha);
    Ok(outcome)
}

fn find_or_create_pull_request(
    host: &dyn GitHost,
    request: &IterationGitRelease<'_>,
    repo: &RepositoryInfo,
) -> Result<PullRequest> {
    let (head, base) = (request.branch, repo.default_branch.as_str());
    if let Some(existing) = host.find_open_pull_request(&repo.full_name, head, base)? {
        return Ok(existing);
    }
    match host.create_pull_request(&repo.full_name, head, base, request.title, request.body) {
        Ok(created) => Ok(created),
        Err(err) => {
            // A concurrent writer may have opened it between our lookup and create.
            match host.find_open_pull_request(&repo.full_name, head, base)? {
                Some(existing) => {
                    warn!(number = existing.number, "pull request appeared concurrently, reusing it");
                    Ok(existing)
                }
                None => Err(err),
            }
        }
    }
}

/// Embed `token` as `x-access-token` credentials in an `https://` URL.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match (url.strip_prefix("https://"), token) {
        (Some(rest), Some(token)) if !token.is_empty() => {
            format!("https://x-access-token:{token}@{rest}")
        }
        _ => url.to_string(),
    }
}

/// One iteration's release, as requested by the orchestrator.
#[derive(Debug, Clone)]
pub struct IterationRelease<'a> {
    pub run_id: &'a str,
    pub iteration_index: u32,
    pub iteration_name: &'a str,
    pub branch: &'a str,
    pub artifacts: &'a [GeneratedFile],
}

/// Orchestrator seam for releasing a gated iteration.
pub trait IterationReleaser: Send + Sync {
    fn release(
        &self,
        request: &IterationRelease<'_>,
        on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
    ) -> Result<ReleaseOutcome>;
}

/// Release mode `disabled`: nothing leaves the sandbox.
pub struct DisabledReleaser;

impl IterationReleaser for DisabledReleaser {
    fn release(
        &self,
        request: &IterationRelease<'_>,
        _on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
    ) -> Result<ReleaseOutcome> {
        info!(branch = request.branch, "release disabled, skipping");
        Ok(ReleaseOutcome::skipped())
    }
}

/// Release through the git CLI and a [`GitHost`].
pub struct GitReleaser {
    host: Box<dyn GitHost>,
    repository: String,
    token: Option<String>,
    author: CommitAuthor,
    timeout: Duration,
}

impl GitReleaser {
    pub fn new(
        host: Box<dyn GitHost>,
        repository: impl Into<String>,
        token: Option<String>,
        author: CommitAuthor,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            repository: repository.into(),
            token,
            author,
            timeout,
        }
    }
}

impl IterationReleaser for GitReleaser {
    fn release(
        &self,
        request: &IterationRelease<'_>,
        on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
    ) -> Result<ReleaseOutcome> {
        let title = format!(
            "Iteration {}: {}",
            request.iteration_index, request.iteration_name
        );
        let body = format!(
            "Automated release of iteration {} for development run `{}`.",
            request.iteration_index, request.run_id
        );
        let secrets: Vec<String> = self.token.iter().cloned().collect();
        let outcome = execute_iteration_git_release(
            self.host.as_ref(),
            &IterationGitRelease {
                repository: &self.repository,
                branch: request.branch,
                title: &title,
                body: &body,
                artifacts: request.artifacts,
                author: &self.author,
                token: self.token.as_deref(),
                secrets: &secrets,
                timeout: self.timeout,
            },
            on_checkpoint,
        )?;
        Ok(outcome)
    }
}

/// Build the releaser selected by `config.mode`.
///
/// `lookup` resolves the token environment variable (normally `std::env::var`).
pub fn releaser_from_config<F>(config: &ReleaseConfig, lookup: F) -> Result<Box<dyn IterationReleaser>>
where
    F: Fn(&str) -> Option<String>,
{
    match config.mode {
        ReleaseMode::Disabled => Ok(Box::new(DisabledReleaser)),
        ReleaseMode::GitCli => {
            let Some(repository) = config.repository.clone() else {
                anyhow::bail!("release.repository is required when release.mode = \"git_cli\"");
            };
            let token = lookup(&config.token_env).filter(|t| !t.trim().is_empty());
            let timeout = Duration::from_secs(config.timeout_secs);
            let host = GhCliHost::new(token.clone(), timeout);
            let author = CommitAuthor {
                name: config.author_name.clone(),
                email: config.author_email.clone(),
            };
            Ok(Box::new(GitReleaser::new(
                Box::new(host),
                repository,
                token,
                author,
                timeout,
            )))
        }
    }
}
