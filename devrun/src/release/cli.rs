//! Lower release layer: push artifacts to a branch through a temp clone.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::instrument;

use crate::core::types::GeneratedFile;
use crate::io::git::{CommitAuthor, Git};
use crate::io::workspace::write_files_within;
use crate::release::{ReleaseCheckpoint, ReleaseError, run_step};

#[derive(Debug, Clone)]
pub struct GitCliRelease<'a> {
    /// May embed credentials; never logged unmasked.
    pub clone_url: &'a str,
    pub base_branch: &'a str,
    pub branch: &'a str,
    pub artifacts: &'a [GeneratedFile],
    pub commit_message: &'a str,
    pub author: &'a CommitAuthor,
    pub secrets: &'a [String],
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCliOutcome {
    pub commit_sha: String,
    /// False when the artifacts matched the branch already (`no_changes`).
    pub committed: bool,
    /// The branch was already on the remote before this release.
    pub branch_existed: bool,
}

/// clone → checkout → write → commit → push → resolve_head.
#[instrument(skip_all, fields(branch = request.branch, base = request.base_branch))]
pub fn execute_git_cli_release(
    request: &GitCliRelease<'_>,
    on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
) -> Result<GitCliOutcome, ReleaseError> {
    let secrets = request.secrets;
    let scratch = run_step("clone", secrets, on_checkpoint, || {
        let scratch = tempfile::Builder::new()
            .prefix("devrun-release-")
            .tempdir()
            .context("create release scratch dir")?;
        let dest = scratch.path().join("repo");
        let git = Git::clone_shallow(
            request.clone_url,
            request.base_branch,
            &dest,
            secrets.to_vec(),
            request.timeout,
        )?;
        Ok(((scratch, git), format!("cloned {}", request.base_branch)))
    })?;
    // The temp dir lives until the end of this function.
    let (_scratch, git) = scratch;

    let branch_existed = run_step("checkout", secrets, on_checkpoint, || {
        if git.remote_branch_exists(request.branch)? {
            git.checkout_remote_branch(request.branch)?;
            Ok((true, format!("reused remote branch {}", request.branch)))
        } else {
            git.checkout_new_branch(request.branch)?;
            Ok((false, format!("created branch {}", request.branch)))
        }
    })?;

    run_step("write", secrets, on_checkpoint, || {
        let written = write_files_within(git.workdir(), request.artifacts)?;
        Ok(((), format!("wrote {} files", written.len())))
    })?;

    let committed = run_step("commit", secrets, on_checkpoint, || {
        git.add_all()?;
        let committed = git.commit_staged(request.commit_message, request.author)?;
        let summary = if committed { "committed" } else { "no_changes" };
        Ok((committed, summary.to_string()))
    })?;

    run_step("push", secrets, on_checkpoint, || {
        git.push(request.branch)?;
        Ok(((), format!("pushed {}", request.branch)))
    })?;

    let commit_sha = run_step("resolve_head", secrets, on_checkpoint, || {
        let sha = git.head_sha()?;
        Ok((sha.clone(), sha))
    })?;

    Ok(GitCliOutcome {
        commit_sha,
        committed,
        branch_existed,
    })
}
