//! [`GitHost`] backed by the GitHub CLI (`gh api`).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::core::mask::mask_secret_in_text;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::release::{GitHost, PullRequest, RepositoryInfo};

const GH_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

pub struct GhCliHost {
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    clone_url: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

impl From<PullResponse> for PullRequest {
    fn from(pr: PullResponse) -> Self {
        PullRequest {
            number: pr.number,
            url: pr.html_url,
        }
    }
}

impl GhCliHost {
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        Self { token, timeout }
    }

    fn api(&self, args: &[&str]) -> Result<Value> {
        let mut argv = vec!["gh".to_string(), "api".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let env: Vec<(String, String)> = self
            .token
            .iter()
            .map(|token| ("GH_TOKEN".to_string(), token.clone()))
            .collect();
        let cmd = command_from_argv(&argv, Path::new("."), &env)?;
        let output = run_command_with_timeout(cmd, None, self.timeout, GH_OUTPUT_LIMIT_BYTES)?;
        if !output.success() {
            let detail = if output.timed_out {
                format!("timed out after {}s", self.timeout.as_secs())
            } else {
                output.combined_text().trim().to_string()
            };
            return Err(anyhow!(self.mask(&format!("gh api {} failed: {detail}", args[0]))));
        }
        debug!(endpoint = args[0], "gh api ok");
        serde_json::from_slice(&output.stdout).with_context(|| format!("parse gh api {}", args[0]))
    }

    fn mask(&self, text: &str) -> String {
        let secrets: Vec<&str> = self.token.iter().map(String::as_str).collect();
        mask_secret_in_text(text, &secrets)
    }
}

fn owner(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

impl GitHost for GhCliHost {
    fn repository(&self, repository: &str) -> Result<RepositoryInfo> {
        let value = self.api(&[&format!("repos/{repository}")])?;
        let repo: RepoResponse = serde_json::from_value(value).context("decode repository")?;
        Ok(RepositoryInfo {
            full_name: repo.full_name,
            clone_url: repo.clone_url,
            default_branch: repo.default_branch,
        })
    }

    fn find_open_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
    ) -> Result<Option<PullRequest>> {
        let endpoint = format!(
            "repos/{repository}/pulls?state=open&head={}:{head}&base={base}",
            owner(repository)
        );
        let value = self.api(&[&endpoint])?;
        let pulls: Vec<PullResponse> = serde_json::from_value(value).context("decode pull requests")?;
        Ok(pulls.into_iter().next().map(PullRequest::from))
    }

    fn create_pull_request(
        &self,
        repository: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let endpoint = format!("repos/{repository}/pulls");
        let value = self.api(&[
            &endpoint,
            "--method",
            "POST",
            "-f",
            &format!("title={title}"),
            "-f",
            &format!("head={head}"),
            "-f",
            &format!("base={base}"),
            "-f",
            &format!("body={body}"),
        ])?;
        let pr: PullResponse = serde_json::from_value(value).context("decode created pull request")?;
        Ok(pr.into())
    }

    fn merge_pull_request(&self, repository: &str, number: u64) -> Result<String> {
        let endpoint = format!("repos/{repository}/pulls/{number}/merge");
        let value = self.api(&[&endpoint, "--method", "PUT", "-f", "merge_method=squash"])?;
        value
            .get("sha")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("merge response for #{number} has no sha"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_first_segment() {
        assert_eq!(owner("acme/shop"), "acme");
        assert_eq!(owner("solo"), "solo");
    }

    #[test]
    fn masks_token_in_errors() {
        let host = GhCliHost::new(Some("ghs_abcdef123456".to_string()), Duration::from_secs(1));
        let masked = host.mask("auth failed for ghs_abcdef123456");
        assert!(!masked.contains("ghs_abcdef123456"));
    }
}
