//! Deploy trigger run after every iteration of a run is deployed.
//!
//! With no hosting site configured the trigger is a no-op success. Otherwise
//! the site is linked to the repository and the deploy of the released commit
//! is polled on a fixed interval until it is `ready`, `error`, or the hard
//! timeout passes. A deploy of an older commit never counts.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::io::process::{command_from_argv, run_command_with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployState {
    Building,
    Ready,
    Error,
}

impl DeployState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeployState::Ready | DeployState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStatus {
    pub state: DeployState,
    pub url: Option<String>,
    pub error: Option<String>,
}

/// Hosting provider seam.
pub trait DeployHost: Send + Sync {
    fn link_site(&self, site_id: &str, repository: &str) -> Result<()>;
    /// Newest deploy built from `commit`, or the newest deploy of the site
    /// when no commit is known. `Building` until a matching deploy exists.
    fn latest_deploy(&self, site_id: &str, commit: Option<&str>) -> Result<DeployStatus>;
}

/// Final result of [`trigger_deploy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployResult {
    Skipped,
    Ready { url: Option<String> },
    Failed { message: String },
}

impl DeployResult {
    pub fn status_label(&self) -> &'static str {
        match self {
            DeployResult::Skipped => "SKIPPED",
            DeployResult::Ready { .. } => "READY",
            DeployResult::Failed { .. } => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployRequest<'a> {
    pub site_id: Option<&'a str>,
    pub repository: Option<&'a str>,
    /// Commit the deploy must be built from, when the run released one.
    pub commit: Option<&'a str>,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Link and poll; `on_progress` receives every observed state.
#[instrument(skip_all, fields(site_id = ?request.site_id, commit = ?request.commit))]
pub fn trigger_deploy(
    host: Option<&dyn DeployHost>,
    request: &DeployRequest<'_>,
    on_progress: &mut dyn FnMut(DeployState, Duration),
) -> Result<DeployResult> {
    let (Some(site_id), Some(host)) = (request.site_id, host) else {
        info!("no hosting site configured, deploy skipped");
        return Ok(DeployResult::Skipped);
    };

    let Some(repository) = request.repository else {
        warn!(site_id, "hosting site configured without a repository to link");
        return Ok(DeployResult::Failed {
            message: format!("site {site_id} is configured but no repository is set to link it to"),
        });
    };
    if let Err(err) = host.link_site(site_id, repository) {
        return Ok(DeployResult::Failed {
            message: format!("link site {site_id}: {err:#}"),
        });
    }

    let started = Instant::now();
    loop {
        let status = match host.latest_deploy(site_id, request.commit) {
            Ok(status) => status,
            Err(err) => {
                return Ok(DeployResult::Failed {
                    message: format!("deploy status: {err:#}"),
                });
            }
        };
        let elapsed = started.elapsed();
        on_progress(status.state, elapsed);
        debug!(state = ?status.state, elapsed_ms = elapsed.as_millis() as u64, "deploy polled");
        if status.state.is_terminal() {
            return Ok(match status.state {
                DeployState::Ready => DeployResult::Ready { url: status.url },
                _ => DeployResult::Failed {
                    message: status
                        .error
                        .unwrap_or_else(|| "deploy failed".to_string()),
                },
            });
        }
        if elapsed + request.poll_interval > request.timeout {
            warn!(timeout_secs = request.timeout.as_secs(), "deploy timed out");
            return Ok(DeployResult::Failed {
                message: format!("deploy timed out after {}s", request.timeout.as_secs()),
            });
        }
        thread::sleep(request.poll_interval);
    }
}

/// [`DeployHost`] backed by the `netlify` CLI (`netlify api <method>`).
pub struct NetlifyCliHost {
    workdir: PathBuf,
    timeout: Duration,
}

impl NetlifyCliHost {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    fn api(&self, method: &str, data: Value) -> Result<Value> {
        let argv = vec![
            "netlify".to_string(),
            "api".to_string(),
            method.to_string(),
            "--data".to_string(),
            data.to_string(),
        ];
        let cmd = command_from_argv(&argv, &self.workdir, &[])?;
        let output = run_command_with_timeout(cmd, None, self.timeout, 1_000_000)?;
        if !output.success() {
            return Err(anyhow!(
                "netlify api {method} failed: {}",
                output.stderr_text().trim()
            ));
        }
        serde_json::from_slice(&output.stdout).with_context(|| format!("parse netlify api {method}"))
    }
}

impl DeployHost for NetlifyCliHost {
    fn link_site(&self, site_id: &str, repository: &str) -> Result<()> {
        self.api(
            "updateSite",
            json!({
                "site_id": site_id,
                "body": { "repo": { "provider": "github", "repo": repository } },
            }),
        )?;
        Ok(())
    }

    fn latest_deploy(&self, site_id: &str, commit: Option<&str>) -> Result<DeployStatus> {
        let deploys = self.api(
            "listSiteDeploys",
            json!({ "site_id": site_id, "per_page": RECENT_DEPLOYS }),
        )?;
        match select_deploy(&deploys, commit) {
            Some(deploy) => Ok(parse_deploy(deploy)),
            None if commit.is_some() => {
                debug!(site_id, ?commit, "no deploy for the commit yet");
                Ok(DeployStatus {
                    state: DeployState::Building,
                    url: None,
                    error: None,
                })
            }
            None => Err(anyhow!("site {site_id} has no deploys")),
        }
    }
}

/// Deploys listed per poll; a fresh push lands near the top.
const RECENT_DEPLOYS: u32 = 20;

/// Newest listed deploy built from `commit` (any deploy when `None`).
fn select_deploy<'a>(deploys: &'a Value, commit: Option<&str>) -> Option<&'a Value> {
    deploys.as_array()?.iter().find(|deploy| match commit {
        Some(sha) => deploy.get("commit_ref").and_then(Value::as_str) == Some(sha),
        None => true,
    })
}

fn parse_deploy(deploy: &Value) -> DeployStatus {
    let state = match deploy.get("state").and_then(Value::as_str) {
        Some("ready") => DeployState::Ready,
        Some("error") => DeployState::Error,
        _ => DeployState::Building,
    };
    let url = ["ssl_url", "url"]
        .iter()
        .find_map(|key| deploy.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    let error = deploy
        .get("error_message")
        .and_then(Value::as_str)
        .map(str::to_string);
    DeployStatus { state, url, error }
}
