//! Test-only fakes for the orchestrator's seams, plus run and plan fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use crate::agents::backend::{AgentBackend, AgentRequest, AgentResponse, FinishReason};
use crate::core::types::{
    DevelopmentRun, GateStatus, GateType, IterationScope, PlannedIteration, PlansSnapshot,
    RunStatus, TokenUsage,
};
use crate::io::deploy::{DeployHost, DeployState, DeployStatus};
use crate::io::gates::{GateOutcome, GateRunner, REASON_COMMAND_FAILED, REASON_SKIPPED};
use crate::release::{
    IterationRelease, IterationReleaser, PullRequest, RELEASE_PHASE, ReleaseCheckpoint,
    ReleaseError, ReleaseOutcome,
};

/// Release steps reported by [`ScriptedReleaser`], in order.
pub const RELEASE_STEPS: [&str; 9] = [
    "repository",
    "clone",
    "checkout",
    "write",
    "commit",
    "push",
    "resolve_head",
    "pull_request",
    "merge",
];

/// Bare git repository on disk with one seed commit on `branch`.
pub struct BareRemote {
    _temp: TempDir,
    bare: PathBuf,
}

impl BareRemote {
    pub fn new(branch: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let bare = temp.path().join("remote.git");
        let seed = temp.path().join("seed");
        fs::create_dir_all(&bare)?;
        fs::create_dir_all(&seed)?;

        git(&bare, &["init", "--bare", "--quiet"])?;
        git(&bare, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;

        git(&seed, &["init", "--quiet"])?;
        git(&seed, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;
        fs::write(seed.join("README.md"), "seed\n")?;
        git(&seed, &["add", "README.md"])?;
        git(
            &seed,
            &[
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "commit.gpgsign=false",
                "commit",
                "--quiet",
                "-m",
                "chore: init",
            ],
        )?;
        let bare_arg = bare.to_string_lossy().into_owned();
        git(&seed, &["push", "--quiet", &bare_arg, &format!("HEAD:refs/heads/{branch}")])?;

        Ok(Self { _temp: temp, bare })
    }

    pub fn url(&self) -> String {
        format!("file://{}", self.bare.display())
    }

    pub fn path(&self) -> &Path {
        &self.bare
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Backend answering from per-agent queues, falling back to a valid default.
pub struct ScriptedBackend {
    queued: Mutex<HashMap<String, VecDeque<String>>>,
    defaults: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// Every agent returns a schema-valid answer.
    pub fn happy() -> Self {
        let defaults = [
            (
                "AssessmentAgent",
                json!({ "summary": "Small storefront", "complexity": "low", "risks": [] }),
            ),
            (
                "IterationPlannerAgent",
                json!({ "iterations": [
                    { "name": "Catalog", "goals": ["List products"], "featureTags": ["catalog"], "risks": [] },
                    { "name": "Cart", "goals": ["Add to cart"], "featureTags": ["cart"], "risks": [] },
                ]}),
            ),
            (
                "SpecAgent",
                json!({
                    "summary": "Iteration behaviour",
                    "featurePath": "features/iteration.feature",
                    "files": [{ "path": "features/iteration.feature", "content": "Feature: Iteration\n" }],
                }),
            ),
            (
                "TestAgent",
                json!({
                    "summary": "Unit tests",
                    "files": [{ "path": "tests/iteration.test.ts", "content": "import { ready } from '../src/lib/feature';\n" }],
                }),
            ),
            (
                "CodeAgent",
                json!({
                    "summary": "Implementation",
                    "files": [{ "path": "src/lib/feature.ts", "content": "export const ready = true;\n" }],
                    "notes": null,
                }),
            ),
            (
                "ReviewAgent",
                json!({ "summary": "Looks fine", "approved": true, "findings": [] }),
            ),
        ];
        Self {
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(
                defaults
                    .into_iter()
                    .map(|(agent, value)| (agent.to_string(), value.to_string()))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer the next call to `agent` with `text`.
    pub fn push(&self, agent: &str, text: &str) {
        self.queued
            .lock()
            .expect("queued")
            .entry(agent.to_string())
            .or_default()
            .push_back(text.to_string());
    }

    /// Answer every unqueued call to `agent` with `text`.
    pub fn set_default(&self, agent: &str, text: &str) {
        self.defaults
            .lock()
            .expect("defaults")
            .insert(agent.to_string(), text.to_string());
    }

    /// Agent names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn call_count(&self, agent: &str) -> usize {
        self.calls().iter().filter(|name| *name == agent).count()
    }
}

impl AgentBackend for ScriptedBackend {
    fn complete(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.calls
            .lock()
            .expect("calls")
            .push(request.agent_name.clone());
        let queued = self
            .queued
            .lock()
            .expect("queued")
            .get_mut(&request.agent_name)
            .and_then(VecDeque::pop_front);
        let text = match queued {
            Some(text) => text,
            None => self
                .defaults
                .lock()
                .expect("defaults")
                .get(&request.agent_name)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(AgentResponse {
            text,
            finish_reason: FinishReason::Stop,
            token_usage: Some(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            }),
            cost: Some(0.001),
        })
    }
}

/// Gate runner that passes everything except a chosen gate.
pub struct ScriptedGateRunner {
    failing: Option<GateType>,
    /// Calls left that fail; `None` fails forever.
    failures_left: Mutex<Option<u32>>,
    calls: Mutex<usize>,
}

impl ScriptedGateRunner {
    pub fn passing() -> Self {
        Self {
            failing: None,
            failures_left: Mutex::new(None),
            calls: Mutex::new(0),
        }
    }

    /// `gate` fails on every call; gates depending on it are skipped.
    pub fn failing(gate: GateType) -> Self {
        Self {
            failing: Some(gate),
            failures_left: Mutex::new(None),
            calls: Mutex::new(0),
        }
    }

    /// `gate` fails on the first `times` calls, then everything passes.
    pub fn failing_times(gate: GateType, times: u32) -> Self {
        Self {
            failing: Some(gate),
            failures_left: Mutex::new(Some(times)),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls")
    }

    fn failing_now(&self) -> Option<GateType> {
        let gate = self.failing?;
        let mut left = self.failures_left.lock().expect("failures");
        match left.as_mut() {
            None => Some(gate),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(gate)
            }
        }
    }
}

fn blocked_by(gate: GateType, failed: GateType) -> bool {
    let mut dependency = gate.depends_on();
    while let Some(current) = dependency {
        if current == failed {
            return true;
        }
        dependency = current.depends_on();
    }
    false
}

impl GateRunner for ScriptedGateRunner {
    fn run_gates(&self, _sandbox: &Path) -> Result<Vec<GateOutcome>> {
        *self.calls.lock().expect("calls") += 1;
        let failing = self.failing_now();
        Ok(GateType::ALL
            .into_iter()
            .map(|gate| {
                let (status, reason, detail) = match failing {
                    Some(failed) if failed == gate => (
                        GateStatus::Failed,
                        Some(REASON_COMMAND_FAILED),
                        Some("Cannot find module 'x'".to_string()),
                    ),
                    Some(failed) if blocked_by(gate, failed) => {
                        (GateStatus::Failed, Some(REASON_SKIPPED), None)
                    }
                    _ => (GateStatus::Passed, None, None),
                };
                GateOutcome {
                    gate_type: gate,
                    status,
                    reason: reason.map(str::to_string),
                    detail,
                    report: json!({ "scripted": true }),
                    duration_ms: 1,
                }
            })
            .collect())
    }
}

/// Releaser that reports the usual steps, optionally failing at one of them.
pub struct ScriptedReleaser {
    fail_at: Mutex<Option<&'static str>>,
    releases: Mutex<Vec<(u32, String, usize)>>,
}

impl ScriptedReleaser {
    pub fn succeeding() -> Self {
        Self {
            fail_at: Mutex::new(None),
            releases: Mutex::new(Vec::new()),
        }
    }

    /// Fail at `step` until [`ScriptedReleaser::recover`] is called.
    pub fn failing_at(step: &'static str) -> Self {
        Self {
            fail_at: Mutex::new(Some(step)),
            releases: Mutex::new(Vec::new()),
        }
    }

    pub fn recover(&self) {
        *self.fail_at.lock().expect("fail_at") = None;
    }

    /// `(iteration index, branch, artifact count)` of every successful release.
    pub fn releases(&self) -> Vec<(u32, String, usize)> {
        self.releases.lock().expect("releases").clone()
    }
}

impl IterationReleaser for ScriptedReleaser {
    fn release(
        &self,
        request: &IterationRelease<'_>,
        on_checkpoint: &mut dyn FnMut(&ReleaseCheckpoint),
    ) -> Result<ReleaseOutcome> {
        let fail_at = *self.fail_at.lock().expect("fail_at");
        for step in RELEASE_STEPS {
            if Some(step) == fail_at {
                return Err(ReleaseError {
                    phase: RELEASE_PHASE,
                    step,
                    summary: format!("{step} rejected by remote"),
                    details: None,
                }
                .into());
            }
            on_checkpoint(&ReleaseCheckpoint {
                phase: RELEASE_PHASE,
                step,
                summary: "ok".to_string(),
                duration_ms: 1,
            });
        }
        let number = {
            let mut releases = self.releases.lock().expect("releases");
            releases.push((
                request.iteration_index,
                request.branch.to_string(),
                request.artifacts.len(),
            ));
            releases.len() as u64
        };
        Ok(ReleaseOutcome {
            skipped: false,
            commit_sha: Some(format!("{number:040}")),
            committed: true,
            pull_request: Some(PullRequest {
                number,
                url: format!("https://example.test/acme/shop/pull/{number}"),
            }),
            merge_sha: Some(format!("merge{number:036}")),
        })
    }
}

/// Hosting fake that replays deploy states; the last state repeats.
pub struct ScriptedDeployHost {
    states: Mutex<VecDeque<DeployState>>,
    linked: Mutex<Vec<(String, String)>>,
    polled: Mutex<Vec<Option<String>>>,
}

impl ScriptedDeployHost {
    pub fn new(states: Vec<DeployState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            linked: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
        }
    }

    /// `(site id, repository)` pairs passed to `link_site`.
    pub fn linked(&self) -> Vec<(String, String)> {
        self.linked.lock().expect("linked").clone()
    }

    /// The commit asked for on every poll.
    pub fn polled_commits(&self) -> Vec<Option<String>> {
        self.polled.lock().expect("polled").clone()
    }
}

impl DeployHost for ScriptedDeployHost {
    fn link_site(&self, site_id: &str, repository: &str) -> Result<()> {
        self.linked
            .lock()
            .expect("linked")
            .push((site_id.to_string(), repository.to_string()));
        Ok(())
    }

    fn latest_deploy(&self, _site_id: &str, commit: Option<&str>) -> Result<DeployStatus> {
        self.polled
            .lock()
            .expect("polled")
            .push(commit.map(str::to_string));
        let mut states = self.states.lock().expect("states");
        let state = if states.len() > 1 {
            states.pop_front()
        } else {
            states.front().copied()
        }
        .unwrap_or(DeployState::Building);
        Ok(DeployStatus {
            state,
            url: (state == DeployState::Ready).then(|| "https://shop.example.test".to_string()),
            error: (state == DeployState::Error).then(|| "build failed".to_string()),
        })
    }
}

/// Plans for a product called "Shop" with `approved` pre-approved iterations.
pub fn plans_snapshot(approved: usize) -> PlansSnapshot {
    const NAMES: [&str; 4] = ["Catalog", "Cart", "Checkout", "Accounts"];
    let iterations: Vec<PlannedIteration> = (0..approved)
        .map(|i| PlannedIteration {
            name: match NAMES.get(i) {
                Some(name) => (*name).to_string(),
                None => format!("Iteration {}", i + 1),
            },
            scope: IterationScope {
                goals: vec![format!("Deliver slice {}", i + 1)],
                feature_tags: vec![format!("slice-{}", i + 1)],
                risks: Vec::new(),
            },
        })
        .collect();
    PlansSnapshot {
        business_plan: json!({ "productName": "Shop", "summary": "Sell things online" }),
        technical_plan: json!({
            "dataModel": [{
                "name": "Product",
                "fields": [
                    { "name": "id", "type": "string" },
                    { "name": "price", "type": "number" },
                ],
            }],
        }),
        ux_plan: json!({ "pages": [{ "name": "Cart", "route": "/cart" }] }),
        approved_assessment: None,
        approved_iterations: (!iterations.is_empty()).then_some(iterations),
    }
}

/// A fresh QUEUED run with one approved iteration.
pub fn queued_run(id: &str, project_id: &str) -> DevelopmentRun {
    DevelopmentRun {
        id: id.to_string(),
        project_id: project_id.to_string(),
        status: RunStatus::Queued,
        current_iteration: 0,
        total_iterations: 1,
        plans_snapshot: plans_snapshot(1),
        worker_sandbox_path: None,
        error_summary: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
        canceled_at: None,
    }
}
