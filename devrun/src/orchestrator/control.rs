//! Run control operations and the run summary read model.
//!
//! Retry, recover, resume and approve each append a retry-boundary
//! RUN_STATUS event before re-entering the loop, so viewers can drop events
//! from the superseded attempt.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use crate::core::boundary::BoundaryKind;
use crate::core::retry::MAX_ITERATION_ATTEMPTS;
use crate::core::transitions::ensure_iteration_transition;
use crate::core::types::{
    DevelopmentRun, GateStatus, GateType, IterationRun, IterationStatus, PlansSnapshot, RunEvent,
    RunStatus,
};
use crate::io::store::Store;
use crate::orchestrator::{Orchestrator, ProcessOutcome};

/// Operator action on a specific iteration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    /// Park a running run at the next status check.
    Pause,
    /// Continue from a checkpoint with the attempt counter untouched.
    Resume,
    /// Accept the iteration's state, reset its attempts and continue without wiping the sandbox.
    Approve,
}

impl CheckpointAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointAction::Pause => "pause",
            CheckpointAction::Resume => "resume",
            CheckpointAction::Approve => "approve",
        }
    }
}

impl fmt::Display for CheckpointAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointAction {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(CheckpointAction::Pause),
            "resume" => Ok(CheckpointAction::Resume),
            "approve" => Ok(CheckpointAction::Approve),
            other => Err(anyhow!("unknown checkpoint action '{other}' (expected pause|resume|approve)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSummary {
    pub gate_type: GateType,
    pub status: GateStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationSummary {
    pub index: u32,
    pub name: String,
    pub status: IterationStatus,
    pub attempt_count: u32,
    pub branch_name: Option<String>,
    pub gherkin_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub gates: Vec<GateSummary>,
}

/// What a viewer needs to render a run without replaying its events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub live_url: Option<String>,
    pub iterations: Vec<IterationSummary>,
}

/// `run-<utc timestamp>-<6 random chars>`.
pub fn new_run_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%d%H%M%S"))
}

/// Build the [`RunSummary`] read model straight from a store.
pub fn summarize_run(store: &dyn Store, run_id: &str) -> Result<RunSummary> {
    let run = store.get_run(run_id)?;
    let mut iterations = Vec::new();
    for iteration in store.list_iterations(run_id)? {
        let mut gates: Vec<GateSummary> = store
            .list_gates(&iteration.id)?
            .into_iter()
            .map(|gate| GateSummary {
                gate_type: gate.gate_type,
                status: gate.status,
                reason: gate.reason,
            })
            .collect();
        gates.sort_by_key(|gate| gate.gate_type);
        iterations.push(IterationSummary {
            index: iteration.index,
            name: iteration.name,
            status: iteration.status,
            attempt_count: iteration.attempt_count,
            branch_name: iteration.branch_name,
            gherkin_path: iteration.gherkin_path,
            started_at: iteration.started_at,
            finished_at: iteration.finished_at,
            gates,
        });
    }
    Ok(RunSummary {
        live_url: store.project_live_url(&run.project_id)?,
        id: run.id,
        project_id: run.project_id,
        status: run.status,
        current_iteration: run.current_iteration,
        total_iterations: run.total_iterations,
        error_summary: run.error_summary,
        created_at: run.created_at,
        started_at: run.started_at,
        finished_at: run.finished_at,
        canceled_at: run.canceled_at,
        iterations,
    })
}

impl Orchestrator {
    /// Queue a new run for `project_id`. A project may have one active run at a time.
    #[instrument(skip(self, plans))]
    pub fn create_run(&self, project_id: &str, plans: PlansSnapshot) -> Result<DevelopmentRun> {
        if let Some(active) = self
            .store
            .list_runs()?
            .into_iter()
            .find(|run| run.project_id == project_id && run.status.is_active())
        {
            bail!(
                "project {project_id} already has an active run {} ({})",
                active.id,
                active.status
            );
        }
        let total = plans.approved_iterations.as_ref().map_or(0, |its| its.len() as u32);
        let run = DevelopmentRun {
            id: new_run_id(),
            project_id: project_id.to_string(),
            status: RunStatus::Queued,
            current_iteration: 0,
            total_iterations: total,
            plans_snapshot: plans,
            worker_sandbox_path: None,
            error_summary: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            canceled_at: None,
        };
        self.store.insert_run(run.clone())?;
        self.events.run_status(
            &run.id,
            RunStatus::Queued,
            Some("Run created"),
            Some(json!({ "projectId": project_id, "totalIterations": total })),
        )?;
        info!(run_id = %run.id, "run created");
        Ok(run)
    }

    /// Cancel a run. Observed by an active loop at its next status check.
    #[instrument(skip(self))]
    pub fn cancel_run(&self, run_id: &str) -> Result<DevelopmentRun> {
        let run = self.store.get_run(run_id)?;
        if run.status == RunStatus::Canceled {
            return Ok(run);
        }
        let now = Utc::now();
        let mut run = self.transition_run(run_id, RunStatus::Canceled, |run| {
            run.canceled_at = Some(now);
            run.finished_at = Some(now);
        })?;
        self.events
            .run_status(run_id, RunStatus::Canceled, Some("Run canceled"), None)?;
        // An active loop cleans up when it notices; otherwise nobody else will.
        if !self.registry.is_active(run_id) && run.worker_sandbox_path.is_some() {
            self.sandboxes.cleanup(&mut run)?;
            run = self.update_run(run_id, |stored| stored.worker_sandbox_path = None)?;
        }
        Ok(run)
    }

    /// Reset the failed or current iteration, clear the sandbox and resume.
    #[instrument(skip(self))]
    pub fn retry_run(&self, run_id: &str) -> Result<ProcessOutcome> {
        let run = self.store.get_run(run_id)?;
        if !matches!(run.status, RunStatus::WaitingCheckpoint | RunStatus::Failed) {
            bail!("run {run_id} is {}; only WAITING_CHECKPOINT or FAILED runs can be retried", run.status);
        }
        self.ensure_idle(run_id)?;
        if let Some(mut iteration) = self.implicated_iteration(run_id)? {
            self.reset_iteration(&mut iteration, true)?;
        }
        self.wipe_sandbox(run_id)?;
        self.requeue(run_id, BoundaryKind::Retry, "Run retried")?;
        self.process_run(run_id)
    }

    /// Reset an iteration that spent its attempt budget, wipe the sandbox and resume.
    #[instrument(skip(self))]
    pub fn recover_run(&self, run_id: &str) -> Result<ProcessOutcome> {
        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::WaitingCheckpoint {
            bail!("run {run_id} is {}; only WAITING_CHECKPOINT runs can be recovered", run.status);
        }
        self.ensure_idle(run_id)?;
        let mut iteration = self
            .store
            .list_iterations(run_id)?
            .into_iter()
            .find(|it| it.status != IterationStatus::Deployed && it.attempt_count >= MAX_ITERATION_ATTEMPTS)
            .ok_or_else(|| anyhow!("run {run_id} has no iteration with exhausted attempts"))?;
        self.reset_iteration(&mut iteration, true)?;
        self.wipe_sandbox(run_id)?;
        self.requeue(run_id, BoundaryKind::Recover, "Run recovered")?;
        self.process_run(run_id)
    }

    /// Pause, resume or approve iteration `index`.
    ///
    /// Pausing only needs the run; the index is recorded on the event.
    #[instrument(skip(self))]
    pub fn checkpoint_action(
        &self,
        run_id: &str,
        index: u32,
        action: CheckpointAction,
    ) -> Result<ProcessOutcome> {
        let run = self.store.get_run(run_id)?;
        match action {
            CheckpointAction::Pause => {
                let summary = format!("Paused at iteration {index}");
                self.transition_run(run_id, RunStatus::WaitingCheckpoint, |run| {
                    run.error_summary = Some(summary.clone());
                })?;
                self.events.run_status(
                    run_id,
                    RunStatus::WaitingCheckpoint,
                    Some(&summary),
                    Some(json!({ "action": action.as_str(), "iterationIndex": index })),
                )?;
                Ok(ProcessOutcome::Stopped(RunStatus::WaitingCheckpoint))
            }
            CheckpointAction::Resume | CheckpointAction::Approve => {
                if run.status != RunStatus::WaitingCheckpoint {
                    bail!("run {run_id} is {}; {action} needs a WAITING_CHECKPOINT run", run.status);
                }
                self.ensure_idle(run_id)?;
                let mut iteration = self
                    .store
                    .list_iterations(run_id)?
                    .into_iter()
                    .find(|it| it.index == index)
                    .ok_or_else(|| anyhow!("run {run_id} has no iteration {index}"))?;
                let (kind, reset_attempts) = match action {
                    CheckpointAction::Approve => (BoundaryKind::Approve, true),
                    _ => (BoundaryKind::Resume, false),
                };
                if iteration.status != IterationStatus::Deployed {
                    self.reset_iteration(&mut iteration, reset_attempts)?;
                }
                let message = format!("Iteration {index} {}d", action.as_str());
                self.requeue(run_id, kind, &message)?;
                self.process_run(run_id)
            }
        }
    }

    /// Status, progress and per-iteration gate results of a run.
    pub fn run_summary(&self, run_id: &str) -> Result<RunSummary> {
        summarize_run(self.store.as_ref(), run_id)
    }

    /// Events with `sequence > after`, in order.
    pub fn list_events_after(&self, run_id: &str, after: u64) -> Result<Vec<RunEvent>> {
        self.store.list_events_after(run_id, after)
    }

    fn ensure_idle(&self, run_id: &str) -> Result<()> {
        if self.registry.is_active(run_id) {
            bail!("run {run_id} is being processed; wait for it to stop first");
        }
        Ok(())
    }

    /// The first iteration that is not yet deployed.
    fn implicated_iteration(&self, run_id: &str) -> Result<Option<IterationRun>> {
        Ok(self
            .store
            .list_iterations(run_id)?
            .into_iter()
            .find(|it| it.status != IterationStatus::Deployed))
    }

    fn reset_iteration(&self, iteration: &mut IterationRun, reset_attempts: bool) -> Result<()> {
        if iteration.status != IterationStatus::Pending {
            ensure_iteration_transition(iteration.status, IterationStatus::Pending)?;
        }
        iteration.status = IterationStatus::Pending;
        iteration.finished_at = None;
        if reset_attempts {
            iteration.attempt_count = 0;
        }
        self.store.update_iteration(iteration)?;
        self.events.iteration_status(
            &iteration.run_id,
            &iteration.id,
            IterationStatus::Pending,
            Some("Iteration reset"),
            Some(json!({ "attemptCount": iteration.attempt_count })),
        )?;
        Ok(())
    }

    /// Empty a sandbox left behind so the resumed loop bootstraps it afresh.
    fn wipe_sandbox(&self, run_id: &str) -> Result<()> {
        let run = self.store.get_run(run_id)?;
        if let Some(path) = &run.worker_sandbox_path {
            self.sandboxes.wipe(Path::new(path))?;
        }
        Ok(())
    }

    /// Back to QUEUED behind a retry-boundary event.
    fn requeue(&self, run_id: &str, kind: BoundaryKind, message: &str) -> Result<()> {
        self.transition_run(run_id, RunStatus::Queued, |run| {
            run.error_summary = None;
            run.finished_at = None;
        })?;
        self.events.boundary(run_id, kind, message)?;
        Ok(())
    }
}
