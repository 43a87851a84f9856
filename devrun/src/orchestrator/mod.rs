//! The development run loop.
//!
//! [`Orchestrator::process_run`] claims a run in the [`WorkerRegistry`],
//! prepares its sandbox, materializes the iteration plan once, and drives
//! each pending iteration through agents, gates and release. It is safe to
//! call again after a crash: everything it needs is read back from the store.
//!
//! This module is the only place that decides run status. Lower layers return
//! typed errors; the loop turns them into checkpoints or a failed run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::agents::backend::AgentBackend;
use crate::agents::harness::AgentHarness;
use crate::core::transitions::ensure_run_transition;
use crate::core::types::{DevelopmentRun, EventType, RunStatus};
use crate::io::config::OrchestratorConfig;
use crate::io::deploy::{DeployHost, DeployRequest, DeployResult, DeployState, trigger_deploy};
use crate::io::event_log::EventLog;
use crate::io::gates::GateRunner;
use crate::io::registry::WorkerRegistry;
use crate::io::store::Store;
use crate::io::workspace::SandboxManager;
use crate::release::IterationReleaser;

pub mod control;
mod iteration;
mod plan;

pub use control::{CheckpointAction, GateSummary, IterationSummary, RunSummary, summarize_run};

/// External collaborators the loop drives.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub registry: WorkerRegistry,
    pub backend: Arc<dyn AgentBackend>,
    pub gates: Arc<dyn GateRunner>,
    pub releaser: Arc<dyn IterationReleaser>,
    /// `None` makes the final deploy a no-op success.
    pub deploy: Option<Arc<dyn DeployHost>>,
    /// Values masked out of every persisted message.
    pub secrets: Vec<String>,
}

/// How a call to [`Orchestrator::process_run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another loop in this process owns the run.
    AlreadyActive,
    /// The run was terminal; nothing changed.
    AlreadyTerminal,
    /// The loop returned with the run in this status.
    Stopped(RunStatus),
}

impl ProcessOutcome {
    pub fn status(self) -> Option<RunStatus> {
        match self {
            ProcessOutcome::Stopped(status) => Some(status),
            ProcessOutcome::AlreadyActive | ProcessOutcome::AlreadyTerminal => None,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    registry: WorkerRegistry,
    backend: Arc<dyn AgentBackend>,
    gates: Arc<dyn GateRunner>,
    releaser: Arc<dyn IterationReleaser>,
    deploy: Option<Arc<dyn DeployHost>>,
    events: EventLog,
    sandboxes: SandboxManager,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let events = EventLog::new(collaborators.store.clone(), collaborators.secrets);
        let sandboxes = SandboxManager::new(&config.sandbox_root, config.gates.manifest.clone());
        Self {
            store: collaborators.store,
            registry: collaborators.registry,
            backend: collaborators.backend,
            gates: collaborators.gates,
            releaser: collaborators.releaser,
            deploy: collaborators.deploy,
            events,
            sandboxes,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    fn harness(&self) -> AgentHarness<'_> {
        AgentHarness {
            backend: self.backend.as_ref(),
            store: self.store.as_ref(),
            events: &self.events,
        }
    }

    /// Atomic read-modify-write of the persisted run.
    fn update_run(&self, run_id: &str, f: impl FnOnce(&mut DevelopmentRun)) -> Result<DevelopmentRun> {
        let mut f = Some(f);
        self.store.update_run(run_id, &mut |run| {
            if let Some(f) = f.take() {
                f(run);
            }
            Ok(())
        })
    }

    /// Move the run to `to` and apply `f` in the same write. The transition is
    /// checked against the stored status, so a concurrent cancel or pause wins.
    fn transition_run(
        &self,
        run_id: &str,
        to: RunStatus,
        f: impl FnOnce(&mut DevelopmentRun),
    ) -> Result<DevelopmentRun> {
        let mut f = Some(f);
        self.store.update_run(run_id, &mut |run| {
            ensure_run_transition(run.status, to)?;
            run.status = to;
            if let Some(f) = f.take() {
                f(run);
            }
            Ok(())
        })
    }

    /// Apply `f` only while the stored status is `expected`. Returns the status
    /// found, so the caller can tell whether anything changed.
    fn update_run_if(
        &self,
        run_id: &str,
        expected: RunStatus,
        f: impl FnOnce(&mut DevelopmentRun),
    ) -> Result<(RunStatus, DevelopmentRun)> {
        let mut f = Some(f);
        let mut found = expected;
        let run = self.store.update_run(run_id, &mut |run| {
            found = run.status;
            if run.status == expected
                && let Some(f) = f.take()
            {
                f(run);
            }
            Ok(())
        })?;
        Ok((found, run))
    }

    fn current_status(&self, run_id: &str) -> Result<RunStatus> {
        Ok(self.store.get_run(run_id)?.status)
    }

    /// Process `run_id` until it finishes, checkpoints, or is stopped externally.
    #[instrument(skip(self))]
    pub fn process_run(&self, run_id: &str) -> Result<ProcessOutcome> {
        let Some(_guard) = self.registry.try_mark_active(run_id) else {
            info!("run already being processed");
            return Ok(ProcessOutcome::AlreadyActive);
        };

        let run = self.store.get_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(ProcessOutcome::AlreadyTerminal);
        }
        if run.status == RunStatus::WaitingCheckpoint {
            // Leaving a checkpoint takes an explicit control operation.
            return Ok(ProcessOutcome::Stopped(run.status));
        }

        let status = match self.drive(run_id) {
            Ok(status) => status,
            Err(err) => self.fail_run(run_id, &err)?,
        };
        self.release_sandbox(run_id);
        Ok(ProcessOutcome::Stopped(status))
    }

    fn drive(&self, run_id: &str) -> Result<RunStatus> {
        let mut resumed = false;
        let (found, mut run) = self.update_run_if(run_id, RunStatus::Queued, |run| {
            resumed = run.started_at.is_some();
            run.status = RunStatus::Running;
            run.started_at.get_or_insert_with(Utc::now);
        })?;
        match found {
            RunStatus::Queued => {
                let message = if resumed { "Run resumed" } else { "Run started" };
                self.events.run_status(run_id, RunStatus::Running, Some(message), None)?;
            }
            RunStatus::Running => {}
            // Canceled or paused between the claim and the start.
            other => return Ok(other),
        }

        let sandbox = self.sandboxes.ensure_sandbox(&mut run)?;
        let sandbox_path = run.worker_sandbox_path.clone();
        self.update_run(run_id, |run| run.worker_sandbox_path = sandbox_path)?;

        let bootstrap = self.sandboxes.bootstrap(&sandbox, &run.plans_snapshot)?;
        if !bootstrap.already_prepared {
            self.events.append(
                run_id,
                None,
                EventType::Info,
                Some("Workspace bootstrapped"),
                Some(json!({
                    "files": bootstrap.written.len(),
                    "usedFallback": bootstrap.used_fallback,
                })),
            )?;
        }

        let iterations = self.materialize_plan(run_id)?;
        for planned in iterations {
            let status = self.current_status(run_id)?;
            if status != RunStatus::Running {
                info!(%status, "run stopped externally");
                return Ok(status);
            }
            match self.run_iteration(run_id, &sandbox, planned.index)? {
                iteration::IterationResult::Deployed => {}
                iteration::IterationResult::Stopped(status) => return Ok(status),
            }
        }

        self.finish_run(run_id)
    }

    /// Final deploy once every iteration is deployed.
    fn finish_run(&self, run_id: &str) -> Result<RunStatus> {
        let status = self.current_status(run_id)?;
        if status != RunStatus::Running {
            return Ok(status);
        }

        let deploy = &self.config.deploy;
        let commit = self.released_commit(run_id)?;
        let request = DeployRequest {
            site_id: deploy.site_id.as_deref(),
            repository: self.config.release.repository.as_deref(),
            commit: commit.as_deref(),
            poll_interval: Duration::from_secs(deploy.poll_interval_secs),
            timeout: Duration::from_secs(deploy.timeout_secs),
        };
        let events = &self.events;
        let mut on_progress = |state: DeployState, elapsed: Duration| {
            let payload = json!({ "state": state, "elapsedMs": elapsed.as_millis() as u64 });
            let appended = events.append(
                run_id,
                None,
                EventType::DeployStatus,
                Some("Deploy in progress"),
                Some(payload),
            );
            if let Err(err) = appended {
                warn!(error = %err, "failed to record deploy progress");
            }
        };
        let result = trigger_deploy(self.deploy.as_deref(), &request, &mut on_progress)?;

        let (message, payload) = match &result {
            DeployResult::Skipped => (
                "Deploy skipped: no hosting site configured".to_string(),
                json!({ "status": result.status_label(), "skipped": true }),
            ),
            DeployResult::Ready { url } => (
                format!("Deploy ready{}", url.as_deref().map(|u| format!(" at {u}")).unwrap_or_default()),
                json!({ "status": result.status_label(), "skipped": false, "url": url }),
            ),
            DeployResult::Failed { message } => (
                format!("Deploy failed: {message}"),
                json!({ "status": result.status_label(), "skipped": false, "error": message }),
            ),
        };
        self.events
            .append(run_id, None, EventType::DeployStatus, Some(&message), Some(payload))?;

        match result {
            DeployResult::Skipped => self.finalize(run_id, RunStatus::Succeeded, None),
            DeployResult::Ready { url } => {
                if let Some(url) = url {
                    let run = self.store.get_run(run_id)?;
                    self.store.mark_project_live(&run.project_id, &url)?;
                }
                self.finalize(run_id, RunStatus::Succeeded, None)
            }
            DeployResult::Failed { .. } => self.finalize(run_id, RunStatus::Failed, Some(&message)),
        }
    }

    /// Write a terminal status, unless the run left RUNNING meanwhile.
    fn finalize(&self, run_id: &str, status: RunStatus, summary: Option<&str>) -> Result<RunStatus> {
        ensure_run_transition(RunStatus::Running, status)?;
        let summary = summary.map(|s| self.events.mask(s));
        let (current, _) = self.update_run_if(run_id, RunStatus::Running, |run| {
            run.status = status;
            run.finished_at = Some(Utc::now());
            run.error_summary = summary.clone();
        })?;
        if current != RunStatus::Running {
            return Ok(current);
        }
        let message = match status {
            RunStatus::Succeeded => "Run succeeded".to_string(),
            _ => format!("Run {}", status.as_str().to_lowercase()),
        };
        let extra = summary.map(|s| json!({ "errorSummary": s }));
        self.events.run_status(run_id, status, Some(&message), extra)?;
        info!(run_id, %status, "run finished");
        Ok(status)
    }

    /// Top-level failure handler: FAILED with an error summary, unless already terminal.
    fn fail_run(&self, run_id: &str, err: &anyhow::Error) -> Result<RunStatus> {
        let summary = self.events.mask(&format!("{err:#}"));
        error!(run_id, error = %summary, "run failed");
        let mut previous = RunStatus::Failed;
        self.store.update_run(run_id, &mut |run| {
            previous = run.status;
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.error_summary = Some(summary.clone());
            }
            Ok(())
        })?;
        if previous.is_terminal() {
            return Ok(previous);
        }
        self.events
            .error(run_id, None, &summary, Some(json!({ "phase": "orchestrator" })))?;
        self.events.run_status(
            run_id,
            RunStatus::Failed,
            Some("Run failed"),
            Some(json!({ "errorSummary": summary })),
        )?;
        Ok(RunStatus::Failed)
    }

    /// Merge (or pushed) commit of the most recently released iteration.
    fn released_commit(&self, run_id: &str) -> Result<Option<String>> {
        let events = self.store.list_events_after(run_id, 0)?;
        Ok(events
            .iter()
            .rev()
            .filter(|event| event.event_type == EventType::IterationStatus)
            .find_map(|event| {
                let payload = event.payload.as_ref()?;
                ["mergeSha", "commitSha"]
                    .iter()
                    .find_map(|key| payload.get(*key).and_then(Value::as_str))
                    .map(str::to_string)
            }))
    }

    /// Delete the sandbox once the run is terminal or parked at a checkpoint.
    fn release_sandbox(&self, run_id: &str) {
        let result = self.store.get_run(run_id).and_then(|mut run| {
            if !run.status.releases_sandbox() || run.worker_sandbox_path.is_none() {
                return Ok(());
            }
            self.sandboxes.cleanup(&mut run)?;
            self.update_run(run_id, |stored| stored.worker_sandbox_path = None)?;
            Ok(())
        });
        if let Err(err) = result {
            warn!(run_id, error = %err, "sandbox cleanup failed");
        }
    }

    /// Payload fields shared by every agent call of a run.
    fn plans_payload(run: &DevelopmentRun) -> Value {
        let plans = &run.plans_snapshot;
        json!({
            "businessPlan": plans.business_plan,
            "technicalPlan": plans.technical_plan,
            "uxPlan": plans.ux_plan,
        })
    }
}
