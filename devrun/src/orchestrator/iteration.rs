//! Per-iteration pipeline: agents → files → gates → release.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::agents::harness::error_details;
use crate::agents::{AgentKind, AgentOutput};
use crate::core::diagnostics::checkpoint_summary;
use crate::core::files::merge_generated_files;
use crate::core::retry::{
    AttemptDecision, CheckpointReason, attempts_remaining, can_start_attempt, decide_after_failure,
};
use crate::core::transitions::ensure_iteration_transition;
use crate::core::types::{
    EventType, IterationRun, IterationStatus, QualityGateRun, RunStatus,
};
use crate::io::gates::GateOutcome;
use crate::orchestrator::Orchestrator;
use crate::release::{IterationRelease, RELEASE_PHASE, ReleaseCheckpoint};

pub(super) enum IterationResult {
    Deployed,
    Stopped(RunStatus),
}

/// Why one attempt did not reach release.
enum AttemptFailure {
    /// Compact per-gate causes, e.g. `BUILD (Cannot find module 'x')`.
    Gates(Vec<String>),
    /// An agent call failed its contract or its runtime.
    Agent(String),
}

impl AttemptFailure {
    /// Text handed to the agents of the next attempt.
    fn feedback(&self) -> String {
        match self {
            AttemptFailure::Gates(summaries) => summaries.join("\n"),
            AttemptFailure::Agent(summary) => summary.clone(),
        }
    }

    fn checkpoint_message(&self, attempts: u32, reason: CheckpointReason) -> String {
        let cause = match self {
            AttemptFailure::Gates(summaries) => checkpoint_summary(attempts, summaries),
            AttemptFailure::Agent(summary) => {
                format!("Agent failure after {attempts} attempt(s): {summary}")
            }
        };
        match reason {
            CheckpointReason::BabyStep => format!("Baby-step pause: {cause}"),
            CheckpointReason::AttemptsExhausted => cause,
        }
    }
}

impl Orchestrator {
    fn load_iteration(&self, run_id: &str, index: u32) -> Result<IterationRun> {
        self.store
            .list_iterations(run_id)?
            .into_iter()
            .find(|it| it.index == index)
            .ok_or_else(|| anyhow!("run {run_id} has no iteration {index}"))
    }

    fn set_iteration_status(
        &self,
        iteration: &mut IterationRun,
        status: IterationStatus,
        message: &str,
        extra: Option<Value>,
    ) -> Result<()> {
        ensure_iteration_transition(iteration.status, status)?;
        iteration.status = status;
        match status {
            IterationStatus::Running => {
                iteration.started_at.get_or_insert_with(Utc::now);
                iteration.finished_at = None;
            }
            IterationStatus::Deployed | IterationStatus::Failed => {
                iteration.finished_at = Some(Utc::now());
            }
            IterationStatus::Pending | IterationStatus::Gated | IterationStatus::Merged => {}
        }
        self.store.update_iteration(iteration)?;
        self.events
            .iteration_status(&iteration.run_id, &iteration.id, status, Some(message), extra)?;
        Ok(())
    }

    /// The documented checkpoint helper: fail the iteration and park the run.
    fn checkpoint(
        &self,
        iteration: &mut IterationRun,
        summary: &str,
        extra: Value,
    ) -> Result<IterationResult> {
        let summary = self.events.mask(summary);
        let attempt = iteration.attempt_count;
        if iteration.status != IterationStatus::Failed {
            self.set_iteration_status(
                iteration,
                IterationStatus::Failed,
                &summary,
                Some(json!({ "attempt": attempt })),
            )?;
        }

        let run_id = iteration.run_id.as_str();
        let (status, _) = self.update_run_if(run_id, RunStatus::Running, |run| {
            run.status = RunStatus::WaitingCheckpoint;
            run.error_summary = Some(summary.clone());
        })?;
        if status != RunStatus::Running {
            return Ok(IterationResult::Stopped(status));
        }
        let mut payload = json!({
            "iterationIndex": iteration.index,
            "attemptCount": iteration.attempt_count,
            "errorSummary": summary,
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut payload, extra) {
            map.extend(extra);
        }
        self.events.run_status(
            run_id,
            RunStatus::WaitingCheckpoint,
            Some(&format!("Waiting at checkpoint on iteration {}", iteration.index)),
            Some(payload),
        )?;
        info!(run_id, index = iteration.index, "run parked at checkpoint");
        Ok(IterationResult::Stopped(RunStatus::WaitingCheckpoint))
    }

    /// Drive one iteration until it is deployed or the run must stop.
    #[instrument(skip(self, sandbox))]
    pub(super) fn run_iteration(
        &self,
        run_id: &str,
        sandbox: &Path,
        index: u32,
    ) -> Result<IterationResult> {
        let mut iteration = self.load_iteration(run_id, index)?;
        if iteration.status == IterationStatus::Deployed {
            return Ok(IterationResult::Deployed);
        }
        self.update_run(run_id, |run| run.current_iteration = index)?;
        match iteration.status {
            // Interrupted after the gates passed: finish the release.
            IterationStatus::Gated => return self.release_iteration(sandbox, &mut iteration),
            IterationStatus::Merged => {
                self.set_iteration_status(&mut iteration, IterationStatus::Deployed, "Iteration deployed", None)?;
                return Ok(IterationResult::Deployed);
            }
            IterationStatus::Failed if can_start_attempt(iteration.attempt_count) => {
                self.set_iteration_status(&mut iteration, IterationStatus::Pending, "Iteration reopened", None)?;
            }
            IterationStatus::Failed
            | IterationStatus::Pending
            | IterationStatus::Running
            | IterationStatus::Deployed => {}
        }

        let mut last_failure: Option<AttemptFailure> = None;
        loop {
            let status = self.current_status(run_id)?;
            if status != RunStatus::Running {
                return Ok(IterationResult::Stopped(status));
            }
            if !can_start_attempt(iteration.attempt_count) {
                let attempts = iteration.attempt_count;
                let summary = match &last_failure {
                    Some(failure) => failure.checkpoint_message(attempts, CheckpointReason::AttemptsExhausted),
                    None => format!(
                        "Iteration {index} exhausted its {attempts} attempts; recover the run to reset it"
                    ),
                };
                return self.checkpoint(
                    &mut iteration,
                    &summary,
                    json!({ "reason": CheckpointReason::AttemptsExhausted.as_str() }),
                );
            }

            iteration.attempt_count += 1;
            let attempt = iteration.attempt_count;
            self.set_iteration_status(
                &mut iteration,
                IterationStatus::Running,
                &format!("Attempt {attempt} started"),
                Some(json!({ "attempt": attempt })),
            )?;

            let feedback = last_failure.as_ref().map(AttemptFailure::feedback);
            let failure = match self.run_attempt(sandbox, &mut iteration, feedback.as_deref())? {
                None => return self.release_iteration(sandbox, &mut iteration),
                Some(failure) => failure,
            };

            match decide_after_failure(attempt, self.config.baby_step) {
                AttemptDecision::Retry => {
                    self.events.append(
                        run_id,
                        Some(&iteration.id),
                        EventType::Info,
                        Some(&format!("Attempt {attempt} failed, retrying: {}", failure.feedback())),
                        Some(json!({
                            "attempt": attempt,
                            "attemptsRemaining": attempts_remaining(attempt),
                        })),
                    )?;
                    last_failure = Some(failure);
                }
                AttemptDecision::Checkpoint(reason) => {
                    let summary = failure.checkpoint_message(attempt, reason);
                    return self.checkpoint(&mut iteration, &summary, json!({ "reason": reason.as_str() }));
                }
            }
        }
    }

    /// One attempt: Spec → Test → Code, write files, Review, gates.
    ///
    /// `Ok(None)` means every gate passed.
    fn run_attempt(
        &self,
        sandbox: &Path,
        iteration: &mut IterationRun,
        feedback: Option<&str>,
    ) -> Result<Option<AttemptFailure>> {
        let run = self.store.get_run(&iteration.run_id)?;
        let run_id = run.id.as_str();
        let mut payload = json!({
            "plans": Self::plans_payload(&run),
            "iteration": {
                "index": iteration.index,
                "name": iteration.name,
                "goals": iteration.scope.goals,
                "featureTags": iteration.scope.feature_tags,
                "risks": iteration.scope.risks,
            },
            "attempt": iteration.attempt_count,
            "failure": feedback,
        });

        let harness = self.harness();
        let mut outputs: Vec<AgentOutput> = Vec::with_capacity(3);
        for kind in [AgentKind::Spec, AgentKind::Test, AgentKind::Code] {
            let output = match harness.invoke(run_id, Some(&iteration.id), kind, &payload) {
                Ok(output) => output,
                Err(err) => return Ok(Some(agent_failure(kind, &err, &self.events.mask(&format!("{err:#}"))))),
            };
            payload[output_key(kind)] = output.to_value();
            outputs.push(output);
        }

        let merged = match merge_generated_files(outputs.iter().map(AgentOutput::files)) {
            Ok(files) => files,
            Err(err) => return Ok(Some(AttemptFailure::Agent(err.to_string()))),
        };
        let written = self
            .sandboxes
            .write_files(sandbox, &merged)
            .context("write generated files")?;
        if let Some(AgentOutput::Spec(spec)) = outputs.first() {
            iteration.gherkin_path = Some(spec.feature_path.clone());
            self.store.update_iteration(iteration)?;
        }
        self.events.append(
            run_id,
            Some(&iteration.id),
            EventType::Info,
            Some(&format!("Wrote {} generated files", written.len())),
            Some(json!({ "files": written })),
        )?;

        // Review is advisory: its verdict is recorded but never blocks.
        payload["files"] = json!(written);
        match harness.invoke(run_id, Some(&iteration.id), AgentKind::Review, &payload) {
            Ok(AgentOutput::Review(review)) => {
                self.events.append(
                    run_id,
                    Some(&iteration.id),
                    EventType::Info,
                    Some(&format!("Review: {}", review.summary)),
                    Some(json!({ "approved": review.approved, "findings": review.findings })),
                )?;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "review agent failed; continuing"),
        }

        let outcomes = self.gates.run_gates(sandbox)?;
        self.record_gates(iteration, &outcomes)?;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|outcome| !outcome.passed())
            .map(GateOutcome::summary)
            .collect();
        if failed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(AttemptFailure::Gates(failed)))
        }
    }

    fn record_gates(&self, iteration: &IterationRun, outcomes: &[GateOutcome]) -> Result<()> {
        for outcome in outcomes {
            self.store.upsert_gate(QualityGateRun {
                iteration_id: iteration.id.clone(),
                run_id: iteration.run_id.clone(),
                gate_type: outcome.gate_type,
                status: outcome.status,
                reason: outcome.reason.clone(),
                report: self.events.mask_value(outcome.report.clone()),
                duration_ms: outcome.duration_ms,
                updated_at: Utc::now(),
            })?;
            let verdict = if outcome.passed() { "passed" } else { "failed" };
            self.events.append(
                &iteration.run_id,
                Some(&iteration.id),
                EventType::QualityGate,
                Some(&format!("{} {verdict}", outcome.gate_type)),
                Some(json!({
                    "gateType": outcome.gate_type,
                    "status": outcome.status,
                    "reason": outcome.reason,
                    "detail": outcome.detail,
                    "durationMs": outcome.duration_ms,
                    "attempt": iteration.attempt_count,
                })),
            )?;
        }
        Ok(())
    }

    /// GATED → release → MERGED → DEPLOYED, or a release checkpoint.
    fn release_iteration(&self, sandbox: &Path, iteration: &mut IterationRun) -> Result<IterationResult> {
        let (index, attempt) = (iteration.index, iteration.attempt_count);
        if iteration.status != IterationStatus::Gated {
            self.set_iteration_status(
                iteration,
                IterationStatus::Gated,
                "All quality gates passed",
                Some(json!({ "attempt": attempt })),
            )?;
        }

        let run_id = iteration.run_id.clone();
        let artifacts = self.sandboxes.collect_artifacts(sandbox)?;
        let branch = iteration
            .branch_name
            .clone()
            .ok_or_else(|| anyhow!("iteration {} has no branch name", iteration.id))?;

        let events = &self.events;
        let iteration_id = iteration.id.clone();
        let mut on_checkpoint = |checkpoint: &ReleaseCheckpoint| {
            let payload = serde_json::to_value(checkpoint).unwrap_or(Value::Null);
            let message = format!("Release {}: {}", checkpoint.step, checkpoint.summary);
            if let Err(err) = events.append(&run_id, Some(&iteration_id), EventType::Info, Some(&message), Some(payload)) {
                warn!(error = %err, "failed to record release checkpoint");
            }
        };
        let released = self.releaser.release(
            &IterationRelease {
                run_id: &run_id,
                iteration_index: index,
                iteration_name: &iteration.name,
                branch: &branch,
                artifacts: &artifacts,
            },
            &mut on_checkpoint,
        );

        let outcome = match released {
            Ok(outcome) => outcome,
            Err(err) => {
                // Release failures never consume an attempt.
                iteration.attempt_count = iteration.attempt_count.saturating_sub(1);
                let details = error_details(&err).unwrap_or_default();
                let phase = details.phase.clone().unwrap_or_else(|| RELEASE_PHASE.to_string());
                let step = details.step.clone().unwrap_or_else(|| "unknown".to_string());
                let cause = details.summary.clone().unwrap_or_else(|| format!("{err:#}"));
                let summary = format!("Release failed (phase={phase}, step={step}): {cause}");
                self.events.error(
                    &run_id,
                    Some(&iteration.id),
                    &summary,
                    Some(json!({ "phase": phase, "step": step, "details": details })),
                )?;
                return self.checkpoint(iteration, &summary, json!({ "phase": phase, "step": step }));
            }
        };

        if outcome.skipped {
            self.events.info(
                &run_id,
                Some(&iteration.id),
                "Release disabled; iteration marked merged without a commit",
            )?;
        }
        self.set_iteration_status(
            iteration,
            IterationStatus::Merged,
            &format!("Iteration {index} merged"),
            Some(json!({
                "skipped": outcome.skipped,
                "commitSha": outcome.commit_sha,
                "pullRequest": outcome.pull_request,
                "mergeSha": outcome.merge_sha,
            })),
        )?;
        self.set_iteration_status(
            iteration,
            IterationStatus::Deployed,
            &format!("Iteration {index} deployed"),
            None,
        )?;
        info!(run_id = %run_id, index, "iteration deployed");
        Ok(IterationResult::Deployed)
    }
}

fn output_key(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Spec => "spec",
        AgentKind::Test => "tests",
        AgentKind::Code => "code",
        AgentKind::Review => "review",
        AgentKind::Assessment => "assessment",
        AgentKind::IterationPlanner => "iterationPlan",
    }
}

fn agent_failure(kind: AgentKind, err: &anyhow::Error, masked: &str) -> AttemptFailure {
    let label = error_details(err)
        .and_then(|details| details.step)
        .unwrap_or_else(|| "runtime_error".to_string());
    AttemptFailure::Agent(format!("{} ({label}: {masked})", kind.name()))
}
