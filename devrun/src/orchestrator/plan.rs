//! Materializing the iteration list of a run, exactly once.

use anyhow::{Result, bail};
use serde_json::json;
use tracing::{info, warn};

use crate::agents::contract::AgentContractError;
use crate::agents::{AgentKind, AgentOutput};
use crate::core::path::iteration_branch_name;
use crate::core::retry::MAX_ITERATION_ATTEMPTS;
use crate::core::types::{EventType, IterationRun, IterationStatus, PlannedIteration};
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Stored iterations, creating them on first call.
    ///
    /// An approved iteration plan from the snapshot is used verbatim;
    /// otherwise the Assessment and IterationPlanner agents produce one.
    pub(super) fn materialize_plan(&self, run_id: &str) -> Result<Vec<IterationRun>> {
        let existing = self.store.list_iterations(run_id)?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let run = self.store.get_run(run_id)?;
        let (source, planned) = match &run.plans_snapshot.approved_iterations {
            Some(approved) if !approved.is_empty() => ("approved", approved.clone()),
            _ => ("synthesized", self.synthesize_plan(run_id)?),
        };

        let iterations: Vec<IterationRun> = planned
            .into_iter()
            .zip(1u32..)
            .map(|(planned, index)| IterationRun {
                id: format!("{run_id}-it{index}"),
                run_id: run_id.to_string(),
                index,
                branch_name: Some(iteration_branch_name(run_id, index, &planned.name)),
                name: planned.name,
                status: IterationStatus::Pending,
                scope: planned.scope,
                gherkin_path: None,
                attempt_count: 0,
                started_at: None,
                finished_at: None,
            })
            .collect();
        self.store.create_iterations(run_id, iterations.clone())?;
        let total = iterations.len() as u32;
        self.update_run(run_id, |run| run.total_iterations = total)?;

        let names: Vec<&str> = iterations.iter().map(|it| it.name.as_str()).collect();
        self.events.append(
            run_id,
            None,
            EventType::Info,
            Some(&format!("Iteration plan materialized ({total} iterations)")),
            Some(json!({ "source": source, "iterations": names })),
        )?;
        info!(run_id, source, total, "iteration plan materialized");
        Ok(iterations)
    }

    fn synthesize_plan(&self, run_id: &str) -> Result<Vec<PlannedIteration>> {
        let run = self.store.get_run(run_id)?;
        let plans = Self::plans_payload(&run);
        let assessment = match &run.plans_snapshot.approved_assessment {
            Some(approved) => approved.clone(),
            None => self.plan_with_retries(run_id, AgentKind::Assessment, &json!({ "plans": plans }))?.to_value(),
        };
        let payload = json!({ "plans": plans, "assessment": assessment });
        match self.plan_with_retries(run_id, AgentKind::IterationPlanner, &payload)? {
            AgentOutput::IterationPlan(plan) if !plan.iterations.is_empty() => Ok(plan.iterations),
            AgentOutput::IterationPlan(_) => bail!("iteration planner returned no iterations"),
            other => bail!("unexpected {} output while planning", other.kind().name()),
        }
    }

    /// Planning agents get the same attempt budget as iterations for contract errors.
    fn plan_with_retries(
        &self,
        run_id: &str,
        kind: AgentKind,
        payload: &serde_json::Value,
    ) -> Result<AgentOutput> {
        let mut attempt = 1;
        loop {
            match self.harness().invoke(run_id, None, kind, payload) {
                Ok(output) => return Ok(output),
                Err(err)
                    if attempt < MAX_ITERATION_ATTEMPTS
                        && err.downcast_ref::<AgentContractError>().is_some() =>
                {
                    warn!(agent = kind.name(), attempt, error = %err, "planning agent failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
