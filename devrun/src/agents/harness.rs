//! Bookkeeping around every agent invocation.
//!
//! [`execute_agent`] records an AgentTaskRun (RUNNING, then SUCCEEDED or
//! FAILED) and emits an AGENT_TASK event before and after the call. Errors
//! are recorded and returned unchanged; the caller's retry policy decides
//! what happens next.

use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::agents::backend::AgentBackend;
use crate::agents::contract::{AgentContractError, parse_agent_output};
use crate::agents::prompt::build_request;
use crate::agents::{AgentKind, AgentOutput};
use crate::core::types::{AgentTaskRun, AgentTaskStatus, ErrorDetails, EventType, TokenUsage};
use crate::io::event_log::EventLog;
use crate::io::store::Store;
use crate::release::ReleaseError;

/// Identity and input of one agent call.
#[derive(Debug, Clone, Copy)]
pub struct AgentCall<'a> {
    pub run_id: &'a str,
    pub iteration_id: Option<&'a str>,
    pub agent_name: &'a str,
    pub payload: &'a Value,
}

/// What a successful call hands back for the task record.
#[derive(Debug, Clone)]
pub struct AgentSuccess<T> {
    pub value: T,
    pub output: Value,
    /// One-line account of what the agent did, when it gives one.
    pub summary: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub cost: Option<f64>,
}

/// SHA-256 hex of the canonical JSON encoding (object keys sorted).
pub fn input_hash(payload: &Value) -> String {
    // serde_json objects are BTreeMap-backed, so serialization is key-ordered.
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Structured `phase/step/summary/details` carried by known error types.
pub fn error_details(err: &anyhow::Error) -> Option<ErrorDetails> {
    if let Some(release) = err.downcast_ref::<ReleaseError>() {
        return Some(release.error_details());
    }
    if let Some(contract) = err.downcast_ref::<AgentContractError>() {
        return Some(ErrorDetails {
            phase: Some("agent".to_string()),
            step: Some(contract.kind().to_string()),
            summary: Some(contract.to_string()),
            details: None,
        });
    }
    None
}

#[instrument(skip_all, fields(run_id = call.run_id, agent = call.agent_name))]
pub fn execute_agent<T>(
    store: &dyn Store,
    events: &EventLog,
    call: AgentCall<'_>,
    run: impl FnOnce() -> Result<AgentSuccess<T>>,
) -> Result<T> {
    let mut task = AgentTaskRun {
        id: String::new(),
        run_id: call.run_id.to_string(),
        iteration_id: call.iteration_id.map(str::to_string),
        agent_name: call.agent_name.to_string(),
        input_hash: input_hash(call.payload),
        status: AgentTaskStatus::Running,
        output: None,
        token_usage: None,
        cost: None,
        duration_ms: None,
        error_message: None,
        error_details: None,
        started_at: Utc::now(),
        finished_at: None,
    };
    task.id = store.start_agent_task(task.clone())?;
    events.append(
        call.run_id,
        call.iteration_id,
        EventType::AgentTask,
        Some(&format!("{} started", call.agent_name)),
        Some(json!({
            "taskId": task.id,
            "agentName": call.agent_name,
            "status": AgentTaskStatus::Running,
            "inputHash": task.input_hash,
        })),
    )?;

    let started = Instant::now();
    let result = run();
    let duration_ms = started.elapsed().as_millis() as u64;
    task.duration_ms = Some(duration_ms);
    task.finished_at = Some(Utc::now());

    match result {
        Ok(success) => {
            task.status = AgentTaskStatus::Succeeded;
            task.output = Some(events.mask_value(success.output));
            task.token_usage = success.token_usage;
            task.cost = success.cost;
            store.close_agent_task(&task)?;
            events.append(
                call.run_id,
                call.iteration_id,
                EventType::AgentTask,
                Some(&format!("{} succeeded", call.agent_name)),
                Some(json!({
                    "taskId": task.id,
                    "agentName": call.agent_name,
                    "status": AgentTaskStatus::Succeeded,
                    "durationMs": duration_ms,
                    "tokenUsage": task.token_usage,
                    "cost": task.cost,
                    "summary": success.summary,
                })),
            )?;
            debug!(duration_ms, "agent task succeeded");
            Ok(success.value)
        }
        Err(err) => {
            let message = events.mask(&format!("{err:#}"));
            let details = error_details(&err);
            task.status = AgentTaskStatus::Failed;
            task.error_message = Some(message.clone());
            task.error_details = details.clone();
            // Bookkeeping failures must not hide the agent's own error.
            if let Err(close_err) = store.close_agent_task(&task) {
                warn!(error = %close_err, "failed to close agent task");
            }
            let payload = json!({
                "taskId": task.id,
                "agentName": call.agent_name,
                "status": AgentTaskStatus::Failed,
                "durationMs": duration_ms,
                "error": message,
                "details": details,
            });
            if let Err(event_err) = events.append(
                call.run_id,
                call.iteration_id,
                EventType::AgentTask,
                Some(&format!("{} failed", call.agent_name)),
                Some(payload),
            ) {
                warn!(error = %event_err, "failed to record agent task event");
            }
            warn!(duration_ms, error = %message, "agent task failed");
            Err(err)
        }
    }
}

/// Agent invocation wired to a backend: prompt → model → contract check.
#[derive(Clone, Copy)]
pub struct AgentHarness<'a> {
    pub backend: &'a dyn AgentBackend,
    pub store: &'a dyn Store,
    pub events: &'a EventLog,
}

impl AgentHarness<'_> {
    pub fn invoke(
        &self,
        run_id: &str,
        iteration_id: Option<&str>,
        kind: AgentKind,
        payload: &Value,
    ) -> Result<AgentOutput> {
        let call = AgentCall {
            run_id,
            iteration_id,
            agent_name: kind.name(),
            payload,
        };
        execute_agent(self.store, self.events, call, || {
            let request = build_request(kind, payload)?;
            let response = self.backend.complete(&request)?;
            let output = parse_agent_output(kind, &response)?;
            Ok(AgentSuccess {
                output: output.to_value(),
                summary: output.summary().map(str::to_string),
                token_usage: response.token_usage,
                cost: response.cost,
                value: output,
            })
        })
    }
}
