//! Strict JSON contract enforced on top of free-text model responses.
//!
//! Parse, don't trust: a response becomes an [`AgentOutput`] only after it
//! parses as JSON, validates against the agent's schema, deserializes into the
//! typed output, and every emitted file path passes sanitization. Each failure
//! class maps to its own [`AgentContractError`] variant.

use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::error::Category;
use thiserror::Error;

use crate::agents::backend::{AgentResponse, FinishReason};
use crate::agents::{AgentKind, AgentOutput};
use crate::core::path::{InvalidWorkspacePath, sanitize_workspace_path};
use crate::core::types::GeneratedFile;

#[derive(Debug, Error)]
pub enum AgentContractError {
    /// The model stopped early; retrying may produce a complete answer.
    #[error("{agent} response was truncated: {detail}")]
    Truncated { agent: &'static str, detail: String },
    #[error("{agent} response is not valid JSON: {detail}")]
    InvalidJson { agent: &'static str, detail: String },
    #[error("{agent} output does not match its schema: {detail}")]
    SchemaMismatch { agent: &'static str, detail: String },
    #[error("{agent} emitted an unsafe file path: {source}")]
    UnsafePath {
        agent: &'static str,
        #[source]
        source: InvalidWorkspacePath,
    },
    #[error("agent runtime is disabled")]
    RuntimeDisabled,
}

impl AgentContractError {
    /// Stable kind label recorded as the failing step.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentContractError::Truncated { .. } => "truncated",
            AgentContractError::InvalidJson { .. } => "invalid_json",
            AgentContractError::SchemaMismatch { .. } => "schema_mismatch",
            AgentContractError::UnsafePath { .. } => "unsafe_path",
            AgentContractError::RuntimeDisabled => "runtime_disabled",
        }
    }
}

/// Remove a surrounding Markdown code fence, if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) on the opening line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn parse_agent_output(
    kind: AgentKind,
    response: &AgentResponse,
) -> Result<AgentOutput, AgentContractError> {
    let agent = kind.name();
    if response.finish_reason == FinishReason::Length {
        return Err(AgentContractError::Truncated {
            agent,
            detail: "model stopped at its length limit".to_string(),
        });
    }

    let body = strip_code_fences(&response.text);
    let value: Value = serde_json::from_str(body).map_err(|err| {
        if err.classify() == Category::Eof {
            AgentContractError::Truncated {
                agent,
                detail: err.to_string(),
            }
        } else {
            AgentContractError::InvalidJson {
                agent,
                detail: err.to_string(),
            }
        }
    })?;

    validate_schema(kind, &value)?;

    let mut output = match kind {
        AgentKind::Assessment => AgentOutput::Assessment(typed(agent, value)?),
        AgentKind::IterationPlanner => AgentOutput::IterationPlan(typed(agent, value)?),
        AgentKind::Spec => AgentOutput::Spec(typed(agent, value)?),
        AgentKind::Test => AgentOutput::Test(typed(agent, value)?),
        AgentKind::Code => AgentOutput::Code(typed(agent, value)?),
        AgentKind::Review => AgentOutput::Review(typed(agent, value)?),
    };
    sanitize_paths(agent, &mut output)?;
    Ok(output)
}

fn validate_schema(kind: AgentKind, value: &Value) -> Result<(), AgentContractError> {
    let agent = kind.name();
    let schema: Value =
        serde_json::from_str(kind.schema()).map_err(|err| AgentContractError::SchemaMismatch {
            agent,
            detail: format!("embedded schema is invalid: {err}"),
        })?;
    let validator = validator_for(&schema).map_err(|err| AgentContractError::SchemaMismatch {
        agent,
        detail: format!("embedded schema is invalid: {err}"),
    })?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    Err(AgentContractError::SchemaMismatch {
        agent,
        detail: messages.join("; "),
    })
}

fn typed<T: DeserializeOwned>(agent: &'static str, value: Value) -> Result<T, AgentContractError> {
    serde_json::from_value(value).map_err(|err| AgentContractError::SchemaMismatch {
        agent,
        detail: err.to_string(),
    })
}

fn sanitize_files(agent: &'static str, files: &mut [GeneratedFile]) -> Result<(), AgentContractError> {
    for file in files {
        file.path = sanitize_workspace_path(&file.path)
            .map_err(|source| AgentContractError::UnsafePath { agent, source })?;
    }
    Ok(())
}

fn sanitize_paths(agent: &'static str, output: &mut AgentOutput) -> Result<(), AgentContractError> {
    match output {
        AgentOutput::Spec(out) => {
            out.feature_path = sanitize_workspace_path(&out.feature_path)
                .map_err(|source| AgentContractError::UnsafePath { agent, source })?;
            sanitize_files(agent, &mut out.files)
        }
        AgentOutput::Test(out) => sanitize_files(agent, &mut out.files),
        AgentOutput::Code(out) => sanitize_files(agent, &mut out.files),
        AgentOutput::Review(out) => {
            for finding in &mut out.findings {
                finding.file = finding
                    .file
                    .as_deref()
                    .and_then(|file| sanitize_workspace_path(file).ok());
            }
            Ok(())
        }
        AgentOutput::Assessment(_) | AgentOutput::IterationPlan(_) => Ok(()),
    }
}
