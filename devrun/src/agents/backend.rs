//! Model runtime seam.
//!
//! The orchestrator only ever sees [`AgentBackend`]. [`CommandBackend`] drives
//! an external agent CLI (`codex exec` by default) with the output schema and
//! a last-message file; tests use scripted backends that never spawn.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agents::contract::AgentContractError;
use crate::core::types::TokenUsage;
use crate::io::config::AgentConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// One model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub agent_name: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub json_schema: String,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Hit the model's own length limit; the text is likely cut off.
    Length,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    pub token_usage: Option<TokenUsage>,
    pub cost: Option<f64>,
}

pub trait AgentBackend: Send + Sync {
    fn complete(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Backend used when agents are turned off; every call is a contract error.
pub struct DisabledBackend;

impl AgentBackend for DisabledBackend {
    fn complete(&self, request: &AgentRequest) -> Result<AgentResponse> {
        debug!(agent = %request.agent_name, "agent runtime disabled");
        Err(AgentContractError::RuntimeDisabled.into())
    }
}

/// Backend that spawns an agent CLI per call.
pub struct CommandBackend {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl AgentBackend for CommandBackend {
    #[instrument(skip_all, fields(agent = %request.agent_name, timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let scratch = tempfile::Builder::new()
            .prefix("devrun-agent-")
            .tempdir()
            .context("create agent scratch dir")?;
        let schema_path = scratch.path().join("output.schema.json");
        let output_path = scratch.path().join("last_message.json");
        fs::write(&schema_path, &request.json_schema)
            .with_context(|| format!("write schema {}", schema_path.display()))?;

        let mut argv = self.command.clone();
        argv.extend([
            "--output-schema".to_string(),
            schema_path.to_string_lossy().into_owned(),
            "--output-last-message".to_string(),
            output_path.to_string_lossy().into_owned(),
            "-".to_string(),
        ]);
        let prompt = format!("{}\n\n{}", request.system_prompt.trim(), request.user_prompt.trim());

        info!(program = %argv[0], "starting agent command");
        let cmd = command_from_argv(&argv, scratch.path(), &[])?;
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run agent command for {}", request.agent_name))?;

        if output.timed_out {
            warn!("agent command timed out");
            return Err(anyhow!(
                "{} timed out after {}s",
                request.agent_name,
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent command failed");
            return Err(anyhow!(
                "{} command failed with status {:?}: {}",
                request.agent_name,
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        if !output_path.exists() {
            return Err(anyhow!(
                "{} produced no output message",
                request.agent_name
            ));
        }
        let text = fs::read_to_string(&output_path)
            .with_context(|| format!("read agent output {}", output_path.display()))?;
        // The CLI does not report a stop reason; a cut-off body is detected by the parser.
        Ok(AgentResponse {
            text,
            finish_reason: FinishReason::Stop,
            token_usage: None,
            cost: None,
        })
    }
}
