//! Shared records and status enums for development runs.
//!
//! These types are the persisted shape of the orchestrator's state. They hold
//! no behavior beyond small classification helpers and must stay stable across
//! releases: the event stream and the run summary read model are consumed by
//! external viewers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a [`DevelopmentRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingCheckpoint,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    /// Terminal runs are never processed again without an explicit control operation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Non-terminal; at most one such run may exist per project.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Terminal or paused at a checkpoint: the states in which the sandbox is released.
    pub fn releases_sandbox(self) -> bool {
        self.is_terminal() || self == RunStatus::WaitingCheckpoint
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::WaitingCheckpoint => "WAITING_CHECKPOINT",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an [`IterationRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationStatus {
    Pending,
    Running,
    Gated,
    Merged,
    Deployed,
    Failed,
}

impl IterationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationStatus::Pending => "PENDING",
            IterationStatus::Running => "RUNNING",
            IterationStatus::Gated => "GATED",
            IterationStatus::Merged => "MERGED",
            IterationStatus::Deployed => "DEPLOYED",
            IterationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateType {
    Build,
    Unit,
    Bdd,
    Review,
    Security,
}

impl GateType {
    /// Evaluation order; BUILD → UNIT → BDD form a dependency chain.
    pub const ALL: [GateType; 5] = [
        GateType::Build,
        GateType::Unit,
        GateType::Bdd,
        GateType::Review,
        GateType::Security,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GateType::Build => "BUILD",
            GateType::Unit => "UNIT",
            GateType::Bdd => "BDD",
            GateType::Review => "REVIEW",
            GateType::Security => "SECURITY",
        }
    }

    /// The gate whose failure short-circuits this one, if any.
    pub fn depends_on(self) -> Option<GateType> {
        match self {
            GateType::Unit => Some(GateType::Build),
            GateType::Bdd => Some(GateType::Unit),
            _ => None,
        }
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentTaskStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStatus,
    IterationStatus,
    AgentTask,
    QualityGate,
    DeployStatus,
    Error,
    Info,
}

/// Scope of one vertical slice of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IterationScope {
    pub goals: Vec<String>,
    pub feature_tags: Vec<String>,
    pub risks: Vec<String>,
}

/// One entry of an iteration plan, either approved by the caller or synthesized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedIteration {
    pub name: String,
    #[serde(flatten)]
    pub scope: IterationScope,
}

/// Immutable copy of the plans captured at run creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlansSnapshot {
    pub business_plan: Value,
    pub technical_plan: Value,
    pub ux_plan: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_assessment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_iterations: Option<Vec<PlannedIteration>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevelopmentRun {
    pub id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub current_iteration: u32,
    pub total_iterations: u32,
    pub plans_snapshot: PlansSnapshot,
    pub worker_sandbox_path: Option<String>,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRun {
    pub id: String,
    pub run_id: String,
    /// 1-based; ordering is authoritative.
    pub index: u32,
    pub name: String,
    pub status: IterationStatus,
    pub scope: IterationScope,
    pub gherkin_path: Option<String>,
    pub branch_name: Option<String>,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateRun {
    pub iteration_id: String,
    pub run_id: String,
    pub gate_type: GateType,
    pub status: GateStatus,
    pub reason: Option<String>,
    /// Free-form diagnostics: snippet, reason, findings.
    pub report: Value,
    pub duration_ms: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Structured context carried by errors that know where they happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskRun {
    pub id: String,
    pub run_id: String,
    pub iteration_id: Option<String>,
    pub agent_name: String,
    pub input_hash: String,
    pub status: AgentTaskStatus,
    pub output: Option<Value>,
    pub token_usage: Option<TokenUsage>,
    pub cost: Option<f64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    /// Strictly increasing per run, starting at 1.
    pub sequence: u64,
    pub iteration_id: Option<String>,
    pub event_type: EventType,
    pub message: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A file emitted by an agent, relative to the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}
