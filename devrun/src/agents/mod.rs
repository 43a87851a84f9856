//! Agent contracts and invocation.
//!
//! Each agent answers with JSON matching its schema. [`contract`] turns the
//! raw response into a typed [`AgentOutput`] (or a classified contract error),
//! [`harness`] wraps every call with task bookkeeping and events, and
//! [`backend`] is the seam to the model runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{GeneratedFile, PlannedIteration};

pub mod backend;
pub mod contract;
pub mod harness;
pub mod prompt;

const ASSESSMENT_SCHEMA: &str = include_str!("../../schemas/assessment_output.schema.json");
const ITERATION_PLAN_SCHEMA: &str = include_str!("../../schemas/iteration_plan_output.schema.json");
const SPEC_SCHEMA: &str = include_str!("../../schemas/spec_output.schema.json");
const TEST_SCHEMA: &str = include_str!("../../schemas/test_output.schema.json");
const CODE_SCHEMA: &str = include_str!("../../schemas/code_output.schema.json");
const REVIEW_SCHEMA: &str = include_str!("../../schemas/review_output.schema.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Assessment,
    IterationPlanner,
    Spec,
    Test,
    Code,
    Review,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Assessment,
        AgentKind::IterationPlanner,
        AgentKind::Spec,
        AgentKind::Test,
        AgentKind::Code,
        AgentKind::Review,
    ];

    /// Name recorded on AgentTaskRun rows and events.
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Assessment => "AssessmentAgent",
            AgentKind::IterationPlanner => "IterationPlannerAgent",
            AgentKind::Spec => "SpecAgent",
            AgentKind::Test => "TestAgent",
            AgentKind::Code => "CodeAgent",
            AgentKind::Review => "ReviewAgent",
        }
    }

    /// JSON Schema the agent's output must satisfy.
    pub fn schema(self) -> &'static str {
        match self {
            AgentKind::Assessment => ASSESSMENT_SCHEMA,
            AgentKind::IterationPlanner => ITERATION_PLAN_SCHEMA,
            AgentKind::Spec => SPEC_SCHEMA,
            AgentKind::Test => TEST_SCHEMA,
            AgentKind::Code => CODE_SCHEMA,
            AgentKind::Review => REVIEW_SCHEMA,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentOutput {
    pub summary: String,
    pub complexity: String,
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationPlanOutput {
    pub iterations: Vec<PlannedIteration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecOutput {
    pub summary: String,
    pub feature_path: String,
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutput {
    pub summary: String,
    pub files: Vec<GeneratedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeOutput {
    pub summary: String,
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFinding {
    pub severity: String,
    #[serde(default)]
    pub file: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutput {
    pub summary: String,
    pub approved: bool,
    pub findings: Vec<ReviewFinding>,
}

/// Validated output of one agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutput {
    Assessment(AssessmentOutput),
    IterationPlan(IterationPlanOutput),
    Spec(SpecOutput),
    Test(TestOutput),
    Code(CodeOutput),
    Review(ReviewOutput),
}

impl AgentOutput {
    pub fn kind(&self) -> AgentKind {
        match self {
            AgentOutput::Assessment(_) => AgentKind::Assessment,
            AgentOutput::IterationPlan(_) => AgentKind::IterationPlanner,
            AgentOutput::Spec(_) => AgentKind::Spec,
            AgentOutput::Test(_) => AgentKind::Test,
            AgentOutput::Code(_) => AgentKind::Code,
            AgentOutput::Review(_) => AgentKind::Review,
        }
    }

    /// Files to write into the sandbox; empty for planning and review agents.
    pub fn files(&self) -> &[GeneratedFile] {
        match self {
            AgentOutput::Spec(out) => &out.files,
            AgentOutput::Test(out) => &out.files,
            AgentOutput::Code(out) => &out.files,
            AgentOutput::Assessment(_) | AgentOutput::IterationPlan(_) | AgentOutput::Review(_) => &[],
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            AgentOutput::Assessment(out) => Some(&out.summary),
            AgentOutput::Spec(out) => Some(&out.summary),
            AgentOutput::Test(out) => Some(&out.summary),
            AgentOutput::Code(out) => Some(&out.summary),
            AgentOutput::Review(out) => Some(&out.summary),
            AgentOutput::IterationPlan(_) => None,
        }
    }

    /// JSON form persisted on the AgentTaskRun row.
    pub fn to_value(&self) -> Value {
        let value = match self {
            AgentOutput::Assessment(out) => serde_json::to_value(out),
            AgentOutput::IterationPlan(out) => serde_json::to_value(out),
            AgentOutput::Spec(out) => serde_json::to_value(out),
            AgentOutput::Test(out) => serde_json::to_value(out),
            AgentOutput::Code(out) => serde_json::to_value(out),
            AgentOutput::Review(out) => serde_json::to_value(out),
        };
        value.unwrap_or(Value::Null)
    }
}
