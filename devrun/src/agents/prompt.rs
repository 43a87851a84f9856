//! Prompt rendering for agent calls.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde_json::Value;

use crate::agents::AgentKind;
use crate::agents::backend::AgentRequest;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const ASSESSMENT_TEMPLATE: &str = include_str!("prompts/assessment.md");
const ITERATION_PLANNER_TEMPLATE: &str = include_str!("prompts/iteration_planner.md");
const SPEC_TEMPLATE: &str = include_str!("prompts/spec.md");
const TEST_TEMPLATE: &str = include_str!("prompts/test.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        // Names carry no extension so minijinja does not auto-escape the JSON context.
        for (name, source) in [
            ("system", SYSTEM_TEMPLATE),
            ("assessment", ASSESSMENT_TEMPLATE),
            ("iteration_planner", ITERATION_PLANNER_TEMPLATE),
            ("spec", SPEC_TEMPLATE),
            ("test", TEST_TEMPLATE),
            ("code", CODE_TEMPLATE),
            ("review", REVIEW_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    fn render_system(&self, kind: AgentKind) -> Result<String> {
        let template = self.env.get_template("system")?;
        Ok(template.render(context! { agent_name => kind.name() })?)
    }

    fn render_user(&self, kind: AgentKind, payload: &Value) -> Result<String> {
        let template = self.env.get_template(template_name(kind))?;
        let iteration = payload.get("iteration");
        let rendered = template.render(context! {
            context_json => serde_json::to_string_pretty(payload)?,
            iteration_index => iteration.and_then(|it| it.get("index")).and_then(Value::as_u64),
            iteration_name => iteration.and_then(|it| it.get("name")).and_then(Value::as_str),
            failure => payload
                .get("failure")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }
}

fn template_name(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Assessment => "assessment",
        AgentKind::IterationPlanner => "iteration_planner",
        AgentKind::Spec => "spec",
        AgentKind::Test => "test",
        AgentKind::Code => "code",
        AgentKind::Review => "review",
    }
}

/// Build the backend request for `kind` from its JSON payload.
///
/// Iteration agents read `iteration.index`, `iteration.name` and an optional
/// `failure` string (the previous attempt's diagnostics) from the payload.
pub fn build_request(kind: AgentKind, payload: &Value) -> Result<AgentRequest> {
    Ok(AgentRequest {
        agent_name: kind.name().to_string(),
        system_prompt: ENGINE.render_system(kind)?,
        user_prompt: ENGINE.render_user(kind, payload)?,
        json_schema: kind.schema().to_string(),
    })
}
