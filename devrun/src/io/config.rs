//! Orchestrator configuration stored as TOML (default `devrun.toml`).
//!
//! Feature flags (gate execution, baby-step mode, release mode) live here and
//! are passed into the orchestrator at construction time. Environment
//! overrides are applied once by the CLI through [`OrchestratorConfig::apply_env_overrides`];
//! library code never reads the environment.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Missing fields default to safe values: gate execution is off, so no code
/// ships without an explicit opt-in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause at a checkpoint after the first failed attempt of any iteration.
    pub baby_step: bool,

    /// Directory under which per-run sandboxes are allocated.
    pub sandbox_root: PathBuf,

    /// File-backed store location.
    pub state_path: PathBuf,

    pub gates: GateConfig,
    pub agent: AgentConfig,
    pub release: ReleaseConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// BUILD/UNIT/BDD only run when explicitly enabled.
    pub execution_enabled: bool,
    /// Project manifest whose presence marks a prepared workspace.
    pub manifest: String,
    /// Dependency directory; install runs only when it is missing.
    pub dependency_dir: String,
    pub install_command: Vec<String>,
    pub build_command: Vec<String>,
    pub unit_command: Vec<String>,
    pub bdd_command: Vec<String>,
    /// Program names gate commands may spawn.
    pub allowed_programs: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            execution_enabled: false,
            manifest: "package.json".to_string(),
            dependency_dir: "node_modules".to_string(),
            install_command: argv(&["npm", "install", "--no-audit", "--no-fund"]),
            build_command: argv(&["npm", "run", "build"]),
            unit_command: argv(&["npm", "run", "test", "--", "--run"]),
            bdd_command: argv(&["npx", "cucumber-js"]),
            allowed_programs: argv(&["npm", "npx", "pnpm", "yarn", "node"]),
            timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// When false every agent call fails with a runtime-disabled contract error.
    pub enabled: bool,
    /// Agent CLI invocation; the prompt is fed on stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: argv(&["codex", "exec", "--skip-git-repo-check"]),
            timeout_secs: 15 * 60,
            output_limit_bytes: 500_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Clone, commit, push, then open and squash-merge a pull request.
    GitCli,
    /// Skip releases; iterations are marked merged without a commit.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleaseConfig {
    pub mode: ReleaseMode,
    /// `owner/name` of the hosted repository.
    pub repository: Option<String>,
    /// Environment variable holding the hosting token.
    pub token_env: String,
    pub author_name: String,
    pub author_email: String,
    pub timeout_secs: u64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            mode: ReleaseMode::GitCli,
            repository: None,
            token_env: "GITHUB_TOKEN".to_string(),
            author_name: "devrun".to_string(),
            author_email: "devrun@users.noreply.github.com".to_string(),
            timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    /// Hosting site id; `None` makes deploy a no-op success.
    pub site_id: Option<String>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            poll_interval_secs: 5,
            timeout_secs: 5 * 60,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            baby_step: false,
            sandbox_root: PathBuf::from(".devrun/sandboxes"),
            state_path: PathBuf::from(".devrun/state.json"),
            gates: GateConfig::default(),
            agent: AgentConfig::default(),
            release: ReleaseConfig::default(),
            deploy: DeployConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let gates = &self.gates;
        for (name, command) in [
            ("gates.install_command", &gates.install_command),
            ("gates.build_command", &gates.build_command),
            ("gates.unit_command", &gates.unit_command),
            ("gates.bdd_command", &gates.bdd_command),
            ("agent.command", &self.agent.command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        if gates.manifest.trim().is_empty() {
            return Err(anyhow!("gates.manifest must not be empty"));
        }
        if gates.timeout_secs == 0 || self.agent.timeout_secs == 0 || self.release.timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if gates.output_limit_bytes == 0 || self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.deploy.timeout_secs == 0 {
            return Err(anyhow!("deploy.timeout_secs must be > 0"));
        }
        if let Some(repo) = &self.release.repository
            && repo.split('/').filter(|part| !part.is_empty()).count() != 2
        {
            return Err(anyhow!("release.repository must look like owner/name (got '{repo}')"));
        }
        Ok(())
    }

    /// Apply `DEVRUN_*` overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DEVRUN_GATES_EXECUTION_ENABLED") {
            self.gates.execution_enabled = parse_flag("DEVRUN_GATES_EXECUTION_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("DEVRUN_BABY_STEP") {
            self.baby_step = parse_flag("DEVRUN_BABY_STEP", &raw)?;
        }
        if let Some(raw) = lookup("DEVRUN_RELEASE_MODE") {
            self.release.mode = match raw.trim() {
                "git_cli" => ReleaseMode::GitCli,
                "disabled" => ReleaseMode::Disabled,
                other => return Err(anyhow!("DEVRUN_RELEASE_MODE: unknown mode '{other}'")),
            };
        }
        if let Some(raw) = lookup("DEVRUN_DEPLOY_SITE_ID") {
            let trimmed = raw.trim();
            self.deploy.site_id = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        self.validate()
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{name}: expected a boolean (got '{other}')")),
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::store::write_atomic(path, &buf)
}
