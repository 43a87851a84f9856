//! devrun: drive development runs from the command line.
//!
//! Runs live in the JSON state file named by the config (`devrun.toml` by
//! default). `worker` processes queued runs until interrupted; the other
//! commands are one-shot operator controls.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use devrun::agents::backend::{AgentBackend, CommandBackend, DisabledBackend};
use devrun::core::boundary::current_window;
use devrun::core::types::{PlansSnapshot, RunStatus};
use devrun::exit_codes;
use devrun::io::config::{OrchestratorConfig, load_config, write_config};
use devrun::io::deploy::{DeployHost, NetlifyCliHost};
use devrun::io::gates::CommandGateRunner;
use devrun::io::registry::WorkerRegistry;
use devrun::io::store::{JsonStore, Store};
use devrun::logging;
use devrun::orchestrator::{CheckpointAction, Collaborators, Orchestrator, ProcessOutcome};
use devrun::release::{DisabledReleaser, IterationReleaser, releaser_from_config};

#[derive(Parser)]
#[command(
    name = "devrun",
    version,
    about = "Drive approved plans through agent iterations, quality gates and releases"
)]
struct Cli {
    /// Orchestrator config (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "devrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a run for a project from a plans snapshot (JSON).
    Create {
        #[arg(long)]
        project: String,
        /// Path to the plans snapshot JSON.
        #[arg(long)]
        plans: PathBuf,
        /// Process the run right away instead of leaving it for a worker.
        #[arg(long)]
        process: bool,
    },
    /// Process one run until it finishes, checkpoints or is stopped.
    Process { run_id: String },
    /// Process queued and interrupted runs in a loop.
    Worker {
        /// Exit after one pass over the queue.
        #[arg(long)]
        once: bool,
        /// Seconds between queue polls.
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
    /// Cancel a run.
    Cancel { run_id: String },
    /// Reset the failed iteration, clear the sandbox and resume.
    Retry { run_id: String },
    /// Reset an iteration that used up its attempts and resume.
    Recover { run_id: String },
    /// Pause, resume or approve an iteration.
    Checkpoint {
        run_id: String,
        index: u32,
        /// pause | resume | approve
        action: CheckpointAction,
    },
    /// Print the run summary as JSON.
    Status { run_id: String },
    /// Print run events as JSON lines.
    Events {
        run_id: String,
        /// Only events with a sequence greater than this.
        #[arg(long, default_value_t = 0)]
        after: u64,
        /// Drop events from before the latest retry boundary.
        #[arg(long)]
        current: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Create {
            project,
            plans,
            process,
        } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            let plans = read_plans(&plans)?;
            let run = orchestrator.create_run(&project, plans)?;
            println!("{}", run.id);
            if process {
                return Ok(outcome_code(orchestrator.process_run(&run.id)?));
            }
            Ok(exit_codes::OK)
        }
        Command::Process { run_id } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            Ok(outcome_code(orchestrator.process_run(&run_id)?))
        }
        Command::Worker { once, poll_secs } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            cmd_worker(&orchestrator, once, Duration::from_secs(poll_secs.max(1)))
        }
        Command::Cancel { run_id } => {
            let orchestrator = build_orchestrator(&cli.config, false)?;
            let run = orchestrator.cancel_run(&run_id)?;
            println!("{}", run.status);
            Ok(exit_codes::OK)
        }
        Command::Retry { run_id } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            Ok(outcome_code(orchestrator.retry_run(&run_id)?))
        }
        Command::Recover { run_id } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            Ok(outcome_code(orchestrator.recover_run(&run_id)?))
        }
        Command::Checkpoint {
            run_id,
            index,
            action,
        } => {
            let orchestrator = build_orchestrator(&cli.config, true)?;
            Ok(outcome_code(orchestrator.checkpoint_action(&run_id, index, action)?))
        }
        Command::Status { run_id } => {
            let orchestrator = build_orchestrator(&cli.config, false)?;
            print_json(&orchestrator.run_summary(&run_id)?)?;
            Ok(exit_codes::OK)
        }
        Command::Events {
            run_id,
            after,
            current,
        } => {
            let orchestrator = build_orchestrator(&cli.config, false)?;
            let events = orchestrator.list_events_after(&run_id, after)?;
            let events = if current { current_window(&events) } else { &events[..] };
            for event in events {
                println!("{}", serde_json::to_string(event).context("serialize event")?);
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &OrchestratorConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Poll for runs that need a loop: QUEUED ones and RUNNING ones left by a crash.
///
/// Each pass processes its runs on one thread per run; the registry keeps a
/// run from being picked up twice.
fn cmd_worker(orchestrator: &Orchestrator, once: bool, poll: Duration) -> Result<i32> {
    loop {
        let pending: Vec<String> = orchestrator
            .store()
            .list_runs()?
            .into_iter()
            .filter(|run| matches!(run.status, RunStatus::Queued | RunStatus::Running))
            .filter(|run| !orchestrator.registry().is_active(&run.id))
            .map(|run| run.id)
            .collect();
        thread::scope(|scope| {
            for run_id in &pending {
                scope.spawn(move || match orchestrator.process_run(run_id) {
                    Ok(outcome) => info!(%run_id, ?outcome, "run processed"),
                    Err(err) => warn!(%run_id, error = %format!("{err:#}"), "run processing failed"),
                });
            }
        });
        if once {
            return Ok(exit_codes::OK);
        }
        thread::sleep(poll);
    }
}

fn build_orchestrator(config_path: &Path, with_release: bool) -> Result<Orchestrator> {
    let lookup = |key: &str| std::env::var(key).ok();
    let mut config = load_config(config_path)?;
    config.apply_env_overrides(lookup)?;

    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&config.state_path)?);
    let backend: Arc<dyn AgentBackend> = if config.agent.enabled {
        Arc::new(CommandBackend::new(&config.agent))
    } else {
        Arc::new(DisabledBackend)
    };
    let releaser: Arc<dyn IterationReleaser> = if with_release {
        Arc::from(releaser_from_config(&config.release, lookup)?)
    } else {
        Arc::new(DisabledReleaser)
    };
    let deploy: Option<Arc<dyn DeployHost>> = config.deploy.site_id.as_ref().map(|_| {
        Arc::new(NetlifyCliHost::new(".", Duration::from_secs(config.release.timeout_secs)))
            as Arc<dyn DeployHost>
    });
    let secrets: Vec<String> = lookup(&config.release.token_env)
        .filter(|token| !token.trim().is_empty())
        .into_iter()
        .collect();

    let collaborators = Collaborators {
        store,
        registry: WorkerRegistry::new(),
        backend,
        gates: Arc::new(CommandGateRunner::new(config.gates.clone())),
        releaser,
        deploy,
        secrets,
    };
    Ok(Orchestrator::new(config, collaborators))
}

fn read_plans(path: &Path) -> Result<PlansSnapshot> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse plans snapshot {}", path.display()))
}

/// Runs handled elsewhere or already finished exit OK.
fn outcome_code(outcome: ProcessOutcome) -> i32 {
    outcome.status().map_or(exit_codes::OK, status_code)
}

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded | RunStatus::Queued | RunStatus::Running => exit_codes::OK,
        RunStatus::WaitingCheckpoint => exit_codes::CHECKPOINT,
        RunStatus::Failed | RunStatus::Canceled => exit_codes::FAILED,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_checkpoint_action() {
        let cli = Cli::parse_from(["devrun", "checkpoint", "run-1", "2", "approve"]);
        assert!(matches!(
            cli.command,
            Command::Checkpoint {
                index: 2,
                action: CheckpointAction::Approve,
                ..
            }
        ));
        assert_eq!(cli.config, PathBuf::from("devrun.toml"));
    }

    #[test]
    fn parse_events_with_global_config() {
        let cli = Cli::parse_from([
            "devrun", "events", "run-1", "--after", "7", "--current", "--config", "alt.toml",
        ]);
        assert!(matches!(
            cli.command,
            Command::Events {
                after: 7,
                current: true,
                ..
            }
        ));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn rejects_unknown_checkpoint_action() {
        assert!(Cli::try_parse_from(["devrun", "checkpoint", "run-1", "1", "skip"]).is_err());
    }

    #[test]
    fn exit_codes_follow_run_status() {
        assert_eq!(status_code(RunStatus::Succeeded), exit_codes::OK);
        assert_eq!(status_code(RunStatus::WaitingCheckpoint), exit_codes::CHECKPOINT);
        assert_eq!(status_code(RunStatus::Canceled), exit_codes::FAILED);
        assert_eq!(outcome_code(ProcessOutcome::AlreadyActive), exit_codes::OK);
    }
}
