//! Quality gate execution against a run's sandbox.
//!
//! BUILD → UNIT → BDD form a dependency chain of allow-listed commands; a gate
//! whose prerequisite failed is recorded as failed, never as passed by
//! omission. REVIEW and SECURITY are static scans that always run.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::diagnostics::{actionable_line, gate_failure_summary};
use crate::core::types::{GateStatus, GateType};
use crate::io::config::GateConfig;
use crate::io::process::{command_from_argv, ensure_program_allowed, run_command_with_timeout};
use crate::io::scan::{ScanReport, review_scan, security_scan};

pub const REASON_EXECUTION_DISABLED: &str = "execution_disabled";
pub const REASON_WORKSPACE_NOT_PREPARED: &str = "workspace_not_prepared";
pub const REASON_SKIPPED: &str = "skipped_due_to_previous_failure";
pub const REASON_COMMAND_NOT_ALLOWED: &str = "command_not_allowed";
pub const REASON_INSTALL_FAILED: &str = "install_failed";
pub const REASON_COMMAND_FAILED: &str = "command_failed";
pub const REASON_TIMED_OUT: &str = "timed_out";
pub const REASON_FINDINGS: &str = "blocking_findings";

const SNIPPET_TAIL_CHARS: usize = 4_000;

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub gate_type: GateType,
    pub status: GateStatus,
    pub reason: Option<String>,
    /// Actionable root-cause line, when one was found.
    pub detail: Option<String>,
    pub report: Value,
    pub duration_ms: u64,
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }

    /// `BUILD (Cannot find module 'x')`-style summary for checkpoint messages.
    pub fn summary(&self) -> String {
        gate_failure_summary(self.gate_type, self.detail.as_deref(), self.reason.as_deref())
    }

    fn synthetic(gate_type: GateType, status: GateStatus, reason: &str) -> Self {
        Self {
            gate_type,
            status,
            reason: Some(reason.to_string()),
            detail: None,
            report: json!({ "reason": reason }),
            duration_ms: 0,
        }
    }
}

/// Runs every gate for one attempt, in [`GateType::ALL`] order.
pub trait GateRunner: Send + Sync {
    fn run_gates(&self, sandbox: &Path) -> Result<Vec<GateOutcome>>;
}

pub struct CommandGateRunner {
    config: GateConfig,
}

impl CommandGateRunner {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    fn command_for(&self, gate: GateType) -> Option<&[String]> {
        match gate {
            GateType::Build => Some(self.config.build_command.as_slice()),
            GateType::Unit => Some(self.config.unit_command.as_slice()),
            GateType::Bdd => Some(self.config.bdd_command.as_slice()),
            GateType::Review | GateType::Security => None,
        }
    }

    fn run_command_gate(&self, gate: GateType, argv: &[String], sandbox: &Path) -> GateOutcome {
        let started = Instant::now();
        let mut outcome = match self.run_allowed(argv, sandbox) {
            Ok(outcome) => outcome,
            Err(failure) => failure,
        };
        outcome.gate_type = gate;
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    /// Run `argv`; both arms carry a filled-in outcome (gate type set by caller).
    fn run_allowed(&self, argv: &[String], sandbox: &Path) -> Result<GateOutcome, GateOutcome> {
        if let Err(rejected) = ensure_program_allowed(argv, &self.config.allowed_programs) {
            warn!(program = %rejected.program, "gate command rejected");
            let mut outcome = GateOutcome::synthetic(GateType::Build, GateStatus::Failed, REASON_COMMAND_NOT_ALLOWED);
            outcome.detail = Some(rejected.to_string());
            return Err(outcome);
        }
        let env = [("CI".to_string(), "1".to_string())];
        let output = command_from_argv(argv, sandbox, &env).and_then(|cmd| {
            run_command_with_timeout(
                cmd,
                None,
                Duration::from_secs(self.config.timeout_secs),
                self.config.output_limit_bytes,
            )
        });
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                let mut outcome = GateOutcome::synthetic(GateType::Build, GateStatus::Failed, REASON_COMMAND_FAILED);
                outcome.detail = Some(format!("{err:#}"));
                return Err(outcome);
            }
        };

        let combined = output.combined_text();
        let reason = if output.success() {
            None
        } else if output.timed_out {
            Some(REASON_TIMED_OUT)
        } else {
            Some(REASON_COMMAND_FAILED)
        };
        let detail = reason.and_then(|_| actionable_line(&combined));
        let outcome = GateOutcome {
            gate_type: GateType::Build,
            status: if reason.is_none() { GateStatus::Passed } else { GateStatus::Failed },
            reason: reason.map(str::to_string),
            detail: detail.clone(),
            report: json!({
                "command": argv.join(" "),
                "exitCode": output.status.code(),
                "timedOut": output.timed_out,
                "reason": reason,
                "detail": detail,
                "snippet": tail(&combined, SNIPPET_TAIL_CHARS),
            }),
            duration_ms: 0,
        };
        if outcome.passed() { Ok(outcome) } else { Err(outcome) }
    }

    fn install_if_needed(&self, sandbox: &Path) -> Option<GateOutcome> {
        if sandbox.join(&self.config.dependency_dir).exists() {
            return None;
        }
        info!("installing dependencies");
        match self.run_allowed(&self.config.install_command, sandbox) {
            Ok(_) => None,
            Err(mut failure) => {
                let inner = failure.reason.take();
                failure.reason = Some(REASON_INSTALL_FAILED.to_string());
                if let Value::Object(map) = &mut failure.report {
                    map.insert("reason".to_string(), json!(REASON_INSTALL_FAILED));
                    map.insert("installReason".to_string(), json!(inner));
                }
                Some(failure)
            }
        }
    }
}

fn scan_outcome(gate: GateType, scan: Result<ScanReport>, started: Instant) -> GateOutcome {
    let duration_ms = started.elapsed().as_millis() as u64;
    match scan {
        Ok(report) => {
            let failed = report.failed();
            GateOutcome {
                gate_type: gate,
                status: if failed { GateStatus::Failed } else { GateStatus::Passed },
                reason: failed.then(|| REASON_FINDINGS.to_string()),
                detail: report.first_failure(),
                report: json!({
                    "filesScanned": report.files_scanned,
                    "findings": report.findings,
                }),
                duration_ms,
            }
        }
        Err(err) => GateOutcome {
            gate_type: gate,
            status: GateStatus::Failed,
            reason: Some(REASON_COMMAND_FAILED.to_string()),
            detail: Some(format!("{err:#}")),
            report: json!({ "error": format!("{err:#}") }),
            duration_ms,
        },
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(sandbox = %sandbox.display()))]
    fn run_gates(&self, sandbox: &Path) -> Result<Vec<GateOutcome>> {
        let mut outcomes: Vec<GateOutcome> = Vec::with_capacity(GateType::ALL.len());

        if !self.config.execution_enabled {
            for gate in GateType::ALL {
                let status = match gate {
                    GateType::Review | GateType::Security => GateStatus::Passed,
                    _ => GateStatus::Failed,
                };
                outcomes.push(GateOutcome::synthetic(gate, status, REASON_EXECUTION_DISABLED));
            }
            return Ok(outcomes);
        }

        let prepared = sandbox.join(&self.config.manifest).is_file();
        let install_failure = if prepared { self.install_if_needed(sandbox) } else { None };

        for gate in GateType::ALL {
            let started = Instant::now();
            let outcome = match self.command_for(gate) {
                None => {
                    let scan = match gate {
                        GateType::Review => review_scan(sandbox),
                        _ => security_scan(sandbox),
                    };
                    scan_outcome(gate, scan, started)
                }
                Some(_) if !prepared => {
                    GateOutcome::synthetic(gate, GateStatus::Failed, REASON_WORKSPACE_NOT_PREPARED)
                }
                Some(argv) => {
                    let prerequisite_failed = gate.depends_on().is_some_and(|dep| {
                        outcomes.iter().any(|o| o.gate_type == dep && !o.passed())
                    });
                    if prerequisite_failed {
                        GateOutcome::synthetic(gate, GateStatus::Failed, REASON_SKIPPED)
                    } else if let (GateType::Build, Some(failure)) = (gate, &install_failure) {
                        let mut failure = failure.clone();
                        failure.gate_type = gate;
                        failure
                    } else {
                        self.run_command_gate(gate, argv, sandbox)
                    }
                }
            };
            info!(gate = %gate, passed = outcome.passed(), reason = ?outcome.reason, "gate finished");
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
