//! Line-based static scans backing the REVIEW and SECURITY gates.
//!
//! A scan walks the sandbox (skipping dependency, build and VCS directories)
//! and matches each source line against named checks. A scan fails iff it has
//! at least one `fail`-severity finding.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::mask::{MASK, mask_secret_in_text};
use crate::io::workspace::{relative_path, source_files};

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];
const MAX_SNIPPET_CHARS: usize = 160;
/// Checks whose match is itself a secret; their matches never reach a snippet.
const CREDENTIAL_CHECKS: &[&str] = &["hardcoded_credential", "provider_token"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fail,
    Warn,
}

struct Check {
    id: &'static str,
    severity: Severity,
    pattern: Regex,
}

fn checks(specs: &[(&'static str, Severity, &str)]) -> Vec<Check> {
    specs
        .iter()
        .map(|(id, severity, pattern)| Check {
            id: *id,
            severity: *severity,
            pattern: Regex::new(pattern).expect("scan pattern should compile"),
        })
        .collect()
}

static REVIEW_CHECKS: LazyLock<Vec<Check>> = LazyLock::new(|| {
    checks(&[
        ("dynamic_eval", Severity::Fail, r"\beval\s*\(|\bnew\s+Function\s*\("),
        ("unsafe_html", Severity::Fail, r"dangerouslySetInnerHTML"),
        ("destructive_shell", Severity::Fail, r"rm\s+-rf\s+/(\s|$|\x22|')"),
        ("debug_logging", Severity::Warn, r"\bconsole\.log\s*\("),
        ("type_escape", Severity::Warn, r"@ts-ignore|@ts-nocheck|\bas\s+any\b|:\s*any\b"),
    ])
});

static SECURITY_CHECKS: LazyLock<Vec<Check>> = LazyLock::new(|| {
    checks(&[
        (
            "hardcoded_credential",
            Severity::Fail,
            r#"(?i)(api[_-]?key|secret|password|passwd|token)\s*[:=]\s*["'][A-Za-z0-9_\-/+=]{12,}["']"#,
        ),
        ("provider_token", Severity::Fail, r"\b(ghp_[A-Za-z0-9]{20,}|github_pat_[A-Za-z0-9_]{20,}|sk-[A-Za-z0-9]{20,}|AKIA[0-9A-Z]{16})\b"),
        ("dom_xss_sink", Severity::Fail, r"\.innerHTML\s*=|\bdocument\.write\s*\("),
        ("subprocess_spawn", Severity::Warn, r#"child_process|\bexecSync\s*\(|\bspawn\s*\("#),
        (
            "sql_interpolation",
            Severity::Warn,
            r"(?i)`\s*(select|insert|update|delete)\b[^`]*\$\{",
        ),
    ])
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub check: String,
    pub severity: Severity,
    pub file: String,
    pub line: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub files_scanned: usize,
    pub findings: Vec<Finding>,
}

impl ScanReport {
    pub fn failed(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Fail)
    }

    /// First fail-severity finding rendered as `check at file:line`.
    pub fn first_failure(&self) -> Option<String> {
        self.findings
            .iter()
            .find(|f| f.severity == Severity::Fail)
            .map(|f| format!("{} at {}:{}", f.check, f.file, f.line))
    }
}

#[instrument(skip_all, fields(root = %root.display()))]
pub fn review_scan(root: &Path) -> Result<ScanReport> {
    scan_lines(root, &REVIEW_CHECKS)
}

#[instrument(skip_all, fields(root = %root.display()))]
pub fn security_scan(root: &Path) -> Result<ScanReport> {
    let mut report = scan_lines(root, &SECURITY_CHECKS)?;
    for entry in source_files(root) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_committed_env_file(&name) {
            report.findings.push(Finding {
                check: "env_file".to_string(),
                severity: Severity::Fail,
                file: relative_path(root, entry.path())?,
                line: 0,
                snippet: String::new(),
            });
        }
    }
    Ok(report)
}

fn is_committed_env_file(name: &str) -> bool {
    name.starts_with(".env") && name != ".env.example"
}

fn scan_lines(root: &Path, checks: &[Check]) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    for entry in source_files(root) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_source = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
        if !is_source {
            continue;
        }
        let Ok(contents) = fs::read_to_string(entry.path()) else {
            debug!(path = %entry.path().display(), "skipping unreadable source file");
            continue;
        };
        report.files_scanned += 1;
        let file = relative_path(root, entry.path())?;
        for (idx, line) in contents.lines().enumerate() {
            for check in checks {
                if check.pattern.is_match(line) {
                    report.findings.push(Finding {
                        check: check.id.to_string(),
                        severity: check.severity,
                        file: file.clone(),
                        line: idx + 1,
                        snippet: redacted_snippet(line),
                    });
                }
            }
        }
    }
    report.findings.sort_by(|a, b| {
        (a.file.as_str(), a.line, a.check.as_str()).cmp(&(b.file.as_str(), b.line, b.check.as_str()))
    });
    Ok(report)
}

/// Trimmed, truncated line with every credential-shaped match replaced by `***`.
fn redacted_snippet(line: &str) -> String {
    let mut redacted = line.trim().to_string();
    for check in SECURITY_CHECKS
        .iter()
        .filter(|check| CREDENTIAL_CHECKS.contains(&check.id))
    {
        redacted = check.pattern.replace_all(&redacted, MASK).into_owned();
    }
    mask_secret_in_text::<&str>(&redacted, &[])
        .chars()
        .take(MAX_SNIPPET_CHARS)
        .collect()
}
