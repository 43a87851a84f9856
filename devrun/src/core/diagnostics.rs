//! Turning noisy command output into short, actionable failure causes.
//!
//! Build and test tools print banners, script echoes and progress lines before
//! the line that actually explains a failure. Checkpoint messages and UI
//! summaries need that one line, so we rank candidate lines by pattern.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::GateType;

const MAX_SUMMARY_CHARS: usize = 240;

/// Patterns ordered from most to least actionable.
static ACTIONABLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"Cannot find module",
        r"Failed to resolve import",
        r"Module not found",
        r"error TS\d+",
        r"SyntaxError",
        r"TypeError",
        r"ReferenceError",
        r"Type error",
        r"AssertionError|expected .+ to ",
        r"\bError:",
        r"(?i)\berror\b",
        r"(?i)\bfail(ed|ure)?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("diagnostic pattern should compile"))
    .collect()
});

static NOISE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^>\s",
        r"^npm (WARN|notice|ERR! (code|path|errno|command|A complete log))",
        r"^npm ERR!\s*$",
        r"^\$ ",
        r"^(RUN|DEV)\s+v\d",
        r"^vite v\d",
        r"^▲ Next\.js",
        r"^\s*at\s",
        r"^-+$",
        r"^Test Files\s",
        r"^\s*Tests\s+\d",
        r"^\s*Duration\s",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("noise pattern should compile"))
    .collect()
});

/// Pick the most actionable line from command output.
///
/// Falls back to the last non-noise line when no pattern matches.
pub fn actionable_line(output: &str) -> Option<String> {
    let candidates: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !is_noise(line))
        .collect();

    for pattern in ACTIONABLE_PATTERNS.iter() {
        if let Some(line) = candidates.iter().find(|line| pattern.is_match(line)) {
            return Some(truncate(line));
        }
    }
    candidates.last().map(|line| truncate(line))
}

fn is_noise(line: &str) -> bool {
    NOISE_PATTERNS.iter().any(|pattern| pattern.is_match(line))
}

fn truncate(line: &str) -> String {
    if line.chars().count() <= MAX_SUMMARY_CHARS {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_SUMMARY_CHARS).collect();
    out.push('…');
    out
}

/// Compact per-gate cause, e.g. `BUILD (Error: <Html> should not be imported ...)`.
pub fn gate_failure_summary(gate: GateType, detail: Option<&str>, reason: Option<&str>) -> String {
    let cause = detail
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .or(reason)
        .unwrap_or("failed");
    format!("{} ({})", gate.as_str(), cause)
}

/// Join gate summaries into a checkpoint message.
pub fn checkpoint_summary(attempts: u32, gate_summaries: &[String]) -> String {
    if gate_summaries.is_empty() {
        return format!("Iteration failed after {attempts} attempt(s)");
    }
    format!(
        "Quality gates failed after {attempts} attempt(s): {}",
        gate_summaries.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_root_cause_over_banners() {
        let output = "\
> app@0.1.0 build
> next build

▲ Next.js 14.2.3
   Creating an optimized production build ...
Failed to compile.
./app/page.tsx
Module not found: Can't resolve '@/components/Hero'
npm ERR! code 1
";
        assert_eq!(
            actionable_line(output).as_deref(),
            Some("Module not found: Can't resolve '@/components/Hero'")
        );
    }

    #[test]
    fn cannot_find_module_beats_generic_error() {
        let output = "Error: Command failed\nError: Cannot find module 'zod'\n";
        assert_eq!(
            actionable_line(output).as_deref(),
            Some("Error: Cannot find module 'zod'")
        );
    }

    #[test]
    fn falls_back_to_last_meaningful_line() {
        let output = "> script\nsomething odd happened\n\n";
        assert_eq!(
            actionable_line(output).as_deref(),
            Some("something odd happened")
        );
        assert_eq!(actionable_line("> only noise\n"), None);
    }

    #[test]
    fn gate_summary_uses_detail_then_reason() {
        assert_eq!(
            gate_failure_summary(
                GateType::Build,
                Some("Error: <Html> should not be imported outside of pages/_document."),
                None
            ),
            "BUILD (Error: <Html> should not be imported outside of pages/_document.)"
        );
        assert_eq!(
            gate_failure_summary(GateType::Unit, None, Some("skipped_due_to_previous_failure")),
            "UNIT (skipped_due_to_previous_failure)"
        );
    }

    #[test]
    fn checkpoint_summary_names_attempts() {
        let msg = checkpoint_summary(3, &["BUILD (boom)".to_string()]);
        assert_eq!(msg, "Quality gates failed after 3 attempt(s): BUILD (boom)");
    }
}
