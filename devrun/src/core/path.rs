//! Sanitizing agent-supplied file paths before they touch the sandbox.

use thiserror::Error;

/// Error code surfaced to callers and persisted in task error messages.
pub const INVALID_WORKSPACE_PATH: &str = "INVALID_WORKSPACE_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("INVALID_WORKSPACE_PATH: {reason} ({path:?})")]
pub struct InvalidWorkspacePath {
    pub path: String,
    pub reason: &'static str,
}

impl InvalidWorkspacePath {
    fn new(path: &str, reason: &'static str) -> Self {
        Self {
            path: path.to_string(),
            reason,
        }
    }
}

/// Normalize an agent-supplied path into a `/`-separated relative path.
///
/// Rejects empty paths, NUL bytes, absolute paths (leading `/` or `\`, drive
/// letters) and any `..` component. `.` and empty components are dropped.
pub fn sanitize_workspace_path(raw: &str) -> Result<String, InvalidWorkspacePath> {
    if raw.contains('\0') {
        return Err(InvalidWorkspacePath::new(raw, "contains NUL byte"));
    }
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(InvalidWorkspacePath::new(raw, "empty path"));
    }
    if unified.starts_with('/') {
        return Err(InvalidWorkspacePath::new(raw, "absolute path"));
    }
    if has_drive_prefix(&unified) {
        return Err(InvalidWorkspacePath::new(raw, "absolute path"));
    }

    let mut parts = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(InvalidWorkspacePath::new(raw, "parent traversal")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(InvalidWorkspacePath::new(raw, "empty path"));
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Lowercase ASCII slug (`a-z0-9` joined by `-`), capped at 40 chars.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "iteration".to_string()
    } else {
        slug.to_string()
    }
}

/// Release branch for one iteration: `devrun/<run>/it-<index>-<slug>`.
pub fn iteration_branch_name(run_id: &str, index: u32, name: &str) -> String {
    format!("devrun/{run_id}/it-{index}-{}", slugify(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_relative_paths() {
        assert_eq!(
            sanitize_workspace_path("./app//page.tsx").expect("ok"),
            "app/page.tsx"
        );
        assert_eq!(
            sanitize_workspace_path("src\\lib\\util.ts").expect("ok"),
            "src/lib/util.ts"
        );
        assert_eq!(
            sanitize_workspace_path("features/login.feature").expect("ok"),
            "features/login.feature"
        );
    }

    #[test]
    fn rejects_traversal_absolute_and_nul() {
        for bad in [
            "../etc/passwd",
            "app/../../x",
            "/etc/passwd",
            "\\windows\\system32",
            "C:/temp/file",
            "app/\0page.tsx",
            "",
            "./.",
        ] {
            let err = sanitize_workspace_path(bad).expect_err(bad);
            assert!(err.to_string().starts_with(INVALID_WORKSPACE_PATH), "{bad}");
        }
    }

    #[test]
    fn dotted_names_are_not_traversal() {
        assert_eq!(
            sanitize_workspace_path("app/..hidden/file..ts").expect("ok"),
            "app/..hidden/file..ts"
        );
    }

    #[test]
    fn slugs_and_branch_names() {
        assert_eq!(slugify("User Login & Signup!"), "user-login-signup");
        assert_eq!(slugify("   "), "iteration");
        assert_eq!(
            iteration_branch_name("run-1", 2, "Checkout Flow"),
            "devrun/run-1/it-2-checkout-flow"
        );
    }
}
