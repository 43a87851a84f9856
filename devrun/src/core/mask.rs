//! Secret masking for anything that may be persisted or logged.

use std::sync::LazyLock;

use regex::Regex;

pub const MASK: &str = "***";

static ACCESS_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"x-access-token:[^@\s]+@").expect("access token regex should compile")
});

static URL_CREDENTIALS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*://)(?P<user>[^/@\s:]+):[^/@\s]+@")
        .expect("url credentials regex should compile")
});

static GITHUB_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:gh[pousr]_[A-Za-z0-9]{20,}|github_pat_[A-Za-z0-9_]{20,})\b")
        .expect("github token regex should compile")
});

/// Replace credentials in `text` with `***`.
///
/// Masks `x-access-token:<token>@`, `user:password@` URL credentials, GitHub
/// token shapes, and every non-empty entry of `secrets` verbatim.
pub fn mask_secret_in_text<S: AsRef<str>>(text: &str, secrets: &[S]) -> String {
    let mut masked = text.to_string();

    // Longest first so a secret containing another secret is removed whole.
    let mut literal: Vec<&str> = secrets
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.trim().is_empty())
        .collect();
    literal.sort_by_key(|s| std::cmp::Reverse(s.len()));
    for secret in literal {
        masked = masked.replace(secret, MASK);
    }

    masked = ACCESS_TOKEN_RE
        .replace_all(&masked, format!("x-access-token:{MASK}@").as_str())
        .into_owned();
    masked = URL_CREDENTIALS_RE
        .replace_all(&masked, |caps: &regex::Captures<'_>| {
            let scheme = &caps["scheme"];
            // Keep the well-known token user so masked clone URLs stay readable.
            if &caps["user"] == "x-access-token" {
                format!("{scheme}x-access-token:{MASK}@")
            } else {
                format!("{scheme}{MASK}@")
            }
        })
        .into_owned();
    GITHUB_TOKEN_RE.replace_all(&masked, MASK).into_owned()
}
