//! Ref name validation following git-style conventions.
//!
//! A valid full ref name:
//! - Must be non-empty
//! - Must not contain whitespace, control characters, `~`, `^`, `:`, `?`,
//!   `*`, `[`, `\`
//! - Must not contain `..` (double dot) or `@{`, and must not be `@`
//! - Must not end with `.` or `/`, and must not start with `/`
//! - Must not contain consecutive slashes (`//`)
//! - Components between slashes must be non-empty, must not start with `.`,
//!   and must not end with `.lock`
//! - Must contain at least one `/`, unless it is a root ref such as `HEAD`
//!   or a pseudoref such as `FETCH_HEAD`

use crate::error::{RefError, Result};

/// Characters that are forbidden anywhere in a ref name.
const FORBIDDEN_CHARS: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\'];

/// Prefixes whose refs get a reflog on update without being asked.
const AUTO_LOGGED_PREFIXES: &[&str] = &["refs/heads/", "refs/remotes/", "refs/notes/"];

fn invalid(name: &str, reason: impl Into<String>) -> RefError {
    RefError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validate a full ref name (e.g. "refs/heads/main" or "HEAD").
///
/// # Examples
///
/// ```
/// use refscope_refs::names::check_refname_format;
///
/// assert!(check_refname_format("refs/heads/main").is_ok());
/// assert!(check_refname_format("HEAD").is_ok());
/// assert!(check_refname_format("main").is_err());
/// assert!(check_refname_format("refs/heads/bad..name").is_err());
/// ```
pub fn check_refname_format(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, "ref name must not be empty"));
    }

    if name == "@" {
        return Err(invalid(name, "'@' is not a valid ref name"));
    }

    if let Some(ch) = name.chars().find(|c| c.is_control() || FORBIDDEN_CHARS.contains(c)) {
        return Err(invalid(name, format!("contains forbidden character: {ch:?}")));
    }

    if name.contains("..") {
        return Err(invalid(name, "must not contain '..'"));
    }

    if name.contains("@{") {
        return Err(invalid(name, "must not contain '@{'"));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(invalid(name, "must not start or end with '/'"));
    }

    if name.ends_with('.') {
        return Err(invalid(name, "must not end with '.'"));
    }

    if name.contains("//") {
        return Err(invalid(name, "must not contain consecutive slashes '//'"));
    }

    for component in name.split('/') {
        if component.starts_with('.') {
            return Err(invalid(
                name,
                format!("component must not start with '.': {component:?}"),
            ));
        }
        if component.ends_with(".lock") {
            return Err(invalid(
                name,
                format!("component must not end with '.lock': {component:?}"),
            ));
        }
    }

    if !name.contains('/') && !is_pseudoref_syntax(name) {
        return Err(invalid(name, "one-level names must be root refs like HEAD"));
    }

    Ok(())
}

/// Returns `true` if `name` has pseudoref syntax: one level, only uppercase
/// ASCII letters and underscores (`HEAD`, `FETCH_HEAD`, `ORIG_HEAD`).
pub fn is_pseudoref_syntax(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
}

/// Validate a pseudoref name. `HEAD` itself is a regular ref and is rejected.
pub fn check_pseudoref_name(name: &str) -> Result<()> {
    if !is_pseudoref_syntax(name) {
        return Err(invalid(name, "not a pseudoref name"));
    }
    if name == "HEAD" {
        return Err(invalid(name, "HEAD is not a pseudoref"));
    }
    Ok(())
}

/// Validate the name of a ref written through the ref namespace
/// (transactions, symrefs, renames). One-level names other than `HEAD` belong
/// to pseudorefs and are rejected so a loose ref cannot shadow one.
pub fn check_ref_update_name(name: &str) -> Result<()> {
    check_refname_format(name)?;
    if name != "HEAD" && is_pseudoref_syntax(name) {
        return Err(invalid(name, "pseudorefs are written with write_pseudoref"));
    }
    Ok(())
}

/// Returns `true` if updates to `name` should create its reflog on demand.
pub fn should_autocreate_reflog(name: &str) -> bool {
    name == "HEAD" || AUTO_LOGGED_PREFIXES.iter().any(|p| name.starts_with(p))
}
