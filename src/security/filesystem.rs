//! Path checks against a profile's allowed and blocked prefixes.

use std::path::{Path, PathBuf};

use crate::utils::{is_within, normalize_path};

/// Outcome of checking one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allowed,
    /// Under a blocked prefix; carries the prefix.
    Blocked(String),
    /// Under no allowed prefix.
    NotAllowed,
}

/// Check if a path is within any of the allowed paths.
pub fn is_path_allowed(path: &Path, allowed_paths: &[PathBuf]) -> bool {
    allowed_paths.iter().any(|allowed| is_within(path, allowed))
}

/// The blocked prefix covering `path`, if any.
pub fn denied_by<'a>(path: &Path, denied_paths: &'a [PathBuf]) -> Option<&'a PathBuf> {
    denied_paths.iter().find(|denied| is_within(path, denied))
}

/// Check `path` against prefix lists. Blocked prefixes win over allowed ones,
/// and a path under neither list is not allowed.
pub fn check_path(path: &str, allowed: &[String], blocked: &[String]) -> PathDecision {
    let target = normalize_path(path);
    let blocked: Vec<PathBuf> = blocked.iter().map(|p| normalize_path(p)).collect();
    let allowed: Vec<PathBuf> = allowed.iter().map(|p| normalize_path(p)).collect();

    if let Some(prefix) = denied_by(&target, &blocked) {
        return PathDecision::Blocked(prefix.display().to_string());
    }
    if is_path_allowed(&target, &allowed) {
        PathDecision::Allowed
    } else {
        PathDecision::NotAllowed
    }
}
