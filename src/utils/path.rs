//! Path normalization utilities.

use std::path::{Component, Path, PathBuf};

/// Expand ~ to the home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.display().to_string();
        }
    }
    path.to_string()
}

/// Normalize a path lexically.
///
/// Expands `~`, drops `.` components and resolves `..` against the preceding
/// component without touching the filesystem, so paths that only exist
/// inside a container are handled the same as host paths. `..` never climbs
/// above the root.
pub fn normalize_path(path: &str) -> PathBuf {
    let expanded = expand_home(path.trim());
    let mut out = PathBuf::new();

    for component in Path::new(&expanded).components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = out.as_os_str() == "/";
                if !at_root && !out.pop() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Check whether `path` equals `prefix` or lives underneath it.
///
/// Matching is per component: `/etc` covers `/etc/passwd` but not `/etcetera`.
pub fn is_within(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/tmp/./x"), PathBuf::from("/tmp/x"));
        assert_eq!(normalize_path("/tmp/a/../b"), PathBuf::from("/tmp/b"));
        assert_eq!(normalize_path("/tmp/../../etc/passwd"), PathBuf::from("/etc/passwd"));
        assert_eq!(normalize_path("/etc/"), PathBuf::from("/etc"));
        assert_eq!(normalize_path(""), PathBuf::from("."));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within(Path::new("/etc/passwd"), Path::new("/etc")));
        assert!(is_within(Path::new("/etc"), Path::new("/etc")));
        assert!(!is_within(Path::new("/etcetera"), Path::new("/etc")));
        assert!(!is_within(Path::new("/tmp/x"), Path::new("/etc")));
    }

    #[test]
    fn test_traversal_cannot_escape_prefix_check() {
        let p = normalize_path("/tmp/../etc/shadow");
        assert!(!is_within(&p, Path::new("/tmp")));
        assert!(is_within(&p, Path::new("/etc")));
    }

    #[test]
    fn test_expand_home_passthrough() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        assert_eq!(expand_home("relative"), "relative");
    }
}
