//! Host capability detection.

use std::process::Stdio;

/// Check if running on Linux.
#[inline]
pub fn is_linux() -> bool {
    cfg!(target_os = "linux")
}

/// Check whether an external tool can be executed.
///
/// The tool is invoked with `probe_arg` (usually `--version`) and counts as
/// available when it exits successfully.
pub fn check_tool(binary: &str, probe_arg: &str) -> bool {
    std::process::Command::new(binary)
        .arg(probe_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check whether the process has the privileges packet-filter changes need.
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_is_unavailable() {
        assert!(!check_tool("sbx-definitely-not-a-real-binary", "--version"));
    }

    #[test]
    fn test_is_linux_matches_cfg() {
        assert_eq!(is_linux(), cfg!(target_os = "linux"));
    }
}
