//! Mapping from requested operations to the capability they exercise.

use serde::{Deserialize, Serialize};

/// A capability a profile can grant or withhold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FileRead,
    FileWrite,
    FileDelete,
    ProcessSpawn,
    NetworkAccess,
    NetworkListen,
    SystemInfo,
    EnvAccess,
    PackageInstall,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::FileRead,
        Capability::FileWrite,
        Capability::FileDelete,
        Capability::ProcessSpawn,
        Capability::NetworkAccess,
        Capability::NetworkListen,
        Capability::SystemInfo,
        Capability::EnvAccess,
        Capability::PackageInstall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FileRead => "file_read",
            Capability::FileWrite => "file_write",
            Capability::FileDelete => "file_delete",
            Capability::ProcessSpawn => "process_spawn",
            Capability::NetworkAccess => "network_access",
            Capability::NetworkListen => "network_listen",
            Capability::SystemInfo => "system_info",
            Capability::EnvAccess => "env_access",
            Capability::PackageInstall => "package_install",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation names and the capability each one needs.
const OPERATIONS: &[(&str, Capability)] = &[
    ("read", Capability::FileRead),
    ("read_file", Capability::FileRead),
    ("open", Capability::FileRead),
    ("list_dir", Capability::FileRead),
    ("write", Capability::FileWrite),
    ("write_file", Capability::FileWrite),
    ("create_file", Capability::FileWrite),
    ("append", Capability::FileWrite),
    ("mkdir", Capability::FileWrite),
    ("delete", Capability::FileDelete),
    ("delete_file", Capability::FileDelete),
    ("remove", Capability::FileDelete),
    ("unlink", Capability::FileDelete),
    ("exec", Capability::ProcessSpawn),
    ("execute", Capability::ProcessSpawn),
    ("spawn", Capability::ProcessSpawn),
    ("run", Capability::ProcessSpawn),
    ("shell", Capability::ProcessSpawn),
    ("connect", Capability::NetworkAccess),
    ("http_request", Capability::NetworkAccess),
    ("fetch", Capability::NetworkAccess),
    ("download", Capability::NetworkAccess),
    ("dns_lookup", Capability::NetworkAccess),
    ("listen", Capability::NetworkListen),
    ("bind", Capability::NetworkListen),
    ("serve", Capability::NetworkListen),
    ("system_info", Capability::SystemInfo),
    ("uname", Capability::SystemInfo),
    ("list_processes", Capability::SystemInfo),
    ("getenv", Capability::EnvAccess),
    ("read_env", Capability::EnvAccess),
    ("install", Capability::PackageInstall),
    ("pip_install", Capability::PackageInstall),
    ("npm_install", Capability::PackageInstall),
];

/// Capability needed by `operation`, if the operation is known.
///
/// Lookup is case-insensitive; `-` and spaces are treated as `_`. A capability
/// name is accepted as its own operation.
pub fn capability_for(operation: &str) -> Option<Capability> {
    let key: String = operation
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    Capability::parse(&key).or_else(|| {
        OPERATIONS
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, cap)| *cap)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_operations() {
        assert_eq!(capability_for("write_file"), Some(Capability::FileWrite));
        assert_eq!(capability_for("HTTP-Request"), Some(Capability::NetworkAccess));
        assert_eq!(capability_for("network_access"), Some(Capability::NetworkAccess));
        assert_eq!(capability_for("pip install"), Some(Capability::PackageInstall));
    }

    #[test]
    fn test_unknown_operation() {
        assert_eq!(capability_for("teleport"), None);
        // no substring matching
        assert_eq!(capability_for("overwrite_everything"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
    }
}
