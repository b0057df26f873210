//! Configuration loader from ~/.sbx-settings.json.

use std::path::{Path, PathBuf};

use crate::config::schema::EngineConfig;
use crate::error::{ConfigError, SandboxError};

/// Default settings file name.
const DEFAULT_SETTINGS_FILE: &str = ".sbx-settings.json";

/// Get the default settings file path.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<EngineConfig, SandboxError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError(format!("Failed to read config file: {}", e))
    })?;

    let mut config = parse_config(&content)?;
    if let Some(base) = path.parent() {
        anchor_policy_dir(&mut config, base);
    }
    check_policy_dir(&config)?;
    Ok(config)
}

/// A relative `security.policyDir` is taken relative to the settings file,
/// not to whatever directory the engine happens to run from.
fn anchor_policy_dir(config: &mut EngineConfig, base: &Path) {
    if let Some(ref dir) = config.security.policy_dir {
        if dir.is_relative() && !dir.starts_with("~") {
            config.security.policy_dir = Some(base.join(dir));
        }
    }
}

/// The policy store creates its directory on first write, so only an
/// existing non-directory at that path is an error.
fn check_policy_dir(config: &EngineConfig) -> Result<(), SandboxError> {
    let dir = config.security.policy_dir();
    if dir.exists() && !dir.is_dir() {
        return Err(ConfigError::ValidationError(format!(
            "policyDir {} exists and is not a directory",
            dir.display()
        ))
        .into());
    }
    Ok(())
}

/// Load configuration from the default path, or return default config if not found.
pub fn load_default_config() -> Result<EngineConfig, SandboxError> {
    match default_settings_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(EngineConfig::default()),
    }
}

/// Parse configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<EngineConfig, SandboxError> {
    let config: EngineConfig = serde_json::from_str(json).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse config JSON: {}", e))
    })?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.runtime.binary, "docker");
        assert_eq!(config.network.filter_binary, "iptables");
        assert!(config.security.auto_isolate);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "runtime": {
                "binary": "podman",
                "defaultImage": "debian:bookworm-slim",
                "readinessTimeoutSecs": 10
            },
            "resources": {
                "totalCpu": 16,
                "totalMemoryMb": 32768
            },
            "monitoring": {
                "resourcePollSecs": 2
            },
            "network": {
                "subnetPool": "10.77.0.0/16",
                "chainPrefix": "TEST-"
            },
            "security": {
                "policyDir": "/var/lib/sbx",
                "defaultProfile": "high-risk",
                "autoIsolate": false
            }
        }"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.runtime.binary, "podman");
        assert_eq!(config.runtime.readiness_timeout_secs, 10);
        // Unspecified fields inside a section keep their defaults.
        assert_eq!(config.runtime.stop_timeout_secs, 5);
        assert_eq!(config.resources.cpu_capacity(), 16.0);
        assert_eq!(config.resources.memory_capacity_mb(), 32768);
        assert_eq!(config.monitoring.resource_poll_secs, 2);
        assert_eq!(config.monitoring.compliance_poll_secs, 30);
        assert_eq!(config.network.pool_prefix().unwrap(), (10, 77));
        assert_eq!(config.security.default_profile, "high-risk");
        assert!(!config.security.auto_isolate);
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let json = r#"{"network": {"subnetPool": "10.0.0.0/8"}}"#;
        assert!(parse_config(json).is_err());
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(parse_config("not json").is_err());
        assert!(parse_config("{\"runtime\": }").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config(Path::new("/definitely/not/here.json"));
        assert!(matches!(
            result,
            Err(SandboxError::Config(ConfigError::FileNotFound(_)))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"resources": {"totalMemoryMb": 4096}}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.resources.memory_capacity_mb(), 4096);
    }

    #[test]
    fn test_relative_policy_dir_follows_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"security": {"policyDir": "policies"}}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.security.policy_dir(), dir.path().join("policies"));
    }

    #[test]
    fn test_policy_dir_must_not_be_a_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policies"), "").unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"security": {"policyDir": "policies"}}"#).unwrap();

        assert!(matches!(
            load_config(&path),
            Err(SandboxError::Config(ConfigError::ValidationError(_)))
        ));
    }
}
