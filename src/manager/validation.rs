//! Shape checks for a sandbox config before anything is created.

use crate::error::{ConfigError, SandboxError};
use crate::manager::types::{NetworkMode, SandboxConfig};
use crate::utils::{is_within, normalize_path};

pub const MAX_CPU_CORES: f64 = 8.0;
pub const MIN_MEMORY_MB: u64 = 64;
pub const MAX_MEMORY_MB: u64 = 8192;

fn limit(field: &str, reason: impl Into<String>) -> SandboxError {
    ConfigError::InvalidResourceLimit {
        field: field.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Validate a sandbox config.
pub fn validate_config(config: &SandboxConfig) -> Result<(), SandboxError> {
    if config.id.is_empty()
        || !config
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ConfigError::ValidationError(format!(
            "sandbox id '{}' must be non-empty and use only letters, digits, '-', '_' or '.'",
            config.id
        ))
        .into());
    }
    if config.image.trim().is_empty() {
        return Err(ConfigError::ValidationError("image cannot be empty".into()).into());
    }

    let resources = &config.resources;
    if resources.cpu.is_nan() || resources.cpu <= 0.0 || resources.cpu > MAX_CPU_CORES {
        return Err(limit("cpu", "CPU limit must be between 0 and 8 cores"));
    }
    if resources.memory_mb < MIN_MEMORY_MB || resources.memory_mb > MAX_MEMORY_MB {
        return Err(limit("memoryMb", "Memory limit must be between 64 and 8192 MB"));
    }
    if resources.max_duration_sec == 0 {
        return Err(limit("maxDurationSec", "Maximum duration must be positive"));
    }
    if config.security.max_processes == 0 {
        return Err(limit("maxProcesses", "Process limit must be positive"));
    }

    if matches!(config.network_mode, NetworkMode::Bridge | NetworkMode::Host)
        && !(resources.network_allowed && config.security.allow_network)
    {
        return Err(ConfigError::ValidationError(format!(
            "network mode '{}' requires networkAllowed and allowNetwork",
            config.network_mode.as_runtime_arg()
        ))
        .into());
    }

    let blocked: Vec<_> = config
        .security
        .blocked_paths
        .iter()
        .map(|p| normalize_path(p))
        .collect();
    for volume in &config.volumes {
        let host = normalize_path(&volume.host_path);
        if let Some(prefix) = blocked.iter().find(|b| is_within(&host, b)) {
            return Err(ConfigError::InvalidPath {
                path: volume.host_path.clone(),
                reason: format!("volume host path is under blocked path {}", prefix.display()),
            }
            .into());
        }
        if !volume.container_path.starts_with('/') {
            return Err(ConfigError::InvalidPath {
                path: volume.container_path.clone(),
                reason: "container path must be absolute".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::types::{ResourceLimits, VolumeMount};

    fn base() -> SandboxConfig {
        SandboxConfig::new("sb-1", "alpine:3.19")
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&base()).is_ok());
    }

    #[test]
    fn test_cpu_range() {
        let config = base().with_resources(ResourceLimits::default().with_cpu(9.0));
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("CPU limit must be between 0 and 8 cores"));

        let config = base().with_resources(ResourceLimits::default().with_cpu(0.0));
        assert!(validate_config(&config).is_err());
        let config = base().with_resources(ResourceLimits::default().with_cpu(8.0));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_memory_range() {
        let config = base().with_resources(ResourceLimits::default().with_memory_mb(32));
        assert!(validate_config(&config).is_err());
        let config = base().with_resources(ResourceLimits::default().with_memory_mb(8192));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_network_mode_consistency() {
        let config = base().with_network_mode(NetworkMode::Bridge);
        assert!(validate_config(&config).is_err());

        let mut config = base()
            .with_network_mode(NetworkMode::Bridge)
            .with_resources(ResourceLimits::default().with_network(true));
        config.security.allow_network = true;
        assert!(validate_config(&config).is_ok());

        // isolated networks are attached later and always filtered
        let config = base().with_network_mode(NetworkMode::Isolated);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_volume_under_blocked_path() {
        let config = base().with_volume(VolumeMount::read_only("/etc/ssl", "/certs"));
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, SandboxError::Config(ConfigError::InvalidPath { .. })));

        let config = base().with_volume(VolumeMount::read_only("/etcetera", "/data"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_bad_id() {
        let mut config = base();
        config.id = "a/b".to_string();
        assert!(validate_config(&config).is_err());
    }
}
