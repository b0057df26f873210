//! Configuration schema for the engine settings file.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};
use crate::utils::expand_home;

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Docker-compatible binary used for container and network commands.
    pub binary: String,
    /// Image used when a request does not name one.
    pub default_image: String,
    /// How long `execute_in_sandbox` waits for a sandbox to reach `running`.
    pub readiness_timeout_secs: u64,
    /// Default wall-clock budget for a command executed in a sandbox.
    pub default_exec_timeout_secs: u64,
    /// Grace period passed to `stop` before the runtime kills the container.
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            default_image: "alpine:3.19".to_string(),
            readiness_timeout_secs: 30,
            default_exec_timeout_secs: 300,
            stop_timeout_secs: 5,
        }
    }
}

/// System capacity the resource ledger admits against.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesConfig {
    /// Total CPU cores (default: detected parallelism).
    pub total_cpu: Option<f64>,
    /// Total memory in MB (default: 16384).
    pub total_memory_mb: Option<u64>,
}

/// Default total memory when none is configured.
pub const DEFAULT_TOTAL_MEMORY_MB: u64 = 16384;

impl ResourcesConfig {
    /// Effective CPU capacity.
    pub fn cpu_capacity(&self) -> f64 {
        self.total_cpu.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(4.0)
        })
    }

    /// Effective memory capacity in MB.
    pub fn memory_capacity_mb(&self) -> u64 {
        self.total_memory_mb.unwrap_or(DEFAULT_TOTAL_MEMORY_MB)
    }
}

/// Background poll intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub resource_poll_secs: u64,
    pub compliance_poll_secs: u64,
    pub network_stats_poll_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            resource_poll_secs: 5,
            compliance_poll_secs: 30,
            network_stats_poll_secs: 30,
        }
    }
}

impl MonitoringConfig {
    pub fn resource_poll_interval(&self) -> Duration {
        Duration::from_secs(self.resource_poll_secs)
    }

    pub fn compliance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.compliance_poll_secs)
    }

    pub fn network_stats_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network_stats_poll_secs)
    }
}

/// Network isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    /// Packet filter binary.
    pub filter_binary: String,
    /// Private /16 pool that per-sandbox /24 subnets are carved from.
    pub subnet_pool: String,
    /// Prefix for per-network filter chains.
    pub chain_prefix: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            filter_binary: "iptables".to_string(),
            subnet_pool: "10.200.0.0/16".to_string(),
            chain_prefix: "SBX-".to_string(),
        }
    }
}

impl NetworkSettings {
    /// Parse the subnet pool into its first two octets.
    pub fn pool_prefix(&self) -> Result<(u8, u8), SandboxError> {
        let (addr, bits) = self.subnet_pool.split_once('/').ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "subnet pool '{}' must be in CIDR form",
                self.subnet_pool
            ))
        })?;
        if bits != "16" {
            return Err(ConfigError::ValidationError(format!(
                "subnet pool '{}' must be a /16",
                self.subnet_pool
            ))
            .into());
        }
        let ip: Ipv4Addr = addr.parse().map_err(|_| {
            ConfigError::ValidationError(format!("invalid subnet pool address '{}'", addr))
        })?;
        let octets = ip.octets();
        Ok((octets[0], octets[1]))
    }
}

/// Security manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySettings {
    /// Root directory for persisted profiles and audit events.
    pub policy_dir: Option<PathBuf>,
    /// Profile bound when a request does not name one.
    pub default_profile: String,
    /// Size of the in-memory audit ring.
    pub audit_capacity: usize,
    /// Number of recent events the compliance score is computed over.
    pub compliance_window: usize,
    /// Scores below this raise a warning event.
    pub compliance_threshold: f64,
    /// More violations than this in the window trigger isolation.
    pub isolation_violation_threshold: usize,
    /// Whether the engine isolates a sandbox when isolation is triggered.
    pub auto_isolate: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            policy_dir: None,
            default_profile: "medium-risk".to_string(),
            audit_capacity: 1000,
            compliance_window: 50,
            compliance_threshold: 70.0,
            isolation_violation_threshold: 10,
            auto_isolate: true,
        }
    }
}

impl SecuritySettings {
    /// Effective policy directory, with `~` expanded.
    pub fn policy_dir(&self) -> PathBuf {
        self.policy_dir
            .as_ref()
            .map(|dir| PathBuf::from(expand_home(&dir.to_string_lossy())))
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("sbx")
                    .join("policies")
            })
    }
}

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub security: SecuritySettings,
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.runtime.binary.trim().is_empty() {
            return Err(ConfigError::ValidationError("runtime binary cannot be empty".into()).into());
        }
        if self.runtime.readiness_timeout_secs == 0 || self.runtime.default_exec_timeout_secs == 0 {
            return Err(ConfigError::ValidationError("runtime timeouts must be positive".into()).into());
        }

        if let Some(cpu) = self.resources.total_cpu {
            if cpu.is_nan() || cpu <= 0.0 {
                return Err(ConfigError::ValidationError("totalCpu must be positive".into()).into());
            }
        }
        if self.resources.total_memory_mb == Some(0) {
            return Err(ConfigError::ValidationError("totalMemoryMb must be positive".into()).into());
        }

        let m = &self.monitoring;
        if m.resource_poll_secs == 0 || m.compliance_poll_secs == 0 || m.network_stats_poll_secs == 0 {
            return Err(ConfigError::ValidationError("poll intervals must be positive".into()).into());
        }

        self.network.pool_prefix()?;

        let s = &self.security;
        if s.audit_capacity == 0 || s.compliance_window == 0 {
            return Err(ConfigError::ValidationError(
                "auditCapacity and complianceWindow must be positive".into(),
            )
            .into());
        }
        if !(0.0..=100.0).contains(&s.compliance_threshold) {
            return Err(ConfigError::ValidationError(
                "complianceThreshold must be between 0 and 100".into(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitoring.resource_poll_secs, 5);
        assert_eq!(config.security.compliance_window, 50);
    }

    #[test]
    fn test_pool_prefix() {
        let settings = NetworkSettings::default();
        assert_eq!(settings.pool_prefix().unwrap(), (10, 200));

        let bad = NetworkSettings {
            subnet_pool: "10.200.0.0/24".to_string(),
            ..Default::default()
        };
        assert!(bad.pool_prefix().is_err());

        let garbage = NetworkSettings {
            subnet_pool: "nope".to_string(),
            ..Default::default()
        };
        assert!(garbage.pool_prefix().is_err());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let mut config = EngineConfig::default();
        config.monitoring.compliance_poll_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_capacity_defaults() {
        let resources = ResourcesConfig::default();
        assert!(resources.cpu_capacity() > 0.0);
        assert_eq!(resources.memory_capacity_mb(), DEFAULT_TOTAL_MEMORY_MB);
    }
}
