//! Security profiles: capability allow-lists plus path, network and resource policy.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};
use crate::security::audit::Severity;
use crate::security::capability::Capability;

/// Upper bounds a profile may declare.
pub const MAX_PROFILE_CPU_CORES: f64 = 8.0;
pub const MAX_PROFILE_MEMORY_MB: u64 = 8192;
pub const MAX_PROFILE_EXECUTION_SECS: u64 = 3600;
pub const MAX_PROFILE_CONNECTIONS: u32 = 100;
pub const MAX_PROFILE_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// Ids of the profiles every manager starts with.
pub const BUILTIN_PROFILES: &[&str] = &["low-risk", "medium-risk", "high-risk"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Whether a capability may be used, and whether uses are audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityGrant {
    pub name: String,
    pub allowed: bool,
    #[serde(default)]
    pub restrictions: Vec<String>,
    #[serde(default)]
    pub audit: bool,
}

impl CapabilityGrant {
    pub fn allow(capability: Capability) -> Self {
        Self {
            name: capability.as_str().to_string(),
            allowed: true,
            restrictions: Vec::new(),
            audit: false,
        }
    }

    pub fn deny(capability: Capability) -> Self {
        Self {
            allowed: false,
            audit: true,
            ..Self::allow(capability)
        }
    }

    #[must_use]
    pub fn audited(mut self) -> Self {
        self.audit = true;
        self
    }

    #[must_use]
    pub fn restricted(mut self, restriction: impl Into<String>) -> Self {
        self.restrictions.push(restriction.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintType {
    Filesystem,
    Network,
    Process,
    Memory,
    Time,
}

/// Numeric ceiling or on/off switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConstraintLimit {
    Flag(bool),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConstraint {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub constraint_type: ConstraintType,
    pub limit: ConstraintLimit,
    #[serde(default = "default_true")]
    pub enforce: bool,
    pub severity: Severity,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSecurityPolicy {
    pub allow_external: bool,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
    pub max_connections: u32,
    pub connection_timeout_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSecurityPolicy {
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_execution_time_sec: u64,
    pub max_processes: u32,
    pub max_open_files: u32,
}

/// A named risk profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityProfile {
    pub id: String,
    pub name: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub capabilities: Vec<CapabilityGrant>,
    #[serde(default)]
    pub constraints: Vec<SecurityConstraint>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub network: Option<NetworkSecurityPolicy>,
    #[serde(default)]
    pub resources: Option<ResourceSecurityPolicy>,
}

impl SecurityProfile {
    /// Grant for a capability, if the profile mentions it.
    pub fn capability(&self, capability: Capability) -> Option<&CapabilityGrant> {
        self.capabilities
            .iter()
            .find(|grant| grant.name == capability.as_str())
    }

    pub fn is_builtin(&self) -> bool {
        BUILTIN_PROFILES.contains(&self.id.as_str())
    }
}

/// Fields a caller supplies for a custom profile; the id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTemplate {
    pub name: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub capabilities: Vec<CapabilityGrant>,
    #[serde(default)]
    pub constraints: Vec<SecurityConstraint>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub network: Option<NetworkSecurityPolicy>,
    #[serde(default)]
    pub resources: Option<ResourceSecurityPolicy>,
}

impl ProfileTemplate {
    /// Start from an existing profile's policy under a new name.
    pub fn derived_from(base: &SecurityProfile, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            risk_level: base.risk_level,
            capabilities: base.capabilities.clone(),
            constraints: base.constraints.clone(),
            allowed_paths: base.allowed_paths.clone(),
            blocked_paths: base.blocked_paths.clone(),
            network: base.network.clone(),
            resources: base.resources.clone(),
        }
    }

    pub fn into_profile(self, id: String) -> SecurityProfile {
        SecurityProfile {
            id,
            name: self.name,
            risk_level: self.risk_level,
            capabilities: self.capabilities,
            constraints: self.constraints,
            allowed_paths: self.allowed_paths,
            blocked_paths: self.blocked_paths,
            network: self.network,
            resources: self.resources,
        }
    }
}

fn invalid(profile: &SecurityProfile, reason: impl Into<String>) -> SandboxError {
    ConfigError::InvalidProfile {
        profile: profile.id.clone(),
        reason: reason.into(),
    }
    .into()
}

/// Check a profile's numeric ranges before it is activated.
pub fn validate_profile(profile: &SecurityProfile) -> Result<(), SandboxError> {
    if profile.id.trim().is_empty() || profile.name.trim().is_empty() {
        return Err(invalid(profile, "profile id and name cannot be empty"));
    }

    if let Some(ref resources) = profile.resources {
        if resources.max_cpu_cores.is_nan()
            || resources.max_cpu_cores <= 0.0
            || resources.max_cpu_cores > MAX_PROFILE_CPU_CORES
        {
            return Err(invalid(
                profile,
                format!("CPU cores must be between 0 and {}", MAX_PROFILE_CPU_CORES),
            ));
        }
        if resources.max_memory_mb == 0 || resources.max_memory_mb > MAX_PROFILE_MEMORY_MB {
            return Err(invalid(
                profile,
                format!("memory must be between 1 and {} MB", MAX_PROFILE_MEMORY_MB),
            ));
        }
        if resources.max_execution_time_sec > MAX_PROFILE_EXECUTION_SECS {
            return Err(invalid(
                profile,
                format!("execution time cannot exceed {} seconds", MAX_PROFILE_EXECUTION_SECS),
            ));
        }
    }

    if let Some(ref network) = profile.network {
        if network.max_connections > MAX_PROFILE_CONNECTIONS {
            return Err(invalid(
                profile,
                format!("max connections cannot exceed {}", MAX_PROFILE_CONNECTIONS),
            ));
        }
        if network.connection_timeout_sec > MAX_PROFILE_CONNECTION_TIMEOUT_SECS {
            return Err(invalid(
                profile,
                format!(
                    "connection timeout cannot exceed {} seconds",
                    MAX_PROFILE_CONNECTION_TIMEOUT_SECS
                ),
            ));
        }
    }

    for constraint in &profile.constraints {
        if let ConstraintLimit::Number(n) = constraint.limit {
            if n.is_nan() || n < 0.0 {
                return Err(invalid(
                    profile,
                    format!("constraint '{}' has a negative limit", constraint.id),
                ));
            }
        }
    }

    Ok(())
}

/// The built-in profiles.
pub fn builtin_profiles() -> Vec<SecurityProfile> {
    vec![low_risk(), medium_risk(), high_risk()]
}

fn low_risk() -> SecurityProfile {
    SecurityProfile {
        id: "low-risk".to_string(),
        name: "Low Risk".to_string(),
        risk_level: RiskLevel::Low,
        capabilities: vec![
            CapabilityGrant::allow(Capability::FileRead),
            CapabilityGrant::allow(Capability::FileWrite),
            CapabilityGrant::allow(Capability::FileDelete).audited(),
            CapabilityGrant::allow(Capability::ProcessSpawn),
            CapabilityGrant::allow(Capability::NetworkAccess).audited(),
            CapabilityGrant::allow(Capability::SystemInfo),
            CapabilityGrant::allow(Capability::EnvAccess),
            CapabilityGrant::allow(Capability::PackageInstall).audited(),
            CapabilityGrant::deny(Capability::NetworkListen),
        ],
        constraints: vec![SecurityConstraint {
            id: "low-max-processes".to_string(),
            name: "Process ceiling".to_string(),
            constraint_type: ConstraintType::Process,
            limit: ConstraintLimit::Number(100.0),
            enforce: true,
            severity: Severity::Medium,
        }],
        allowed_paths: vec!["/tmp".into(), "/workspace".into(), "/home".into(), "/usr".into()],
        blocked_paths: vec!["/etc/shadow".into(), "/root".into(), "/var/run/docker.sock".into()],
        network: Some(NetworkSecurityPolicy {
            allow_external: true,
            allowed_hosts: Vec::new(),
            blocked_hosts: vec!["169.254.169.254".into(), "metadata.google.internal".into()],
            allowed_ports: Vec::new(),
            max_connections: 50,
            connection_timeout_sec: 120,
        }),
        resources: Some(ResourceSecurityPolicy {
            max_cpu_cores: 4.0,
            max_memory_mb: 4096,
            max_execution_time_sec: 3600,
            max_processes: 100,
            max_open_files: 4096,
        }),
    }
}

fn medium_risk() -> SecurityProfile {
    SecurityProfile {
        id: "medium-risk".to_string(),
        name: "Medium Risk".to_string(),
        risk_level: RiskLevel::Medium,
        capabilities: vec![
            CapabilityGrant::allow(Capability::FileRead),
            CapabilityGrant::allow(Capability::FileWrite).audited(),
            CapabilityGrant::allow(Capability::FileDelete)
                .audited()
                .restricted("workspace only"),
            CapabilityGrant::allow(Capability::ProcessSpawn).audited(),
            CapabilityGrant::allow(Capability::NetworkAccess)
                .audited()
                .restricted("allow-listed hosts"),
            CapabilityGrant::allow(Capability::EnvAccess),
            CapabilityGrant::deny(Capability::SystemInfo),
            CapabilityGrant::deny(Capability::PackageInstall),
            CapabilityGrant::deny(Capability::NetworkListen),
        ],
        constraints: vec![
            SecurityConstraint {
                id: "medium-max-processes".to_string(),
                name: "Process ceiling".to_string(),
                constraint_type: ConstraintType::Process,
                limit: ConstraintLimit::Number(50.0),
                enforce: true,
                severity: Severity::Medium,
            },
            SecurityConstraint {
                id: "medium-max-runtime".to_string(),
                name: "Runtime ceiling".to_string(),
                constraint_type: ConstraintType::Time,
                limit: ConstraintLimit::Number(1800.0),
                enforce: true,
                severity: Severity::Medium,
            },
        ],
        allowed_paths: vec!["/tmp".into(), "/workspace".into()],
        blocked_paths: vec![
            "/etc".into(),
            "/root".into(),
            "/proc/sys".into(),
            "/sys".into(),
            "/var/run/docker.sock".into(),
        ],
        network: Some(NetworkSecurityPolicy {
            allow_external: true,
            allowed_hosts: vec![
                "pypi.org".into(),
                "files.pythonhosted.org".into(),
                "registry.npmjs.org".into(),
                "github.com".into(),
            ],
            blocked_hosts: vec!["169.254.169.254".into(), "metadata.google.internal".into()],
            allowed_ports: vec![80, 443],
            max_connections: 20,
            connection_timeout_sec: 60,
        }),
        resources: Some(ResourceSecurityPolicy {
            max_cpu_cores: 2.0,
            max_memory_mb: 2048,
            max_execution_time_sec: 1800,
            max_processes: 50,
            max_open_files: 1024,
        }),
    }
}

fn high_risk() -> SecurityProfile {
    SecurityProfile {
        id: "high-risk".to_string(),
        name: "High Risk".to_string(),
        risk_level: RiskLevel::High,
        capabilities: vec![
            CapabilityGrant::allow(Capability::FileRead).audited(),
            CapabilityGrant::allow(Capability::FileWrite)
                .audited()
                .restricted("/tmp only"),
            CapabilityGrant::deny(Capability::FileDelete),
            CapabilityGrant::allow(Capability::ProcessSpawn)
                .audited()
                .restricted("no shells"),
            CapabilityGrant::deny(Capability::NetworkAccess),
            CapabilityGrant::deny(Capability::NetworkListen),
            CapabilityGrant::deny(Capability::SystemInfo),
            CapabilityGrant::deny(Capability::EnvAccess),
            CapabilityGrant::deny(Capability::PackageInstall),
        ],
        constraints: vec![
            SecurityConstraint {
                id: "high-no-network".to_string(),
                name: "Network disabled".to_string(),
                constraint_type: ConstraintType::Network,
                limit: ConstraintLimit::Flag(false),
                enforce: true,
                severity: Severity::High,
            },
            SecurityConstraint {
                id: "high-memory".to_string(),
                name: "Memory ceiling".to_string(),
                constraint_type: ConstraintType::Memory,
                limit: ConstraintLimit::Number(512.0),
                enforce: true,
                severity: Severity::High,
            },
        ],
        allowed_paths: vec!["/tmp".into(), "/workspace".into()],
        blocked_paths: vec![
            "/etc".into(),
            "/root".into(),
            "/home".into(),
            "/proc".into(),
            "/sys".into(),
            "/dev".into(),
            "/var".into(),
        ],
        network: Some(NetworkSecurityPolicy {
            allow_external: false,
            allowed_hosts: Vec::new(),
            blocked_hosts: Vec::new(),
            allowed_ports: Vec::new(),
            max_connections: 0,
            connection_timeout_sec: 10,
        }),
        resources: Some(ResourceSecurityPolicy {
            max_cpu_cores: 0.5,
            max_memory_mb: 512,
            max_execution_time_sec: 300,
            max_processes: 10,
            max_open_files: 256,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        for profile in builtin_profiles() {
            assert!(validate_profile(&profile).is_ok(), "{} invalid", profile.id);
            assert!(profile.is_builtin());
        }
    }

    #[test]
    fn test_rejects_out_of_range_cpu() {
        let mut profile = medium_risk();
        profile.resources.as_mut().unwrap().max_cpu_cores = 9.0;
        let err = validate_profile(&profile).unwrap_err();
        assert!(err.to_string().contains("CPU cores"));
    }

    #[test]
    fn test_rejects_out_of_range_network() {
        let mut profile = low_risk();
        profile.network.as_mut().unwrap().max_connections = 101;
        assert!(validate_profile(&profile).is_err());

        let mut profile = low_risk();
        profile.network.as_mut().unwrap().connection_timeout_sec = 301;
        assert!(validate_profile(&profile).is_err());
    }

    #[test]
    fn test_rejects_long_execution() {
        let mut profile = high_risk();
        profile.resources.as_mut().unwrap().max_execution_time_sec = 7200;
        assert!(validate_profile(&profile).is_err());
    }

    #[test]
    fn test_capability_lookup() {
        let profile = high_risk();
        assert!(!profile.capability(Capability::NetworkAccess).unwrap().allowed);
        assert!(profile.capability(Capability::FileRead).unwrap().allowed);
    }

    #[test]
    fn test_constraint_limit_serde() {
        let json = r#"{"id":"c","name":"n","type":"memory","limit":256,"severity":"high"}"#;
        let constraint: SecurityConstraint = serde_json::from_str(json).unwrap();
        assert_eq!(constraint.limit, ConstraintLimit::Number(256.0));
        assert!(constraint.enforce);

        let json = r#"{"id":"c","name":"n","type":"network","limit":false,"severity":"low"}"#;
        let constraint: SecurityConstraint = serde_json::from_str(json).unwrap();
        assert_eq!(constraint.limit, ConstraintLimit::Flag(false));
    }
}
