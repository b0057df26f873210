//! Sandbox configuration and state types.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource limits for a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU cores.
    pub cpu: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_allowed: bool,
    pub max_duration_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_mb: 512,
            disk_mb: 1024,
            network_allowed: false,
            max_duration_sec: 300,
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    #[must_use]
    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    #[must_use]
    pub fn with_max_duration(mut self, secs: u64) -> Self {
        self.max_duration_sec = secs;
        self
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}

/// Security policy applied to the container itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub allow_filesystem: bool,
    pub allow_network: bool,
    pub allow_exec: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    pub max_processes: u32,
    pub max_open_files: u32,
    pub read_only_root: bool,
    pub no_privileges: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_filesystem: true,
            allow_network: false,
            allow_exec: true,
            allowed_paths: vec!["/tmp".to_string(), "/workspace".to_string()],
            blocked_paths: vec![
                "/etc".to_string(),
                "/proc/sys".to_string(),
                "/sys".to_string(),
                "/var/run/docker.sock".to_string(),
            ],
            max_processes: 64,
            max_open_files: 1024,
            read_only_root: true,
            no_privileges: true,
        }
    }
}

/// Container network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network at all.
    #[default]
    None,
    /// Default runtime bridge.
    Bridge,
    /// Host network namespace.
    Host,
    /// Per-sandbox isolated network, joined when the container is created.
    /// Without one the container has no network.
    Isolated,
}

impl NetworkMode {
    /// Value passed to the runtime's `--network` flag.
    pub fn as_runtime_arg(&self) -> &'static str {
        match self {
            NetworkMode::None | NetworkMode::Isolated => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }

    pub fn has_network(&self) -> bool {
        !matches!(self, NetworkMode::None)
    }
}

/// Host directory mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn read_only(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }
}

/// Container restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure,
    Always,
}

impl RestartPolicy {
    pub fn as_runtime_arg(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        }
    }
}

/// Everything needed to create a sandbox. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub id: String,
    pub image: String,
    /// Long-running entry command. Empty keeps the container idle so commands
    /// can be executed into it.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub security: SecurityPolicy,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_true")]
    pub cleanup_on_exit: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

fn default_true() -> bool {
    true
}

impl SandboxConfig {
    /// A config with defaults for everything but identity and image.
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            command: Vec::new(),
            environment: HashMap::new(),
            resources: ResourceLimits::default(),
            security: SecurityPolicy::default(),
            network_mode: NetworkMode::None,
            volumes: Vec::new(),
            working_dir: None,
            user: None,
            cleanup_on_exit: true,
            restart_policy: RestartPolicy::No,
        }
    }

    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    #[must_use]
    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }
}

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Stopped,
    Failed,
    Exited,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Running => "running",
            SandboxStatus::Paused => "paused",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Most recent resource usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub net_bytes_in: u64,
    pub net_bytes_out: u64,
}

/// Observable state of one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxState {
    pub id: String,
    pub status: SandboxStatus,
    pub container_id: Option<String>,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub usage: ResourceUsage,
    pub last_error: Option<String>,
}

impl SandboxState {
    pub fn creating(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SandboxStatus::Creating,
            container_id: None,
            pid: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            usage: ResourceUsage::default(),
            last_error: None,
        }
    }
}

/// Options for [`SandboxManager::execute_in_sandbox`](crate::manager::SandboxManager::execute_in_sandbox).
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Image override; the configured default image otherwise.
    pub image: Option<String>,
    pub environment: HashMap<String, String>,
    pub resources: Option<ResourceLimits>,
    pub security: Option<SecurityPolicy>,
    pub network_mode: Option<NetworkMode>,
    pub working_dir: Option<String>,
    /// Wall-clock budget for the command; the configured default otherwise.
    pub timeout: Option<Duration>,
    /// Defaults to true when unset.
    pub cleanup_on_exit: Option<bool>,
}

/// Result of a command executed in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub sandbox_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
