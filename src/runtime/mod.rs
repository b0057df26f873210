//! Container runtime abstraction.
//!
//! The engine never talks to a container engine directly; it goes through
//! [`ContainerRuntime`]. [`CliRuntime`] shells out to a docker-compatible
//! binary, [`MockRuntime`] keeps everything in memory for tests.

pub mod cli;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::manager::types::{NetworkMode, RestartPolicy, SandboxConfig, VolumeMount};

pub use crate::utils::ToolOutput as ExecOutput;
pub use cli::CliRuntime;
pub use mock::MockRuntime;

/// Label attached to every container and network the engine creates.
pub const SANDBOX_LABEL: &str = "io.sbx.sandbox";

/// Entry command used when a sandbox has no command of its own, so the
/// container stays up for `exec`.
const IDLE_COMMAND: &[&str] = &["sleep", "infinity"];

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Sorted so generated command lines are deterministic.
    pub environment: Vec<(String, String)>,
    pub cpu: f64,
    pub memory_mb: u64,
    pub pids_limit: u32,
    pub nofile_limit: u32,
    pub network_mode: NetworkMode,
    /// Network joined at create time; takes the place of `network_mode`.
    pub network: Option<NetworkAttachment>,
    pub volumes: Vec<VolumeMount>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub read_only_root: bool,
    pub no_new_privileges: bool,
    pub restart_policy: RestartPolicy,
    pub labels: Vec<(String, String)>,
}

impl ContainerSpec {
    /// Container name used for a sandbox id.
    pub fn container_name(sandbox_id: &str) -> String {
        format!("sbx-{}", sandbox_id)
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        let mut environment: Vec<_> = config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        environment.sort();

        let command = if config.command.is_empty() {
            IDLE_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            config.command.clone()
        };

        Self {
            name: Self::container_name(&config.id),
            image: config.image.clone(),
            command,
            environment,
            cpu: config.resources.cpu,
            memory_mb: config.resources.memory_mb,
            pids_limit: config.security.max_processes,
            nofile_limit: config.security.max_open_files,
            network_mode: config.network_mode,
            network: None,
            volumes: config.volumes.clone(),
            working_dir: config.working_dir.clone(),
            user: config.user.clone(),
            read_only_root: config.security.read_only_root,
            no_new_privileges: config.security.no_privileges,
            restart_policy: config.restart_policy,
            labels: vec![(SANDBOX_LABEL.to_string(), config.id.clone())],
        }
    }

    #[must_use]
    pub fn with_network(mut self, attachment: Option<NetworkAttachment>) -> Self {
        self.network = attachment;
        self
    }
}

/// Network a container is created on, with an optional fixed address.
///
/// Runtimes refuse to connect a container that was created without a network
/// to another one, so isolated sandboxes join their network this way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub ip: Option<String>,
}

/// A command to run inside an existing container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Hard wall-clock budget; the process is killed when it runs out.
    pub timeout: Duration,
}

/// One sample of container resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub net_bytes_in: u64,
    pub net_bytes_out: u64,
}

/// Request to create an isolated network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    /// Internal networks have no route to the outside.
    pub internal: bool,
    pub labels: Vec<(String, String)>,
}

/// Subset of `network inspect` the engine cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkInspection {
    pub connected_containers: usize,
}

/// Operations the engine issues against a container engine.
///
/// Implementations report a vanished container as
/// [`SandboxError::ContainerNotFound`] so callers can tell it apart from other
/// tool failures.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human readable runtime name for logs.
    fn name(&self) -> &str;

    /// Whether the runtime binary is usable.
    async fn is_available(&self) -> bool;

    /// Create a container, returning its handle.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn start_container(&self, handle: &str) -> Result<(), SandboxError>;

    async fn stop_container(&self, handle: &str, grace: Duration) -> Result<(), SandboxError>;

    async fn remove_container(&self, handle: &str) -> Result<(), SandboxError>;

    async fn pause_container(&self, handle: &str) -> Result<(), SandboxError>;

    async fn unpause_container(&self, handle: &str) -> Result<(), SandboxError>;

    /// Host pid of the container's init process, when it is running.
    async fn container_pid(&self, handle: &str) -> Result<Option<u32>, SandboxError>;

    /// Run a command inside the container. A non-zero exit of the command is
    /// data, not an error.
    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecOutput, SandboxError>;

    async fn stats(&self, handle: &str) -> Result<ContainerStats, SandboxError>;

    /// Create a network, returning its id.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, SandboxError>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ip: Option<&str>,
    ) -> Result<(), SandboxError>;

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), SandboxError>;

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError>;

    async fn inspect_network(&self, network: &str) -> Result<NetworkInspection, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_config() {
        let config = SandboxConfig::new("abc", "alpine:3.19")
            .with_env("B", "2")
            .with_env("A", "1");
        let spec = ContainerSpec::from_config(&config);

        assert_eq!(spec.name, "sbx-abc");
        assert_eq!(spec.command, vec!["sleep", "infinity"]);
        assert_eq!(
            spec.environment,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
        assert_eq!(spec.pids_limit, config.security.max_processes);
        assert_eq!(spec.labels[0].1, "abc");
    }

    #[test]
    fn test_spec_keeps_explicit_command() {
        let config = SandboxConfig::new("abc", "python:3.12")
            .with_command(vec!["python3".into(), "-m".into(), "http.server".into()]);
        let spec = ContainerSpec::from_config(&config);
        assert_eq!(spec.command[0], "python3");
    }
}
