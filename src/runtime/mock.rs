//! In-memory container runtime for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SandboxError;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, ExecOutput, ExecRequest, NetworkInspection,
    NetworkSpec,
};

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    running: bool,
    paused: bool,
    /// Created with `--network=none`.
    detached: bool,
    stats: Option<ContainerStats>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    calls: Vec<String>,
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, HashSet<String>>,
    fail_create: Option<String>,
    fail_start: Option<String>,
    fail_stop: Option<String>,
    fail_network_create: Option<String>,
    exec_output: ExecOutput,
    exec_delay: Duration,
    default_stats: ContainerStats,
}

/// A [`ContainerRuntime`] that keeps containers and networks in memory.
///
/// Every call is recorded (`"create sbx-foo"`, `"start mock-1"`, ...) so tests
/// can assert on what the engine asked for. Failures, exec output, exec delay
/// and stats are scriptable.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls whose verb is `verb`.
    pub fn call_count(&self, verb: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn fail_create(&self, message: impl Into<String>) {
        self.state.lock().fail_create = Some(message.into());
    }

    pub fn fail_start(&self, message: impl Into<String>) {
        self.state.lock().fail_start = Some(message.into());
    }

    pub fn fail_stop(&self, message: impl Into<String>) {
        self.state.lock().fail_stop = Some(message.into());
    }

    pub fn fail_network_create(&self, message: impl Into<String>) {
        self.state.lock().fail_network_create = Some(message.into());
    }

    pub fn set_exec_output(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.state.lock().exec_output = ExecOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        };
    }

    /// How long `exec` takes before returning.
    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().exec_delay = delay;
    }

    /// Stats reported for every container without its own override.
    pub fn set_default_stats(&self, stats: ContainerStats) {
        self.state.lock().default_stats = stats;
    }

    pub fn set_stats(&self, handle: &str, stats: ContainerStats) {
        if let Some(container) = self.state.lock().containers.get_mut(handle) {
            container.stats = Some(stats);
        }
    }

    /// Simulate a container disappearing behind the engine's back.
    pub fn vanish(&self, handle: &str) {
        self.state.lock().containers.remove(handle);
    }

    pub fn container_exists(&self, handle: &str) -> bool {
        self.state.lock().containers.contains_key(handle)
    }

    pub fn container_running(&self, handle: &str) -> bool {
        self.state
            .lock()
            .containers
            .get(handle)
            .is_some_and(|c| c.running)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().networks.len()
    }

    /// Containers attached to a network.
    pub fn network_members(&self, network: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut members: Vec<_> = state
            .networks
            .get(network)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn record(state: &mut MockState, call: String) {
        state.calls.push(call);
    }

    fn missing(handle: &str) -> SandboxError {
        SandboxError::ContainerNotFound(format!("No such container: {}", handle))
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("create {}", spec.name));
        if let Some(ref message) = state.fail_create {
            return Err(SandboxError::tool_failure("mock", message.clone()));
        }
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(SandboxError::tool_failure(
                "mock",
                format!("container name {} already in use", spec.name),
            ));
        }

        if let Some(ref attachment) = spec.network {
            if !state.networks.contains_key(&attachment.network) {
                return Err(SandboxError::tool_failure(
                    "mock",
                    format!("network {} not found", attachment.network),
                ));
            }
        }

        state.next_id += 1;
        let handle = format!("mock-{}", state.next_id);
        if let Some(ref attachment) = spec.network {
            if let Some(members) = state.networks.get_mut(&attachment.network) {
                members.insert(handle.clone());
            }
        }
        state.containers.insert(
            handle.clone(),
            MockContainer {
                name: spec.name.clone(),
                running: false,
                paused: false,
                detached: spec.network.is_none() && spec.network_mode.as_runtime_arg() == "none",
                stats: None,
            },
        );
        Ok(handle)
    }

    async fn start_container(&self, handle: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("start {}", handle));
        if let Some(ref message) = state.fail_start {
            return Err(SandboxError::tool_failure("mock", message.clone()));
        }
        let container = state.containers.get_mut(handle).ok_or_else(|| Self::missing(handle))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, handle: &str, _grace: Duration) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("stop {}", handle));
        if let Some(ref message) = state.fail_stop {
            return Err(SandboxError::tool_failure("mock", message.clone()));
        }
        let container = state.containers.get_mut(handle).ok_or_else(|| Self::missing(handle))?;
        container.running = false;
        container.paused = false;
        Ok(())
    }

    async fn remove_container(&self, handle: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("rm {}", handle));
        if state.containers.remove(handle).is_none() {
            return Err(Self::missing(handle));
        }
        for members in state.networks.values_mut() {
            members.remove(handle);
        }
        Ok(())
    }

    async fn pause_container(&self, handle: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("pause {}", handle));
        let container = state.containers.get_mut(handle).ok_or_else(|| Self::missing(handle))?;
        container.paused = true;
        Ok(())
    }

    async fn unpause_container(&self, handle: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("unpause {}", handle));
        let container = state.containers.get_mut(handle).ok_or_else(|| Self::missing(handle))?;
        container.paused = false;
        Ok(())
    }

    async fn container_pid(&self, handle: &str) -> Result<Option<u32>, SandboxError> {
        let state = self.state.lock();
        let container = state.containers.get(handle).ok_or_else(|| Self::missing(handle))?;
        Ok(container.running.then_some(4242))
    }

    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecOutput, SandboxError> {
        let (delay, output) = {
            let mut state = self.state.lock();
            Self::record(&mut state, format!("exec {} {}", handle, request.command.join(" ")));
            if !state.containers.contains_key(handle) {
                return Err(Self::missing(handle));
            }
            (state.exec_delay, state.exec_output.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(output)
    }

    async fn stats(&self, handle: &str) -> Result<ContainerStats, SandboxError> {
        let state = self.state.lock();
        let container = state.containers.get(handle).ok_or_else(|| Self::missing(handle))?;
        Ok(container.stats.unwrap_or(state.default_stats))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("network-create {} {}", spec.name, spec.subnet));
        if let Some(ref message) = state.fail_network_create {
            return Err(SandboxError::tool_failure("mock", message.clone()));
        }
        let id = format!("net-{}", spec.name);
        state.networks.insert(id.clone(), HashSet::new());
        Ok(id)
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        _ip: Option<&str>,
    ) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("network-connect {} {}", network, container));
        let detached = state
            .containers
            .get(container)
            .ok_or_else(|| Self::missing(container))?
            .detached;
        if detached {
            return Err(SandboxError::tool_failure(
                "mock",
                "container cannot be connected to multiple networks with one of the networks in private (none) mode",
            ));
        }
        let members = state
            .networks
            .get_mut(network)
            .ok_or_else(|| SandboxError::tool_failure("mock", format!("network {} not found", network)))?;
        members.insert(container.to_string());
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("network-disconnect {} {}", network, container));
        let removed = state
            .networks
            .get_mut(network)
            .map(|members| members.remove(container))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(SandboxError::tool_failure(
                "mock",
                format!("container {} is not connected to network {}", container, network),
            ))
        }
    }

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock();
        Self::record(&mut state, format!("network-rm {}", network));
        state
            .networks
            .remove(network)
            .map(|_| ())
            .ok_or_else(|| SandboxError::tool_failure("mock", format!("network {} not found", network)))
    }

    async fn inspect_network(&self, network: &str) -> Result<NetworkInspection, SandboxError> {
        let state = self.state.lock();
        let members = state
            .networks
            .get(network)
            .ok_or_else(|| SandboxError::tool_failure("mock", format!("network {} not found", network)))?;
        Ok(NetworkInspection {
            connected_containers: members.len(),
        })
    }
}
