//! Sandbox manager: admission, container lifecycle, monitoring and cleanup.

mod monitor;
pub mod state;
pub mod types;
pub mod validation;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error::SandboxError;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::ResourceLedger;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecRequest, NetworkAttachment};

use self::state::{IdLocks, ManagerState, SandboxEntry};
use self::types::{ExecOptions, ExecutionResult, SandboxConfig, SandboxState, SandboxStatus};

pub use state::SandboxMetrics;
pub use validation::validate_config;

/// How often readiness is polled while waiting for a sandbox to run.
const READINESS_POLL: Duration = Duration::from_millis(100);

/// Creates, tracks and tears down sandboxes.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    ledger: Arc<ResourceLedger>,
    events: Arc<EventBus>,
    settings: RuntimeConfig,
    monitor_interval: Duration,
    state: RwLock<ManagerState>,
    locks: IdLocks,
}

impl SandboxManager {
    pub fn new(
        settings: RuntimeConfig,
        monitor_interval: Duration,
        runtime: Arc<dyn ContainerRuntime>,
        ledger: Arc<ResourceLedger>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            runtime,
            ledger,
            events,
            settings,
            monitor_interval,
            state: RwLock::new(ManagerState::new()),
            locks: IdLocks::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.settings.stop_timeout_secs)
    }

    /// Admit, create and start a sandbox.
    ///
    /// Admission happens before any external call. Once admitted, any failure
    /// marks the sandbox `failed`, returns its resources, removes a container
    /// that was already created and re-raises.
    pub async fn create_sandbox(self: &Arc<Self>, config: SandboxConfig) -> Result<String, SandboxError> {
        self.create_sandbox_on(config, None).await
    }

    /// [`Self::create_sandbox`], with the container created directly on
    /// `network` when one is given.
    pub async fn create_sandbox_on(
        self: &Arc<Self>,
        config: SandboxConfig,
        network: Option<NetworkAttachment>,
    ) -> Result<String, SandboxError> {
        let _guard = self.locks.lock(&config.id).await;
        let id = config.id.clone();

        if self.state.read().sandboxes.contains_key(&id) {
            return Err(SandboxError::InvalidState(format!("sandbox {} already exists", id)));
        }

        let (cpu, memory_mb) = (config.resources.cpu, config.resources.memory_mb);
        if !self.ledger.can_allocate(cpu, memory_mb) {
            let available = self.ledger.utilization();
            return Err(SandboxError::ResourceExhaustion(format!(
                "sandbox {} needs {:.2} CPU / {} MB, available {:.2} CPU / {} MB",
                id, cpu, memory_mb, available.available_cpu, available.available_memory_mb
            )));
        }
        validate_config(&config)?;
        let allocation = self.ledger.allocate(cpu, memory_mb)?;

        let config = Arc::new(config);
        {
            let mut state = self.state.write();
            state
                .sandboxes
                .insert(id.clone(), SandboxEntry::new(config.clone(), allocation));
            state.counters.created += 1;
        }
        tracing::info!(sandbox = %id, image = %config.image, "creating sandbox");
        self.events.publish(EngineEvent::SandboxCreating { sandbox_id: id.clone() });

        let spec = ContainerSpec::from_config(&config).with_network(network);
        let mut created = None;
        let started = async {
            let handle = self.runtime.create_container(&spec).await?;
            created = Some(handle.clone());
            self.runtime.start_container(&handle).await?;
            Ok::<_, SandboxError>(handle)
        }
        .await;

        match started {
            Ok(handle) => {
                let pid = match self.runtime.container_pid(&handle).await {
                    Ok(pid) => pid,
                    Err(e) => {
                        tracing::debug!(sandbox = %id, error = %e, "could not read container pid");
                        None
                    }
                };
                if let Some(entry) = self.state.write().sandboxes.get_mut(&id) {
                    entry.state.status = SandboxStatus::Running;
                    entry.state.container_id = Some(handle.clone());
                    entry.state.pid = pid;
                    entry.state.start_time = Some(Utc::now());
                }

                tracing::info!(sandbox = %id, container = %handle, "sandbox running");
                self.events.publish(EngineEvent::SandboxCreated {
                    sandbox_id: id.clone(),
                    container_id: handle.clone(),
                });
                self.start_monitor(&id, handle);
                Ok(id)
            }
            Err(e) => {
                self.fail_creation(&id, created, &e).await;
                Err(e)
            }
        }
    }

    async fn fail_creation(&self, id: &str, created: Option<String>, error: &SandboxError) {
        let allocation = {
            let mut state = self.state.write();
            state.counters.failed += 1;
            state.sandboxes.get_mut(id).and_then(|entry| {
                entry.state.status = SandboxStatus::Failed;
                entry.state.last_error = Some(error.to_string());
                entry.state.end_time = Some(Utc::now());
                entry.allocation.take()
            })
        };
        if let Some(allocation) = allocation {
            self.ledger.release(allocation);
        }

        if let Some(handle) = created {
            if let Err(e) = self.runtime.remove_container(&handle).await {
                tracing::warn!(sandbox = id, container = %handle, error = %e, "rollback remove failed");
            }
        }

        tracing::warn!(sandbox = id, error = %error, "sandbox creation failed");
        self.events.publish(EngineEvent::SandboxFailed {
            sandbox_id: id.to_string(),
            error: error.to_string(),
        });
    }

    /// Run one command in an ephemeral sandbox scoped to `task_id`.
    ///
    /// Unless `cleanup_on_exit` is false the sandbox is cleaned up on every
    /// exit path, including failure and timeout.
    pub async fn execute_in_sandbox(
        self: &Arc<Self>,
        task_id: &str,
        command: Vec<String>,
        options: ExecOptions,
    ) -> Result<ExecutionResult, SandboxError> {
        let sandbox_id = task_sandbox_id(task_id);
        let cleanup = options.cleanup_on_exit.unwrap_or(true);
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.settings.default_exec_timeout_secs));

        let mut config = SandboxConfig::new(
            sandbox_id.clone(),
            options
                .image
                .clone()
                .unwrap_or_else(|| self.settings.default_image.clone()),
        );
        config.environment = options.environment.clone();
        if let Some(resources) = options.resources {
            config.resources = resources;
        }
        if let Some(security) = options.security {
            config.security = security;
        }
        if let Some(mode) = options.network_mode {
            config.network_mode = mode;
        }
        config.working_dir = options.working_dir.clone();
        config.cleanup_on_exit = cleanup;

        let result = self.run_task(config, command, timeout).await;

        if cleanup {
            self.cleanup_sandbox(&sandbox_id).await;
        }
        result
    }

    async fn run_task(
        self: &Arc<Self>,
        config: SandboxConfig,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let working_dir = config.working_dir.clone();
        let user = config.user.clone();
        let mut environment: Vec<_> = config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        environment.sort();

        let id = self.create_sandbox(config).await?;
        let handle = self.wait_until_running(&id).await?;

        let request = ExecRequest {
            command,
            environment,
            working_dir,
            user,
            timeout,
        };

        tracing::debug!(sandbox = %id, command = %crate::utils::join_args(&request.command), "exec");
        let started = Instant::now();
        let output = match tokio::time::timeout(timeout, self.runtime.exec(&handle, &request)).await {
            Ok(output) => output?,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(sandbox = %id, timeout_ms, "command timed out, stopping container");
                self.stop_after_timeout(&id, &handle).await;
                return Err(SandboxError::Timeout(timeout_ms));
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut state = self.state.write();
            state.counters.completed_executions += 1;
            state.counters.total_execution_ms += duration_ms;
        }

        Ok(ExecutionResult {
            sandbox_id: id,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms,
        })
    }

    /// Dropping the exec future only kills the local client, so the command
    /// keeps running in the container until the container itself stops.
    async fn stop_after_timeout(&self, id: &str, handle: &str) {
        let _guard = self.locks.lock(id).await;
        if let Err(e) = self.runtime.stop_container(handle, self.stop_grace()).await {
            if !e.is_container_gone() {
                tracing::warn!(sandbox = id, container = handle, error = %e, "stop after timeout failed");
            }
            return;
        }
        if let Some(entry) = self.state.write().sandboxes.get_mut(id) {
            entry.state.status = SandboxStatus::Stopped;
        }
    }

    /// Wait for `running`, bounded by the readiness timeout. Returns the
    /// container handle.
    async fn wait_until_running(&self, id: &str) -> Result<String, SandboxError> {
        let budget = Duration::from_secs(self.settings.readiness_timeout_secs);
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            let snapshot = self
                .get_sandbox(id)
                .ok_or_else(|| SandboxError::NotFound(format!("sandbox {}", id)))?;
            match snapshot.status {
                SandboxStatus::Running => {
                    if let Some(handle) = snapshot.container_id {
                        return Ok(handle);
                    }
                }
                SandboxStatus::Creating => {}
                other => {
                    return Err(SandboxError::UnexpectedExit {
                        sandbox_id: id.to_string(),
                        reason: snapshot
                            .last_error
                            .unwrap_or_else(|| format!("sandbox is {}", other)),
                    })
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Timeout(budget.as_millis() as u64));
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    /// Stop and remove the container, release the admitted resources and
    /// forget the sandbox. Unknown ids are a no-op.
    pub async fn cleanup_sandbox(&self, id: &str) {
        let guard = self.locks.lock(id).await;
        let entry = self.state.write().sandboxes.remove(id);
        let Some(mut entry) = entry else {
            drop(guard);
            self.locks.prune();
            return;
        };

        entry.stop_monitor();

        if let Some(ref handle) = entry.state.container_id {
            if let Err(e) = self.runtime.stop_container(handle, self.stop_grace()).await {
                if !e.is_container_gone() {
                    tracing::warn!(sandbox = id, container = %handle, error = %e, "stop failed");
                }
            }
            if let Err(e) = self.runtime.remove_container(handle).await {
                if !e.is_container_gone() {
                    tracing::warn!(sandbox = id, container = %handle, error = %e, "remove failed");
                }
            }
        }

        if let Some(allocation) = entry.allocation.take() {
            self.ledger.release(allocation);
        }

        tracing::info!(sandbox = id, "sandbox cleaned up");
        self.events.publish(EngineEvent::SandboxCleanup {
            sandbox_id: id.to_string(),
        });

        drop(guard);
        self.locks.prune();
    }

    /// Clean up every registered sandbox concurrently.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.state.read().sandboxes.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.cleanup_sandbox(id))).await;
    }

    pub async fn pause_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.transition(id, SandboxStatus::Running, SandboxStatus::Paused).await
    }

    pub async fn resume_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        self.transition(id, SandboxStatus::Paused, SandboxStatus::Running).await
    }

    async fn transition(&self, id: &str, from: SandboxStatus, to: SandboxStatus) -> Result<(), SandboxError> {
        let _guard = self.locks.lock(id).await;

        let handle = {
            let state = self.state.read();
            let entry = state
                .sandboxes
                .get(id)
                .ok_or_else(|| SandboxError::NotFound(format!("sandbox {}", id)))?;
            if entry.state.status != from {
                return Err(SandboxError::InvalidState(format!(
                    "sandbox {} is {}, expected {}",
                    id, entry.state.status, from
                )));
            }
            entry
                .state
                .container_id
                .clone()
                .ok_or_else(|| SandboxError::InvalidState(format!("sandbox {} has no container", id)))?
        };

        if to == SandboxStatus::Paused {
            self.runtime.pause_container(&handle).await?;
        } else {
            self.runtime.unpause_container(&handle).await?;
        }

        if let Some(entry) = self.state.write().sandboxes.get_mut(id) {
            entry.state.status = to;
        }

        tracing::info!(sandbox = id, status = %to, "sandbox {}", if to == SandboxStatus::Paused { "paused" } else { "resumed" });
        self.events.publish(if to == SandboxStatus::Paused {
            EngineEvent::SandboxPaused { sandbox_id: id.to_string() }
        } else {
            EngineEvent::SandboxResumed { sandbox_id: id.to_string() }
        });
        Ok(())
    }

    pub fn get_sandbox(&self, id: &str) -> Option<SandboxState> {
        self.state.read().sandboxes.get(id).map(|e| e.state.clone())
    }

    /// Every registered sandbox, ordered by id.
    pub fn list_sandboxes(&self) -> Vec<SandboxState> {
        let mut all: Vec<_> = self
            .state
            .read()
            .sandboxes
            .values()
            .map(|e| e.state.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_config(&self, id: &str) -> Option<Arc<SandboxConfig>> {
        self.state.read().sandboxes.get(id).map(|e| e.config.clone())
    }

    pub fn container_handle(&self, id: &str) -> Option<String> {
        self.state
            .read()
            .sandboxes
            .get(id)
            .and_then(|e| e.state.container_id.clone())
    }

    pub fn get_metrics(&self) -> SandboxMetrics {
        let utilization = self.ledger.utilization();
        self.state.read().metrics(utilization)
    }
}

/// Sandbox id for an ephemeral task sandbox.
fn task_sandbox_id(task_id: &str) -> String {
    let task: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(32)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", task, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::types::ResourceLimits;
    use crate::runtime::MockRuntime;

    fn manager(runtime: Arc<MockRuntime>, cpu: f64, memory_mb: u64) -> Arc<SandboxManager> {
        Arc::new(SandboxManager::new(
            RuntimeConfig::default(),
            Duration::from_secs(5),
            runtime,
            Arc::new(ResourceLedger::new(cpu, memory_mb)),
            Arc::new(EventBus::new()),
        ))
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone(), 4.0, 4096);

        let id = manager
            .create_sandbox(SandboxConfig::new("sb-1", "alpine"))
            .await
            .unwrap();
        let state = manager.get_sandbox(&id).unwrap();
        assert_eq!(state.status, SandboxStatus::Running);
        assert_eq!(state.pid, Some(4242));
        assert_eq!(manager.ledger().utilization().allocated_memory_mb, 512);

        manager.cleanup_sandbox(&id).await;
        assert!(manager.get_sandbox(&id).is_none());
        assert_eq!(manager.ledger().utilization().allocated_memory_mb, 0);
        assert_eq!(runtime.container_count(), 0);
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone(), 4.0, 4096);
        manager.create_sandbox(SandboxConfig::new("sb-1", "alpine")).await.unwrap();
        let err = manager
            .create_sandbox(SandboxConfig::new("sb-1", "alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
        assert_eq!(runtime.call_count("create"), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_releases_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone(), 16.0, 65536);
        let config = SandboxConfig::new("sb-1", "alpine")
            .with_resources(ResourceLimits::default().with_cpu(9.0));
        assert!(matches!(
            manager.create_sandbox(config).await,
            Err(SandboxError::Config(_))
        ));
        assert_eq!(runtime.call_count("create"), 0);
        assert_eq!(manager.ledger().utilization().active_allocations, 0);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_start("image entrypoint missing");
        let manager = manager(runtime.clone(), 4.0, 4096);

        let err = manager
            .create_sandbox(SandboxConfig::new("sb-1", "alpine"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("entrypoint"));

        let state = manager.get_sandbox("sb-1").unwrap();
        assert_eq!(state.status, SandboxStatus::Failed);
        assert!(state.last_error.is_some());
        assert_eq!(manager.ledger().utilization().active_allocations, 0);
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(manager.get_metrics().failed_sandboxes, 1);

        // cleaning up a failed sandbox does not release twice
        manager.cleanup_sandbox("sb-1").await;
        assert_eq!(manager.ledger().utilization().allocated_cpu, 0.0);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let runtime = Arc::new(MockRuntime::new());
        let manager = manager(runtime.clone(), 4.0, 4096);
        manager.create_sandbox(SandboxConfig::new("sb-1", "alpine")).await.unwrap();

        assert!(manager.resume_sandbox("sb-1").await.is_err());
        manager.pause_sandbox("sb-1").await.unwrap();
        assert_eq!(manager.get_sandbox("sb-1").unwrap().status, SandboxStatus::Paused);
        assert!(manager.pause_sandbox("sb-1").await.is_err());
        manager.resume_sandbox("sb-1").await.unwrap();
        assert_eq!(manager.get_sandbox("sb-1").unwrap().status, SandboxStatus::Running);
        assert!(matches!(
            manager.pause_sandbox("missing").await,
            Err(SandboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_returns_output() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_exec_output(3, "out", "err");
        let manager = manager(runtime.clone(), 4.0, 4096);

        let result = manager
            .execute_in_sandbox("task 1", vec!["false".into()], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out");
        assert!(result.sandbox_id.starts_with("task-task-1-"));
        assert!(manager.list_sandboxes().is_empty());
        assert_eq!(manager.get_metrics().completed_executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_kept_sandbox() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.set_exec_delay(Duration::from_secs(60));
        let manager = manager(runtime.clone(), 4.0, 4096);

        let result = manager
            .execute_in_sandbox(
                "slow",
                vec!["sleep".into(), "60".into()],
                ExecOptions {
                    timeout: Some(Duration::from_secs(2)),
                    cleanup_on_exit: Some(false),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout(2000))));

        let state = manager.list_sandboxes().pop().unwrap();
        assert_eq!(state.status, SandboxStatus::Stopped);
        let handle = state.container_id.unwrap();
        assert_eq!(runtime.call_count("stop"), 1);
        assert!(runtime.container_exists(&handle));
        assert!(!runtime.container_running(&handle));

        manager.cleanup_sandbox(&state.id).await;
        assert_eq!(runtime.container_count(), 0);
    }

    #[test]
    fn test_task_sandbox_id_is_valid() {
        let id = task_sandbox_id("weird/task id!");
        let config = SandboxConfig::new(id, "alpine");
        assert!(validate_config(&config).is_ok());
    }
}
