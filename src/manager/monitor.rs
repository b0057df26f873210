//! Per-sandbox resource monitor.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, ResourceCategory};
use crate::manager::types::{ResourceUsage, SandboxStatus};
use crate::manager::SandboxManager;

impl SandboxManager {
    /// Start polling usage for a running sandbox. The token lives in the
    /// registry entry and is cancelled at cleanup or exit.
    pub(super) fn start_monitor(self: &Arc<Self>, id: &str, handle: String) {
        let token = CancellationToken::new();
        {
            let mut state = self.state.write();
            let Some(entry) = state.sandboxes.get_mut(id) else {
                return;
            };
            entry.stop_monitor();
            entry.monitor = Some(token.clone());
        }

        let weak = Arc::downgrade(self);
        let id = id.to_string();
        let interval = self.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        if manager.poll_usage(&id, &handle).await.is_break() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(sandbox = %id, "resource monitor stopped");
        });
    }

    /// One usage sample. Breaks when the sandbox is gone.
    pub(crate) async fn poll_usage(&self, id: &str, handle: &str) -> ControlFlow<()> {
        let limits = match self.state.read().sandboxes.get(id) {
            Some(entry) if entry.state.status == SandboxStatus::Running => entry.config.resources.clone(),
            Some(_) => return ControlFlow::Continue(()),
            None => return ControlFlow::Break(()),
        };

        let stats = match self.runtime.stats(handle).await {
            Ok(stats) => stats,
            Err(e) if e.is_container_gone() => {
                self.mark_exited(id, e.to_string());
                return ControlFlow::Break(());
            }
            Err(e) => {
                tracing::warn!(sandbox = id, error = %e, "resource poll failed");
                return ControlFlow::Continue(());
            }
        };

        {
            let mut state = self.state.write();
            match state.sandboxes.get_mut(id) {
                Some(entry) => {
                    entry.state.usage = ResourceUsage {
                        cpu_percent: stats.cpu_percent,
                        memory_bytes: stats.memory_bytes,
                        net_bytes_in: stats.net_bytes_in,
                        net_bytes_out: stats.net_bytes_out,
                    };
                }
                None => return ControlFlow::Break(()),
            }
            state.record_usage(stats.cpu_percent, stats.memory_bytes);
        }

        let cpu_limit = limits.cpu * 100.0;
        if stats.cpu_percent > cpu_limit {
            tracing::warn!(sandbox = id, usage = stats.cpu_percent, limit = cpu_limit, "CPU limit exceeded");
            self.events.publish(EngineEvent::ResourceLimitExceeded {
                sandbox_id: id.to_string(),
                category: ResourceCategory::Cpu,
                usage: stats.cpu_percent,
                limit: cpu_limit,
            });
        }

        let memory_limit = limits.memory_bytes();
        if stats.memory_bytes > memory_limit {
            tracing::warn!(sandbox = id, usage = stats.memory_bytes, limit = memory_limit, "memory limit exceeded");
            self.events.publish(EngineEvent::ResourceLimitExceeded {
                sandbox_id: id.to_string(),
                category: ResourceCategory::Memory,
                usage: stats.memory_bytes as f64,
                limit: memory_limit as f64,
            });
        }

        ControlFlow::Continue(())
    }

    fn mark_exited(&self, id: &str, error: String) {
        {
            let mut state = self.state.write();
            let Some(entry) = state.sandboxes.get_mut(id) else {
                return;
            };
            entry.state.status = SandboxStatus::Exited;
            entry.state.end_time = Some(Utc::now());
            entry.state.last_error = Some(error.clone());
            entry.stop_monitor();
        }

        tracing::warn!(sandbox = id, error = %error, "sandbox container disappeared");
        self.events.publish(EngineEvent::SandboxExited {
            sandbox_id: id.to_string(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::events::EventBus;
    use crate::ledger::ResourceLedger;
    use crate::manager::types::{ResourceLimits, SandboxConfig};
    use crate::runtime::{ContainerStats, MockRuntime};

    fn setup() -> (Arc<MockRuntime>, Arc<EventBus>, Arc<SandboxManager>) {
        let runtime = Arc::new(MockRuntime::new());
        let events = Arc::new(EventBus::new());
        let manager = Arc::new(SandboxManager::new(
            RuntimeConfig::default(),
            Duration::from_secs(5),
            runtime.clone(),
            Arc::new(ResourceLedger::new(4.0, 4096)),
            events.clone(),
        ));
        (runtime, events, manager)
    }

    #[tokio::test]
    async fn test_limit_breach_is_advisory() {
        let (runtime, events, manager) = setup();
        let config = SandboxConfig::new("sb-1", "alpine")
            .with_resources(ResourceLimits::default().with_cpu(0.5).with_memory_mb(128));
        manager.create_sandbox(config).await.unwrap();
        let handle = manager.container_handle("sb-1").unwrap();
        let mut rx = events.subscribe();

        runtime.set_stats(
            &handle,
            ContainerStats {
                cpu_percent: 75.0,
                memory_bytes: 200 * 1024 * 1024,
                ..Default::default()
            },
        );
        assert!(manager.poll_usage("sb-1", &handle).await.is_continue());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::ResourceLimitExceeded { category: ResourceCategory::Cpu, .. }));
        assert!(matches!(second, EngineEvent::ResourceLimitExceeded { category: ResourceCategory::Memory, .. }));

        let state = manager.get_sandbox("sb-1").unwrap();
        assert_eq!(state.status, SandboxStatus::Running);
        assert_eq!(state.usage.cpu_percent, 75.0);
        assert_eq!(manager.get_metrics().peak_cpu_percent, 75.0);
    }

    #[tokio::test]
    async fn test_vanished_container_marks_exited() {
        let (runtime, events, manager) = setup();
        manager.create_sandbox(SandboxConfig::new("sb-1", "alpine")).await.unwrap();
        let handle = manager.container_handle("sb-1").unwrap();
        let mut rx = events.subscribe();

        runtime.vanish(&handle);
        assert!(manager.poll_usage("sb-1", &handle).await.is_break());

        let state = manager.get_sandbox("sb-1").unwrap();
        assert_eq!(state.status, SandboxStatus::Exited);
        assert!(state.last_error.unwrap().contains("No such container"));
        assert_eq!(rx.recv().await.unwrap().name(), "sandbox_exited");

        // cleanup tolerates the missing container and releases resources
        manager.cleanup_sandbox("sb-1").await;
        assert_eq!(manager.ledger().utilization().active_allocations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_polls_on_interval() {
        let (runtime, events, manager) = setup();
        runtime.set_default_stats(ContainerStats {
            memory_bytes: 1024 * 1024 * 1024,
            ..Default::default()
        });
        let mut rx = events.subscribe();
        manager.create_sandbox(SandboxConfig::new("sb-1", "alpine")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"resource_limit_exceeded"));
    }
}
