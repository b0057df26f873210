//! Registry state for the sandbox manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::ledger::{Allocation, LedgerUtilization};
use crate::manager::types::{SandboxConfig, SandboxState, SandboxStatus};

/// One registered sandbox.
#[derive(Debug)]
pub struct SandboxEntry {
    pub config: Arc<SandboxConfig>,
    pub state: SandboxState,
    /// Admitted resources; taken exactly once when released.
    pub allocation: Option<Allocation>,
    /// Resource monitor; taken exactly once when cancelled.
    pub monitor: Option<CancellationToken>,
}

impl SandboxEntry {
    pub fn new(config: Arc<SandboxConfig>, allocation: Allocation) -> Self {
        Self {
            state: SandboxState::creating(config.id.clone()),
            config,
            allocation: Some(allocation),
            monitor: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.status,
            SandboxStatus::Creating | SandboxStatus::Running | SandboxStatus::Paused
        )
    }

    pub fn stop_monitor(&mut self) {
        if let Some(token) = self.monitor.take() {
            token.cancel();
        }
    }
}

/// Lifetime counters.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub created: u64,
    pub failed: u64,
    pub completed_executions: u64,
    pub total_execution_ms: u64,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
}

/// Internal state for the sandbox manager.
#[derive(Debug, Default)]
pub struct ManagerState {
    pub sandboxes: HashMap<String, SandboxEntry>,
    pub counters: Counters,
}

impl ManagerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_usage(&mut self, cpu_percent: f64, memory_bytes: u64) {
        let c = &mut self.counters;
        c.peak_cpu_percent = c.peak_cpu_percent.max(cpu_percent);
        c.peak_memory_bytes = c.peak_memory_bytes.max(memory_bytes);
    }

    pub fn metrics(&self, ledger: LedgerUtilization) -> SandboxMetrics {
        let c = &self.counters;
        SandboxMetrics {
            total_sandboxes: c.created,
            active_sandboxes: self.sandboxes.values().filter(|e| e.is_active()).count(),
            failed_sandboxes: c.failed,
            completed_executions: c.completed_executions,
            average_execution_ms: if c.completed_executions == 0 {
                0.0
            } else {
                c.total_execution_ms as f64 / c.completed_executions as f64
            },
            peak_cpu_percent: c.peak_cpu_percent,
            peak_memory_bytes: c.peak_memory_bytes,
            ledger,
        }
    }
}

/// Snapshot returned by [`SandboxManager::get_metrics`](crate::manager::SandboxManager::get_metrics).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMetrics {
    /// Sandboxes admitted since start.
    pub total_sandboxes: u64,
    pub active_sandboxes: usize,
    pub failed_sandboxes: u64,
    pub completed_executions: u64,
    pub average_execution_ms: f64,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub ledger: LedgerUtilization,
}

/// Async mutex per sandbox id.
#[derive(Debug, Default)]
pub struct IdLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdLocks {
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(IdLocks::default());
        let guard = locks.lock("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different id is not blocked
        let _b = locks.lock("b").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = IdLocks::default();
        let held = locks.lock("a").await;
        drop(locks.lock("b").await);
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_metrics_average() {
        let mut state = ManagerState::new();
        state.counters.completed_executions = 4;
        state.counters.total_execution_ms = 1000;
        state.record_usage(50.0, 10);
        state.record_usage(20.0, 30);

        let ledger = crate::ledger::ResourceLedger::new(4.0, 1024).utilization();
        let metrics = state.metrics(ledger);
        assert_eq!(metrics.average_execution_ms, 250.0);
        assert_eq!(metrics.peak_cpu_percent, 50.0);
        assert_eq!(metrics.peak_memory_bytes, 30);
    }
}
