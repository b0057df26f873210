//! System-wide CPU/memory accounting used for admission control.

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::SandboxError;

/// Resources reserved for one sandbox.
///
/// Returned by [`ResourceLedger::allocate`] and handed back to
/// [`ResourceLedger::release`]; it is not `Clone`, so a reservation can only
/// be released once.
#[derive(Debug, PartialEq)]
pub struct Allocation {
    pub cpu: f64,
    pub memory_mb: u64,
}

/// Snapshot of ledger utilization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerUtilization {
    pub total_cpu: f64,
    pub allocated_cpu: f64,
    pub available_cpu: f64,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub available_memory_mb: u64,
    pub active_allocations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cpu: f64,
    memory_mb: u64,
    allocations: usize,
}

/// Allocated vs. available capacity across all sandboxes.
///
/// Check-and-reserve happens under one lock, so the allocated totals can
/// never exceed the system totals even under concurrent admission.
#[derive(Debug)]
pub struct ResourceLedger {
    total_cpu: f64,
    total_memory_mb: u64,
    allocated: Mutex<Counters>,
}

/// Float slack so that repeated add/subtract of fractional cores does not
/// reject an allocation that fits exactly.
const CPU_EPSILON: f64 = 1e-9;

impl ResourceLedger {
    pub fn new(total_cpu: f64, total_memory_mb: u64) -> Self {
        Self {
            total_cpu,
            total_memory_mb,
            allocated: Mutex::new(Counters::default()),
        }
    }

    /// Whether `cpu` cores and `memory_mb` would currently fit.
    pub fn can_allocate(&self, cpu: f64, memory_mb: u64) -> bool {
        let counters = self.allocated.lock();
        self.fits(&counters, cpu, memory_mb)
    }

    /// Reserve resources, failing with `ResourceExhaustion` when they do not fit.
    pub fn allocate(&self, cpu: f64, memory_mb: u64) -> Result<Allocation, SandboxError> {
        let mut counters = self.allocated.lock();
        if !self.fits(&counters, cpu, memory_mb) {
            return Err(SandboxError::ResourceExhaustion(format!(
                "requested {:.2} CPU / {} MB, available {:.2} CPU / {} MB",
                cpu,
                memory_mb,
                (self.total_cpu - counters.cpu).max(0.0),
                self.total_memory_mb.saturating_sub(counters.memory_mb),
            )));
        }

        counters.cpu += cpu;
        counters.memory_mb += memory_mb;
        counters.allocations += 1;

        tracing::debug!(
            "Ledger allocate {:.2} CPU / {} MB (now {:.2} / {} MB)",
            cpu,
            memory_mb,
            counters.cpu,
            counters.memory_mb
        );

        Ok(Allocation { cpu, memory_mb })
    }

    /// Return a reservation to the pool.
    pub fn release(&self, allocation: Allocation) {
        let mut counters = self.allocated.lock();
        counters.cpu = (counters.cpu - allocation.cpu).max(0.0);
        if counters.cpu < CPU_EPSILON {
            counters.cpu = 0.0;
        }
        counters.memory_mb = counters.memory_mb.saturating_sub(allocation.memory_mb);
        counters.allocations = counters.allocations.saturating_sub(1);

        tracing::debug!(
            "Ledger release {:.2} CPU / {} MB (now {:.2} / {} MB)",
            allocation.cpu,
            allocation.memory_mb,
            counters.cpu,
            counters.memory_mb
        );
    }

    pub fn utilization(&self) -> LedgerUtilization {
        let counters = self.allocated.lock();
        LedgerUtilization {
            total_cpu: self.total_cpu,
            allocated_cpu: counters.cpu,
            available_cpu: (self.total_cpu - counters.cpu).max(0.0),
            total_memory_mb: self.total_memory_mb,
            allocated_memory_mb: counters.memory_mb,
            available_memory_mb: self.total_memory_mb.saturating_sub(counters.memory_mb),
            active_allocations: counters.allocations,
        }
    }

    fn fits(&self, counters: &Counters, cpu: f64, memory_mb: u64) -> bool {
        counters.cpu + cpu <= self.total_cpu + CPU_EPSILON
            && counters.memory_mb.saturating_add(memory_mb) <= self.total_memory_mb
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let ledger = ResourceLedger::new(4.0, 4096);
        let a = ledger.allocate(1.5, 1024).unwrap();
        let b = ledger.allocate(2.5, 2048).unwrap();

        let usage = ledger.utilization();
        assert_eq!(usage.allocated_cpu, 4.0);
        assert_eq!(usage.available_memory_mb, 1024);
        assert_eq!(usage.active_allocations, 2);

        ledger.release(a);
        ledger.release(b);
        let usage = ledger.utilization();
        assert_eq!(usage.allocated_cpu, 0.0);
        assert_eq!(usage.allocated_memory_mb, 0);
        assert_eq!(usage.active_allocations, 0);
    }

    #[test]
    fn test_rejects_over_capacity() {
        let ledger = ResourceLedger::new(2.0, 1024);
        assert!(!ledger.can_allocate(2.5, 128));
        assert!(!ledger.can_allocate(1.0, 2048));

        let _held = ledger.allocate(1.0, 512).unwrap();
        let err = ledger.allocate(1.5, 256).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExhaustion(_)));
        assert_eq!(ledger.utilization().allocated_cpu, 1.0);
    }

    #[test]
    fn test_fractional_cpu_fills_exactly() {
        let ledger = ResourceLedger::new(1.0, 1024);
        let parts: Vec<_> = (0..10).map(|_| ledger.allocate(0.1, 64).unwrap()).collect();
        assert!(!ledger.can_allocate(0.1, 64));
        for p in parts {
            ledger.release(p);
        }
        assert_eq!(ledger.utilization().allocated_cpu, 0.0);
    }

    #[test]
    fn test_concurrent_admission_never_overcommits() {
        let ledger = Arc::new(ResourceLedger::new(8.0, 8192));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.allocate(1.0, 512).ok())
            })
            .collect();

        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(granted.len(), 8);
        assert_eq!(ledger.utilization().allocated_cpu, 8.0);

        for a in granted {
            ledger.release(a);
        }
        assert_eq!(ledger.utilization().allocated_memory_mb, 0);
    }
}
