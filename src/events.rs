//! Engine notifications and the observer bus that delivers them.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::security::SecurityEvent;

/// Resource dimension that crossed its configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Cpu,
    Memory,
}

/// A notification emitted by one of the managers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SandboxCreating {
        sandbox_id: String,
    },
    SandboxCreated {
        sandbox_id: String,
        container_id: String,
    },
    SandboxFailed {
        sandbox_id: String,
        error: String,
    },
    ResourceLimitExceeded {
        sandbox_id: String,
        category: ResourceCategory,
        usage: f64,
        limit: f64,
    },
    SandboxExited {
        sandbox_id: String,
        error: String,
    },
    SandboxPaused {
        sandbox_id: String,
    },
    SandboxResumed {
        sandbox_id: String,
    },
    SandboxCleanup {
        sandbox_id: String,
    },
    NetworkCreated {
        sandbox_id: String,
        network_id: String,
        subnet: String,
    },
    NetworkConnected {
        sandbox_id: String,
        network_id: String,
    },
    NetworkDisconnected {
        sandbox_id: String,
        network_id: String,
    },
    NetworkRemoved {
        sandbox_id: String,
        network_id: String,
    },
    PolicyApplied {
        sandbox_id: String,
        policy_id: String,
        rule_count: usize,
    },
    ProfileApplied {
        sandbox_id: String,
        profile_id: String,
    },
    SecurityEvent(SecurityEvent),
    CriticalSecurityEvent(SecurityEvent),
    SandboxIsolationTriggered {
        sandbox_id: String,
        profile_id: String,
        violations: usize,
        compliance_score: f64,
    },
}

impl EngineEvent {
    /// Stable event name, as exposed to callers.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::SandboxCreating { .. } => "sandbox_creating",
            EngineEvent::SandboxCreated { .. } => "sandbox_created",
            EngineEvent::SandboxFailed { .. } => "sandbox_failed",
            EngineEvent::ResourceLimitExceeded { .. } => "resource_limit_exceeded",
            EngineEvent::SandboxExited { .. } => "sandbox_exited",
            EngineEvent::SandboxPaused { .. } => "sandbox_paused",
            EngineEvent::SandboxResumed { .. } => "sandbox_resumed",
            EngineEvent::SandboxCleanup { .. } => "sandbox_cleanup",
            EngineEvent::NetworkCreated { .. } => "network_created",
            EngineEvent::NetworkConnected { .. } => "network_connected",
            EngineEvent::NetworkDisconnected { .. } => "network_disconnected",
            EngineEvent::NetworkRemoved { .. } => "network_removed",
            EngineEvent::PolicyApplied { .. } => "policy_applied",
            EngineEvent::ProfileApplied { .. } => "profile_applied",
            EngineEvent::SecurityEvent(_) => "security_event",
            EngineEvent::CriticalSecurityEvent(_) => "critical_security_event",
            EngineEvent::SandboxIsolationTriggered { .. } => "sandbox_isolation_triggered",
        }
    }

    /// The sandbox the event concerns.
    pub fn sandbox_id(&self) -> &str {
        match self {
            EngineEvent::SandboxCreating { sandbox_id }
            | EngineEvent::SandboxCreated { sandbox_id, .. }
            | EngineEvent::SandboxFailed { sandbox_id, .. }
            | EngineEvent::ResourceLimitExceeded { sandbox_id, .. }
            | EngineEvent::SandboxExited { sandbox_id, .. }
            | EngineEvent::SandboxPaused { sandbox_id }
            | EngineEvent::SandboxResumed { sandbox_id }
            | EngineEvent::SandboxCleanup { sandbox_id }
            | EngineEvent::NetworkCreated { sandbox_id, .. }
            | EngineEvent::NetworkConnected { sandbox_id, .. }
            | EngineEvent::NetworkDisconnected { sandbox_id, .. }
            | EngineEvent::NetworkRemoved { sandbox_id, .. }
            | EngineEvent::PolicyApplied { sandbox_id, .. }
            | EngineEvent::ProfileApplied { sandbox_id, .. }
            | EngineEvent::SandboxIsolationTriggered { sandbox_id, .. } => sandbox_id,
            EngineEvent::SecurityEvent(event) | EngineEvent::CriticalSecurityEvent(event) => {
                &event.sandbox_id
            }
        }
    }
}

/// Fan-out bus for engine events.
///
/// Every subscriber gets its own unbounded channel, so a slow reader never
/// causes events to be dropped for it or for anyone else. Receivers that were
/// dropped are pruned on the next publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), sandbox = event.sandbox_id(), "publish");

        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for tx in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    closed = true;
                }
            }
        }

        if closed {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().iter().filter(|tx| !tx.is_closed()).count()
    }
}
