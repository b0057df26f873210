//! Security events and the bounded in-memory audit log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Violation,
    Audit,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What the engine did about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Blocked,
    Logged,
    Alerted,
    Isolated,
}

macro_rules! lowercase_display {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let value = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
                f.write_str(value.as_str().unwrap_or_default())
            }
        })*
    };
}

lowercase_display!(EventType, Severity, EventAction);

/// One recorded security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub category: String,
    pub sandbox_id: String,
    pub description: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub policy_id: Option<String>,
    pub action: EventAction,
}

/// An event before it is stamped with an id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub severity: Severity,
    pub category: String,
    pub sandbox_id: String,
    pub description: String,
    pub details: serde_json::Value,
    pub policy_id: Option<String>,
    pub action: EventAction,
}

impl EventDraft {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        category: impl Into<String>,
        sandbox_id: impl Into<String>,
        description: impl Into<String>,
        action: EventAction,
    ) -> Self {
        Self {
            event_type,
            severity,
            category: category.into(),
            sandbox_id: sandbox_id.into(),
            description: description.into(),
            details: serde_json::Value::Null,
            policy_id: None,
            action,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn stamp(self) -> SecurityEvent {
        SecurityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: self.event_type,
            severity: self.severity,
            category: self.category,
            sandbox_id: self.sandbox_id,
            description: self.description,
            details: self.details,
            policy_id: self.policy_id,
            action: self.action,
        }
    }
}

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub sandbox_id: Option<String>,
    pub event_type: Option<EventType>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &SecurityEvent) -> bool {
        self.sandbox_id.as_deref().map_or(true, |id| event.sandbox_id == id)
            && self.event_type.map_or(true, |t| event.event_type == t)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.since.map_or(true, |t| event.timestamp >= t)
    }
}

/// Bounded log of security events, oldest evicted first.
#[derive(Debug)]
pub struct AuditLog {
    events: RwLock<VecDeque<SecurityEvent>>,
    total_count: RwLock<usize>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            total_count: RwLock::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: SecurityEvent) {
        let mut events = self.events.write();
        events.push_back(event);
        *self.total_count.write() += 1;

        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Matching events, oldest first. A limit keeps the newest `limit`.
    pub fn query(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        let events = self.events.read();
        let mut matched: Vec<_> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    /// The newest `n` events for a sandbox that pass `keep`, oldest first.
    pub fn recent_for(
        &self,
        sandbox_id: &str,
        n: usize,
        keep: impl Fn(&SecurityEvent) -> bool,
    ) -> Vec<SecurityEvent> {
        let mut events: Vec<SecurityEvent> = self
            .query(&EventFilter {
                sandbox_id: Some(sandbox_id.to_string()),
                ..Default::default()
            })
            .into_iter()
            .filter(|e| keep(e))
            .collect();
        let excess = events.len().saturating_sub(n);
        events.drain(..excess);
        events
    }

    /// Events currently retained.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events ever recorded, including evicted ones.
    pub fn total_count(&self) -> usize {
        *self.total_count.read()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every retained event of a sandbox.
    pub fn remove_sandbox(&self, sandbox_id: &str) -> usize {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.sandbox_id != sandbox_id);
        before - events.len()
    }
}
