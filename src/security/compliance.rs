//! Compliance scoring over recent audit events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::security::audit::{EventType, SecurityEvent};

/// `100 - violations / total * 100`, or 100 when there are no events.
pub fn compliance_score(events: &[SecurityEvent]) -> f64 {
    if events.is_empty() {
        return 100.0;
    }
    let violations = count_violations(events);
    100.0 - (violations as f64 / events.len() as f64) * 100.0
}

pub fn count_violations(events: &[SecurityEvent]) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == EventType::Violation)
        .count()
}

/// Compliance state of one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub sandbox_id: String,
    pub profile_id: String,
    pub score: f64,
    pub window: usize,
    pub total_events: usize,
    pub violations: usize,
    pub compliant: bool,
    pub checked_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn compute(
        sandbox_id: &str,
        profile_id: &str,
        window: usize,
        threshold: f64,
        events: &[SecurityEvent],
    ) -> Self {
        let score = compliance_score(events);
        Self {
            sandbox_id: sandbox_id.to_string(),
            profile_id: profile_id.to_string(),
            score,
            window,
            total_events: events.len(),
            violations: count_violations(events),
            compliant: score >= threshold,
            checked_at: Utc::now(),
        }
    }
}
