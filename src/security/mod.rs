//! Security profiles, operation validation, auditing and compliance.

pub mod audit;
pub mod capability;
pub mod compliance;
pub mod filesystem;
pub mod profile;
pub mod report;
pub mod validator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::SecuritySettings;
use crate::error::{ConfigError, SandboxError};
use crate::events::{EngineEvent, EventBus};
use crate::store::PolicyStore;

pub use audit::{AuditLog, EventAction, EventDraft, EventFilter, EventType, SecurityEvent, Severity};
pub use capability::Capability;
pub use compliance::ComplianceReport;
pub use profile::{
    builtin_profiles, validate_profile, CapabilityGrant, ProfileTemplate, RiskLevel, SecurityConstraint,
    SecurityProfile,
};
pub use report::ReportFormat;
pub use validator::{ExecutionContext, ValidationResult, Violation, ViolationCategory};

/// Policy id recorded for operations on sandboxes without a profile.
pub const DEFAULT_DENY_POLICY: &str = "default-deny";

/// Category of the warnings a failed compliance pass records.
pub const COMPLIANCE_CATEGORY: &str = "compliance";

#[derive(Debug)]
struct Binding {
    profile_id: String,
    monitor: Option<CancellationToken>,
    isolation_triggered: bool,
}

/// Owns the profile registry, sandbox bindings and the audit trail.
pub struct SecurityManager {
    settings: SecuritySettings,
    compliance_interval: Duration,
    store: Arc<PolicyStore>,
    events: Arc<EventBus>,
    audit: AuditLog,
    profiles: RwLock<HashMap<String, SecurityProfile>>,
    bindings: RwLock<HashMap<String, Binding>>,
}

impl SecurityManager {
    pub fn new(
        settings: SecuritySettings,
        compliance_interval: Duration,
        store: Arc<PolicyStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let profiles = builtin_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        Self {
            audit: AuditLog::new(settings.audit_capacity),
            settings,
            compliance_interval,
            store,
            events,
            profiles: RwLock::new(profiles),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Load custom profiles persisted by earlier runs.
    pub async fn load_persisted_profiles(&self) -> Result<usize, SandboxError> {
        let stored = self.store.load_profiles().await?;
        let mut loaded = 0;
        for profile in stored {
            if profile.is_builtin() {
                tracing::warn!(profile = %profile.id, "ignoring stored profile shadowing a built-in");
                continue;
            }
            if let Err(e) = validate_profile(&profile) {
                tracing::warn!(profile = %profile.id, error = %e, "ignoring invalid stored profile");
                continue;
            }
            self.profiles.write().insert(profile.id.clone(), profile);
            loaded += 1;
        }
        tracing::debug!(loaded, "custom profiles loaded");
        Ok(loaded)
    }

    /// Add a profile to the registry. Built-ins cannot be replaced.
    pub fn register_profile(&self, profile: SecurityProfile) -> Result<(), SandboxError> {
        if profile.is_builtin() {
            return Err(ConfigError::InvalidProfile {
                profile: profile.id,
                reason: "built-in profiles cannot be replaced".to_string(),
            }
            .into());
        }
        validate_profile(&profile)?;
        self.profiles.write().insert(profile.id.clone(), profile);
        Ok(())
    }

    /// Create, persist and register a custom profile.
    pub async fn create_custom_profile(&self, template: ProfileTemplate) -> Result<SecurityProfile, SandboxError> {
        let profile = template.into_profile(format!("custom-{}", uuid::Uuid::new_v4()));
        validate_profile(&profile)?;
        self.store.save_profile(&profile).await?;
        self.profiles.write().insert(profile.id.clone(), profile.clone());

        tracing::info!(profile = %profile.id, name = %profile.name, "custom profile created");
        Ok(profile)
    }

    /// Remove a custom profile that no sandbox is bound to.
    pub async fn remove_profile(&self, profile_id: &str) -> Result<(), SandboxError> {
        if profile::BUILTIN_PROFILES.contains(&profile_id) {
            return Err(ConfigError::InvalidProfile {
                profile: profile_id.to_string(),
                reason: "built-in profiles cannot be removed".to_string(),
            }
            .into());
        }
        if !self.profiles.read().contains_key(profile_id) {
            return Err(SandboxError::NotFound(format!("profile {}", profile_id)));
        }
        if self.bindings.read().values().any(|b| b.profile_id == profile_id) {
            return Err(SandboxError::InvalidState(format!(
                "profile {} is bound to a sandbox",
                profile_id
            )));
        }

        self.store.delete_profile(profile_id).await?;
        self.profiles.write().remove(profile_id);
        Ok(())
    }

    pub fn get_profile(&self, profile_id: &str) -> Option<SecurityProfile> {
        self.profiles.read().get(profile_id).cloned()
    }

    /// All profiles, built-ins first, then by id.
    pub fn list_profiles(&self) -> Vec<SecurityProfile> {
        let mut profiles: Vec<_> = self.profiles.read().values().cloned().collect();
        profiles.sort_by(|a, b| (!a.is_builtin(), &a.id).cmp(&(!b.is_builtin(), &b.id)));
        profiles
    }

    /// Profile bound to a sandbox.
    pub fn bound_profile(&self, sandbox_id: &str) -> Option<String> {
        self.bindings.read().get(sandbox_id).map(|b| b.profile_id.clone())
    }

    /// Bind a profile to a sandbox and start compliance monitoring.
    /// Re-applying replaces the binding and its monitor.
    pub fn apply_profile_to_sandbox(self: &Arc<Self>, sandbox_id: &str, profile_id: &str) -> Result<(), SandboxError> {
        let profile = self
            .get_profile(profile_id)
            .ok_or_else(|| SandboxError::NotFound(format!("profile {}", profile_id)))?;
        validate_profile(&profile)?;

        let token = CancellationToken::new();
        let previous = self.bindings.write().insert(
            sandbox_id.to_string(),
            Binding {
                profile_id: profile_id.to_string(),
                monitor: Some(token.clone()),
                isolation_triggered: false,
            },
        );
        if let Some(token) = previous.and_then(|mut b| b.monitor.take()) {
            token.cancel();
        }

        self.spawn_compliance_monitor(sandbox_id.to_string(), token);

        tracing::info!(sandbox = sandbox_id, profile = profile_id, "security profile applied");
        self.events.publish(EngineEvent::ProfileApplied {
            sandbox_id: sandbox_id.to_string(),
            profile_id: profile_id.to_string(),
        });
        Ok(())
    }

    fn spawn_compliance_monitor(self: &Arc<Self>, sandbox_id: String, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        let interval = self.compliance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        if manager.check_compliance(&sandbox_id).await.is_none() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(sandbox = %sandbox_id, "compliance monitor stopped");
        });
    }

    /// Drop a sandbox's binding and stop its compliance monitor.
    pub fn release_sandbox(&self, sandbox_id: &str) {
        let binding = self.bindings.write().remove(sandbox_id);
        if let Some(token) = binding.and_then(|mut b| b.monitor.take()) {
            token.cancel();
            tracing::debug!(sandbox = sandbox_id, "security binding released");
        }
    }

    /// Validate an operation against the sandbox's profile. Every call is
    /// audited; violations are returned, not raised.
    pub async fn validate_execution(
        &self,
        sandbox_id: &str,
        operation: &str,
        context: &ExecutionContext,
    ) -> ValidationResult {
        let bound = self
            .bound_profile(sandbox_id)
            .and_then(|id| self.get_profile(&id));

        let (policy_id, result) = match bound {
            Some(profile) => {
                let result = validator::validate(&profile, operation, context);
                (profile.id, result)
            }
            None => (
                DEFAULT_DENY_POLICY.to_string(),
                ValidationResult::from_violations(vec![Violation {
                    category: ViolationCategory::Capability,
                    rule: DEFAULT_DENY_POLICY.to_string(),
                    message: format!("sandbox {} has no security profile", sandbox_id),
                    severity: Severity::High,
                    enforced: true,
                }]),
            ),
        };

        let details = serde_json::json!({
            "operation": operation,
            "context": context,
            "violations": result.violations,
        });

        let draft = if result.violations.is_empty() {
            let category = capability::capability_for(operation)
                .map(|c| c.as_str())
                .unwrap_or("operation");
            EventDraft::new(
                EventType::Audit,
                Severity::Low,
                category,
                sandbox_id,
                format!("operation '{}' allowed", operation),
                EventAction::Logged,
            )
        } else {
            let first = &result.violations[0];
            EventDraft::new(
                EventType::Violation,
                result.max_severity().unwrap_or(Severity::Medium),
                first.category.as_str(),
                sandbox_id,
                first.message.clone(),
                if result.is_enforced() {
                    EventAction::Blocked
                } else {
                    EventAction::Logged
                },
            )
        };

        self.audit_event(draft.with_details(details).with_policy(policy_id)).await;
        result
    }

    /// Record an event: ring buffer, durable store, bus.
    pub async fn audit_event(&self, mut draft: EventDraft) -> SecurityEvent {
        if draft.policy_id.is_none() {
            draft.policy_id = Some(
                self.bound_profile(&draft.sandbox_id)
                    .unwrap_or_else(|| DEFAULT_DENY_POLICY.to_string()),
            );
        }
        let event = draft.stamp();
        self.audit.push(event.clone());

        if let Err(e) = self.store.save_event(&event).await {
            tracing::warn!(event = %event.id, error = %e, "failed to persist security event");
        }

        match event.event_type {
            EventType::Violation => tracing::warn!(
                sandbox = %event.sandbox_id,
                severity = %event.severity,
                category = %event.category,
                "{}",
                event.description
            ),
            _ => tracing::debug!(sandbox = %event.sandbox_id, category = %event.category, "{}", event.description),
        }

        self.events.publish(EngineEvent::SecurityEvent(event.clone()));
        if event.severity == Severity::Critical {
            self.events
                .publish(EngineEvent::CriticalSecurityEvent(event.clone()));
        }
        event
    }

    /// The most recent events the score is computed over. Warnings from
    /// earlier compliance passes are left out so a failing sandbox does not
    /// dilute its own violation ratio.
    fn window_events(&self, sandbox_id: &str) -> Vec<SecurityEvent> {
        self.audit
            .recent_for(sandbox_id, self.settings.compliance_window, |e| {
                !(e.event_type == EventType::Warning && e.category == COMPLIANCE_CATEGORY)
            })
    }

    /// Compliance over the recent window, without side effects.
    pub fn get_compliance_report(&self, sandbox_id: &str) -> Option<ComplianceReport> {
        let profile_id = self.bound_profile(sandbox_id)?;
        Some(ComplianceReport::compute(
            sandbox_id,
            &profile_id,
            self.settings.compliance_window,
            self.settings.compliance_threshold,
            &self.window_events(sandbox_id),
        ))
    }

    /// One compliance pass. Warns below the threshold and triggers isolation
    /// once when violations exceed the configured count. `None` when the
    /// sandbox has no binding.
    pub async fn check_compliance(&self, sandbox_id: &str) -> Option<ComplianceReport> {
        let report = self.get_compliance_report(sandbox_id)?;

        if !report.compliant {
            self.audit_event(
                EventDraft::new(
                    EventType::Warning,
                    Severity::Medium,
                    COMPLIANCE_CATEGORY,
                    sandbox_id,
                    format!("compliance score {:.1} is below {:.1}", report.score, self.settings.compliance_threshold),
                    EventAction::Alerted,
                )
                .with_details(serde_json::json!({
                    "score": report.score,
                    "violations": report.violations,
                    "totalEvents": report.total_events,
                }))
                .with_policy(report.profile_id.clone()),
            )
            .await;
        }

        if report.violations > self.settings.isolation_violation_threshold {
            let first_time = {
                let mut bindings = self.bindings.write();
                match bindings.get_mut(sandbox_id) {
                    Some(b) if !b.isolation_triggered => {
                        b.isolation_triggered = true;
                        true
                    }
                    _ => false,
                }
            };
            if first_time {
                tracing::warn!(sandbox = sandbox_id, violations = report.violations, "isolation triggered");
                self.events.publish(EngineEvent::SandboxIsolationTriggered {
                    sandbox_id: sandbox_id.to_string(),
                    profile_id: report.profile_id.clone(),
                    violations: report.violations,
                    compliance_score: report.score,
                });
            }
        }

        Some(report)
    }

    /// Retained events, oldest first, optionally for one sandbox.
    pub fn get_events(&self, sandbox_id: Option<&str>, limit: Option<usize>) -> Vec<SecurityEvent> {
        self.audit.query(&EventFilter {
            sandbox_id: sandbox_id.map(str::to_string),
            limit,
            ..Default::default()
        })
    }

    pub fn query_events(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        self.audit.query(filter)
    }

    pub fn export_audit_report(&self, sandbox_id: Option<&str>, format: ReportFormat) -> Result<String, SandboxError> {
        report::export(&self.get_events(sandbox_id, None), sandbox_id, format)
    }

    /// Cancel every compliance monitor and drop all bindings.
    pub fn shutdown(&self) {
        let bindings: Vec<Binding> = self.bindings.write().drain().map(|(_, b)| b).collect();
        for mut binding in bindings {
            if let Some(token) = binding.monitor.take() {
                token.cancel();
            }
        }
    }
}
