//! Runtime validation of a requested operation against a profile.

use serde::{Deserialize, Serialize};

use crate::network::policy::{host_matches, is_loopback_host};
use crate::security::audit::Severity;
use crate::security::capability::capability_for;
use crate::security::filesystem::{check_path, PathDecision};
use crate::security::profile::{ConstraintLimit, ConstraintType, SecurityConstraint, SecurityProfile};

/// What the operation is about to touch. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    pub path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub process_count: Option<u32>,
    pub memory_usage_mb: Option<u64>,
    pub cpu_cores: Option<f64>,
    pub open_files: Option<u32>,
    pub elapsed_secs: Option<u64>,
}

impl ExecutionContext {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn host(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationCategory {
    Filesystem,
    Network,
    Resource,
    Capability,
}

impl ViolationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCategory::Filesystem => "filesystem",
            ViolationCategory::Network => "network",
            ViolationCategory::Resource => "resource",
            ViolationCategory::Capability => "capability",
        }
    }
}

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub category: ViolationCategory,
    /// Name of the rule or constraint that was broken.
    pub rule: String,
    pub message: String,
    pub severity: Severity,
    /// Enforced violations block the operation; others are only logged.
    pub enforced: bool,
}

impl Violation {
    fn enforced(
        category: ViolationCategory,
        rule: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            rule: rule.into(),
            message: message.into(),
            severity,
            enforced: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// `allowed` holds exactly when nothing was violated, enforced or not.
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
        }
    }

    /// Whether any violation comes from an enforcing rule. Only those are
    /// audited as blocked.
    pub fn is_enforced(&self) -> bool {
        self.violations.iter().any(|v| v.enforced)
    }

    /// Highest severity among the violations.
    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

/// Validate `operation` with `context` against `profile`.
pub fn validate(profile: &SecurityProfile, operation: &str, context: &ExecutionContext) -> ValidationResult {
    let mut violations = Vec::new();

    if let Some(ref path) = context.path {
        check_filesystem(profile, path, &mut violations);
    }
    if let Some(ref host) = context.host {
        check_network(profile, host, context.port, &mut violations);
    }
    check_resources(profile, context, &mut violations);
    check_capability(profile, operation, &mut violations);
    for constraint in &profile.constraints {
        if let Some(v) = check_constraint(constraint, context) {
            violations.push(v);
        }
    }

    ValidationResult::from_violations(violations)
}

fn check_filesystem(profile: &SecurityProfile, path: &str, out: &mut Vec<Violation>) {
    match check_path(path, &profile.allowed_paths, &profile.blocked_paths) {
        PathDecision::Allowed => {}
        PathDecision::Blocked(prefix) => out.push(Violation::enforced(
            ViolationCategory::Filesystem,
            "blocked_path",
            Severity::High,
            format!("access to {} is blocked by {}", path, prefix),
        )),
        PathDecision::NotAllowed => out.push(Violation::enforced(
            ViolationCategory::Filesystem,
            "allowed_paths",
            Severity::Medium,
            format!("{} is outside the allowed paths", path),
        )),
    }
}

fn check_network(profile: &SecurityProfile, host: &str, port: Option<u16>, out: &mut Vec<Violation>) {
    let Some(ref policy) = profile.network else {
        return;
    };

    let lower = host.to_lowercase();
    if let Some(blocked) = policy
        .blocked_hosts
        .iter()
        .find(|b| lower.contains(&b.to_lowercase()))
    {
        out.push(Violation::enforced(
            ViolationCategory::Network,
            "blocked_hosts",
            Severity::High,
            format!("host {} matches blocked host {}", host, blocked),
        ));
    }

    if is_loopback_host(host) {
        return;
    }

    if !policy.allow_external {
        out.push(Violation::enforced(
            ViolationCategory::Network,
            "allow_external",
            Severity::High,
            format!("external network access to {} is not allowed", host),
        ));
        return;
    }

    if !policy.allowed_hosts.is_empty() && !policy.allowed_hosts.iter().any(|p| host_matches(p, host)) {
        out.push(Violation::enforced(
            ViolationCategory::Network,
            "allowed_hosts",
            Severity::Medium,
            format!("host {} is not in the allowed hosts", host),
        ));
    }

    if let Some(port) = port {
        if !policy.allowed_ports.is_empty() && !policy.allowed_ports.contains(&port) {
            out.push(Violation::enforced(
                ViolationCategory::Network,
                "allowed_ports",
                Severity::Medium,
                format!("port {} is not in the allowed ports", port),
            ));
        }
    }
}

fn check_resources(profile: &SecurityProfile, context: &ExecutionContext, out: &mut Vec<Violation>) {
    let Some(ref limits) = profile.resources else {
        return;
    };

    let mut exceeded = |rule: &str, what: &str, used: f64, limit: f64| {
        if used > limit {
            out.push(Violation::enforced(
                ViolationCategory::Resource,
                rule,
                Severity::Medium,
                format!("{} {} exceeds limit {}", what, used, limit),
            ));
        }
    };

    if let Some(n) = context.process_count {
        exceeded("max_processes", "process count", f64::from(n), f64::from(limits.max_processes));
    }
    if let Some(mb) = context.memory_usage_mb {
        exceeded("max_memory_mb", "memory usage (MB)", mb as f64, limits.max_memory_mb as f64);
    }
    if let Some(cores) = context.cpu_cores {
        exceeded("max_cpu_cores", "CPU cores", cores, limits.max_cpu_cores);
    }
    if let Some(n) = context.open_files {
        exceeded("max_open_files", "open files", f64::from(n), f64::from(limits.max_open_files));
    }
    if let Some(secs) = context.elapsed_secs {
        exceeded(
            "max_execution_time_sec",
            "execution time (s)",
            secs as f64,
            limits.max_execution_time_sec as f64,
        );
    }
}

fn check_capability(profile: &SecurityProfile, operation: &str, out: &mut Vec<Violation>) {
    let Some(capability) = capability_for(operation) else {
        tracing::trace!(operation, "operation maps to no capability");
        return;
    };
    if let Some(grant) = profile.capability(capability) {
        if !grant.allowed {
            out.push(Violation::enforced(
                ViolationCategory::Capability,
                capability.as_str(),
                Severity::High,
                format!("operation '{}' requires {} which the profile denies", operation, capability),
            ));
        }
    }
}

fn check_constraint(constraint: &SecurityConstraint, context: &ExecutionContext) -> Option<Violation> {
    let (category, broken, detail) = match (constraint.constraint_type, constraint.limit) {
        (ConstraintType::Process, ConstraintLimit::Number(limit)) => {
            let used = f64::from(context.process_count?);
            (ViolationCategory::Resource, used > limit, format!("{} processes > {}", used, limit))
        }
        (ConstraintType::Memory, ConstraintLimit::Number(limit)) => {
            let used = context.memory_usage_mb? as f64;
            (ViolationCategory::Resource, used > limit, format!("{} MB > {} MB", used, limit))
        }
        (ConstraintType::Time, ConstraintLimit::Number(limit)) => {
            let used = context.elapsed_secs? as f64;
            (ViolationCategory::Resource, used > limit, format!("{} s > {} s", used, limit))
        }
        (ConstraintType::Network, ConstraintLimit::Flag(false)) => {
            let host = context.host.as_deref()?;
            (
                ViolationCategory::Network,
                !is_loopback_host(host),
                format!("network access to {}", host),
            )
        }
        (ConstraintType::Filesystem, ConstraintLimit::Flag(false)) => {
            let path = context.path.as_deref()?;
            (ViolationCategory::Filesystem, true, format!("filesystem access to {}", path))
        }
        _ => return None,
    };

    broken.then(|| Violation {
        category,
        rule: constraint.id.clone(),
        message: format!("constraint '{}' violated: {}", constraint.name, detail),
        severity: constraint.severity,
        enforced: constraint.enforce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::profile::{builtin_profiles, ResourceSecurityPolicy, RiskLevel};

    fn bare_profile() -> SecurityProfile {
        SecurityProfile {
            id: "custom".to_string(),
            name: "Custom".to_string(),
            risk_level: RiskLevel::Medium,
            capabilities: Vec::new(),
            constraints: Vec::new(),
            allowed_paths: vec!["/tmp".to_string()],
            blocked_paths: vec!["/etc".to_string()],
            network: None,
            resources: None,
        }
    }

    fn profile(id: &str) -> SecurityProfile {
        builtin_profiles().into_iter().find(|p| p.id == id).unwrap()
    }

    #[test]
    fn test_filesystem_checks() {
        let profile = bare_profile();

        let result = validate(&profile, "read_file", &ExecutionContext::path("/etc/passwd"));
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].category, ViolationCategory::Filesystem);

        let result = validate(&profile, "read_file", &ExecutionContext::path("/tmp/x"));
        assert!(result.allowed);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn test_process_limit() {
        let mut profile = bare_profile();
        profile.resources = Some(ResourceSecurityPolicy {
            max_cpu_cores: 1.0,
            max_memory_mb: 256,
            max_execution_time_sec: 60,
            max_processes: 5,
            max_open_files: 64,
        });
        let context = ExecutionContext {
            process_count: Some(6),
            ..Default::default()
        };

        let result = validate(&profile, "exec", &context);
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].category, ViolationCategory::Resource);
        assert_eq!(result.violations[0].rule, "max_processes");
    }

    #[test]
    fn test_network_policy() {
        let high = profile("high-risk");
        let result = validate(&high, "connect", &ExecutionContext::host("example.com", Some(443)));
        assert!(!result.allowed);
        assert!(result
            .violations
            .iter()
            .any(|v| v.category == ViolationCategory::Capability));
        assert!(result.violations.iter().any(|v| v.rule == "allow_external"));

        let medium = profile("medium-risk");
        assert!(validate(&medium, "connect", &ExecutionContext::host("pypi.org", Some(443))).allowed);
        let off_list = validate(&medium, "connect", &ExecutionContext::host("evil.com", Some(443)));
        assert_eq!(off_list.violations[0].rule, "allowed_hosts");
        let metadata = validate(&medium, "connect", &ExecutionContext::host("169.254.169.254", None));
        assert_eq!(metadata.violations[0].rule, "blocked_hosts");
    }

    #[test]
    fn test_loopback_always_reachable() {
        let mut high = profile("high-risk");
        high.capabilities.clear();
        let result = validate(&high, "connect", &ExecutionContext::host("127.0.0.1", Some(8080)));
        assert!(result.allowed, "{:?}", result.violations);
    }

    #[test]
    fn test_unknown_operation_and_capability_are_allowed() {
        let profile = bare_profile();
        assert!(validate(&profile, "teleport", &ExecutionContext::default()).allowed);
        // capability not mentioned in the profile
        assert!(validate(&profile, "pip_install", &ExecutionContext::default()).allowed);
    }

    #[test]
    fn test_unenforced_constraint_still_disallows() {
        let mut profile = bare_profile();
        profile.constraints.push(SecurityConstraint {
            id: "mem".to_string(),
            name: "memory".to_string(),
            constraint_type: ConstraintType::Memory,
            limit: ConstraintLimit::Number(100.0),
            enforce: false,
            severity: Severity::Low,
        });
        let context = ExecutionContext {
            memory_usage_mb: Some(200),
            ..Default::default()
        };

        let result = validate(&profile, "exec", &context);
        assert!(!result.allowed);
        assert!(!result.is_enforced());
        assert_eq!(result.violations.len(), 1);
        assert!(!result.violations[0].enforced);
        assert_eq!(result.max_severity(), Some(Severity::Low));
    }
}
