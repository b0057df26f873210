//! Network policies, rule precedence and in-process traffic evaluation.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SandboxError};
use crate::filter::{FilterAction, FilterRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[default]
    All,
}

impl Protocol {
    fn filter_name(&self) -> Option<String> {
        match self {
            Protocol::Tcp => Some("tcp".to_string()),
            Protocol::Udp => Some("udp".to_string()),
            Protocol::Icmp => Some("icmp".to_string()),
            Protocol::All => None,
        }
    }

    fn covers(&self, other: Protocol) -> bool {
        *self == Protocol::All || *self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One traffic rule.
///
/// Hosts are exact names, IP addresses, CIDR blocks or `*.domain` wildcards.
/// `None` matches any host or port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    pub id: String,
    pub action: RuleAction,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub destination_port: Option<u16>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl NetworkRule {
    pub fn new(id: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: id.into(),
            action,
            protocol: Protocol::All,
            source: None,
            source_port: None,
            destination: None,
            destination_port: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn from_host(mut self, host: impl Into<String>) -> Self {
        self.source = Some(host.into());
        self
    }

    #[must_use]
    pub fn to_host(mut self, host: impl Into<String>) -> Self {
        self.destination = Some(host.into());
        self
    }

    #[must_use]
    pub fn to_port(mut self, port: u16) -> Self {
        self.destination_port = Some(port);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Host fields count 2, ports and a concrete protocol 1 each.
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        score += 2 * u8::from(self.source.is_some());
        score += 2 * u8::from(self.destination.is_some());
        score += u8::from(self.source_port.is_some());
        score += u8::from(self.destination_port.is_some());
        score += u8::from(self.protocol != Protocol::All);
        score
    }

    /// Whether the rule matches traffic with a remote peer.
    ///
    /// Outbound rules match the peer against their destination fields,
    /// inbound rules against their source fields. The sandbox-local side is
    /// always the sandbox itself, so those fields are not consulted here.
    fn matches(&self, direction: Direction, request: &TrafficRequest) -> bool {
        if !self.protocol.covers(request.protocol) {
            return false;
        }
        let (host, port) = match direction {
            Direction::Outbound => (&self.destination, self.destination_port),
            Direction::Inbound => (&self.source, self.source_port),
        };
        if let Some(ref pattern) = host {
            if !host_matches(pattern, &request.host) {
                return false;
            }
        }
        match (port, request.port) {
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Ordered inbound and outbound rules for one sandbox network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub inbound: Vec<NetworkRule>,
    #[serde(default)]
    pub outbound: Vec<NetworkRule>,
    #[serde(default)]
    pub logging_enabled: bool,
    #[serde(default)]
    pub metrics_enabled: bool,
}

impl NetworkPolicy {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            logging_enabled: false,
            metrics_enabled: false,
        }
    }

    /// Loopback-only inbound and a single deny-all outbound rule.
    pub fn isolation(sandbox_id: &str) -> Self {
        let mut policy = Self::new(format!("isolate-{}", sandbox_id), "isolation");
        policy.inbound.push(
            NetworkRule::new(format!("isolate-{}-lo4", sandbox_id), RuleAction::Allow)
                .from_host("127.0.0.0/8"),
        );
        policy.inbound.push(
            NetworkRule::new(format!("isolate-{}-lo6", sandbox_id), RuleAction::Allow)
                .from_host("::1/128"),
        );
        policy.outbound.push(NetworkRule::new(
            format!("isolate-{}-out", sandbox_id),
            RuleAction::Deny,
        ));
        policy.logging_enabled = true;
        policy
    }

    pub fn rules(&self, direction: Direction) -> &[NetworkRule] {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn enabled_rule_count(&self) -> usize {
        self.inbound
            .iter()
            .chain(self.outbound.iter())
            .filter(|r| r.enabled)
            .count()
    }

    /// Evaluate traffic against the policy.
    pub fn evaluate(&self, request: &TrafficRequest) -> TrafficVerdict {
        let mut logged_by = None;
        for rule in ordered(self.rules(request.direction)) {
            if !rule.matches(request.direction, request) {
                continue;
            }
            match rule.action {
                RuleAction::Log => {
                    logged_by.get_or_insert_with(|| rule.id.clone());
                }
                RuleAction::Allow | RuleAction::Deny => {
                    return TrafficVerdict {
                        allowed: rule.action == RuleAction::Allow,
                        rule_id: Some(rule.id.clone()),
                        logged_by,
                    };
                }
            }
        }
        TrafficVerdict {
            allowed: false,
            rule_id: None,
            logged_by,
        }
    }

    /// Translate into packet filter rules for a network with `subnet`.
    ///
    /// Allow and log rules on wildcard hosts cannot be expressed to the packet
    /// filter and are left to [`NetworkPolicy::evaluate`]; dropping them only
    /// narrows the chain. A deny rule that cannot be expressed is an error.
    /// A port-bearing rule for every protocol becomes one tcp and one udp
    /// rule. The default-deny rule is not included.
    pub fn to_filter_rules(&self, subnet: &str) -> Result<Vec<FilterRule>, SandboxError> {
        let mut out = Vec::new();
        for direction in [Direction::Inbound, Direction::Outbound] {
            for rule in ordered(self.rules(direction)) {
                let translated = filter_rules(rule, direction, subnet)?;
                if translated.is_empty() {
                    tracing::debug!(
                        rule = %rule.id,
                        "rule not expressible as packet filter rule, evaluated in-process only"
                    );
                }
                out.extend(translated);
            }
        }
        Ok(out)
    }
}

/// Enabled rules in precedence order.
///
/// Log rules come first since they never terminate evaluation. Then more
/// specific rules win over less specific ones, and at equal specificity deny
/// wins over allow. Ties keep declaration order.
pub fn ordered(rules: &[NetworkRule]) -> Vec<&NetworkRule> {
    let mut enabled: Vec<&NetworkRule> = rules.iter().filter(|r| r.enabled).collect();
    enabled.sort_by_key(|rule| {
        let tier = match rule.action {
            RuleAction::Log => 0u8,
            RuleAction::Deny => 1,
            RuleAction::Allow => 2,
        };
        let log_first = u8::from(rule.action != RuleAction::Log);
        (log_first, std::cmp::Reverse(rule.specificity()), tier)
    });
    enabled
}

fn filter_rules(
    rule: &NetworkRule,
    direction: Direction,
    subnet: &str,
) -> Result<Vec<FilterRule>, SandboxError> {
    let remote = match direction {
        Direction::Outbound => rule.destination.as_deref(),
        Direction::Inbound => rule.source.as_deref(),
    };
    let remote = match remote {
        Some(host) if is_any_host(host) => None,
        Some(host) if host.contains('*') => {
            if rule.action == RuleAction::Deny {
                return Err(inexpressible(rule, "wildcard hosts cannot be matched by the packet filter"));
            }
            return Ok(Vec::new());
        }
        other => other.map(str::to_string),
    };

    let has_ports = rule.source_port.is_some() || rule.destination_port.is_some();
    let protocols = match rule.protocol {
        Protocol::All if has_ports => vec![Some("tcp".to_string()), Some("udp".to_string())],
        Protocol::Icmp if has_ports => return Err(inexpressible(rule, "icmp has no ports")),
        other => vec![other.filter_name()],
    };

    let action = match rule.action {
        RuleAction::Allow => FilterAction::Accept,
        RuleAction::Deny => FilterAction::Drop,
        RuleAction::Log => FilterAction::Log,
    };

    let local = Some(subnet.to_string());
    let (source, destination) = match direction {
        Direction::Outbound => (local, remote),
        Direction::Inbound => (remote, local),
    };

    Ok(protocols
        .into_iter()
        .map(|protocol| FilterRule {
            action,
            protocol,
            source: source.clone(),
            source_port: rule.source_port,
            destination: destination.clone(),
            destination_port: rule.destination_port,
            comment: Some(rule.id.clone()),
        })
        .collect())
}

fn inexpressible(rule: &NetworkRule, reason: &str) -> SandboxError {
    ConfigError::ValidationError(format!("network rule '{}': {}", rule.id, reason)).into()
}

/// Traffic to evaluate; `host` and `port` describe the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficRequest {
    pub direction: Direction,
    pub host: String,
    pub port: Option<u16>,
    pub protocol: Protocol,
}

impl TrafficRequest {
    pub fn outbound(host: impl Into<String>, port: Option<u16>, protocol: Protocol) -> Self {
        Self {
            direction: Direction::Outbound,
            host: host.into(),
            port,
            protocol,
        }
    }

    pub fn inbound(host: impl Into<String>, port: Option<u16>, protocol: Protocol) -> Self {
        Self {
            direction: Direction::Inbound,
            ..Self::outbound(host, port, protocol)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficVerdict {
    pub allowed: bool,
    /// Rule that decided; `None` means the default deny.
    pub rule_id: Option<String>,
    /// First log rule that matched on the way.
    pub logged_by: Option<String>,
}

fn is_any_host(pattern: &str) -> bool {
    matches!(pattern, "*" | "any" | "0.0.0.0/0" | "::/0")
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Whether `host` refers to the loopback interface.
pub fn is_loopback_host(host: &str) -> bool {
    let host = strip_brackets(host.trim());
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Match a hostname against a domain pattern.
///
/// `*.example.com` matches `api.example.com` but not `example.com`;
/// anything else must match exactly, ignoring case.
pub fn matches_domain_pattern(hostname: &str, pattern: &str) -> bool {
    let hostname = hostname.to_lowercase();
    let pattern = pattern.to_lowercase();

    match pattern.strip_prefix("*.") {
        Some(base) => hostname.ends_with(&format!(".{}", base)),
        None => hostname == pattern,
    }
}

/// Match a host against a rule host pattern.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim();
    let host = strip_brackets(host.trim());
    if is_any_host(pattern) {
        return true;
    }
    let host = if host.eq_ignore_ascii_case("localhost") { "127.0.0.1" } else { host };
    let pattern = if pattern.eq_ignore_ascii_case("localhost") { "127.0.0.1" } else { pattern };
    if let Some((network, prefix)) = pattern.split_once('/') {
        return match (network.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(network), Ok(prefix)) => host
                .parse::<IpAddr>()
                .map(|ip| cidr_contains(network, prefix, ip))
                .unwrap_or(false),
            _ => false,
        };
    }
    if let (Ok(a), Ok(b)) = (pattern.parse::<IpAddr>(), host.parse::<IpAddr>()) {
        return a == b;
    }
    matches_domain_pattern(host, strip_brackets(pattern))
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) if prefix <= 32 => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) if prefix <= 128 => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_pattern_matching() {
        assert!(matches_domain_pattern("example.com", "example.com"));
        assert!(matches_domain_pattern("EXAMPLE.COM", "example.com"));
        assert!(!matches_domain_pattern("api.example.com", "example.com"));
        assert!(matches_domain_pattern("deep.api.example.com", "*.example.com"));
        assert!(!matches_domain_pattern("example.com", "*.example.com"));
    }

    #[test]
    fn test_host_matches_cidr() {
        assert!(host_matches("10.0.0.0/8", "10.20.30.40"));
        assert!(!host_matches("10.0.0.0/8", "11.0.0.1"));
        assert!(host_matches("127.0.0.0/8", "127.0.0.1"));
        assert!(host_matches("127.0.0.0/8", "localhost"));
        assert!(host_matches("::1/128", "[::1]"));
        assert!(!host_matches("10.0.0.0/8", "example.com"));
        assert!(host_matches("any", "example.com"));
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.53"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("10.0.0.1"));
        assert!(!is_loopback_host("example.com"));
    }

    #[test]
    fn test_specific_allow_beats_broad_deny() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(NetworkRule::new("deny-all", RuleAction::Deny));
        policy.outbound.push(
            NetworkRule::new("pypi", RuleAction::Allow)
                .to_host("pypi.org")
                .to_port(443)
                .protocol(Protocol::Tcp),
        );

        let ok = policy.evaluate(&TrafficRequest::outbound("pypi.org", Some(443), Protocol::Tcp));
        assert!(ok.allowed);
        assert_eq!(ok.rule_id.as_deref(), Some("pypi"));

        let denied =
            policy.evaluate(&TrafficRequest::outbound("evil.com", Some(443), Protocol::Tcp));
        assert!(!denied.allowed);
        assert_eq!(denied.rule_id.as_deref(), Some("deny-all"));
    }

    #[test]
    fn test_deny_wins_at_equal_specificity() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy
            .outbound
            .push(NetworkRule::new("allow", RuleAction::Allow).to_host("*.example.com"));
        policy
            .outbound
            .push(NetworkRule::new("deny", RuleAction::Deny).to_host("api.example.com"));

        let verdict = policy.evaluate(&TrafficRequest::outbound(
            "api.example.com",
            None,
            Protocol::Tcp,
        ));
        assert!(!verdict.allowed);
        assert_eq!(verdict.rule_id.as_deref(), Some("deny"));
    }

    #[test]
    fn test_log_rules_do_not_decide() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(NetworkRule::new("log", RuleAction::Log));
        policy
            .outbound
            .push(NetworkRule::new("allow", RuleAction::Allow).to_host("github.com"));

        let verdict = policy.evaluate(&TrafficRequest::outbound("github.com", None, Protocol::Tcp));
        assert!(verdict.allowed);
        assert_eq!(verdict.logged_by.as_deref(), Some("log"));

        let verdict = policy.evaluate(&TrafficRequest::outbound("gitlab.com", None, Protocol::Tcp));
        assert!(!verdict.allowed);
        assert_eq!(verdict.rule_id, None);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy
            .outbound
            .push(NetworkRule::new("allow", RuleAction::Allow).disabled());
        let verdict = policy.evaluate(&TrafficRequest::outbound("a.com", None, Protocol::Tcp));
        assert!(!verdict.allowed);
        assert_eq!(policy.enabled_rule_count(), 0);
    }

    #[test]
    fn test_isolation_policy() {
        let policy = NetworkPolicy::isolation("sb-1");
        assert_eq!(policy.outbound.len(), 1);
        assert_eq!(policy.outbound[0].action, RuleAction::Deny);

        let out = policy.evaluate(&TrafficRequest::outbound("8.8.8.8", Some(53), Protocol::Udp));
        assert!(!out.allowed);
        let lo = policy.evaluate(&TrafficRequest::inbound("127.0.0.1", Some(80), Protocol::Tcp));
        assert!(lo.allowed);
        let remote = policy.evaluate(&TrafficRequest::inbound("10.1.2.3", Some(80), Protocol::Tcp));
        assert!(!remote.allowed);
    }

    #[test]
    fn test_filter_translation() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(NetworkRule::new("deny-all", RuleAction::Deny));
        policy.outbound.push(
            NetworkRule::new("dns", RuleAction::Allow)
                .to_host("1.1.1.1")
                .to_port(53)
                .protocol(Protocol::Udp),
        );
        policy
            .outbound
            .push(NetworkRule::new("wild", RuleAction::Allow).to_host("*.example.com"));

        let rules = policy.to_filter_rules("10.200.1.0/24").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].comment.as_deref(), Some("dns"));
        assert_eq!(rules[0].source.as_deref(), Some("10.200.1.0/24"));
        assert_eq!(rules[0].destination.as_deref(), Some("1.1.1.1"));
        assert_eq!(rules[0].protocol.as_deref(), Some("udp"));
        assert_eq!(rules[1].action, FilterAction::Drop);
        assert_eq!(rules[1].destination, None);
    }

    #[test]
    fn test_any_protocol_port_rule_splits_into_tcp_and_udp() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(
            NetworkRule::new("https", RuleAction::Allow)
                .to_host("93.184.216.34")
                .to_port(443),
        );

        let rules = policy.to_filter_rules("10.200.1.0/24").unwrap();
        assert_eq!(rules.len(), 2);
        let protocols: Vec<_> = rules.iter().map(|r| r.protocol.as_deref()).collect();
        assert_eq!(protocols, vec![Some("tcp"), Some("udp")]);
        assert!(rules.iter().all(|r| r.destination_port == Some(443)
            && r.action == FilterAction::Accept
            && r.comment.as_deref() == Some("https")));
    }

    #[test]
    fn test_wildcard_deny_is_rejected() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(NetworkRule::new("allow-all", RuleAction::Allow));
        policy
            .outbound
            .push(NetworkRule::new("no-tracker", RuleAction::Deny).to_host("*.tracker.example"));

        let err = policy.to_filter_rules("10.200.1.0/24").unwrap_err();
        assert!(matches!(err, SandboxError::Config(ConfigError::ValidationError(_))));
        assert!(err.to_string().contains("no-tracker"));
    }

    #[test]
    fn test_icmp_with_port_is_rejected() {
        let mut policy = NetworkPolicy::new("p", "p");
        policy.outbound.push(
            NetworkRule::new("ping", RuleAction::Allow)
                .to_port(7)
                .protocol(Protocol::Icmp),
        );
        assert!(policy.to_filter_rules("10.200.1.0/24").is_err());
    }
}
