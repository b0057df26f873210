//! OS packet filter abstraction.
//!
//! Each sandbox network gets its own filter chain. Traffic to and from the
//! network's subnet is jumped into that chain, which ends in a drop rule so
//! unmatched traffic is denied.

pub mod iptables;
pub mod mock;

use async_trait::async_trait;

use crate::error::SandboxError;

pub use iptables::IptablesFilter;
pub use mock::MockFilter;

/// Verdict of a filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Drop,
    /// Log and keep evaluating.
    Log,
}

/// One rule appended to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: FilterAction,
    /// `tcp`, `udp`, `icmp`; `None` matches every protocol.
    pub protocol: Option<String>,
    pub source: Option<String>,
    pub source_port: Option<u16>,
    pub destination: Option<String>,
    pub destination_port: Option<u16>,
    pub comment: Option<String>,
}

impl FilterRule {
    /// The unconditional drop every chain ends with.
    pub fn default_deny() -> Self {
        Self {
            action: FilterAction::Drop,
            protocol: None,
            source: None,
            source_port: None,
            destination: None,
            destination_port: None,
            comment: Some("default deny".to_string()),
        }
    }
}

/// Chain operations the engine issues against the host firewall.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the tool was found and can be driven.
    fn is_available(&self) -> bool;

    /// Create `chain` and hook traffic to/from `subnet` into it.
    async fn create_chain(&self, chain: &str, subnet: &str) -> Result<(), SandboxError>;

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<(), SandboxError>;

    async fn flush_chain(&self, chain: &str) -> Result<(), SandboxError>;

    /// Unhook, flush and delete `chain`.
    async fn delete_chain(&self, chain: &str, subnet: &str) -> Result<(), SandboxError>;
}
