//! Packet filter backed by the `iptables` CLI.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConfigError, SandboxError};
use crate::filter::{FilterAction, FilterRule, PacketFilter};
use crate::utils::platform::{check_tool, is_linux, is_privileged};
use crate::utils::process::run_tool_checked;

const FILTER_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives `iptables` in the filter table.
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    binary: String,
    available: bool,
}

impl IptablesFilter {
    /// Probe for the binary and root privileges.
    ///
    /// When either is missing the filter is created in unavailable mode and a
    /// warning is logged; the engine keeps running without kernel filtering.
    pub fn detect(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        let available = if !is_linux() {
            tracing::warn!("packet filtering is only supported on Linux");
            false
        } else if !check_tool(&binary, "--version") {
            tracing::warn!("{} not found - network filtering unavailable", binary);
            false
        } else if !is_privileged() {
            tracing::warn!("not running as root - network filtering unavailable");
            false
        } else {
            true
        };

        Self { binary, available }
    }

    async fn run(&self, args: &[String]) -> Result<(), SandboxError> {
        run_tool_checked(&self.binary, args, Some(FILTER_TIMEOUT)).await?;
        Ok(())
    }

    fn hook_args(op: &str, chain: &str, subnet: &str) -> [Vec<String>; 2] {
        [
            vec![
                op.to_string(),
                "FORWARD".to_string(),
                "-s".to_string(),
                subnet.to_string(),
                "-j".to_string(),
                chain.to_string(),
            ],
            vec![
                op.to_string(),
                "FORWARD".to_string(),
                "-d".to_string(),
                subnet.to_string(),
                "-j".to_string(),
                chain.to_string(),
            ],
        ]
    }
}

/// Build the `-A` arguments for a rule.
///
/// Port matches need tcp or udp; a rule carrying ports without one is
/// refused rather than widened to every port.
pub fn rule_args(chain: &str, rule: &FilterRule) -> Result<Vec<String>, SandboxError> {
    let mut args = vec!["-A".to_string(), chain.to_string()];

    let protocol = rule.protocol.as_deref().filter(|p| *p != "all");
    if let Some(p) = protocol {
        args.push("-p".to_string());
        args.push(p.to_string());
    }

    if let Some(ref source) = rule.source {
        args.push("-s".to_string());
        args.push(source.clone());
    }
    if let Some(ref destination) = rule.destination {
        args.push("-d".to_string());
        args.push(destination.clone());
    }

    let has_ports = rule.source_port.is_some() || rule.destination_port.is_some();
    if has_ports && !matches!(protocol, Some("tcp") | Some("udp")) {
        return Err(ConfigError::ValidationError(format!(
            "port match on {} rule in {} needs tcp or udp",
            protocol.unwrap_or("all"),
            chain
        ))
        .into());
    }
    if let Some(port) = rule.source_port {
        args.push("--sport".to_string());
        args.push(port.to_string());
    }
    if let Some(port) = rule.destination_port {
        args.push("--dport".to_string());
        args.push(port.to_string());
    }

    if let Some(ref comment) = rule.comment {
        args.push("-m".to_string());
        args.push("comment".to_string());
        args.push("--comment".to_string());
        args.push(comment.clone());
    }

    args.push("-j".to_string());
    match rule.action {
        FilterAction::Accept => args.push("ACCEPT".to_string()),
        FilterAction::Drop => args.push("DROP".to_string()),
        FilterAction::Log => {
            args.push("LOG".to_string());
            args.push("--log-prefix".to_string());
            args.push(format!("[{}] ", chain));
        }
    }

    Ok(args)
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    fn name(&self) -> &str {
        &self.binary
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn create_chain(&self, chain: &str, subnet: &str) -> Result<(), SandboxError> {
        self.run(&["-N".to_string(), chain.to_string()]).await?;
        for args in Self::hook_args("-I", chain, subnet) {
            self.run(&args).await?;
        }
        Ok(())
    }

    async fn append_rule(&self, chain: &str, rule: &FilterRule) -> Result<(), SandboxError> {
        self.run(&rule_args(chain, rule)?).await
    }

    async fn flush_chain(&self, chain: &str) -> Result<(), SandboxError> {
        self.run(&["-F".to_string(), chain.to_string()]).await
    }

    async fn delete_chain(&self, chain: &str, subnet: &str) -> Result<(), SandboxError> {
        for args in Self::hook_args("-D", chain, subnet) {
            if let Err(e) = self.run(&args).await {
                tracing::debug!("Failed to unhook {}: {}", chain, e);
            }
        }
        self.flush_chain(chain).await?;
        self.run(&["-X".to_string(), chain.to_string()]).await
    }
}
