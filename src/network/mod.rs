//! Per-sandbox network isolation.
//!
//! Every sandbox that asks for one gets its own internal bridge network with a
//! `/24` from the configured pool, and its own packet filter chain ending in a
//! default-deny rule. Policies are translated into chain rules and are also
//! kept in memory so traffic can be evaluated without the packet filter.

pub mod policy;
pub mod subnet;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::NetworkSettings;
use crate::error::SandboxError;
use crate::events::{EngineEvent, EventBus};
use crate::filter::{FilterRule, PacketFilter};
use crate::runtime::{ContainerRuntime, NetworkAttachment, NetworkSpec, SANDBOX_LABEL};

pub use policy::{
    is_loopback_host, Direction, NetworkPolicy, NetworkRule, Protocol, RuleAction, TrafficRequest,
    TrafficVerdict,
};
use subnet::{explicit_lease, random_mac, SubnetLease, SubnetPool};

/// Longest chain name the packet filter accepts.
const MAX_CHAIN_NAME: usize = 28;

/// Options for [`NetworkIsolationManager::create_sandbox_network`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOptions {
    /// Explicit subnet; one is leased from the pool otherwise.
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    /// Internal networks have no route off the host.
    pub internal: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            subnet: None,
            gateway: None,
            internal: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceStatus {
    Up,
    Down,
}

/// The sandbox's interface on its isolated network.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub subnet: String,
    pub gateway: String,
    pub mac: String,
    pub status: InterfaceStatus,
    #[serde(rename = "type")]
    pub interface_type: String,
    pub sandbox_id: String,
}

/// Traffic counters for one sandbox network.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub active_connections: usize,
    pub blocked_connections: u64,
    pub last_updated: DateTime<Utc>,
}

impl NetworkStats {
    fn zeroed() -> Self {
        Self {
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            active_connections: 0,
            blocked_connections: 0,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct SandboxNetwork {
    network_id: String,
    chain: String,
    lease: SubnetLease,
    interface: NetworkInterface,
    stats: NetworkStats,
    policy: Option<NetworkPolicy>,
    /// Container attached to the network, if any.
    container: Option<String>,
}

#[derive(Debug)]
struct NetworkState {
    networks: HashMap<String, SandboxNetwork>,
    /// Sandbox ids with a network being set up.
    pending: HashSet<String>,
    pool: SubnetPool,
}

/// Owns every sandbox network, its filter chain and its policy.
pub struct NetworkIsolationManager {
    runtime: Arc<dyn ContainerRuntime>,
    filter: Arc<dyn PacketFilter>,
    events: Arc<EventBus>,
    chain_prefix: String,
    state: RwLock<NetworkState>,
    poller: Mutex<Option<CancellationToken>>,
}

impl NetworkIsolationManager {
    pub fn new(
        settings: &NetworkSettings,
        runtime: Arc<dyn ContainerRuntime>,
        filter: Arc<dyn PacketFilter>,
        events: Arc<EventBus>,
    ) -> Result<Self, SandboxError> {
        let prefix = settings.pool_prefix()?;
        if !filter.is_available() {
            tracing::warn!(
                filter = filter.name(),
                "packet filter unavailable, network policies will only be evaluated in-process"
            );
        }

        Ok(Self {
            runtime,
            filter,
            events,
            chain_prefix: settings.chain_prefix.clone(),
            state: RwLock::new(NetworkState {
                networks: HashMap::new(),
                pending: HashSet::new(),
                pool: SubnetPool::new(prefix),
            }),
            poller: Mutex::new(None),
        })
    }

    /// Whether chain rules are actually installed.
    pub fn filtering_enabled(&self) -> bool {
        self.filter.is_available()
    }

    fn chain_name(&self, sandbox_id: &str) -> String {
        let room = MAX_CHAIN_NAME.saturating_sub(self.chain_prefix.len());
        let suffix: String = sandbox_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(room)
            .collect();
        format!("{}{}", self.chain_prefix, suffix)
    }

    fn network_name(sandbox_id: &str) -> String {
        format!("sbx-net-{}", sandbox_id)
    }

    /// Create the isolated network and its filter chain for a sandbox.
    pub async fn create_sandbox_network(
        &self,
        sandbox_id: &str,
        options: NetworkOptions,
    ) -> Result<String, SandboxError> {
        let lease = {
            let mut state = self.state.write();
            if state.networks.contains_key(sandbox_id) || state.pending.contains(sandbox_id) {
                return Err(SandboxError::InvalidState(format!(
                    "sandbox {} already has a network",
                    sandbox_id
                )));
            }
            let lease = match options.subnet {
                Some(ref cidr) => explicit_lease(cidr, options.gateway.as_deref())?,
                None => state.pool.allocate()?,
            };
            state.pending.insert(sandbox_id.to_string());
            lease
        };

        match self.setup_network(sandbox_id, &lease, options.internal).await {
            Ok((network_id, chain)) => {
                let interface = NetworkInterface {
                    name: format!("eth-{}", sandbox_id.chars().take(8).collect::<String>()),
                    ip: lease.address.to_string(),
                    subnet: lease.cidr.clone(),
                    gateway: lease.gateway.to_string(),
                    mac: random_mac(),
                    status: InterfaceStatus::Down,
                    interface_type: "bridge".to_string(),
                    sandbox_id: sandbox_id.to_string(),
                };
                let subnet = lease.cidr.clone();
                {
                    let mut state = self.state.write();
                    state.pending.remove(sandbox_id);
                    state.networks.insert(
                        sandbox_id.to_string(),
                        SandboxNetwork {
                            network_id: network_id.clone(),
                            chain,
                            lease,
                            interface,
                            stats: NetworkStats::zeroed(),
                            policy: None,
                            container: None,
                        },
                    );
                }

                tracing::info!(sandbox = sandbox_id, network = %network_id, subnet = %subnet, "network created");
                self.events.publish(EngineEvent::NetworkCreated {
                    sandbox_id: sandbox_id.to_string(),
                    network_id: network_id.clone(),
                    subnet,
                });
                Ok(network_id)
            }
            Err(e) => {
                let mut state = self.state.write();
                state.pending.remove(sandbox_id);
                if let Some(slot) = lease.pool_slot {
                    state.pool.release(slot);
                }
                Err(e)
            }
        }
    }

    async fn setup_network(
        &self,
        sandbox_id: &str,
        lease: &SubnetLease,
        internal: bool,
    ) -> Result<(String, String), SandboxError> {
        let spec = NetworkSpec {
            name: Self::network_name(sandbox_id),
            subnet: lease.cidr.clone(),
            gateway: lease.gateway.to_string(),
            internal,
            labels: vec![(SANDBOX_LABEL.to_string(), sandbox_id.to_string())],
        };
        let network_id = self.runtime.create_network(&spec).await?;

        let chain = self.chain_name(sandbox_id);
        if self.filter.is_available() {
            let installed = async {
                self.filter.create_chain(&chain, &lease.cidr).await?;
                self.filter.append_rule(&chain, &FilterRule::default_deny()).await
            }
            .await;

            if let Err(e) = installed {
                if let Err(cleanup) = self.filter.delete_chain(&chain, &lease.cidr).await {
                    tracing::debug!(chain = %chain, error = %cleanup, "chain rollback failed");
                }
                if let Err(cleanup) = self.runtime.remove_network(&network_id).await {
                    tracing::warn!(network = %network_id, error = %cleanup, "network rollback failed");
                }
                return Err(e);
            }
        }

        Ok((network_id, chain))
    }

    /// Attach a sandbox's container to its network.
    pub async fn connect_sandbox_to_network(
        &self,
        sandbox_id: &str,
        container: &str,
    ) -> Result<(), SandboxError> {
        let NetworkAttachment { network, ip } = self
            .attachment(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(format!("network for sandbox {}", sandbox_id)))?;

        self.runtime
            .connect_network(&network, container, ip.as_deref())
            .await?;

        self.mark_connected(sandbox_id, container, network);
        Ok(())
    }

    /// Network and address a container joins when it is created directly on
    /// the sandbox network.
    pub fn attachment(&self, sandbox_id: &str) -> Option<NetworkAttachment> {
        self.state
            .read()
            .networks
            .get(sandbox_id)
            .map(|net| NetworkAttachment {
                network: net.network_id.clone(),
                ip: Some(net.interface.ip.clone()),
            })
    }

    /// Record a container that was created with [`Self::attachment`] and is
    /// already on the network.
    pub fn adopt_container(&self, sandbox_id: &str, container: &str) -> Result<(), SandboxError> {
        let network = self
            .attachment(sandbox_id)
            .map(|a| a.network)
            .ok_or_else(|| SandboxError::NotFound(format!("network for sandbox {}", sandbox_id)))?;
        self.mark_connected(sandbox_id, container, network);
        Ok(())
    }

    fn mark_connected(&self, sandbox_id: &str, container: &str, network_id: String) {
        if let Some(net) = self.state.write().networks.get_mut(sandbox_id) {
            net.container = Some(container.to_string());
            net.interface.status = InterfaceStatus::Up;
        }

        tracing::debug!(sandbox = sandbox_id, network = %network_id, container, "connected");
        self.events.publish(EngineEvent::NetworkConnected {
            sandbox_id: sandbox_id.to_string(),
            network_id,
        });
    }

    /// Detach the sandbox's container. Best-effort: failures are logged.
    pub async fn disconnect_sandbox_from_network(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let target = {
            let mut state = self.state.write();
            state.networks.get_mut(sandbox_id).and_then(|net| {
                net.interface.status = InterfaceStatus::Down;
                net.container
                    .take()
                    .map(|container| (net.network_id.clone(), container))
            })
        };
        let Some((network_id, container)) = target else {
            return Ok(());
        };

        if self.detach(&network_id, &container).await {
            self.events.publish(EngineEvent::NetworkDisconnected {
                sandbox_id: sandbox_id.to_string(),
                network_id,
            });
        }
        Ok(())
    }

    async fn detach(&self, network_id: &str, container: &str) -> bool {
        match self.runtime.disconnect_network(network_id, container).await {
            Ok(()) => true,
            Err(e) if e.is_container_gone() || e.to_string().contains("is not connected") => {
                tracing::debug!(network = network_id, container, "already disconnected");
                false
            }
            Err(e) => {
                tracing::warn!(network = network_id, container, error = %e, "disconnect failed");
                false
            }
        }
    }

    /// Replace the chain contents with `policy` followed by default deny.
    pub async fn apply_network_policy(
        &self,
        sandbox_id: &str,
        policy: NetworkPolicy,
    ) -> Result<(), SandboxError> {
        let (chain, subnet) = {
            let state = self.state.read();
            match state.networks.get(sandbox_id) {
                Some(net) if net.container.is_some() => (net.chain.clone(), net.lease.cidr.clone()),
                _ => return Err(SandboxError::NotConnected(sandbox_id.to_string())),
            }
        };

        if self.filter.is_available() {
            let rules = policy.to_filter_rules(&subnet)?;
            self.filter.flush_chain(&chain).await?;
            if let Err(e) = self.install_rules(&chain, &rules).await {
                // a partially written chain still has to end in a drop
                if let Err(restore) = self
                    .filter
                    .append_rule(&chain, &FilterRule::default_deny())
                    .await
                {
                    tracing::error!(sandbox = sandbox_id, chain = %chain, error = %restore, "failed to restore default deny");
                }
                return Err(e);
            }
        } else {
            tracing::debug!(sandbox = sandbox_id, "packet filter unavailable, policy recorded only");
        }

        let policy_id = policy.id.clone();
        let rule_count = policy.enabled_rule_count();
        if let Some(net) = self.state.write().networks.get_mut(sandbox_id) {
            net.policy = Some(policy);
        }

        tracing::info!(sandbox = sandbox_id, policy = %policy_id, rules = rule_count, "network policy applied");
        self.events.publish(EngineEvent::PolicyApplied {
            sandbox_id: sandbox_id.to_string(),
            policy_id,
            rule_count,
        });
        Ok(())
    }

    async fn install_rules(&self, chain: &str, rules: &[FilterRule]) -> Result<(), SandboxError> {
        for rule in rules {
            self.filter.append_rule(chain, rule).await?;
        }
        self.filter.append_rule(chain, &FilterRule::default_deny()).await
    }

    /// Loopback-only inbound, deny-all outbound.
    pub async fn isolate_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        tracing::warn!(sandbox = sandbox_id, "isolating sandbox network");
        self.apply_network_policy(sandbox_id, NetworkPolicy::isolation(sandbox_id))
            .await
    }

    /// Add one allow-outbound rule per destination to the current policy.
    pub async fn allow_network_access(
        &self,
        sandbox_id: &str,
        destinations: &[Destination],
    ) -> Result<(), SandboxError> {
        let mut policy = self
            .get_policy(sandbox_id)
            .unwrap_or_else(|| NetworkPolicy::new(format!("access-{}", sandbox_id), "access"));

        let base = policy.outbound.len();
        for (i, dest) in destinations.iter().enumerate() {
            let mut rule = NetworkRule::new(format!("{}-allow-{}", policy.id, base + i), RuleAction::Allow)
                .to_host(dest.host.clone())
                .protocol(dest.protocol);
            rule.destination_port = dest.port;
            policy.outbound.push(rule);
        }

        self.apply_network_policy(sandbox_id, policy).await
    }

    /// Tear down everything network-related for a sandbox. Unknown ids are a
    /// no-op and every step is best-effort.
    pub async fn cleanup_sandbox_network(&self, sandbox_id: &str) {
        let Some(net) = self.state.write().networks.remove(sandbox_id) else {
            return;
        };

        if let Some(ref container) = net.container {
            self.detach(&net.network_id, container).await;
        }

        if let Err(e) = self.runtime.remove_network(&net.network_id).await {
            tracing::warn!(sandbox = sandbox_id, network = %net.network_id, error = %e, "failed to remove network");
        }

        if self.filter.is_available() {
            if let Err(e) = self.filter.delete_chain(&net.chain, &net.lease.cidr).await {
                tracing::warn!(sandbox = sandbox_id, chain = %net.chain, error = %e, "failed to delete chain");
            }
        }

        if let Some(slot) = net.lease.pool_slot {
            self.state.write().pool.release(slot);
        }

        tracing::info!(sandbox = sandbox_id, network = %net.network_id, "network removed");
        self.events.publish(EngineEvent::NetworkRemoved {
            sandbox_id: sandbox_id.to_string(),
            network_id: net.network_id,
        });
    }

    /// Evaluate traffic against the sandbox's applied policy. With no policy
    /// applied only the default deny is in place.
    pub fn evaluate_traffic(
        &self,
        sandbox_id: &str,
        request: &TrafficRequest,
    ) -> Result<TrafficVerdict, SandboxError> {
        let mut state = self.state.write();
        let net = state
            .networks
            .get_mut(sandbox_id)
            .ok_or_else(|| SandboxError::NotFound(format!("network for sandbox {}", sandbox_id)))?;

        let verdict = match net.policy {
            Some(ref policy) => policy.evaluate(request),
            None => TrafficVerdict {
                allowed: false,
                rule_id: None,
                logged_by: None,
            },
        };
        if !verdict.allowed {
            net.stats.blocked_connections += 1;
        }
        Ok(verdict)
    }

    pub fn has_network(&self, sandbox_id: &str) -> bool {
        self.state.read().networks.contains_key(sandbox_id)
    }

    pub fn network_id(&self, sandbox_id: &str) -> Option<String> {
        self.state
            .read()
            .networks
            .get(sandbox_id)
            .map(|n| n.network_id.clone())
    }

    pub fn get_network_stats(&self, sandbox_id: &str) -> Option<NetworkStats> {
        self.state.read().networks.get(sandbox_id).map(|n| n.stats.clone())
    }

    pub fn get_interface(&self, sandbox_id: &str) -> Option<NetworkInterface> {
        self.state
            .read()
            .networks
            .get(sandbox_id)
            .map(|n| n.interface.clone())
    }

    pub fn get_policy(&self, sandbox_id: &str) -> Option<NetworkPolicy> {
        self.state
            .read()
            .networks
            .get(sandbox_id)
            .and_then(|n| n.policy.clone())
    }

    /// Sandbox ids that currently own a network.
    pub fn sandboxes(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.read().networks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refresh connection counts and traffic counters for every network.
    pub async fn refresh_stats(&self) {
        let targets: Vec<(String, String, Option<String>)> = self
            .state
            .read()
            .networks
            .iter()
            .map(|(id, net)| (id.clone(), net.network_id.clone(), net.container.clone()))
            .collect();

        for (sandbox_id, network_id, container) in targets {
            let connections = match self.runtime.inspect_network(&network_id).await {
                Ok(inspection) => Some(inspection.connected_containers),
                Err(e) => {
                    tracing::debug!(sandbox = %sandbox_id, error = %e, "network inspect failed");
                    None
                }
            };
            let traffic = match container {
                Some(ref handle) => self.runtime.stats(handle).await.ok(),
                None => None,
            };

            if let Some(net) = self.state.write().networks.get_mut(&sandbox_id) {
                if let Some(count) = connections {
                    net.stats.active_connections = count;
                }
                if let Some(sample) = traffic {
                    net.stats.bytes_in = sample.net_bytes_in;
                    net.stats.bytes_out = sample.net_bytes_out;
                }
                net.stats.last_updated = Utc::now();
            }
        }
    }

    /// Start the background stats poller. Restarting replaces the old one.
    pub fn start_stats_polling(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(old) = self.poller.lock().replace(token.clone()) {
            old.cancel();
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.refresh_stats().await;
                    }
                }
            }
        });
    }

    pub fn stop_stats_polling(&self) {
        if let Some(token) = self.poller.lock().take() {
            token.cancel();
        }
    }
}

/// A destination for [`NetworkIsolationManager::allow_network_access`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: Option<u16>, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }
}
