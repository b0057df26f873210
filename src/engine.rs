//! The engine ties the ledger, store and the three managers together.
//!
//! Provisioning a sandbox means admitting and starting it, optionally giving
//! it an isolated network with a policy, and binding it to a security
//! profile. The engine also runs the isolation controller, which reacts to
//! `sandbox_isolation_triggered` by cutting the sandbox's network off.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::SandboxError;
use crate::events::{EngineEvent, EventBus};
use crate::filter::PacketFilter;
use crate::ledger::ResourceLedger;
use crate::manager::types::{NetworkMode, SandboxConfig};
use crate::manager::SandboxManager;
use crate::network::{Destination, NetworkIsolationManager, NetworkOptions, NetworkPolicy};
use crate::runtime::ContainerRuntime;
use crate::security::{EventAction, EventDraft, EventType, SecurityManager, Severity};
use crate::store::PolicyStore;

/// Policy to put on a freshly created sandbox network.
#[derive(Debug, Clone, Default)]
pub enum NetworkAccess {
    /// Only the chain's default deny.
    #[default]
    DefaultDeny,
    /// Loopback-only inbound, deny-all outbound.
    Isolated,
    Policy(NetworkPolicy),
    Allow(Vec<Destination>),
}

#[derive(Debug, Clone, Default)]
pub struct NetworkRequest {
    pub options: NetworkOptions,
    pub access: NetworkAccess,
}

/// Everything needed to provision one sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub config: SandboxConfig,
    /// Isolated network to attach; none when unset.
    pub network: Option<NetworkRequest>,
    /// Profile to bind; the configured default when unset.
    pub profile: Option<String>,
}

impl ProvisionRequest {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            network: None,
            profile: None,
        }
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkRequest) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

/// External tools the engine found.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAvailability {
    pub runtime: String,
    pub runtime_available: bool,
    pub packet_filter: String,
    pub packet_filter_available: bool,
    pub privileged: bool,
}

pub struct SandboxEngine {
    config: EngineConfig,
    events: Arc<EventBus>,
    ledger: Arc<ResourceLedger>,
    store: Arc<PolicyStore>,
    runtime: Arc<dyn ContainerRuntime>,
    sandboxes: Arc<SandboxManager>,
    network: Arc<NetworkIsolationManager>,
    security: Arc<SecurityManager>,
    controller: Mutex<Option<CancellationToken>>,
}

impl SandboxEngine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        filter: Arc<dyn PacketFilter>,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(ResourceLedger::new(
            config.resources.cpu_capacity(),
            config.resources.memory_capacity_mb(),
        ));
        let store = Arc::new(PolicyStore::new(config.security.policy_dir()));

        let sandboxes = Arc::new(SandboxManager::new(
            config.runtime.clone(),
            config.monitoring.resource_poll_interval(),
            runtime.clone(),
            ledger.clone(),
            events.clone(),
        ));
        let network = Arc::new(NetworkIsolationManager::new(
            &config.network,
            runtime.clone(),
            filter,
            events.clone(),
        )?);
        let security = Arc::new(SecurityManager::new(
            config.security.clone(),
            config.monitoring.compliance_poll_interval(),
            store.clone(),
            events.clone(),
        ));

        Ok(Self {
            config,
            events,
            ledger,
            store,
            runtime,
            sandboxes,
            network,
            security,
            controller: Mutex::new(None),
        })
    }

    /// Load persisted profiles and start the background tasks.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        let loaded = self.security.load_persisted_profiles().await?;
        self.network
            .start_stats_polling(self.config.monitoring.network_stats_poll_interval());
        if self.config.security.auto_isolate {
            self.start_isolation_controller();
        }

        tracing::info!(
            runtime = self.runtime.name(),
            filtering = self.network.filtering_enabled(),
            custom_profiles = loaded,
            "engine initialized"
        );
        Ok(())
    }

    /// Create a sandbox, give it a network and bind its profile. Any failure
    /// tears down whatever was already set up.
    ///
    /// A requested network is created first so the container can be created
    /// on it; containers created without a network cannot join one later.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<String, SandboxError> {
        let ProvisionRequest {
            mut config,
            network,
            profile,
        } = request;
        let id = config.id.clone();
        let profile = profile.unwrap_or_else(|| self.config.security.default_profile.clone());

        let (access, attachment) = match network {
            Some(request) => {
                if config.network_mode == NetworkMode::None {
                    config.network_mode = NetworkMode::Isolated;
                }
                self.network
                    .create_sandbox_network(&id, request.options)
                    .await?;
                (Some(request.access), self.network.attachment(&id))
            }
            None => (None, None),
        };

        let networked = access.is_some();
        if let Err(e) = self.sandboxes.create_sandbox_on(config, attachment).await {
            if networked {
                self.network.cleanup_sandbox_network(&id).await;
            }
            // InvalidState means the id belongs to a live sandbox
            if !matches!(e, SandboxError::InvalidState(_)) {
                self.sandboxes.cleanup_sandbox(&id).await;
            }
            return Err(e);
        }

        if let Err(e) = self.finish_provision(&id, access, &profile).await {
            tracing::warn!(sandbox = %id, error = %e, "provisioning failed, tearing down");
            self.teardown(&id).await;
            return Err(e);
        }

        tracing::info!(sandbox = %id, profile = %profile, "sandbox provisioned");
        Ok(id)
    }

    async fn finish_provision(
        &self,
        id: &str,
        access: Option<NetworkAccess>,
        profile: &str,
    ) -> Result<(), SandboxError> {
        if let Some(access) = access {
            let handle = self
                .sandboxes
                .container_handle(id)
                .ok_or_else(|| SandboxError::InvalidState(format!("sandbox {} has no container", id)))?;

            self.network.adopt_container(id, &handle)?;
            match access {
                NetworkAccess::DefaultDeny => {}
                NetworkAccess::Isolated => self.network.isolate_sandbox(id).await?,
                NetworkAccess::Policy(policy) => self.network.apply_network_policy(id, policy).await?,
                NetworkAccess::Allow(destinations) => {
                    self.network.allow_network_access(id, &destinations).await?
                }
            }
        }

        self.security.apply_profile_to_sandbox(id, profile)
    }

    /// Release the security binding, remove the network and clean up the
    /// sandbox. Safe to call for unknown ids.
    pub async fn teardown(&self, id: &str) {
        self.security.release_sandbox(id);
        self.network.cleanup_sandbox_network(id).await;
        self.sandboxes.cleanup_sandbox(id).await;
    }

    /// Tear down every sandbox and stop background tasks.
    pub async fn shutdown(&self) {
        if let Some(token) = self.controller.lock().take() {
            token.cancel();
        }
        self.network.stop_stats_polling();

        let mut ids: Vec<String> = self
            .sandboxes
            .list_sandboxes()
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in self.network.sandboxes() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        join_all(ids.iter().map(|id| self.teardown(id))).await;
        self.security.shutdown();

        tracing::info!(sandboxes = ids.len(), "engine shut down");
    }

    fn start_isolation_controller(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.controller.lock().replace(token.clone()) {
            old.cancel();
        }

        let rx = self.events.subscribe();
        let network = self.network.clone();
        let security = self.security.clone();
        tokio::spawn(isolation_controller(rx, network, security, token));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn network(&self) -> &Arc<NetworkIsolationManager> {
        &self.network
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub async fn tool_availability(&self) -> ToolAvailability {
        ToolAvailability {
            runtime: self.runtime.name().to_string(),
            runtime_available: self.runtime.is_available().await,
            packet_filter: self.config.network.filter_binary.clone(),
            packet_filter_available: self.network.filtering_enabled(),
            privileged: crate::utils::is_privileged(),
        }
    }
}

async fn isolation_controller(
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    network: Arc<NetworkIsolationManager>,
    security: Arc<SecurityManager>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let EngineEvent::SandboxIsolationTriggered {
            sandbox_id,
            profile_id,
            violations,
            compliance_score,
        } = event
        else {
            continue;
        };

        if !network.has_network(&sandbox_id) {
            tracing::warn!(sandbox = %sandbox_id, "isolation triggered but sandbox has no network");
            continue;
        }

        match network.isolate_sandbox(&sandbox_id).await {
            Ok(()) => {
                security
                    .audit_event(
                        EventDraft::new(
                            EventType::Audit,
                            Severity::High,
                            "network",
                            sandbox_id.as_str(),
                            format!("sandbox isolated after {} violations", violations),
                            EventAction::Isolated,
                        )
                        .with_details(serde_json::json!({
                            "violations": violations,
                            "complianceScore": compliance_score,
                        }))
                        .with_policy(profile_id),
                    )
                    .await;
            }
            Err(e) => tracing::warn!(sandbox = %sandbox_id, error = %e, "automatic isolation failed"),
        }
    }
    tracing::trace!("isolation controller stopped");
}
