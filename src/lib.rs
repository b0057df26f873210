//! Sandbox Isolation - container sandboxes with per-sandbox network isolation
//! and security profile enforcement.
//!
//! The engine is built from three cooperating managers that share a resource
//! ledger and an event bus:
//! - [`SandboxManager`]: admission, container lifecycle, resource monitoring
//! - [`NetworkIsolationManager`]: isolated networks, filter chains, policies
//! - [`SecurityManager`]: profiles, operation validation, audit, compliance
//!
//! [`SandboxEngine`] wires them together. Container engines and packet
//! filters sit behind the [`ContainerRuntime`] and [`PacketFilter`] traits.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod filter;
pub mod ledger;
pub mod manager;
pub mod network;
pub mod runtime;
pub mod security;
pub mod store;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{NetworkAccess, NetworkRequest, ProvisionRequest, SandboxEngine};
pub use error::{ConfigError, Result, SandboxError};
pub use events::{EngineEvent, EventBus};
pub use filter::PacketFilter;
pub use ledger::ResourceLedger;
pub use manager::SandboxManager;
pub use network::NetworkIsolationManager;
pub use runtime::ContainerRuntime;
pub use security::SecurityManager;

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{NetworkAccess, NetworkRequest, ProvisionRequest, SandboxEngine};
    pub use crate::error::{Result, SandboxError};
    pub use crate::events::EngineEvent;
    pub use crate::manager::types::{ExecOptions, NetworkMode, ResourceLimits, SandboxConfig};
    pub use crate::network::{Destination, NetworkPolicy};
    pub use crate::security::{ExecutionContext, ReportFormat};
}
