//! Error types for the sandbox isolation engine.

use thiserror::Error;

/// Main error type for the sandbox isolation engine.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("{tool} failed: {message}")]
    ExternalToolFailure { tool: String, message: String },

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Sandbox {sandbox_id} exited unexpectedly: {reason}")]
    UnexpectedExit { sandbox_id: String, reason: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sandbox {0} is not connected to a network")]
    NotConnected(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Build an external tool failure from a tool name and captured stderr.
    pub fn tool_failure(tool: impl Into<String>, message: impl Into<String>) -> Self {
        SandboxError::ExternalToolFailure {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// True when the runtime reported that the container no longer exists.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, SandboxError::ContainerNotFound(_))
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid resource limit '{field}': {reason}")]
    InvalidResourceLimit { field: String, reason: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid profile '{profile}': {reason}")]
    InvalidProfile { profile: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
