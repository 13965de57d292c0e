//! Error types for gatemux gateway operations.

use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Duplicate backend name found in config
    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),

    /// Invalid configuration for a named backend
    #[error("invalid config for backend '{0}': {1}")]
    InvalidConfig(String, String),

    /// A backend has no assigned security level while a policy is configured
    #[error("backend '{0}' has no security level assigned")]
    MissingSecurityLevel(String),

    /// Spawn or handshake failed for a named backend
    #[error("initialization failed for backend '{0}': {1}")]
    InitializationFailed(String, String),

    /// MCP protocol error for a named backend
    #[error("protocol error for backend '{0}': {1}")]
    Protocol(String, String),

    /// Transport-level error for a named backend
    #[error("transport error for backend '{0}': {1}")]
    Transport(String, String),

    /// Call to a named backend timed out
    #[error("call timeout for backend '{0}'")]
    CallTimeout(String),

    /// Call was aborted because the session is shutting down or was cancelled
    #[error("call aborted for backend '{0}': {1}")]
    Aborted(String, String),

    /// No backend registered under the given name
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// Backend session is in a terminal Failed state
    #[error("backend '{0}' is unavailable: {1}")]
    BackendUnavailable(String, String),

    /// Security monitor denied the call
    #[error("denied: {0}")]
    SecurityDenied(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
