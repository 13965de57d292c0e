//! Gateway configuration — deserialization and validation.
//!
//! A gateway config file declares the backend MCP servers to supervise and an
//! optional security policy governing cross-backend access. `${VAR}`
//! interpolation of environment overlays is resolved at spawn time, not at
//! parse time, so the same config can be validated without touching the
//! environment.

use crate::error::GatewayError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of env-var references to their actual values.
///
/// Each value must be `${VAR}`. Unknown variables resolve to the empty
/// string (same as shell `${UNSET-}`).
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(), // caught by validate(), but handle gracefully
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level gateway configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    pub security_policy: Option<SecurityPolicyConfig>,
}

/// Configuration for a single managed backend MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// The executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Env var references (`${VAR}`), resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Human-readable description surfaced by `discover_backend_tools`.
    #[serde(default)]
    pub description: String,
    /// Per-call timeout in seconds. Defaults to 30.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Security classification for this backend. Required when a
    /// `security_policy` section is present.
    pub security_level: Option<SecurityLevel>,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Security classification of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Public,
    Internal,
    Sensitive,
}

/// Policy flags governing cross-backend access, as parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityPolicyConfig {
    #[serde(default)]
    pub prevent_sensitive_to_public: bool,
    #[serde(default)]
    pub prevent_sensitive_data_leak: bool,
    #[serde(default)]
    pub sql_injection_protection: bool,
    #[serde(default)]
    pub block_after_suspicious_activity: bool,
    #[serde(default)]
    pub log_all_cross_backend_access: bool,
    /// Session timeout in seconds. `None` disables the session-age check.
    pub session_timeout_secs: Option<u64>,
}

impl SecurityPolicyConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }
}

impl GatewayConfig {
    /// Validate the config, failing fast on misconfigurations before any backends are spawned.
    pub fn validate(&self) -> crate::Result<()> {
        // Backend names come from the map keys, which serde/TOML already
        // guarantees are unique within the table, but an empty name is the
        // one way to smuggle a degenerate entry through TOML's table syntax.
        let mut seen: HashSet<&str> = HashSet::new();
        for name in self.backends.keys() {
            if name.is_empty() {
                return Err(GatewayError::InvalidConfig(
                    name.clone(),
                    "backend name must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(GatewayError::DuplicateBackend(name.clone()));
            }
        }

        for (name, config) in &self.backends {
            if config.command.is_empty() {
                return Err(GatewayError::InvalidConfig(
                    name.clone(),
                    "'command' must not be empty".to_string(),
                ));
            }
            if config.timeout_secs == 0 {
                return Err(GatewayError::InvalidConfig(
                    name.clone(),
                    "timeout_secs must be > 0".to_string(),
                ));
            }
            for (key, value) in &config.env {
                if parse_env_ref(value).is_none() {
                    return Err(GatewayError::InvalidConfig(
                        name.clone(),
                        format!(
                            "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                            key, value
                        ),
                    ));
                }
            }
        }

        // A security policy requires every backend to carry a security level.
        if self.security_policy.is_some() {
            for (name, config) in &self.backends {
                if config.security_level.is_none() {
                    return Err(GatewayError::MissingSecurityLevel(name.clone()));
                }
            }
        }

        Ok(())
    }
}
