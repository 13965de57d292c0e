//! Security monitor — the stateful firewall between the client's agent and
//! the backend fleet.
//!
//! A single `tokio::sync::Mutex`-guarded state struct with an async API:
//! every call is checked against an ordered policy, recorded in an
//! append-only trace, and can taint the session for the remainder of its
//! lifetime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{SecurityLevel, SecurityPolicyConfig};

/// Outcome of a single access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Deny,
}

/// One entry in the session's access log.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub elapsed_ms: u128,
    pub backend: String,
    pub tool: String,
    pub level: Option<SecurityLevel>,
    pub outcome: Outcome,
    pub reason: Option<String>,
}

/// Taint state of the session: set once a suspicious access is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taint {
    Clean,
    Tainted,
}

struct SessionTrace {
    entries: Vec<TraceEntry>,
    taint: Taint,
    started_at: Instant,
    last_activity: Instant,
}

impl SessionTrace {
    fn new() -> Self {
        let now = Instant::now();
        SessionTrace {
            entries: Vec::new(),
            taint: Taint::Clean,
            started_at: now,
            last_activity: now,
        }
    }
}

/// A snapshot of the monitor's state, returned by the `security_status` meta-tool.
#[derive(Debug, Serialize)]
pub struct SecurityStatus {
    pub session_age_secs: u64,
    pub tainted: bool,
    pub access_counts: HashMap<String, u64>,
    pub recent_entries: Vec<TraceEntryView>,
    pub policy_active: bool,
}

#[derive(Debug, Serialize)]
pub struct TraceEntryView {
    pub backend: String,
    pub tool: String,
    pub outcome: &'static str,
    pub reason: Option<String>,
}

const RECENT_ENTRIES: usize = 20;

/// Fixed catalogue of SQL-injection signature tokens. Matched case-insensitively
/// as substrings/regexes over the serialized tool arguments.
fn sql_injection_patterns() -> &'static [&'static str] {
    &[
        r"(?i)\bunion\b\s+\bselect\b",
        r"(?i)\bor\b\s+['\"]?1['\"]?\s*=\s*['\"]?1['\"]?",
        r"--\s*$",
        r";\s*(drop|delete|insert|update)\b",
        r"(?i)\bxp_cmdshell\b",
        r"/\*.*\*/",
    ]
}

/// Patterns that suggest sensitive data (credentials, connection strings) in
/// tool arguments.
fn sensitive_data_patterns() -> &'static [&'static str] {
    &[
        r"(?i)\bpassword\s*[:=]",
        r"(?i)\bsecret\s*[:=]",
        r"sk-[A-Za-z0-9]{16,}",
        r"(?i)\b(aws_secret_access_key|aws_access_key_id)\b",
        r"(?i)-----BEGIN (RSA |EC )?PRIVATE KEY-----",
        r"(?i)\b\w+://[^:/\s]+:[^@/\s]+@",
    ]
}

/// The reason a call was denied, and whether the denial taints the session.
pub struct Denial {
    pub reason: String,
}

/// Process-wide stateful guard consulted on every routed call.
pub struct SecurityMonitor {
    policy: Option<SecurityPolicyConfig>,
    levels: HashMap<String, SecurityLevel>,
    trace: Mutex<SessionTrace>,
    sql_patterns: Vec<Regex>,
    sensitive_patterns: Vec<Regex>,
}

impl SecurityMonitor {
    pub fn new(policy: Option<SecurityPolicyConfig>, levels: HashMap<String, SecurityLevel>) -> Self {
        SecurityMonitor {
            policy,
            levels,
            trace: Mutex::new(SessionTrace::new()),
            sql_patterns: sql_injection_patterns()
                .iter()
                .map(|p| Regex::new(p).expect("built-in pattern is valid"))
                .collect(),
            sensitive_patterns: sensitive_data_patterns()
                .iter()
                .map(|p| Regex::new(p).expect("built-in pattern is valid"))
                .collect(),
        }
    }

    /// Evaluate whether `backend`/`tool` may be called with `arguments`.
    ///
    /// Returns `Ok(())` if allowed, `Err(Denial)` otherwise. Records an entry
    /// in the session trace either way.
    pub async fn check(
        &self,
        backend: &str,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), Denial> {
        let level = self.levels.get(backend).copied();
        let policy = match &self.policy {
            Some(p) => p,
            None => {
                self.record(backend, tool, level, Outcome::Allow, None).await;
                return Ok(());
            }
        };

        let mut trace = self.trace.lock().await;
        trace.last_activity = Instant::now();

        // 1. session expiry
        if let Some(timeout) = policy.session_timeout() {
            if trace.started_at.elapsed() > timeout {
                return self
                    .deny_locked(&mut trace, backend, tool, level, "session expired")
                    .await;
            }
        }

        // 2. block-after-taint
        if policy.block_after_suspicious_activity && trace.taint == Taint::Tainted {
            return self
                .deny_locked(
                    &mut trace,
                    backend,
                    tool,
                    level,
                    "blocked after suspicious activity",
                )
                .await;
        }

        let serialized = arguments.to_string();

        // 3. SQL injection
        if policy.sql_injection_protection && self.sql_patterns.iter().any(|re| re.is_match(&serialized)) {
            trace.taint = Taint::Tainted;
            return self
                .deny_locked(&mut trace, backend, tool, level, "potential SQL injection")
                .await;
        }

        // 4. sensitive -> public flow
        if policy.prevent_sensitive_to_public && level == Some(SecurityLevel::Public) {
            let prior_sensitive_access = trace.entries.iter().any(|e| {
                e.outcome == Outcome::Allow && e.level == Some(SecurityLevel::Sensitive)
            });
            if prior_sensitive_access {
                trace.taint = Taint::Tainted;
                return self
                    .deny_locked(&mut trace, backend, tool, level, "sensitive\u{2192}public flow")
                    .await;
            }
        }

        // 5. sensitive data leak
        if policy.prevent_sensitive_data_leak
            && self.sensitive_patterns.iter().any(|re| re.is_match(&serialized))
        {
            trace.taint = Taint::Tainted;
            return self
                .deny_locked(&mut trace, backend, tool, level, "sensitive data in arguments")
                .await;
        }

        // 6. allow, with optional cross-backend access logging.
        if policy.log_all_cross_backend_access {
            if let Some(last) = trace.entries.last() {
                if last.backend != backend {
                    tracing::info!(
                        from = %last.backend,
                        to = %backend,
                        tool = %tool,
                        "cross-backend access"
                    );
                }
            }
        }

        let elapsed_ms = trace.started_at.elapsed().as_millis();
        trace.entries.push(TraceEntry {
            elapsed_ms,
            backend: backend.to_string(),
            tool: tool.to_string(),
            level,
            outcome: Outcome::Allow,
            reason: None,
        });
        Ok(())
    }

    async fn deny_locked(
        &self,
        trace: &mut SessionTrace,
        backend: &str,
        tool: &str,
        level: Option<SecurityLevel>,
        reason: &str,
    ) -> Result<(), Denial> {
        let elapsed_ms = trace.started_at.elapsed().as_millis();
        trace.entries.push(TraceEntry {
            elapsed_ms,
            backend: backend.to_string(),
            tool: tool.to_string(),
            level,
            outcome: Outcome::Deny,
            reason: Some(reason.to_string()),
        });
        Err(Denial {
            reason: reason.to_string(),
        })
    }

    async fn record(
        &self,
        backend: &str,
        tool: &str,
        level: Option<SecurityLevel>,
        outcome: Outcome,
        reason: Option<String>,
    ) {
        let mut trace = self.trace.lock().await;
        trace.last_activity = Instant::now();
        let elapsed_ms = trace.started_at.elapsed().as_millis();
        trace.entries.push(TraceEntry {
            elapsed_ms,
            backend: backend.to_string(),
            tool: tool.to_string(),
            level,
            outcome,
            reason,
        });
    }

    /// Return a snapshot of the monitor's state for the `security_status` meta-tool.
    pub async fn status(&self) -> SecurityStatus {
        let trace = self.trace.lock().await;
        let mut access_counts: HashMap<String, u64> = HashMap::new();
        for entry in &trace.entries {
            *access_counts.entry(entry.backend.clone()).or_insert(0) += 1;
        }
        let recent_entries = trace
            .entries
            .iter()
            .rev()
            .take(RECENT_ENTRIES)
            .map(|e| TraceEntryView {
                backend: e.backend.clone(),
                tool: e.tool.clone(),
                outcome: match e.outcome {
                    Outcome::Allow => "allow",
                    Outcome::Deny => "deny",
                },
                reason: e.reason.clone(),
            })
            .rev()
            .collect();

        SecurityStatus {
            session_age_secs: trace.started_at.elapsed().as_secs(),
            tainted: trace.taint == Taint::Tainted,
            access_counts,
            recent_entries,
            policy_active: self.policy.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(overrides: impl FnOnce(&mut SecurityPolicyConfig)) -> SecurityPolicyConfig {
        let mut policy = SecurityPolicyConfig {
            prevent_sensitive_to_public: false,
            prevent_sensitive_data_leak: false,
            sql_injection_protection: false,
            block_after_suspicious_activity: false,
            log_all_cross_backend_access: false,
            session_timeout_secs: None,
        };
        overrides(&mut policy);
        policy
    }

    #[tokio::test]
    async fn test_no_policy_always_allows() {
        let monitor = SecurityMonitor::new(None, HashMap::new());
        let result = monitor.check("db", "query", &json!({})).await;
        assert!(result.is_ok());
        let status = monitor.status().await;
        assert!(!status.policy_active);
        assert_eq!(status.access_counts.get("db"), Some(&1));
    }

    #[tokio::test]
    async fn test_sensitive_to_public_flow_denied() {
        let mut levels = HashMap::new();
        levels.insert("db".to_string(), SecurityLevel::Sensitive);
        levels.insert("gh".to_string(), SecurityLevel::Public);
        let monitor = SecurityMonitor::new(
            Some(policy(|p| p.prevent_sensitive_to_public = true)),
            levels,
        );

        assert!(monitor.check("db", "query", &json!({})).await.is_ok());
        let result = monitor.check("gh", "list_repos", &json!({})).await;
        assert!(result.is_err());
        let status = monitor.status().await;
        assert!(status.tainted);
    }

    #[tokio::test]
    async fn test_sql_injection_denied_and_taints() {
        let mut levels = HashMap::new();
        levels.insert("db".to_string(), SecurityLevel::Sensitive);
        let monitor = SecurityMonitor::new(
            Some(policy(|p| p.sql_injection_protection = true)),
            levels,
        );

        let result = monitor
            .check(
                "db",
                "query",
                &json!({"query": "SELECT * FROM t WHERE 1=1 OR '1'='1'--"}),
            )
            .await;
        assert!(result.is_err());
        let status = monitor.status().await;
        assert!(status.tainted);
    }

    #[tokio::test]
    async fn test_sensitive_data_leak_denied() {
        let monitor = SecurityMonitor::new(
            Some(policy(|p| p.prevent_sensitive_data_leak = true)),
            HashMap::new(),
        );
        let result = monitor
            .check("gh", "search", &json!({"query": "password: hunter2"}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_block_after_suspicious_activity() {
        let mut levels = HashMap::new();
        levels.insert("db".to_string(), SecurityLevel::Sensitive);
        let monitor = SecurityMonitor::new(
            Some(policy(|p| {
                p.sql_injection_protection = true;
                p.block_after_suspicious_activity = true;
            })),
            levels,
        );

        let first = monitor
            .check("db", "query", &json!({"query": "1=1 OR '1'='1'--"}))
            .await;
        assert!(first.is_err());

        let second = monitor.check("db", "query", &json!({"query": "safe"})).await;
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().reason, "blocked after suspicious activity");
    }

    #[tokio::test]
    async fn test_clean_access_allowed_with_policy() {
        let mut levels = HashMap::new();
        levels.insert("gh".to_string(), SecurityLevel::Public);
        let monitor = SecurityMonitor::new(
            Some(policy(|p| p.sql_injection_protection = true)),
            levels,
        );
        let result = monitor.check("gh", "list_repos", &json!({"org": "acme"})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_session_timeout_denies() {
        let monitor = SecurityMonitor::new(
            Some(policy(|p| p.session_timeout_secs = Some(0))),
            HashMap::new(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = monitor.check("gh", "list_repos", &json!({})).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().reason, "session expired");
    }
}
