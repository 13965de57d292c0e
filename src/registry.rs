//! GatewayRegistry — name to BackendSession map.
//!
//! Spawns every enabled backend up front, serializes access per name, and
//! routes calls by name rather than a namespace-prefixed tool string (this
//! gateway's meta-tool surface carries the backend name as an explicit
//! argument instead).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::session::{BackendSession, SessionState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Name to backend session map, constructed from a validated [`GatewayConfig`].
///
/// A per-name `Mutex` (`recreate_locks`) serializes recreation of a single
/// failed backend without blocking lookups of any other backend: the map-wide
/// `sessions` lock is only ever held for the brief map read/insert, never
/// across a child spawn + handshake.
pub struct GatewayRegistry {
    sessions: Mutex<HashMap<String, Arc<BackendSession>>>,
    recreate_locks: HashMap<String, Mutex<()>>,
    cancel: CancellationToken,
}

impl GatewayRegistry {
    /// Build a registry from validated config, eagerly spawning every backend.
    ///
    /// Returns as soon as spawns are issued; a backend that fails its
    /// handshake is left in `Failed` state rather than aborting startup —
    /// the gateway should still serve the backends that did come up.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let mut sessions = HashMap::new();
        let mut recreate_locks = HashMap::new();

        for (name, backend_config) in config.backends {
            let session = Arc::new(BackendSession::new(
                name.clone(),
                backend_config,
                cancel.child_token(),
            ));
            if let Err(e) = session.start().await {
                tracing::warn!(backend = %name, error = %e, "backend failed to start at startup");
            }
            recreate_locks.insert(name.clone(), Mutex::new(()));
            sessions.insert(name, session);
        }

        Ok(GatewayRegistry {
            sessions: Mutex::new(sessions),
            recreate_locks,
            cancel,
        })
    }

    /// Return the session for `name`, recreating it if the existing instance
    /// is `Failed` or `Terminated`. Unknown names are an error.
    ///
    /// Recreation is serialized per name via `recreate_locks`, not via the
    /// map-wide `sessions` lock, so a concurrent lookup of a healthy backend
    /// `b` never blocks behind backend `a`'s reconnection.
    pub async fn get(&self, name: &str) -> Result<Arc<BackendSession>> {
        let existing = self.lookup(name).await?;
        if !matches!(existing.state().await, SessionState::Failed | SessionState::Terminated) {
            return Ok(existing);
        }

        let name_lock = self
            .recreate_locks
            .get(name)
            .expect("recreate lock exists for every configured backend");
        let _guard = name_lock.lock().await;

        // Re-check: another caller may have already recreated this backend
        // while we were waiting for the per-name lock.
        let existing = self.lookup(name).await?;
        if !matches!(existing.state().await, SessionState::Failed | SessionState::Terminated) {
            return Ok(existing);
        }

        let fresh = Arc::new(BackendSession::new(
            name.to_string(),
            existing.config_snapshot(),
            self.cancel.child_token(),
        ));
        fresh.start().await?;

        let mut sessions = self.sessions.lock().await;
        sessions.insert(name.to_string(), fresh.clone());
        Ok(fresh)
    }

    async fn lookup(&self, name: &str) -> Result<Arc<BackendSession>> {
        self.sessions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }

    /// Return the names of all configured backends, sorted.
    pub async fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn backend_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancel all sessions and terminate them in parallel, bounded by a
    /// total grace deadline.
    pub async fn shutdown(&self) {
        tracing::info!("gateway registry shutting down all backends");
        self.cancel.cancel();
        let sessions: Vec<Arc<BackendSession>> =
            self.sessions.lock().await.values().cloned().collect();
        let shutdown_all = futures::future::join_all(
            sessions.iter().map(|session| session.terminate()),
        );
        if tokio::time::timeout(SHUTDOWN_GRACE, shutdown_all).await.is_err() {
            tracing::warn!("registry shutdown exceeded grace deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::NamedTempFile;

    fn echo_config() -> GatewayConfig {
        toml::from_str(
            r#"
            [backends.echo]
            command = "cat"
            timeout_secs = 2
            "#,
        )
        .expect("valid config")
    }

    /// A backend that takes a full second to complete its `initialize`
    /// handshake, so a recreation attempt against it has an observable
    /// duration to race other lookups against.
    fn write_slow_handshake_fixture() -> NamedTempFile {
        let script = r#"#!/bin/sh
while IFS= read -r line; do
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$method" in
    initialize)
      sleep 1
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fixture","version":"0"},"capabilities":{}}}\n' "$id"
      ;;
  esac
done
"#;
        let mut file = NamedTempFile::new().expect("create temp fixture script");
        file.write_all(script.as_bytes()).expect("write fixture script");
        let mut perms = file.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        file.as_file().set_permissions(perms).unwrap();
        file
    }

    #[tokio::test]
    async fn test_from_config_spawns_every_backend() {
        let registry = GatewayRegistry::from_config(echo_config()).await.unwrap();
        assert_eq!(registry.backend_count().await, 1);
        assert_eq!(registry.backend_names().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_get_unknown_backend_errors() {
        let registry = GatewayRegistry::from_config(echo_config()).await.unwrap();
        let result = registry.get("nope").await;
        assert!(matches!(result, Err(GatewayError::UnknownBackend(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn test_get_existing_ready_backend_returns_same_instance() {
        let registry = GatewayRegistry::from_config(echo_config()).await.unwrap();
        let first = registry.get("echo").await.unwrap();
        let second = registry.get("echo").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_get_recreates_failed_backend() {
        let mut config = echo_config();
        let broken: BackendConfig = toml::from_str(
            r#"
            command = "/definitely/not/a/real/command-xyz"
            timeout_secs = 1
            "#,
        )
        .unwrap();
        config.backends.insert("broken".to_string(), broken);

        let registry = GatewayRegistry::from_config(config).await.unwrap();
        // the startup spawn failed and left the session Failed; a fresh
        // get() attempts recreation, which will fail again but should not
        // panic and should return an error rather than a stale handle.
        let result = registry.get("broken").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_does_not_block_other_backends_during_recreation() {
        let slow_fixture = write_slow_handshake_fixture();
        let mut config = echo_config();
        let slow: BackendConfig = toml::from_str(&format!(
            r#"
            command = "/bin/sh"
            args = ["{}"]
            timeout_secs = 5
            "#,
            slow_fixture.path().to_str().unwrap()
        ))
        .unwrap();
        config.backends.insert("slow".to_string(), slow);

        let registry = Arc::new(GatewayRegistry::from_config(config).await.unwrap());

        let slow_session = registry.get("slow").await.unwrap();
        slow_session.terminate().await;
        assert_eq!(slow_session.state().await, SessionState::Terminated);

        let recreate_registry = registry.clone();
        let recreate = tokio::spawn(async move { recreate_registry.get("slow").await });
        // give the recreation task a head start so it holds the per-name lock
        // through its one-second handshake while we race a lookup below.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        let echo = registry.get("echo").await.unwrap();
        assert_eq!(echo.name(), "echo");
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "looking up a healthy backend must not block behind another backend's recreation"
        );

        assert!(recreate.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_does_not_panic_on_empty_registry() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        let registry = GatewayRegistry::from_config(config).await.unwrap();
        registry.shutdown().await;
    }
}
