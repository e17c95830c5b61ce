use crate::error::SessionError;
use crate::launcher::{LaunchSpec, Launcher};
use crate::session::{Session, SessionInfo, DEFAULT_OUTPUT_BUFFER_BYTES};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub launch: LaunchSpec,
    pub output_buffer_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            launch: LaunchSpec::default(),
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
        }
    }
}

/// Owns every live [`Session`], at most one per container id.
pub struct SessionRegistry {
    launcher: Launcher,
    output_buffer_bytes: usize,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            launcher: Launcher::new(config.launch),
            output_buffer_bytes: config.output_buffer_bytes,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        self.launcher.spec()
    }

    /// Returns the live session for `container_id`, launching one if needed.
    ///
    /// Creation happens under the write lock, so concurrent callers for the
    /// same id all observe the same session.
    pub async fn get_or_create(&self, container_id: &str) -> Result<Arc<Session>, SessionError> {
        let container_id = validate_container_id(container_id)?;
        if let Some(session) = self.sessions.read().await.get(container_id) {
            if session.is_alive() {
                return Ok(session.clone());
            }
        }

        let (session, stale) = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(container_id).filter(|s| s.is_alive()) {
                return Ok(existing.clone());
            }
            let stale = sessions.remove(container_id);
            let handle = self.launcher.launch(container_id)?;
            let session = Session::start(container_id, handle, self.output_buffer_bytes);
            sessions.insert(container_id.to_string(), session.clone());
            (session, stale)
        };

        if let Some(stale) = stale {
            info!(event = "session_replaced", container = container_id);
            stale.shutdown().await;
        }
        info!(
            event = "session_created",
            container = container_id,
            pid = session.pid().unwrap_or_default()
        );
        Ok(session)
    }

    pub async fn get(&self, container_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(container_id.to_string()))
    }

    pub async fn mark_dead(&self, container_id: &str) -> Result<(), SessionError> {
        let session = self.get(container_id).await?;
        session.mark_dead("marked_dead");
        Ok(())
    }

    pub async fn dispose(&self, container_id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(container_id)
            .ok_or_else(|| SessionError::SessionNotFound(container_id.to_string()))?;
        session.shutdown().await;
        info!(event = "session_disposed", container = container_id);
        Ok(())
    }

    pub async fn dispose_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        let count = drained.len();
        for session in drained {
            session.shutdown().await;
        }
        info!(event = "sessions_disposed", count);
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        infos
    }
}

/// Container ids are passed to the eval binary as a single argument, never
/// through a shell. Flags and control characters are still refused.
pub fn validate_container_id(container_id: &str) -> Result<&str, SessionError> {
    let trimmed = container_id.trim();
    let valid = !trimmed.is_empty()
        && !trimmed.starts_with('-')
        && trimmed
            .chars()
            .all(|ch| !ch.is_control() && !ch.is_whitespace() && ch != '/');
    if valid {
        Ok(trimmed)
    } else {
        Err(SessionError::InvalidContainer(container_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cat_registry() -> SessionRegistry {
        SessionRegistry::new(RegistryConfig {
            launch: LaunchSpec::new("cat"),
            ..RegistryConfig::default()
        })
    }

    #[test]
    fn container_ids_are_validated() {
        assert_eq!(validate_container_id(" web-1 "), Ok("web-1"));
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("--help").is_err());
        assert!(validate_container_id("a b").is_err());
        assert!(validate_container_id("../etc").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_or_create_is_idempotent() {
        let registry = cat_registry();
        let first = registry.get_or_create("web-1").await.expect("first");
        let second = registry.get_or_create("web-1").await.expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list().await.len(), 1);
        registry.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_creation_yields_one_session() {
        let registry = Arc::new(cat_registry());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create("db").await.expect("create")
            }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.expect("join"));
        }
        assert!(sessions.iter().all(|session| Arc::ptr_eq(session, &sessions[0])));
        registry.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_session_is_replaced() {
        let registry = cat_registry();
        let first = registry.get_or_create("web-1").await.expect("first");
        registry.mark_dead("web-1").await.expect("mark dead");
        first.closed().await;

        let second = registry.get_or_create("web-1").await.expect("second");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_alive());
        registry.dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_and_dispose_report_missing_sessions() {
        let registry = cat_registry();
        assert_eq!(
            registry.get("ghost").await.err(),
            Some(SessionError::SessionNotFound("ghost".to_string()))
        );
        assert!(registry.dispose("ghost").await.is_err());

        let session = registry.get_or_create("web-1").await.expect("create");
        tokio::time::timeout(Duration::from_secs(5), registry.dispose("web-1"))
            .await
            .expect("dispose in time")
            .expect("dispose");
        assert!(!session.is_alive());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_errors_leave_no_entry() {
        let registry = SessionRegistry::new(RegistryConfig {
            launch: LaunchSpec::eval("/nonexistent/qube-eval-binary"),
            ..RegistryConfig::default()
        });
        let err = registry.get_or_create("web-1").await.err().expect("spawn error");
        assert_eq!(err.code(), "spawn_error");
        assert!(registry.list().await.is_empty());
    }
}
