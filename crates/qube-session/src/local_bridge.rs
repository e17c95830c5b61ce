use crate::correlator::{CapturedOutput, CommandCorrelator};
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Request/response access to sessions for an in-process UI.
///
/// The target container comes from the current navigation context rather
/// than from each call, mirroring a console page addressed as
/// `console?name=<container>`.
pub struct LocalBridge {
    registry: Arc<SessionRegistry>,
    correlator: CommandCorrelator,
    current: RwLock<Option<String>>,
}

impl LocalBridge {
    pub fn new(registry: Arc<SessionRegistry>, correlator: CommandCorrelator) -> Self {
        Self {
            registry,
            correlator,
            current: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Updates the navigation context. Returns the container it names, if any.
    pub async fn navigate(&self, location: &str) -> Option<String> {
        let container = container_from_location(location);
        debug!(event = "bridge_navigate", location, container = ?container);
        *self.current.write().await = container.clone();
        container
    }

    pub async fn current_container(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    pub async fn start_session(&self, container_id: &str) -> Result<String, SessionError> {
        let session = self.registry.get_or_create(container_id).await?;
        let container_id = session.container_id().to_string();
        *self.current.write().await = Some(container_id.clone());
        info!(event = "bridge_session_started", container = %container_id);
        Ok(container_id)
    }

    pub async fn send_command(&self, text: &str) -> Result<CapturedOutput, SessionError> {
        let container_id = self.require_container().await?;
        self.correlator
            .send_to(&self.registry, &container_id, text)
            .await
    }

    pub async fn send_control(&self, byte: u8) -> Result<(), SessionError> {
        let container_id = self.require_container().await?;
        let session = self.registry.get(&container_id).await?;
        session.write_bytes(&[byte]).await
    }

    /// Disposes the session for the current container, if there is one.
    pub async fn close(&self) -> Result<(), SessionError> {
        let Some(container_id) = self.current.write().await.take() else {
            return Ok(());
        };
        match self.registry.dispose(&container_id).await {
            Err(SessionError::SessionNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn require_container(&self) -> Result<String, SessionError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(SessionError::NoContainerSelected)
    }
}

/// Extracts the `name` query parameter from an address-bar style location
/// such as `console.html?name=web-1` or `qube://console?name=web-1#top`.
pub fn container_from_location(location: &str) -> Option<String> {
    let without_fragment = location.split('#').next().unwrap_or_default();
    let (_, query) = without_fragment.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "name")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
