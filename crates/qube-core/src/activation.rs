use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    #[error("invalid activation url '{url}': {reason}")]
    Parse { url: String, reason: String },
}

/// Message written by a second instance to the primary's activation socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationForward {
    pub pid: u32,
    pub args: Vec<String>,
}

/// Parses `scheme://<action>/<param>?<query>`.
///
/// The authority becomes the action, the first path segment the param and the
/// query string the key/value map. Later duplicate keys win.
pub fn parse_activation_url(raw: &str) -> Result<ActivationEvent, ActivationError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|err| ActivationError::Parse {
        url: trimmed.to_string(),
        reason: err.to_string(),
    })?;

    let action = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => {
            return Err(ActivationError::Parse {
                url: trimmed.to_string(),
                reason: "missing action".to_string(),
            })
        }
    };

    let param = url
        .path_segments()
        .and_then(|mut segments| segments.next())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);

    let query = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    Ok(ActivationEvent {
        action,
        param,
        query,
    })
}

/// Returns the arguments that look like activation URLs.
pub fn activation_urls(args: &[String]) -> Vec<&str> {
    args.iter()
        .map(String::as_str)
        .filter(|arg| arg.contains("://"))
        .collect()
}

/// Holds at most one activation event until the UI reports it is ready.
#[derive(Debug, Default)]
pub struct ActivationQueue {
    ready: bool,
    pending: Option<ActivationEvent>,
}

impl ActivationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending(&self) -> Option<&ActivationEvent> {
        self.pending.as_ref()
    }

    /// Returns the event when it can be delivered now, otherwise parks it.
    /// A newer parked event replaces an older one.
    pub fn offer(&mut self, event: ActivationEvent) -> Option<ActivationEvent> {
        if self.ready {
            return Some(event);
        }
        if let Some(previous) = self.pending.replace(event) {
            warn!(
                event = "activation_replaced",
                action = %previous.action,
                param = previous.param.as_deref().unwrap_or("")
            );
        }
        None
    }

    /// Parses and offers a raw URL. Malformed URLs are logged and dropped.
    pub fn offer_url(&mut self, raw: &str) -> Option<ActivationEvent> {
        match parse_activation_url(raw) {
            Ok(event) => self.offer(event),
            Err(err) => {
                warn!(event = "activation_parse_error", error = %err);
                None
            }
        }
    }

    /// Marks the UI ready and hands back the parked event, if any.
    pub fn mark_ready(&mut self) -> Option<ActivationEvent> {
        self.ready = true;
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_param_and_query() {
        let event = parse_activation_url("scheme://container/demo?tab=logs").expect("parse");
        assert_eq!(event.action, "container");
        assert_eq!(event.param.as_deref(), Some("demo"));
        assert_eq!(event.query.len(), 1);
        assert_eq!(event.query.get("tab").map(String::as_str), Some("logs"));
    }

    #[test]
    fn param_is_absent_without_path() {
        let event = parse_activation_url("qube://open?page=containers").expect("parse");
        assert_eq!(event.action, "open");
        assert_eq!(event.param, None);
        assert_eq!(
            event.query.get("page").map(String::as_str),
            Some("containers")
        );
    }

    #[test]
    fn only_first_path_segment_is_kept() {
        let event = parse_activation_url("qube://container/web-1/logs/extra").expect("parse");
        assert_eq!(event.param.as_deref(), Some("web-1"));
        assert!(event.query.is_empty());
    }

    #[test]
    fn relative_text_is_a_parse_error() {
        let err = parse_activation_url("not-a-url").expect_err("should fail");
        assert!(matches!(err, ActivationError::Parse { .. }));
    }

    #[test]
    fn url_without_authority_is_a_parse_error() {
        let err = parse_activation_url("qube:container/demo").expect_err("should fail");
        let ActivationError::Parse { reason, .. } = err;
        assert_eq!(reason, "missing action");
    }

    #[test]
    fn activation_urls_filters_plain_arguments() {
        let args = vec![
            "/usr/bin/qube-desktop".to_string(),
            "--debug".to_string(),
            "qube://open?page=containers".to_string(),
        ];
        assert_eq!(activation_urls(&args), vec!["qube://open?page=containers"]);
    }

    #[test]
    fn queued_event_is_delivered_once_after_ready() {
        let mut queue = ActivationQueue::new();
        assert!(queue.offer_url("scheme://open?page=containers").is_none());
        assert!(queue.pending().is_some());

        let delivered = queue.mark_ready().expect("pending event");
        assert_eq!(delivered.action, "open");
        assert_eq!(delivered.param, None);
        assert_eq!(
            delivered.query.get("page").map(String::as_str),
            Some("containers")
        );

        assert!(queue.pending().is_none());
        assert!(queue.mark_ready().is_none());
    }

    #[test]
    fn newer_event_replaces_parked_one() {
        let mut queue = ActivationQueue::new();
        queue.offer_url("qube://container/a");
        queue.offer_url("qube://container/b");
        let delivered = queue.mark_ready().expect("pending");
        assert_eq!(delivered.param.as_deref(), Some("b"));
    }

    #[test]
    fn ready_queue_passes_events_through() {
        let mut queue = ActivationQueue::new();
        assert!(queue.mark_ready().is_none());
        let event = queue.offer_url("qube://container/web-1").expect("delivered");
        assert_eq!(event.param.as_deref(), Some("web-1"));
        assert!(queue.pending().is_none());
    }

    #[test]
    fn malformed_url_is_dropped_without_disturbing_pending() {
        let mut queue = ActivationQueue::new();
        queue.offer_url("qube://container/keep");
        assert!(queue.offer_url("not-a-url").is_none());
        assert_eq!(
            queue.pending().and_then(|event| event.param.as_deref()),
            Some("keep")
        );
    }
}
