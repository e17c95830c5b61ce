use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:3030";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerEntry {
    pub name: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Value,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
}

impl ContainerEntry {
    pub fn is_running(&self) -> bool {
        self.pid > 0
    }

    pub fn ports_label(&self) -> String {
        match &self.ports {
            Value::Null => "none".to_string(),
            Value::String(text) if text.trim().is_empty() => "none".to_string(),
            Value::String(text) => text.clone(),
            Value::Array(items) if items.is_empty() => "none".to_string(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            other => other.to_string(),
        }
    }

    pub fn command_line(&self) -> Option<String> {
        if self.command.is_empty() {
            None
        } else {
            Some(self.command.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerList {
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid api base '{0}'")]
    InvalidBase(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{path} returned status {status}")]
    Status { path: String, status: u16 },
}

/// Client for the REST API owned by the container engine.
#[derive(Debug, Clone)]
pub struct EngineClient {
    base: Url,
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(api_base: &str) -> Result<Self, EngineError> {
        let mut normalized = api_base.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base =
            Url::parse(&normalized).map_err(|_| EngineError::InvalidBase(api_base.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(EngineError::InvalidBase(api_base.to_string()));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Websocket URL of the streaming console for `container`.
    pub fn console_url(&self, container: &str, command: &str) -> Result<Url, EngineError> {
        let mut url = self.endpoint(&format!("eval/{container}/{command}"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| EngineError::InvalidBase(self.base.to_string()))?;
        Ok(url)
    }

    pub async fn list(&self) -> Result<ContainerList, EngineError> {
        let response = self.http.get(self.endpoint("list")?).send().await?;
        let response = check_status(response, "/list")?;
        Ok(response.json().await?)
    }

    pub async fn find(&self, name: &str) -> Result<Option<ContainerEntry>, EngineError> {
        let list = self.list().await?;
        Ok(list.containers.into_iter().find(|entry| entry.name == name))
    }

    pub async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.post(&format!("start/{name}")).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.post(&format!("stop/{name}")).await
    }

    pub async fn images(&self) -> Result<Value, EngineError> {
        self.get_json("images").await
    }

    pub async fn volumes(&self) -> Result<Value, EngineError> {
        self.get_json("volumes").await
    }

    async fn get_json(&self, path: &str) -> Result<Value, EngineError> {
        let response = self.http.get(self.endpoint(path)?).send().await?;
        let response = check_status(response, &format!("/{path}"))?;
        Ok(response.json().await?)
    }

    async fn post(&self, path: &str) -> Result<(), EngineError> {
        let response = self.http.post(self.endpoint(path)?).send().await?;
        check_status(response, &format!("/{path}"))?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, EngineError> {
        self.base
            .join(path)
            .map_err(|_| EngineError::InvalidBase(self.base.to_string()))
    }
}

fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(EngineError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        })
    }
}

pub fn format_uptime(started_at: Option<i64>, now: i64) -> String {
    let Some(started_at) = started_at.filter(|ts| *ts > 0) else {
        return "—".to_string();
    };
    let elapsed = (now - started_at).max(0);
    let days = elapsed / 86_400;
    let hours = (elapsed % 86_400) / 3_600;
    let minutes = (elapsed % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

pub fn format_memory(memory_mb: Option<f64>) -> String {
    match memory_mb {
        Some(value) if value >= 1024.0 => format!("{:.1}G", value / 1024.0),
        Some(value) => format!("{value:.1}M"),
        None => "—".to_string(),
    }
}
