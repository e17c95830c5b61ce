use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::{OutputChunk, Session};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(150);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How the correlator decides a command's output is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionMode {
    /// Capture for a fixed window starting when the write completes.
    Quiescence(Duration),
    /// Capture until a line containing the marker appears. The marker line
    /// itself is dropped from the result.
    Marker(String),
}

impl Default for CompletionMode {
    fn default() -> Self {
        CompletionMode::Quiescence(DEFAULT_QUIESCENCE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub completion: CompletionMode,
    pub command_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub dispatched_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub command: Command,
    pub text: String,
    /// Chunks dropped because the listener fell behind the process.
    pub lagged: u64,
}

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    lagged: u64,
}

impl Capture {
    fn push(&mut self, chunk: OutputChunk) {
        self.bytes.extend_from_slice(&chunk.bytes);
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Turns a raw line-oriented process into request/response calls.
#[derive(Debug, Clone, Default)]
pub struct CommandCorrelator {
    config: CorrelatorConfig,
}

impl CommandCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub async fn send_to(
        &self,
        registry: &SessionRegistry,
        container_id: &str,
        text: &str,
    ) -> Result<CapturedOutput, SessionError> {
        let session = registry.get(container_id).await?;
        self.send(&session, text).await
    }

    pub async fn send(&self, session: &Session, text: &str) -> Result<CapturedOutput, SessionError> {
        let queued_at = Instant::now();
        let container_id = session.container_id();
        let _turn = timeout(self.config.command_timeout, session.acquire_turn())
            .await
            .map_err(|_| {
                warn!(event = "command_queue_timeout", container = container_id);
                SessionError::CommandTimedOut {
                    container: container_id.to_string(),
                    waited_ms: elapsed_ms(queued_at),
                }
            })?;
        session.ensure_alive()?;

        let text = text.trim_end_matches(&['\n', '\r'][..]);
        let mut output = session.subscribe();
        session.write_line(text).await?;
        let command = Command {
            text: text.to_string(),
            dispatched_at: Instant::now(),
        };
        debug!(event = "command_dispatched", container = container_id, command = text);

        let capture = match &self.config.completion {
            CompletionMode::Quiescence(window) => {
                capture_window(&mut output, command.dispatched_at + *window).await
            }
            CompletionMode::Marker(marker) => {
                let deadline = command.dispatched_at + self.config.command_timeout;
                capture_until_marker(session, &mut output, marker, deadline).await?
            }
        };
        drop(output);

        if capture.lagged > 0 {
            warn!(
                event = "command_output_lagged",
                container = container_id,
                dropped = capture.lagged
            );
        }
        let captured = CapturedOutput {
            text: capture.text().trim().to_string(),
            lagged: capture.lagged,
            command,
        };
        debug!(
            event = "command_settled",
            container = container_id,
            bytes = captured.text.len()
        );
        Ok(captured)
    }
}

async fn capture_window(output: &mut broadcast::Receiver<OutputChunk>, deadline: Instant) -> Capture {
    let mut capture = Capture::default();
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            received = output.recv() => match received {
                Ok(chunk) => capture.push(chunk),
                Err(RecvError::Lagged(skipped)) => capture.lagged += skipped,
                Err(RecvError::Closed) => break,
            }
        }
    }
    capture
}

async fn capture_until_marker(
    session: &Session,
    output: &mut broadcast::Receiver<OutputChunk>,
    marker: &str,
    deadline: Instant,
) -> Result<Capture, SessionError> {
    let started = Instant::now();
    let mut capture = Capture::default();
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                return Err(SessionError::CommandTimedOut {
                    container: session.container_id().to_string(),
                    waited_ms: elapsed_ms(started),
                });
            }
            _ = session.closed() => {
                return Err(SessionError::ProcessDead(session.container_id().to_string()));
            }
            received = output.recv() => match received {
                Ok(chunk) => {
                    capture.push(chunk);
                    if let Some(before) = text_before_marker(&capture.text(), marker) {
                        capture.bytes = before.into_bytes();
                        return Ok(capture);
                    }
                }
                Err(RecvError::Lagged(skipped)) => capture.lagged += skipped,
                Err(RecvError::Closed) => {
                    return Err(SessionError::ProcessDead(session.container_id().to_string()));
                }
            }
        }
    }
}

fn text_before_marker(text: &str, marker: &str) -> Option<String> {
    let mut before = String::new();
    for line in text.split_inclusive('\n') {
        if line.contains(marker) {
            return Some(before);
        }
        before.push_str(line);
    }
    None
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
