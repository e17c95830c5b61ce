use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use qube_core::console_wire::{
    decode_frame, encode_frame, ClientFrame, ServerFrame, DEFAULT_MAX_FRAME_BYTES,
};
use qube_core::engine::{ContainerEntry, EngineClient};
use qube_session::LocalBridge;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 64;
const CONSOLE_COMMAND_SEGMENT: &str = "command";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Sessions hosted in this process, one request/response call per command.
    #[default]
    Local,
    /// Tagged websocket stream from a running hub.
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => f.write_str("local"),
            TransportKind::Stream => f.write_str("stream"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "local" | "ipc" => Ok(TransportKind::Local),
            "stream" | "ws" | "websocket" => Ok(TransportKind::Stream),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect { container: String },
    Dispatch { id: u64, text: String },
    Control(u8),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting { container: String },
    Connected { container: String },
    Output { command_id: Option<u64>, data: String },
    Settled { command_id: u64 },
    CommandResult { command_id: u64, text: String },
    CommandFailed { command_id: Option<u64>, message: String },
    Exited { code: Option<i32> },
    Disconnected { reason: Option<String> },
    ContainerInfo(Option<ContainerEntry>),
}

pub struct TransportHandle {
    pub commands: mpsc::Sender<TransportCommand>,
    pub task: JoinHandle<()>,
}

pub fn spawn_local(
    bridge: Arc<LocalBridge>,
    events: mpsc::Sender<TransportEvent>,
) -> TransportHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let task = tokio::spawn(run_local(bridge, rx, events));
    TransportHandle { commands: tx, task }
}

pub fn spawn_stream(
    engine: EngineClient,
    events: mpsc::Sender<TransportEvent>,
) -> TransportHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let task = tokio::spawn(run_stream(engine, rx, events));
    TransportHandle { commands: tx, task }
}

async fn run_local(
    bridge: Arc<LocalBridge>,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut watcher: Option<JoinHandle<()>> = None;
    while let Some(command) = commands.recv().await {
        match command {
            TransportCommand::Connect { container } => {
                if let Some(task) = watcher.take() {
                    task.abort();
                }
                if let Err(err) = bridge.close().await {
                    warn!(event = "local_close_error", error = %err);
                }
                let _ = events
                    .send(TransportEvent::Connecting {
                        container: container.clone(),
                    })
                    .await;
                bridge.navigate(&format!("console?name={container}")).await;
                match bridge.start_session(&container).await {
                    Ok(container) => {
                        watcher = watch_exit(&bridge, &container, events.clone()).await;
                        let _ = events.send(TransportEvent::Connected { container }).await;
                    }
                    Err(err) => {
                        warn!(event = "local_connect_error", container = %container, error = %err);
                        let _ = events
                            .send(TransportEvent::Disconnected {
                                reason: Some(err.to_string()),
                            })
                            .await;
                    }
                }
            }
            TransportCommand::Dispatch { id, text } => {
                let bridge = bridge.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let event = match bridge.send_command(&text).await {
                        Ok(captured) => TransportEvent::CommandResult {
                            command_id: id,
                            text: captured.text,
                        },
                        Err(err) => TransportEvent::CommandFailed {
                            command_id: Some(id),
                            message: err.to_string(),
                        },
                    };
                    let _ = events.send(event).await;
                });
            }
            TransportCommand::Control(byte) => {
                if let Err(err) = bridge.send_control(byte).await {
                    let _ = events
                        .send(TransportEvent::CommandFailed {
                            command_id: None,
                            message: err.to_string(),
                        })
                        .await;
                }
            }
            TransportCommand::Shutdown => break,
        }
    }
    if let Some(task) = watcher.take() {
        task.abort();
    }
    bridge.registry().dispose_all().await;
    debug!(event = "local_transport_stopped");
}

async fn watch_exit(
    bridge: &LocalBridge,
    container: &str,
    events: mpsc::Sender<TransportEvent>,
) -> Option<JoinHandle<()>> {
    let session = bridge.registry().get(container).await.ok()?;
    Some(tokio::spawn(async move {
        session.closed().await;
        let _ = events
            .send(TransportEvent::Exited {
                code: session.exit_code(),
            })
            .await;
    }))
}

async fn run_stream(
    engine: EngineClient,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut writer: Option<SplitSink<WsStream, WsMessage>> = None;
    let mut reader: Option<JoinHandle<()>> = None;

    while let Some(command) = commands.recv().await {
        match command {
            TransportCommand::Connect { container } => {
                if let Some(task) = reader.take() {
                    task.abort();
                }
                if let Some(mut sink) = writer.take() {
                    let _ = sink.close().await;
                }
                let _ = events
                    .send(TransportEvent::Connecting {
                        container: container.clone(),
                    })
                    .await;

                let url = match engine.console_url(&container, CONSOLE_COMMAND_SEGMENT) {
                    Ok(mut url) => {
                        url.set_query(Some("protocol=tagged"));
                        url
                    }
                    Err(err) => {
                        let _ = events
                            .send(TransportEvent::Disconnected {
                                reason: Some(err.to_string()),
                            })
                            .await;
                        continue;
                    }
                };
                match connect_async(url.as_str()).await {
                    Ok((socket, _)) => {
                        info!(event = "stream_connected", container = %container, url = %url);
                        let (sink, stream) = socket.split();
                        writer = Some(sink);
                        reader = Some(tokio::spawn(read_frames(stream, events.clone())));
                        let _ = events.send(TransportEvent::Connected { container }).await;
                    }
                    Err(err) => {
                        warn!(event = "stream_connect_error", container = %container, error = %err);
                        let _ = events
                            .send(TransportEvent::Disconnected {
                                reason: Some(err.to_string()),
                            })
                            .await;
                    }
                }
            }
            TransportCommand::Dispatch { id, text } => {
                let frame = ClientFrame::Command { id, text };
                if let Err(message) = send_client_frame(writer.as_mut(), &frame).await {
                    let _ = events
                        .send(TransportEvent::CommandFailed {
                            command_id: Some(id),
                            message,
                        })
                        .await;
                }
            }
            TransportCommand::Control(byte) => {
                let frame = ClientFrame::Control { byte };
                if let Err(message) = send_client_frame(writer.as_mut(), &frame).await {
                    let _ = events
                        .send(TransportEvent::CommandFailed {
                            command_id: None,
                            message,
                        })
                        .await;
                }
            }
            TransportCommand::Shutdown => break,
        }
    }

    if let Some(task) = reader.take() {
        task.abort();
    }
    if let Some(mut sink) = writer.take() {
        let _ = sink.close().await;
    }
    debug!(event = "stream_transport_stopped");
}

async fn send_client_frame(
    writer: Option<&mut SplitSink<WsStream, WsMessage>>,
    frame: &ClientFrame,
) -> Result<(), String> {
    let Some(writer) = writer else {
        return Err("not connected".to_string());
    };
    let text = encode_frame(frame, DEFAULT_MAX_FRAME_BYTES).map_err(|err| err.to_string())?;
    writer
        .send(WsMessage::Text(text))
        .await
        .map_err(|err| err.to_string())
}

async fn read_frames(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut reason = None;
    while let Some(result) = stream.next().await {
        let text = match result {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                reason = Some(err.to_string());
                break;
            }
        };
        let frame = match decode_frame::<ServerFrame>(&text, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "stream_decode_error", error = %err);
                continue;
            }
        };
        if let Some(event) = frame_event(frame) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Disconnected { reason }).await;
}

fn frame_event(frame: ServerFrame) -> Option<TransportEvent> {
    match frame {
        ServerFrame::Output {
            command_id, data, ..
        } => Some(TransportEvent::Output { command_id, data }),
        ServerFrame::Settled { command_id } => Some(TransportEvent::Settled { command_id }),
        ServerFrame::Exited { code } => Some(TransportEvent::Exited { code }),
        ServerFrame::Error { code, message } => {
            if code == "output_lagged" {
                warn!(event = "stream_output_lagged", message = %message);
                return None;
            }
            Some(TransportEvent::CommandFailed {
                command_id: None,
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qube_core::console_wire::OutputStream;
    use qube_session::{CommandCorrelator, LaunchSpec, RegistryConfig, SessionRegistry};
    use std::time::Duration;

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("transport open")
    }

    fn local_bridge(spec: LaunchSpec) -> Arc<LocalBridge> {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            launch: spec,
            ..RegistryConfig::default()
        }));
        Arc::new(LocalBridge::new(registry, CommandCorrelator::default()))
    }

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("".parse::<TransportKind>(), Ok(TransportKind::Local));
        assert_eq!("WS".parse::<TransportKind>(), Ok(TransportKind::Stream));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Stream.to_string(), "stream");
    }

    #[test]
    fn server_frames_map_to_events() {
        assert_eq!(
            frame_event(ServerFrame::Output {
                command_id: Some(4),
                stream: OutputStream::Stderr,
                data: "oops".to_string(),
            }),
            Some(TransportEvent::Output {
                command_id: Some(4),
                data: "oops".to_string(),
            })
        );
        assert_eq!(
            frame_event(ServerFrame::error("process_dead", "gone")),
            Some(TransportEvent::CommandFailed {
                command_id: None,
                message: "gone".to_string(),
            })
        );
        assert_eq!(frame_event(ServerFrame::error("output_lagged", "3 dropped")), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_transport_round_trips_a_command() {
        let (events_tx, mut events) = mpsc::channel(32);
        let handle = spawn_local(local_bridge(LaunchSpec::new("cat")), events_tx);

        handle
            .commands
            .send(TransportCommand::Connect {
                container: "web-1".to_string(),
            })
            .await
            .expect("connect");
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Connecting {
                container: "web-1".to_string()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Connected {
                container: "web-1".to_string()
            }
        );

        handle
            .commands
            .send(TransportCommand::Dispatch {
                id: 1,
                text: "hello".to_string(),
            })
            .await
            .expect("dispatch");
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::CommandResult {
                command_id: 1,
                text: "hello".to_string(),
            }
        );

        handle
            .commands
            .send(TransportCommand::Shutdown)
            .await
            .expect("shutdown");
        handle.task.await.expect("transport task");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_transport_reports_exit() {
        let (events_tx, mut events) = mpsc::channel(32);
        let handle = spawn_local(
            local_bridge(LaunchSpec::new("sh").arg("-c").arg("read line; exit 2")),
            events_tx,
        );
        handle
            .commands
            .send(TransportCommand::Connect {
                container: "db".to_string(),
            })
            .await
            .expect("connect");
        next_event(&mut events).await;
        next_event(&mut events).await;

        handle
            .commands
            .send(TransportCommand::Dispatch {
                id: 1,
                text: "bye".to_string(),
            })
            .await
            .expect("dispatch");
        let mut saw_exit = false;
        for _ in 0..2 {
            if next_event(&mut events).await == (TransportEvent::Exited { code: Some(2) }) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
        let _ = handle.commands.send(TransportCommand::Shutdown).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_transport_without_connection_fails_commands() {
        let (events_tx, mut events) = mpsc::channel(32);
        let engine = EngineClient::new("http://127.0.0.1:9").expect("engine client");
        let handle = spawn_stream(engine, events_tx);
        handle
            .commands
            .send(TransportCommand::Dispatch {
                id: 3,
                text: "ls".to_string(),
            })
            .await
            .expect("dispatch");
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::CommandFailed {
                command_id: Some(3),
                message: "not connected".to_string(),
            }
        );
        let _ = handle.commands.send(TransportCommand::Shutdown).await;
    }
}
