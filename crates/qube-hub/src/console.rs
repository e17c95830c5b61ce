use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use qube_core::console_wire::{
    decode_frame, encode_frame, raw_input_bytes, ClientFrame, OutputStream, ServerFrame,
    StreamProtocol,
};
use qube_session::{
    BridgeEvent, BridgeSubscriber, SessionError, SessionRegistry, StreamingBridge,
};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub quiescence: Duration,
    pub command_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

pub struct ConsoleHub {
    config: ConsoleConfig,
    registry: Arc<SessionRegistry>,
    conn_counter: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct EvalQuery {
    #[serde(default)]
    protocol: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionView {
    container: String,
    pid: Option<u32>,
    alive: bool,
    exit_code: Option<i32>,
    pending_commands: usize,
    uptime_secs: u64,
}

enum Inbound {
    Command { id: u64, text: String },
    Raw(Vec<u8>),
}

pub fn router(hub: Arc<ConsoleHub>) -> Router {
    Router::new()
        .route("/eval/:container/:command", get(eval_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/:container", delete(dispose_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn eval_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((container, command)): Path<(String, String)>,
    Query(query): Query<EvalQuery>,
    State(hub): State<Arc<ConsoleHub>>,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let protocol = match query
        .protocol
        .as_deref()
        .unwrap_or_default()
        .parse::<StreamProtocol>()
    {
        Ok(value) => value,
        Err(err) => return (StatusCode::BAD_REQUEST, err).into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr, container, command, protocol)
            .await;
    })
}

async fn sessions_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<ConsoleHub>>,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let sessions: Vec<SessionView> = hub
        .registry
        .list()
        .await
        .into_iter()
        .map(|info| SessionView {
            container: info.container_id,
            pid: info.pid,
            alive: info.alive,
            exit_code: info.exit_code,
            pending_commands: info.pending_waiters,
            uptime_secs: info.uptime.as_secs(),
        })
        .collect();
    Json(sessions).into_response()
}

async fn dispose_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(container): Path<String>,
    State(hub): State<Arc<ConsoleHub>>,
) -> StatusCode {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN;
    }
    match hub.registry.dispose(&container).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(SessionError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
        Err(err) => {
            warn!(event = "dispose_failed", container = %container, error = %err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ConsoleHub {
    pub fn new(config: ConsoleConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        remote: SocketAddr,
        container: String,
        command: String,
        protocol: StreamProtocol,
    ) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        info!(
            event = "console_connected",
            conn_id = %conn_id,
            container = %container,
            command = %command,
            protocol = %protocol,
            remote = %remote
        );

        let session = match self.registry.get_or_create(&container).await {
            Ok(session) => session,
            Err(err) => {
                warn!(event = "console_session_error", conn_id = %conn_id, error = %err);
                if let Some(msg) = self.error_message(protocol, &err) {
                    let _ = tx.send(msg).await;
                }
                let _ = tx.send(Message::Close(None)).await;
                drop(tx);
                let _ = write_task.await;
                return;
            }
        };

        let (bridge, backlog, subscriber) = StreamingBridge::attach(
            session,
            self.config.quiescence,
            self.config.command_timeout,
        );
        if !backlog.is_empty() {
            let replay = String::from_utf8_lossy(&backlog).into_owned();
            let frame = ServerFrame::Output {
                command_id: None,
                stream: OutputStream::Stdout,
                data: replay.clone(),
            };
            if let Some(msg) = self.outbound(protocol, &frame, replay) {
                let _ = tx.send(msg).await;
            }
            debug!(event = "console_replayed", conn_id = %conn_id, bytes = backlog.len());
        }

        let relay = tokio::spawn(self.clone().relay_output(
            subscriber,
            tx.clone(),
            protocol,
            conn_id.clone(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_CAPACITY);
        let dispatcher = tokio::spawn(self.clone().dispatch_inbound(
            bridge.clone(),
            inbound_rx,
            tx.clone(),
            protocol,
            conn_id.clone(),
        ));

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if text.len() > self.config.max_frame_bytes {
                warn!(event = "message_too_large", conn_id = %conn_id, size = text.len());
                continue;
            }

            let inbound = match protocol {
                StreamProtocol::Raw => {
                    let bytes = raw_input_bytes(&text);
                    if let [byte] = bytes.as_slice() {
                        self.write_control(&bridge, *byte, &tx, protocol, &conn_id)
                            .await;
                        continue;
                    }
                    Inbound::Raw(bytes)
                }
                StreamProtocol::Tagged => {
                    match decode_frame::<ClientFrame>(&text, self.config.max_frame_bytes) {
                        Ok(ClientFrame::Command { id, text }) => Inbound::Command { id, text },
                        Ok(ClientFrame::Control { byte }) => {
                            self.write_control(&bridge, byte, &tx, protocol, &conn_id)
                                .await;
                            continue;
                        }
                        Err(err) => {
                            warn!(event = "message_invalid", conn_id = %conn_id, error = %err);
                            let frame = ServerFrame::error("bad_frame", err.to_string());
                            if let Some(msg) = self.outbound(protocol, &frame, err.to_string()) {
                                let _ = tx.send(msg).await;
                            }
                            continue;
                        }
                    }
                }
            };
            if inbound_tx.send(inbound).await.is_err() {
                break;
            }
        }

        drop(inbound_tx);
        dispatcher.abort();
        relay.abort();
        drop(tx);
        let _ = write_task.await;
        info!(event = "console_disconnected", conn_id = %conn_id, container = %container);
    }

    async fn relay_output(
        self: Arc<Self>,
        mut subscriber: BridgeSubscriber,
        tx: mpsc::Sender<Message>,
        protocol: StreamProtocol,
        conn_id: String,
    ) {
        while let Some(event) = subscriber.next().await {
            let (frame, raw) = match event {
                BridgeEvent::Output { command_id, chunk } => {
                    let data = chunk.text();
                    (
                        ServerFrame::Output {
                            command_id,
                            stream: chunk.stream,
                            data: data.clone(),
                        },
                        data,
                    )
                }
                BridgeEvent::Settled { command_id } => {
                    debug!(event = "command_settled", conn_id = %conn_id, command_id);
                    (ServerFrame::Settled { command_id }, String::new())
                }
                BridgeEvent::TimedOut { command_id, waited_ms } => {
                    let err = SessionError::CommandTimedOut {
                        container: subscriber.container_id().to_string(),
                        waited_ms,
                    };
                    warn!(event = "command_timed_out", conn_id = %conn_id, command_id, waited_ms);
                    (ServerFrame::error(err.code(), err.to_string()), String::new())
                }
                BridgeEvent::Lagged { skipped } => (
                    ServerFrame::error("output_lagged", format!("{skipped} output chunks dropped")),
                    String::new(),
                ),
                BridgeEvent::Exited { code } => {
                    info!(event = "console_process_exited", conn_id = %conn_id, code = code.unwrap_or(-1));
                    if let Some(msg) = self.outbound(protocol, &ServerFrame::Exited { code }, String::new()) {
                        let _ = tx.send(msg).await;
                    }
                    let _ = tx.send(Message::Close(None)).await;
                    return;
                }
            };
            if let Some(msg) = self.outbound(protocol, &frame, raw) {
                if tx.send(msg).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn dispatch_inbound(
        self: Arc<Self>,
        bridge: Arc<StreamingBridge>,
        mut inbound: mpsc::Receiver<Inbound>,
        tx: mpsc::Sender<Message>,
        protocol: StreamProtocol,
        conn_id: String,
    ) {
        while let Some(item) = inbound.recv().await {
            let result = match &item {
                Inbound::Command { id, text } => bridge.submit_command(*id, text).await,
                Inbound::Raw(bytes) => bridge.submit_raw(bytes).await,
            };
            if let Err(err) = result {
                warn!(event = "console_write_error", conn_id = %conn_id, error = %err);
                if let Some(msg) = self.error_message(protocol, &err) {
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn write_control(
        &self,
        bridge: &StreamingBridge,
        byte: u8,
        tx: &mpsc::Sender<Message>,
        protocol: StreamProtocol,
        conn_id: &str,
    ) {
        debug!(event = "console_control", conn_id = %conn_id, byte);
        if let Err(err) = bridge.submit_control(byte).await {
            warn!(event = "console_write_error", conn_id = %conn_id, error = %err);
            if let Some(msg) = self.error_message(protocol, &err) {
                let _ = tx.send(msg).await;
            }
        }
    }

    fn error_message(&self, protocol: StreamProtocol, err: &SessionError) -> Option<Message> {
        let frame = ServerFrame::error(err.code(), err.to_string());
        self.outbound(protocol, &frame, err.to_string())
    }

    /// Renders a frame for the connection's protocol. Raw connections get the
    /// plain text instead, and nothing at all when it is empty.
    fn outbound(&self, protocol: StreamProtocol, frame: &ServerFrame, raw: String) -> Option<Message> {
        match protocol {
            StreamProtocol::Raw if raw.is_empty() => None,
            StreamProtocol::Raw => Some(Message::Text(raw)),
            StreamProtocol::Tagged => match encode_frame(frame, self.config.max_frame_bytes) {
                Ok(encoded) => Some(Message::Text(encoded)),
                Err(err) => {
                    warn!(event = "frame_encode_failed", error = %err);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qube_core::console_wire::DEFAULT_MAX_FRAME_BYTES;
    use qube_session::{LaunchSpec, RegistryConfig};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> ConsoleConfig {
        ConsoleConfig {
            quiescence: Duration::from_millis(150),
            command_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    async fn launch_hub(spec: LaunchSpec) -> (SocketAddr, Arc<ConsoleHub>) {
        launch_hub_with(test_config(), spec).await
    }

    async fn launch_hub_with(config: ConsoleConfig, spec: LaunchSpec) -> (SocketAddr, Arc<ConsoleHub>) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            launch: spec,
            ..RegistryConfig::default()
        }));
        let hub = Arc::new(ConsoleHub::new(config, registry));
        let app = router(hub.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind hub");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        (addr, hub)
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}{path}"))
            .await
            .expect("connect");
        client
    }

    async fn next_text(client: &mut Client) -> Option<String> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("message in time")?;
            match msg.expect("ws read") {
                WsMessage::Text(text) => return Some(text),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn next_frame(client: &mut Client) -> ServerFrame {
        let text = next_text(client).await.expect("frame");
        decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode frame")
    }

    async fn send_frame(client: &mut Client, frame: &ClientFrame) {
        let text = encode_frame(frame, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        client.send(WsMessage::Text(text)).await.expect("send");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn raw_protocol_appends_newline_and_streams_output() {
        let (addr, hub) = launch_hub(LaunchSpec::new("cat")).await;
        let mut client = connect(addr, "/eval/web-1/command").await;

        client
            .send(WsMessage::Text("ls".to_string()))
            .await
            .expect("send");
        assert_eq!(next_text(&mut client).await.as_deref(), Some("ls\n"));
        hub.registry().dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tagged_protocol_attributes_output_and_settles() {
        let (addr, hub) = launch_hub(LaunchSpec::new("cat")).await;
        let mut client = connect(addr, "/eval/web-1/command?protocol=tagged").await;

        send_frame(
            &mut client,
            &ClientFrame::Command {
                id: 1,
                text: "whoami".to_string(),
            },
        )
        .await;
        assert_eq!(
            next_frame(&mut client).await,
            ServerFrame::Output {
                command_id: Some(1),
                stream: OutputStream::Stdout,
                data: "whoami\n".to_string(),
            }
        );
        assert_eq!(
            next_frame(&mut client).await,
            ServerFrame::Settled { command_id: 1 }
        );
        hub.registry().dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endless_command_gets_timed_out_frame_then_settles() {
        let config = ConsoleConfig {
            command_timeout: Duration::from_millis(500),
            ..test_config()
        };
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("read line; while :; do echo x; sleep 0.02; done");
        let (addr, hub) = launch_hub_with(config, spec).await;
        let mut client = connect(addr, "/eval/web-1/command?protocol=tagged").await;

        send_frame(
            &mut client,
            &ClientFrame::Command {
                id: 3,
                text: "go".to_string(),
            },
        )
        .await;
        let mut error_code = None;
        loop {
            match next_frame(&mut client).await {
                ServerFrame::Output { command_id, .. } => assert_eq!(command_id, Some(3)),
                ServerFrame::Error { code, .. } => error_code = Some(code),
                ServerFrame::Settled { command_id } => {
                    assert_eq!(command_id, 3);
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(error_code.as_deref(), Some("command_timed_out"));
        hub.registry().dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reattach_replays_buffered_output() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("echo 'welcome to {container}'; cat");
        let (addr, hub) = launch_hub(spec).await;

        let mut first = connect(addr, "/eval/web-1/command").await;
        assert_eq!(
            next_text(&mut first).await.as_deref(),
            Some("welcome to web-1\n")
        );
        first.close(None).await.expect("close first");

        let mut second = connect(addr, "/eval/web-1/command?protocol=tagged").await;
        assert_eq!(
            next_frame(&mut second).await,
            ServerFrame::Output {
                command_id: None,
                stream: OutputStream::Stdout,
                data: "welcome to web-1\n".to_string(),
            }
        );
        assert_eq!(hub.registry().list().await.len(), 1);
        hub.registry().dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_is_reported_and_socket_closed() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("read line; exit 3");
        let (addr, _hub) = launch_hub(spec).await;
        let mut client = connect(addr, "/eval/db/command?protocol=tagged").await;

        send_frame(
            &mut client,
            &ClientFrame::Command {
                id: 9,
                text: "quit".to_string(),
            },
        )
        .await;
        let mut saw_exit = false;
        while let Some(text) = next_text(&mut client).await {
            let frame: ServerFrame = decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            if frame == (ServerFrame::Exited { code: Some(3) }) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_is_sent_before_close() {
        let (addr, _hub) = launch_hub(LaunchSpec::eval("/nonexistent/qube-eval-binary")).await;

        let mut raw = connect(addr, "/eval/web-1/command").await;
        let text = next_text(&mut raw).await.expect("error text");
        assert!(text.contains("web-1"));
        assert!(next_text(&mut raw).await.is_none());

        let mut tagged = connect(addr, "/eval/web-1/command?protocol=tagged").await;
        match next_frame(&mut tagged).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, "spawn_error"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_tagged_frame_gets_error_frame() {
        let (addr, hub) = launch_hub(LaunchSpec::new("cat")).await;
        let mut client = connect(addr, "/eval/web-1/command?protocol=tagged").await;

        client
            .send(WsMessage::Text("{\"type\":\"resize\"}".to_string()))
            .await
            .expect("send");
        match next_frame(&mut client).await {
            ServerFrame::Error { code, .. } => assert_eq!(code, "bad_frame"),
            other => panic!("unexpected frame: {other:?}"),
        }
        hub.registry().dispose_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sessions_endpoint_lists_and_disposes() {
        let (addr, hub) = launch_hub(LaunchSpec::new("cat")).await;
        hub.registry().get_or_create("web-1").await.expect("session");

        let listing = http_request(addr, "GET", "/sessions").await;
        assert!(listing.starts_with("HTTP/1.1 200"));
        assert!(listing.contains("\"container\":\"web-1\""));
        assert!(listing.contains("\"alive\":true"));

        let deleted = http_request(addr, "DELETE", "/sessions/web-1").await;
        assert!(deleted.starts_with("HTTP/1.1 204"));
        let missing = http_request(addr, "DELETE", "/sessions/web-1").await;
        assert!(missing.starts_with("HTTP/1.1 404"));
    }

    async fn http_request(addr: SocketAddr, method: &str, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
        let request =
            format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write request");
        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
            .await
            .expect("response in time")
            .expect("read response");
        response
    }

    #[test]
    fn raw_outbound_skips_empty_text() {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let hub = ConsoleHub::new(test_config(), registry);
        let frame = ServerFrame::Settled { command_id: 1 };
        assert!(hub.outbound(StreamProtocol::Raw, &frame, String::new()).is_none());
        match hub.outbound(StreamProtocol::Tagged, &frame, String::new()) {
            Some(Message::Text(text)) => assert_eq!(text, r#"{"type":"settled","command_id":1}"#),
            _ => panic!("expected tagged text"),
        }
    }
}
