mod activation;
mod console;
mod transport;
mod ui;

use activation::{lock_path, route_activation, socket_path, ActivationListener, InstanceLock, Route};
use anyhow::Context;
use clap::Parser;
use console::{Console, Effect};
use crossterm::{
    cursor,
    event::{Event, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use qube_core::activation::{activation_urls, ActivationQueue};
use qube_core::engine::{EngineClient, DEFAULT_API_BASE};
use qube_session::{
    CommandCorrelator, CompletionMode, CorrelatorConfig, LaunchSpec, LocalBridge, RegistryConfig,
    SessionRegistry, DEFAULT_OUTPUT_BUFFER_BYTES,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    fs::OpenOptions,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{TransportCommand, TransportEvent, TransportHandle, TransportKind};

const DEFAULT_EVAL_BIN: &str = "qube";
const DEFAULT_LOG_DIR: &str = ".qube/logs";
const DEFAULT_STATE_DIR: &str = ".qube";
const TICK_MS: u64 = 100;
const INFO_REFRESH_SECS: u64 = 5;
const EVENT_QUEUE_CAPACITY: usize = 256;
const TRANSPORT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
struct Config {
    transport: TransportKind,
    api_base: String,
    state_dir: PathBuf,
    log_dir: String,
    eval_bin: String,
    quiescence: Duration,
    command_timeout: Duration,
    debug: bool,
    container: Option<String>,
    activation_args: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "qube-desktop", about = "Terminal console for Qube containers")]
struct Args {
    #[arg(long, default_value = "")]
    transport: String,
    #[arg(long, default_value = "")]
    api_base: String,
    #[arg(long, default_value = "")]
    state_dir: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value = "")]
    eval_bin: String,
    #[arg(long, env = "QUBE_QUIESCENCE_MS", default_value_t = 150)]
    quiescence_ms: u64,
    #[arg(long, env = "QUBE_COMMAND_TIMEOUT_MS", default_value_t = 10_000)]
    command_timeout_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Container to open on start.
    #[arg(long)]
    container: Option<String>,
    /// Activation URLs such as `qube://container/web-1`.
    #[arg(value_name = "URL")]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config);

    let lock_file = lock_path(&config.state_dir);
    let Some(lock) = InstanceLock::try_acquire(&lock_file)
        .with_context(|| format!("open instance lock {}", lock_file.display()))?
    else {
        let socket = socket_path(&config.state_dir);
        forward_activation_or_fail(&socket, &config.activation_args).await?;
        eprintln!("qube-desktop is already running; activation forwarded");
        return Ok(());
    };
    info!(event = "instance_lock_acquired", path = %lock.path().display());
    let socket = socket_path(&config.state_dir);
    let bound = activation::bind_listener(&socket)
        .with_context(|| format!("bind activation socket {}", socket.display()))?;

    let result = run(config, bound).await;
    drop(lock);
    result
}

async fn forward_activation_or_fail(socket: &std::path::Path, args: &[String]) -> anyhow::Result<()> {
    activation::forward_activation(socket, args)
        .await
        .with_context(|| format!("forward activation to {}", socket.display()))
}

async fn run(config: Config, bound: ActivationListener) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (url_tx, mut url_rx) = mpsc::channel::<String>(16);
    let listener = tokio::spawn(activation::run_listener(bound, url_tx, shutdown_rx));

    let mut activations = ActivationQueue::new();
    for url in activation_urls(&config.activation_args) {
        activations.offer_url(url);
    }

    let engine = EngineClient::new(&config.api_base)
        .with_context(|| format!("invalid api base '{}'", config.api_base))?;
    let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE_CAPACITY);
    let (transport, registry) = spawn_transport(&config, engine.clone(), events_tx.clone());
    let mut console = Console::new(config.command_timeout);
    console.set_note(format!("transport: {}", config.transport));

    let raw_mode = TerminalRestore::enable()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    if let Some(container) = &config.container {
        apply_route(
            Route::SwitchContainer(container.clone()),
            &mut console,
            &transport,
            &engine,
            &events_tx,
        );
    }
    while let Ok(url) = url_rx.try_recv() {
        activations.offer_url(&url);
    }
    if let Some(event) = activations.mark_ready() {
        apply_route(
            route_activation(&event),
            &mut console,
            &transport,
            &engine,
            &events_tx,
        );
    }

    let loop_result = event_loop(
        &mut terminal,
        &mut console,
        &mut activations,
        &transport,
        &engine,
        &events_tx,
        &mut events_rx,
        &mut url_rx,
    )
    .await;

    drop(terminal);
    raw_mode.finish()?;

    let _ = transport.commands.send(TransportCommand::Shutdown).await;
    if tokio::time::timeout(TRANSPORT_STOP_TIMEOUT, transport.task)
        .await
        .is_err()
    {
        warn!(event = "transport_stop_timeout");
    }
    if let Some(registry) = registry {
        registry.dispose_all().await;
    }
    let _ = shutdown_tx.send(true);
    match listener.await {
        Ok(Err(err)) => warn!(event = "activation_listener_error", error = %err),
        Err(err) => warn!(event = "activation_listener_join_error", error = %err),
        Ok(Ok(())) => {}
    }
    info!(event = "desktop_stop");
    loop_result
}

/// Leaves raw mode and the alternate screen when dropped, so a failed setup
/// step or loop error does not leave the user's shell unusable.
struct TerminalRestore {
    armed: bool,
}

impl TerminalRestore {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self { armed: true })
    }

    fn finish(mut self) -> io::Result<()> {
        self.armed = false;
        disable_raw_mode()?;
        restore_screen(&mut io::stdout())
    }
}

impl Drop for TerminalRestore {
    fn drop(&mut self) {
        if self.armed {
            let _ = disable_raw_mode();
            let _ = restore_screen(&mut io::stdout());
        }
    }
}

fn restore_screen<W: io::Write>(out: &mut W) -> io::Result<()> {
    execute!(out, LeaveAlternateScreen, cursor::Show)
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    console: &mut Console,
    activations: &mut ActivationQueue,
    transport: &TransportHandle,
    engine: &EngineClient,
    events_tx: &mpsc::Sender<TransportEvent>,
    events_rx: &mut mpsc::Receiver<TransportEvent>,
    url_rx: &mut mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let mut keys = EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
    let mut info_ticker = tokio::time::interval(Duration::from_secs(INFO_REFRESH_SECS));

    loop {
        let view = console.view(chrono::Utc::now().timestamp());
        terminal.draw(|frame| ui::render_ui(frame, &view))?;

        tokio::select! {
            _ = tick.tick() => {
                console.tick(Instant::now());
            }
            _ = info_ticker.tick() => {
                if let Some(container) = console.container() {
                    refresh_container_info(engine.clone(), container.to_string(), events_tx.clone());
                }
            }
            Some(event) = events_rx.recv() => {
                let stale = matches!(
                    &event,
                    TransportEvent::ContainerInfo(Some(entry))
                        if console.container() != Some(entry.name.as_str())
                );
                if !stale {
                    console.apply(event);
                }
            }
            Some(url) = url_rx.recv() => {
                if let Some(event) = activations.offer_url(&url) {
                    apply_route(route_activation(&event), console, transport, engine, events_tx);
                }
            }
            maybe_event = keys.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) => {
                        if let Some(effect) = console.handle_key(key) {
                            if perform(effect, console, transport) {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => warn!(event = "terminal_event_error", error = %err),
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Runs a console effect. Returns true when the console asked to quit.
fn perform(effect: Effect, console: &mut Console, transport: &TransportHandle) -> bool {
    let (command, command_id) = match effect {
        Effect::Quit => return true,
        Effect::Dispatch { id, text } => (TransportCommand::Dispatch { id, text }, Some(id)),
        Effect::Control(byte) => (TransportCommand::Control(byte), None),
    };
    if let Err(err) = transport.commands.try_send(command) {
        warn!(event = "transport_queue_error", error = %err);
        console.apply(TransportEvent::CommandFailed {
            command_id,
            message: "transport busy".to_string(),
        });
    }
    false
}

fn apply_route(
    route: Route,
    console: &mut Console,
    transport: &TransportHandle,
    engine: &EngineClient,
    events_tx: &mpsc::Sender<TransportEvent>,
) {
    match route {
        Route::SwitchContainer(container) => {
            info!(event = "switch_container", container = %container);
            console.set_note(format!("opened {container}"));
            console.set_container_info(None);
            if let Err(err) = transport.commands.try_send(TransportCommand::Connect {
                container: container.clone(),
            }) {
                warn!(event = "transport_queue_error", error = %err);
            }
            refresh_container_info(engine.clone(), container, events_tx.clone());
        }
        Route::Note(note) => console.set_note(note),
    }
}

fn refresh_container_info(
    engine: EngineClient,
    container: String,
    events: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        match engine.find(&container).await {
            Ok(info) => {
                let _ = events.send(TransportEvent::ContainerInfo(info)).await;
            }
            Err(err) => debug!(event = "engine_info_error", container = %container, error = %err),
        }
    });
}

fn spawn_transport(
    config: &Config,
    engine: EngineClient,
    events: mpsc::Sender<TransportEvent>,
) -> (TransportHandle, Option<Arc<SessionRegistry>>) {
    match config.transport {
        TransportKind::Local => {
            let registry = Arc::new(SessionRegistry::new(RegistryConfig {
                launch: LaunchSpec::eval(config.eval_bin.clone()),
                output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            }));
            let correlator = CommandCorrelator::new(CorrelatorConfig {
                completion: CompletionMode::Quiescence(config.quiescence),
                command_timeout: config.command_timeout,
            });
            let bridge = Arc::new(LocalBridge::new(registry.clone(), correlator));
            (transport::spawn_local(bridge, events), Some(registry))
        }
        TransportKind::Stream => (transport::spawn_stream(engine, events), None),
    }
}

fn load_config() -> anyhow::Result<Config> {
    config_from_args(Args::parse())
}

fn config_from_args(args: Args) -> anyhow::Result<Config> {
    let transport = resolve_flag_or_env(&args.transport, "QUBE_TRANSPORT", "local")
        .parse::<TransportKind>()
        .map_err(anyhow::Error::msg)?;
    Ok(Config {
        transport,
        api_base: resolve_flag_or_env(&args.api_base, "QUBE_API_BASE", DEFAULT_API_BASE),
        state_dir: resolve_state_dir(&args.state_dir),
        log_dir: resolve_flag_or_env(&args.log_dir, "QUBE_LOG_DIR", DEFAULT_LOG_DIR),
        eval_bin: resolve_flag_or_env(&args.eval_bin, "QUBE_EVAL_BIN", DEFAULT_EVAL_BIN),
        quiescence: Duration::from_millis(args.quiescence_ms),
        command_timeout: Duration::from_millis(args.command_timeout_ms),
        debug: args.debug,
        container: args
            .container
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()),
        activation_args: args.urls,
    })
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("QUBE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if env_true("QUBE_LOG_STDOUT") {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }
    let file = std::fs::create_dir_all(&config.log_dir).and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(PathBuf::from(&config.log_dir).join("qube-desktop.log"))
    });
    match file {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}

fn env_true(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES") | Some("on")
    )
}

fn resolve_flag_or_env(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn resolve_state_dir(flag: &str) -> PathBuf {
    let fallback = dirs::home_dir()
        .map(|home| home.join(DEFAULT_STATE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    PathBuf::from(resolve_flag_or_env(
        flag,
        "QUBE_STATE_DIR",
        &fallback.display().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_leaves_alternate_screen_and_shows_cursor() {
        let mut out = Vec::new();
        restore_screen(&mut out).expect("restore");
        let written = String::from_utf8(out).expect("utf8");
        assert!(written.contains("\x1b[?1049l"), "{written:?}");
        assert!(written.contains("\x1b[?25h"), "{written:?}");
    }

    #[test]
    fn positional_urls_become_activation_args() {
        let args = Args::parse_from([
            "qube-desktop",
            "--transport",
            "stream",
            "--container",
            " web-1 ",
            "qube://container/db",
        ]);
        let config = config_from_args(args).expect("config");
        assert_eq!(config.transport, TransportKind::Stream);
        assert_eq!(config.container.as_deref(), Some("web-1"));
        assert_eq!(config.activation_args, vec!["qube://container/db".to_string()]);
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let args = Args::parse_from(["qube-desktop", "--transport", "telepathy"]);
        assert!(config_from_args(args).is_err());
    }

    #[test]
    fn state_dir_flag_wins() {
        assert_eq!(
            resolve_state_dir(" /tmp/qube-state "),
            PathBuf::from("/tmp/qube-state")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn effects_are_queued_for_the_transport() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = TransportHandle {
            commands: tx,
            task: tokio::spawn(async {}),
        };
        let mut console = Console::new(Duration::from_secs(1));
        assert!(perform(Effect::Quit, &mut console, &handle));
        assert!(!perform(Effect::Control(0x03), &mut console, &handle));
        assert_eq!(rx.recv().await, Some(TransportCommand::Control(0x03)));

        // queue full
        assert!(!perform(Effect::Control(0x18), &mut console, &handle));
        assert!(!perform(
            Effect::Dispatch {
                id: 7,
                text: "ls".to_string()
            },
            &mut console,
            &handle
        ));
        assert_eq!(
            console.scrollback().last().map(|line| line.content.as_str()),
            Some("transport busy")
        );
    }
}
