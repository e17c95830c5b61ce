mod console;

use anyhow::{bail, Context};
use clap::Parser;
use console::{ConsoleConfig, ConsoleHub};
use qube_core::console_wire::DEFAULT_MAX_FRAME_BYTES;
use qube_session::{LaunchSpec, RegistryConfig, SessionRegistry, DEFAULT_OUTPUT_BUFFER_BYTES};
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const DEFAULT_ADDR: &str = "127.0.0.1:3030";
const DEFAULT_EVAL_BIN: &str = "qube";
const DEFAULT_LOG_DIR: &str = ".qube/logs";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    eval_bin: String,
    debug: bool,
    quiescence: Duration,
    command_timeout: Duration,
    write_timeout: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "qube-hub", about = "Streaming console endpoint for Qube containers")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    eval_bin: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "QUBE_QUIESCENCE_MS", default_value_t = 150)]
    quiescence_ms: u64,
    #[arg(long, env = "QUBE_COMMAND_TIMEOUT_MS", default_value_t = 10_000)]
    command_timeout_ms: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_logging(&config);
    if let Err(err) = run(config).await {
        error!(event = "hub_error", error = %err);
        return Err(err);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.addr))?;
    if !addr.ip().is_loopback() {
        bail!("refusing non-loopback listen address {addr}");
    }

    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        launch: LaunchSpec::eval(config.eval_bin.clone()),
        output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
    }));
    let hub = Arc::new(ConsoleHub::new(
        ConsoleConfig {
            quiescence: config.quiescence,
            command_timeout: config.command_timeout,
            write_timeout: config.write_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        },
        registry.clone(),
    ));
    let app = console::router(hub);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    info!(
        event = "hub_start",
        addr = %config.addr,
        eval_bin = %config.eval_bin,
        quiescence_ms = config.quiescence.as_millis() as u64
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    registry.dispose_all().await;
    info!(event = "hub_stop");
    served.context("serve")
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        eval_bin: resolve_eval_bin(&args.eval_bin),
        debug: args.debug || env_true("QUBE_HUB_DEBUG"),
        quiescence: Duration::from_millis(args.quiescence_ms),
        command_timeout: Duration::from_millis(args.command_timeout_ms),
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn log_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    std::env::var("QUBE_LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Logs to stdout, teed into `qube-hub.log` under the log dir when it opens.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(config.debug)));
    let writer = match open_log_file(&config.log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Mutex::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("qube-hub: log file unavailable: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("qube-hub.log"))
        .map(Some)
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
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

fn resolve_addr(addr_flag: &str) -> String {
    resolve_flag_or_env(addr_flag, "QUBE_HUB_ADDR", DEFAULT_ADDR)
}

fn resolve_eval_bin(eval_bin_flag: &str) -> String {
    resolve_flag_or_env(eval_bin_flag, "QUBE_EVAL_BIN", DEFAULT_EVAL_BIN)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    resolve_flag_or_env(log_dir_flag, "QUBE_LOG_DIR", DEFAULT_LOG_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_default() {
        assert_eq!(
            resolve_flag_or_env(" 127.0.0.1:4000 ", "QUBE_TEST_UNSET_ADDR", DEFAULT_ADDR),
            "127.0.0.1:4000"
        );
        assert_eq!(
            resolve_flag_or_env("", "QUBE_TEST_UNSET_ADDR", DEFAULT_ADDR),
            DEFAULT_ADDR
        );
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::parse_from(["qube-hub", "--eval-bin", "/opt/qube/bin/qube"]);
        assert_eq!(args.eval_bin, "/opt/qube/bin/qube");
        assert!(!args.debug);
        assert_eq!(args.write_timeout, 2);
    }

    #[test]
    fn log_file_is_created_in_log_dir() {
        let dir = std::env::temp_dir().join(format!("qube-hub-log-test-{}", std::process::id()));
        let file = open_log_file(&dir.display().to_string()).expect("open log");
        assert!(file.is_some());
        assert!(dir.join("qube-hub.log").exists());
        let _ = std::fs::remove_dir_all(&dir);

        assert!(open_log_file("  ").expect("blank dir").is_none());
    }

    #[test]
    fn debug_flag_forces_debug_level() {
        assert_eq!(log_level(true), "debug");
    }
}
