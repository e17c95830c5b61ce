use chrono::Utc;
use fs2::FileExt;
use qube_core::activation::{activation_urls, ActivationEvent, ActivationForward};
use qube_core::console_wire::DEFAULT_MAX_FRAME_BYTES;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[cfg(unix)]
use qube_core::console_wire::{decode_frame, encode_line};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
#[cfg(unix)]
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};

const LOCK_FILE: &str = "desktop.lock";
const SOCKET_FILE: &str = "desktop.sock";

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

pub fn socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SOCKET_FILE)
}

/// Advisory exclusive lock held by the primary desktop instance.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Returns `None` when another process already holds the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Where an activation takes the running console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SwitchContainer(String),
    Note(String),
}

pub fn route_activation(event: &ActivationEvent) -> Route {
    if event.action == "container" {
        if let Some(name) = event.param.as_deref().filter(|name| !name.trim().is_empty()) {
            return Route::SwitchContainer(name.trim().to_string());
        }
    }
    let mut note = format!("activation: {}", event.action);
    if let Some(param) = &event.param {
        note.push('/');
        note.push_str(param);
    }
    if !event.query.is_empty() {
        let pairs: Vec<String> = event
            .query
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        note.push('?');
        note.push_str(&pairs.join("&"));
    }
    Route::Note(note)
}

const FORWARD_ATTEMPTS: u32 = 10;
const FORWARD_BACKOFF_START: Duration = Duration::from_millis(50);
const FORWARD_BACKOFF_MAX: Duration = Duration::from_millis(400);

/// Sends this process's activation arguments to the primary instance.
///
/// The primary may hold the lock without having bound its socket yet, so a
/// missing or refusing socket is retried with a bounded backoff.
#[cfg(unix)]
pub async fn forward_activation(socket_path: &Path, args: &[String]) -> io::Result<()> {
    let forward = ActivationForward {
        pid: std::process::id(),
        args: args.to_vec(),
    };
    let line = encode_line(&forward, DEFAULT_MAX_FRAME_BYTES)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    let mut stream = connect_with_backoff(socket_path).await?;
    stream.write_all(&line).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    info!(
        event = "activation_forwarded",
        socket = %socket_path.display(),
        urls = activation_urls(args).len()
    );
    Ok(())
}

#[cfg(unix)]
async fn connect_with_backoff(socket_path: &Path) -> io::Result<UnixStream> {
    let mut delay = FORWARD_BACKOFF_START;
    let mut attempt = 1;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(err)
                if attempt < FORWARD_ATTEMPTS
                    && matches!(
                        err.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
            {
                debug!(
                    event = "activation_forward_retry",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(FORWARD_BACKOFF_MAX);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(not(unix))]
pub async fn forward_activation(_socket_path: &Path, _args: &[String]) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "activation forwarding requires unix domain sockets",
    ))
}

/// Activation socket bound by the primary instance. The socket file is
/// removed when the listener stops.
#[cfg(unix)]
pub struct ActivationListener {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(not(unix))]
pub struct ActivationListener;

/// Binds the activation socket. Call right after taking the instance lock so
/// forwards from a second instance find it as early as possible.
#[cfg(unix)]
pub fn bind_listener(socket_path: &Path) -> io::Result<ActivationListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }
    if socket_path.exists() {
        let _ = fs::remove_file(socket_path);
    }

    let listener = UnixListener::bind(socket_path)?;
    let _ = fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600));
    info!(event = "activation_listener_bound", socket = %socket_path.display());
    Ok(ActivationListener {
        listener,
        path: socket_path.to_path_buf(),
    })
}

#[cfg(not(unix))]
pub fn bind_listener(_socket_path: &Path) -> io::Result<ActivationListener> {
    Ok(ActivationListener)
}

/// Accepts forwarded activations until `shutdown` flips, pushing every URL
/// argument into `urls`. Forwards queued before this starts are accepted too.
#[cfg(unix)]
pub async fn run_listener(
    bound: ActivationListener,
    urls: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let ActivationListener { listener, path } = bound;
    info!(event = "activation_listener_start", socket = %path.display());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(read_forwards(stream, urls.clone()));
                    }
                    Err(err) => {
                        warn!(event = "activation_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&path);
    info!(event = "activation_listener_stop");
    Ok(())
}

#[cfg(not(unix))]
pub async fn run_listener(
    _bound: ActivationListener,
    _urls: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
async fn read_forwards(stream: UnixStream, urls: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(event = "activation_read_error", error = %err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let forward: ActivationForward = match decode_frame(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(forward) => forward,
            Err(err) => {
                warn!(event = "activation_decode_error", error = %err);
                continue;
            }
        };
        info!(event = "activation_received", from_pid = forward.pid);
        for url in activation_urls(&forward.args) {
            if urls.send(url.to_string()).await.is_err() {
                return;
            }
        }
    }
}
