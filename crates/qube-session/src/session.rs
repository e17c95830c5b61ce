use crate::error::SessionError;
use crate::launcher::ProcessHandle;
use qube_core::console_wire::OutputStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 64 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READ_CHUNK_BYTES: usize = 4096;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Bounded ring of the most recent output, replayed to late subscribers.
#[derive(Debug)]
struct OutputBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(READ_CHUNK_BYTES)),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    fn release(&mut self) {
        self.bytes = VecDeque::new();
    }
}

/// Subscription handed to a streaming client: everything buffered so far plus
/// a receiver for what comes next, with no gap or overlap between the two.
pub struct Attachment {
    pub backlog: Vec<u8>,
    pub receiver: broadcast::Receiver<OutputChunk>,
}

/// Held while a command owns the session; dropping it lets the next one in.
pub struct CommandTurn {
    _guard: OwnedMutexGuard<()>,
}

struct WaiterCount<'a>(&'a AtomicUsize);

impl<'a> WaiterCount<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub container_id: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub exit_code: Option<i32>,
    pub pending_waiters: usize,
    pub uptime: Duration,
}

/// Live binding between a container id and its eval process.
///
/// The child itself is owned by a reaper task. Two reader tasks relay
/// stdout and stderr into the replay buffer and the broadcast channel.
pub struct Session {
    container_id: String,
    pid: Option<u32>,
    started_at: Instant,
    alive: watch::Sender<bool>,
    exit_code: Mutex<Option<i32>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    turn: Arc<AsyncMutex<()>>,
    pending_waiters: AtomicUsize,
    output: broadcast::Sender<OutputChunk>,
    buffer: Mutex<OutputBuffer>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn start(container_id: &str, handle: ProcessHandle, buffer_bytes: usize) -> Arc<Self> {
        let ProcessHandle {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        } = handle;
        let (alive, _) = watch::channel(true);
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();

        let session = Arc::new(Self {
            container_id: container_id.to_string(),
            pid,
            started_at: Instant::now(),
            alive,
            exit_code: Mutex::new(None),
            stdin: AsyncMutex::new(Some(stdin)),
            turn: Arc::new(AsyncMutex::new(())),
            pending_waiters: AtomicUsize::new(0),
            output,
            buffer: Mutex::new(OutputBuffer::new(buffer_bytes)),
            kill: Mutex::new(Some(kill_tx)),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        let pumps = vec![
            tokio::spawn(pump_output(weak.clone(), stdout, OutputStream::Stdout)),
            tokio::spawn(pump_output(weak.clone(), stderr, OutputStream::Stderr)),
        ];
        let reaper = tokio::spawn(reap(
            weak,
            container_id.to_string(),
            child,
            kill_rx,
            pumps,
        ));
        *lock(&session.reaper) = Some(reaper);
        session
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    pub fn pending_waiters(&self) -> usize {
        self.pending_waiters.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            container_id: self.container_id.clone(),
            pid: self.pid,
            alive: self.is_alive(),
            exit_code: self.exit_code(),
            pending_waiters: self.pending_waiters(),
            uptime: self.started_at.elapsed(),
        }
    }

    pub fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SessionError::ProcessDead(self.container_id.clone()))
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputChunk> {
        self.output.subscribe()
    }

    pub fn attach(&self) -> Attachment {
        let buffer = lock(&self.buffer);
        let receiver = self.output.subscribe();
        Attachment {
            backlog: buffer.snapshot(),
            receiver,
        }
    }

    /// Resolves once the session is dead. Returns immediately if it already is.
    pub async fn closed(&self) {
        let mut alive = self.alive.subscribe();
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    /// Waits for this session's command queue, first come first served.
    pub async fn acquire_turn(&self) -> CommandTurn {
        let _waiting = WaiterCount::enter(&self.pending_waiters);
        CommandTurn {
            _guard: self.turn.clone().lock_owned().await,
        }
    }

    pub async fn write_line(&self, text: &str) -> Result<(), SessionError> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write_bytes(&bytes).await
    }

    /// Writes `bytes` to stdin. A failed write marks the session dead.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.ensure_alive()?;
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(SessionError::ProcessDead(self.container_id.clone()));
        };
        let result = match pipe.write_all(bytes).await {
            Ok(()) => pipe.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            stdin.take();
            drop(stdin);
            warn!(
                event = "stdin_write_failed",
                container = %self.container_id,
                error = %err
            );
            self.mark_dead("write_failed");
            return Err(SessionError::WriteFailed {
                container: self.container_id.clone(),
                message: err.to_string(),
            });
        }
        debug!(
            event = "stdin_written",
            container = %self.container_id,
            bytes = bytes.len()
        );
        Ok(())
    }

    /// Flips the alive flag once and asks the reaper to terminate the child.
    pub fn mark_dead(&self, reason: &str) {
        let changed = self.alive.send_if_modified(|alive| {
            if *alive {
                *alive = false;
                true
            } else {
                false
            }
        });
        if changed {
            info!(
                event = "session_dead",
                container = %self.container_id,
                reason
            );
        }
        self.request_kill();
    }

    /// Sends EOF to the process without terminating it.
    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Closes stdin, terminates the process and waits for it to be reaped.
    pub async fn shutdown(&self) {
        self.close_stdin().await;
        self.mark_dead("disposed");
        let reaper = lock(&self.reaper).take();
        if let Some(reaper) = reaper {
            if let Err(err) = reaper.await {
                warn!(
                    event = "reaper_join_failed",
                    container = %self.container_id,
                    error = %err
                );
            }
        }
    }

    fn request_kill(&self) {
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }

    fn publish(&self, chunk: OutputChunk) {
        let mut buffer = lock(&self.buffer);
        buffer.push(&chunk.bytes);
        // No receivers is fine: nobody is listening right now.
        let _ = self.output.send(chunk);
    }

    /// Drops stdin and the replay buffer before the session is reported dead.
    /// The registry keeps the dead entry so later calls see `ProcessDead`.
    async fn record_exit(&self, code: Option<i32>) {
        self.close_stdin().await;
        lock(&self.buffer).release();
        *lock(&self.exit_code) = code;
        self.mark_dead("exited");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn pump_output<R>(session: Weak<Session>, mut reader: R, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(event = "output_read_failed", ?stream, error = %err);
                break;
            }
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.publish(OutputChunk {
            stream,
            bytes: buf[..read].to_vec(),
        });
    }
    debug!(event = "output_closed", ?stream);
}

async fn reap(
    session: Weak<Session>,
    container_id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    pumps: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = match &status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(event = "process_wait_failed", container = %container_id, error = %err);
            None
        }
    };

    // Give the readers a moment to deliver the final output before the
    // session is reported dead.
    let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!(event = "output_drain_timeout", container = %container_id);
    }

    info!(
        event = "process_reaped",
        container = %container_id,
        code = code.unwrap_or(-1)
    );
    if let Some(session) = session.upgrade() {
        session.record_exit(code).await;
    }
}
