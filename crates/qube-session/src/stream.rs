use crate::error::SessionError;
use crate::session::{CommandTurn, OutputChunk, Session};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    command_id: u64,
    deadline: Instant,
    cutoff: Instant,
}

/// How an in-flight command left the tagger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub command_id: u64,
    /// The command was still producing output when its time limit ran out.
    pub timed_out: bool,
}

/// Attributes output to the command in flight.
///
/// A command is in flight from its write until `window` passes without
/// output. Each chunk seen while in flight pushes the deadline out again,
/// but never past `limit` after the write.
#[derive(Debug, Clone)]
pub struct OutputTagger {
    window: Duration,
    limit: Duration,
    current: Option<InFlight>,
}

impl OutputTagger {
    pub fn new(window: Duration, limit: Duration) -> Self {
        Self {
            window,
            limit,
            current: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Puts `command_id` in flight and returns the command it replaced, if any.
    pub fn begin(&mut self, command_id: u64, now: Instant) -> Option<u64> {
        let previous = self.current.take().map(|flight| flight.command_id);
        self.current = Some(self.flight(command_id, now));
        previous
    }

    /// Restarts the window and the limit of `command_id` from `now`, the
    /// moment its write completed.
    pub fn arm(&mut self, command_id: u64, now: Instant) {
        if self.in_flight() == Some(command_id) {
            self.current = Some(self.flight(command_id, now));
        }
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.current.map(|flight| flight.command_id)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.current.map(|flight| flight.deadline)
    }

    /// Tag for a chunk arriving at `now`. Call [`Self::settle_due`] first so an
    /// expired command is reported before its successor's output.
    pub fn tag(&mut self, now: Instant) -> Option<u64> {
        let window = self.window;
        match self.current.as_mut() {
            Some(flight) if now < flight.deadline => {
                flight.deadline = (now + window).min(flight.cutoff);
                Some(flight.command_id)
            }
            _ => None,
        }
    }

    pub fn settle_due(&mut self, now: Instant) -> Option<Settlement> {
        match self.current {
            Some(flight) if flight.deadline <= now => {
                self.current = None;
                Some(Settlement {
                    command_id: flight.command_id,
                    timed_out: flight.deadline >= flight.cutoff,
                })
            }
            _ => None,
        }
    }

    pub fn settle_now(&mut self) -> Option<u64> {
        self.current.take().map(|flight| flight.command_id)
    }

    fn flight(&self, command_id: u64, now: Instant) -> InFlight {
        let cutoff = now + self.limit;
        InFlight {
            command_id,
            deadline: (now + self.window).min(cutoff),
            cutoff,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Output {
        command_id: Option<u64>,
        chunk: OutputChunk,
    },
    Settled {
        command_id: u64,
    },
    /// Sent just before `Settled` when the command hit its time limit.
    TimedOut {
        command_id: u64,
        waited_ms: u64,
    },
    Lagged {
        skipped: u64,
    },
    Exited {
        code: Option<i32>,
    },
}

struct BridgeState {
    tagger: OutputTagger,
    turn: Option<CommandTurn>,
}

/// One streaming client's view of a session.
///
/// A tagged command keeps the session's command turn until it settles, so
/// another client's command never lands inside its window.
pub struct StreamingBridge {
    session: Arc<Session>,
    command_timeout: Duration,
    state: Mutex<BridgeState>,
    wake: Notify,
}

impl StreamingBridge {
    /// Attaches to `session`, returning the bridge for writes, the buffered
    /// output to replay, and the subscriber for everything after it.
    pub fn attach(
        session: Arc<Session>,
        window: Duration,
        command_timeout: Duration,
    ) -> (Arc<Self>, Vec<u8>, BridgeSubscriber) {
        let attachment = session.attach();
        let bridge = Arc::new(Self {
            session,
            command_timeout,
            state: Mutex::new(BridgeState {
                tagger: OutputTagger::new(window, command_timeout),
                turn: None,
            }),
            wake: Notify::new(),
        });
        let subscriber = BridgeSubscriber {
            bridge: bridge.clone(),
            receiver: attachment.receiver,
            queued: VecDeque::new(),
            finished: false,
        };
        (bridge, attachment.backlog, subscriber)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.state().tagger.in_flight()
    }

    /// Writes `text` as command `command_id` once the session's turn is free.
    pub async fn submit_command(&self, command_id: u64, text: &str) -> Result<(), SessionError> {
        let turn = self.wait_turn().await?;
        self.session.ensure_alive()?;
        {
            let mut state = self.state();
            state.tagger.begin(command_id, Instant::now());
            state.turn = Some(turn);
        }
        self.wake.notify_one();

        let text = text.trim_end_matches(&['\n', '\r'][..]);
        if let Err(err) = self.session.write_line(text).await {
            let mut state = self.state();
            state.tagger.settle_now();
            state.turn = None;
            return Err(err);
        }
        self.state().tagger.arm(command_id, Instant::now());
        self.wake.notify_one();
        debug!(
            event = "stream_command_written",
            container = %self.session.container_id(),
            command_id
        );
        Ok(())
    }

    /// Writes untagged input. Text is written inside the session's turn so it
    /// never interleaves with a correlated command.
    pub async fn submit_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if is_control(bytes) {
            return self.session.write_bytes(bytes).await;
        }
        let _turn = self.wait_turn().await?;
        self.session.write_bytes(bytes).await
    }

    /// Control bytes bypass the command queue.
    pub async fn submit_control(&self, byte: u8) -> Result<(), SessionError> {
        self.session.write_bytes(&[byte]).await
    }

    async fn wait_turn(&self) -> Result<CommandTurn, SessionError> {
        let started = Instant::now();
        timeout(self.command_timeout, self.session.acquire_turn())
            .await
            .map_err(|_| SessionError::CommandTimedOut {
                container: self.session.container_id().to_string(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadline(&self) -> Option<Instant> {
        self.state().tagger.deadline()
    }

    fn settle_due(&self, now: Instant) -> Option<Settlement> {
        let mut state = self.state();
        let settled = state.tagger.settle_due(now);
        if settled.is_some() {
            state.turn = None;
        }
        settled
    }

    fn settle_now(&self) -> Option<u64> {
        let mut state = self.state();
        state.turn = None;
        state.tagger.settle_now()
    }

    fn tag(&self, now: Instant) -> (Option<Settlement>, Option<u64>) {
        let mut state = self.state();
        let settled = state.tagger.settle_due(now);
        if settled.is_some() {
            state.turn = None;
        }
        (settled, state.tagger.tag(now))
    }
}

fn is_control(bytes: &[u8]) -> bool {
    bytes.len() == 1 && bytes[0].is_ascii_control() && bytes[0] != b'\n'
}

/// Receiving half of a [`StreamingBridge`], owned by the task relaying output.
pub struct BridgeSubscriber {
    bridge: Arc<StreamingBridge>,
    receiver: broadcast::Receiver<OutputChunk>,
    queued: VecDeque<BridgeEvent>,
    finished: bool,
}

impl BridgeSubscriber {
    pub fn container_id(&self) -> &str {
        self.bridge.session.container_id()
    }

    /// Next event for the client; `None` once `Exited` has been delivered.
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let deadline = self.bridge.deadline();
            let session = self.bridge.session.clone();
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Ok(chunk) => self.push_chunk(chunk),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            event = "stream_lagged",
                            container = %session.container_id(),
                            skipped
                        );
                        self.queued.push_back(BridgeEvent::Lagged { skipped });
                    }
                    Err(RecvError::Closed) => self.finish(),
                },
                _ = sleep_until_deadline(deadline) => {
                    if let Some(settled) = self.bridge.settle_due(Instant::now()) {
                        self.push_settled(settled);
                    }
                }
                _ = self.bridge.wake.notified() => {}
                _ = session.closed() => {
                    loop {
                        match self.receiver.try_recv() {
                            Ok(chunk) => self.push_chunk(chunk),
                            Err(TryRecvError::Lagged(skipped)) => {
                                self.queued.push_back(BridgeEvent::Lagged { skipped });
                            }
                            Err(_) => break,
                        }
                    }
                    self.finish();
                }
            }
        }
    }

    fn push_chunk(&mut self, chunk: OutputChunk) {
        let (settled, command_id) = self.bridge.tag(Instant::now());
        if let Some(settled) = settled {
            self.push_settled(settled);
        }
        self.queued.push_back(BridgeEvent::Output { command_id, chunk });
    }

    fn push_settled(&mut self, settled: Settlement) {
        let command_id = settled.command_id;
        if settled.timed_out {
            let waited_ms =
                u64::try_from(self.bridge.command_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(
                event = "stream_command_timed_out",
                container = %self.bridge.session.container_id(),
                command_id,
                waited_ms
            );
            self.queued
                .push_back(BridgeEvent::TimedOut { command_id, waited_ms });
        }
        self.queued.push_back(BridgeEvent::Settled { command_id });
    }

    fn finish(&mut self) {
        if let Some(command_id) = self.bridge.settle_now() {
            self.queued.push_back(BridgeEvent::Settled { command_id });
        }
        self.queued.push_back(BridgeEvent::Exited {
            code: self.bridge.session.exit_code(),
        });
        self.finished = true;
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
