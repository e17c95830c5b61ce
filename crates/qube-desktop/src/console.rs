use crate::transport::TransportEvent;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use qube_core::console_wire::{CTRL_C, CTRL_X};
use qube_core::engine::{format_memory, format_uptime, ContainerEntry};
use qube_core::EchoFilter;
use std::time::{Duration, Instant};

pub const MAX_SCROLLBACK: usize = 2_000;
pub const PROMPT: &str = "$ ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Sending,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Sending => "sending",
        }
    }

    fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Sending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Output,
    InputEcho,
    Prompt,
    Notice,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLine {
    pub content: String,
    pub kind: LineKind,
}

impl TerminalLine {
    fn new(kind: LineKind, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind,
        }
    }
}

/// Work the event loop performs on behalf of the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Dispatch { id: u64, text: String },
    Control(u8),
    Quit,
}

/// Everything needed to draw one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleView {
    pub title: String,
    pub status: String,
    pub note: Option<String>,
    pub lines: Vec<TerminalLine>,
    pub caret: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    id: u64,
    since: Instant,
}

pub struct Console {
    state: ConnectionState,
    container: Option<String>,
    container_info: Option<ContainerEntry>,
    input: Vec<char>,
    caret: usize,
    scrollback: Vec<TerminalLine>,
    open_line: bool,
    echo: EchoFilter,
    pending: Option<PendingCommand>,
    next_command_id: u64,
    send_timeout: Duration,
    note: Option<String>,
}

impl Console {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            container: None,
            container_info: None,
            input: Vec::new(),
            caret: 0,
            scrollback: Vec::new(),
            open_line: false,
            echo: EchoFilter::new(),
            pending: None,
            next_command_id: 1,
            send_timeout,
            note: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn input(&self) -> String {
        self.input.iter().collect()
    }

    pub fn scrollback(&self) -> &[TerminalLine] {
        &self.scrollback
    }

    pub fn set_note(&mut self, note: impl Into<String>) {
        self.note = Some(note.into());
    }

    pub fn set_container_info(&mut self, info: Option<ContainerEntry>) {
        self.container_info = info;
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<Effect> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => Some(Effect::Quit),
            KeyCode::Char('c') | KeyCode::Char('C') if ctrl => self.control(CTRL_C),
            KeyCode::Char('x') | KeyCode::Char('X') if ctrl => self.control(CTRL_X),
            KeyCode::Char(_) if ctrl => None,
            KeyCode::Char(ch) => {
                self.input.insert(self.caret, ch);
                self.caret += 1;
                None
            }
            KeyCode::Backspace => {
                if self.caret > 0 {
                    self.caret -= 1;
                    self.input.remove(self.caret);
                }
                None
            }
            KeyCode::Delete => {
                if self.caret < self.input.len() {
                    self.input.remove(self.caret);
                }
                None
            }
            KeyCode::Left => {
                self.caret = self.caret.saturating_sub(1);
                None
            }
            KeyCode::Right => {
                self.caret = (self.caret + 1).min(self.input.len());
                None
            }
            KeyCode::Home => {
                self.caret = 0;
                None
            }
            KeyCode::End => {
                self.caret = self.input.len();
                None
            }
            KeyCode::Enter => self.submit(Instant::now()),
            _ => None,
        }
    }

    fn control(&mut self, byte: u8) -> Option<Effect> {
        if self.state.is_connected() {
            Some(Effect::Control(byte))
        } else {
            None
        }
    }

    fn submit(&mut self, now: Instant) -> Option<Effect> {
        match self.state {
            ConnectionState::Sending => return None,
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.push(TerminalLine::new(LineKind::Error, "not connected"));
                return None;
            }
            ConnectionState::Ready => {}
        }

        let text: String = self.input.drain(..).collect();
        self.caret = 0;
        let command = text.trim();
        if command.eq_ignore_ascii_case("clear") {
            self.scrollback.clear();
            self.open_line = false;
            return None;
        }
        self.push(TerminalLine::new(LineKind::InputEcho, format!("{PROMPT}{command}")));
        if command.is_empty() {
            return None;
        }

        let id = self.next_command_id;
        self.next_command_id += 1;
        self.echo.remember_tagged(id, command);
        self.pending = Some(PendingCommand { id, since: now });
        self.state = ConnectionState::Sending;
        Some(Effect::Dispatch {
            id,
            text: command.to_string(),
        })
    }

    pub fn apply(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { container } => {
                self.state = ConnectionState::Connecting;
                self.pending = None;
                self.echo.clear();
                self.push(TerminalLine::new(
                    LineKind::Notice,
                    format!("connecting to {container}..."),
                ));
                if self.container.as_deref() != Some(container.as_str()) {
                    self.container_info = None;
                }
                self.container = Some(container);
            }
            TransportEvent::Connected { container } => {
                self.state = ConnectionState::Ready;
                self.push(TerminalLine::new(
                    LineKind::Notice,
                    format!("connected to {container}"),
                ));
                self.container = Some(container);
            }
            TransportEvent::Output { command_id, data } => {
                let data = self.echo.filter_frame(command_id, &data);
                self.push_output(&data);
                if command_id.is_some() && command_id == self.pending_id() {
                    self.finish_pending();
                }
            }
            TransportEvent::Settled { command_id } => {
                self.echo.settle(command_id);
                if Some(command_id) == self.pending_id() {
                    self.finish_pending();
                }
            }
            TransportEvent::CommandResult { command_id, text } => {
                let text = self.literal_echo_filter(command_id, &text);
                self.push_output(&text);
                if Some(command_id) == self.pending_id() {
                    self.finish_pending();
                }
            }
            TransportEvent::CommandFailed {
                command_id,
                message,
            } => {
                self.push(TerminalLine::new(LineKind::Error, message));
                if command_id.is_none() || command_id == self.pending_id() {
                    self.finish_pending();
                    self.echo.clear();
                }
            }
            TransportEvent::Exited { code } => {
                let label = code.map_or_else(|| "unknown".to_string(), |code| code.to_string());
                self.push(TerminalLine::new(
                    LineKind::Notice,
                    format!("process exited (code {label})"),
                ));
                self.disconnect();
            }
            TransportEvent::Disconnected { reason } => {
                let message = match reason {
                    Some(reason) => format!("disconnected: {reason}"),
                    None => "disconnected".to_string(),
                };
                self.push(TerminalLine::new(LineKind::Notice, message));
                self.disconnect();
            }
            TransportEvent::ContainerInfo(info) => self.container_info = info,
        }
    }

    /// Returns a `Sending` console to `Ready` once the send timeout has passed.
    pub fn tick(&mut self, now: Instant) {
        let Some(pending) = self.pending else {
            return;
        };
        if self.state == ConnectionState::Sending
            && now.saturating_duration_since(pending.since) >= self.send_timeout
        {
            self.push(TerminalLine::new(
                LineKind::Error,
                format!("no response after {} ms", self.send_timeout.as_millis()),
            ));
            self.finish_pending();
        }
    }

    pub fn view(&self, now_unix: i64) -> ConsoleView {
        let title = match &self.container {
            Some(container) => format!("Qube console: {container}"),
            None => "Qube console".to_string(),
        };
        let mut status = vec![format!("State: {}", self.state.label())];
        if let Some(info) = &self.container_info {
            if let Some(image) = &info.image {
                status.push(format!("Image: {image}"));
            }
            status.push(format!("Ports: {}", info.ports_label()));
            let net = if info.isolated { "isolated" } else { "shared" };
            status.push(format!("Net: {net}"));
            if info.is_running() {
                status.push(format!("PID: {}", info.pid));
            }
            status.push(format!("Up: {}", format_uptime(info.timestamp, now_unix)));
            status.push(format!("Mem: {}", format_memory(info.memory_mb)));
            let cmd = info.command_line().unwrap_or_else(|| "—".to_string());
            status.push(format!("Cmd: {cmd}"));
        }

        let mut lines = self.scrollback.clone();
        let prompt = format!("{PROMPT}{}", self.input.iter().collect::<String>());
        lines.push(TerminalLine::new(LineKind::Prompt, prompt));
        ConsoleView {
            title,
            status: status.join("  "),
            note: self.note.clone(),
            lines,
            caret: PROMPT.chars().count() + self.caret,
        }
    }

    fn pending_id(&self) -> Option<u64> {
        self.pending.map(|pending| pending.id)
    }

    fn finish_pending(&mut self) {
        self.pending = None;
        if self.state == ConnectionState::Sending {
            self.state = ConnectionState::Ready;
        }
    }

    fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.pending = None;
        self.echo.clear();
    }

    /// Request/response results carry no frame tags, so the echo is matched
    /// literally against the whole batch.
    fn literal_echo_filter(&mut self, command_id: u64, text: &str) -> String {
        if Some(command_id) != self.pending_id() {
            return text.to_string();
        }
        match self.echo.pending_text().map(str::to_string) {
            Some(command) => {
                self.echo.remember(&command);
                self.echo.filter_batch(text)
            }
            None => text.to_string(),
        }
    }

    fn push(&mut self, line: TerminalLine) {
        self.open_line = false;
        self.scrollback.push(line);
        self.trim_scrollback();
    }

    fn push_output(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let mut segments = data.split('\n').peekable();
        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();
            let segment = segment.trim_end_matches('\r');
            if is_last && segment.is_empty() {
                // data ended with a newline
                self.open_line = false;
                break;
            }
            match self.scrollback.last_mut() {
                Some(last) if self.open_line && last.kind == LineKind::Output => {
                    last.content.push_str(segment);
                }
                _ => self
                    .scrollback
                    .push(TerminalLine::new(LineKind::Output, segment)),
            }
            self.open_line = is_last;
        }
        self.trim_scrollback();
    }

    fn trim_scrollback(&mut self) {
        if self.scrollback.len() > MAX_SCROLLBACK {
            let excess = self.scrollback.len() - MAX_SCROLLBACK;
            self.scrollback.drain(..excess);
        }
    }
}
