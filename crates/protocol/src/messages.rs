//! Host command and event definitions.
//!
//! Commands flow from the host into the daemon; events flow back out. Both
//! are adjacently tagged JSON objects (`{"type": ..., "data": ...}`) so a
//! host can dispatch on `type` without knowing every payload.

use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Commands accepted from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Create a new session, optionally with an explicit launch config.
    CreateSession {
        #[serde(default)]
        config: Option<SessionConfig>,
    },
    /// Close a session and terminate its process.
    CloseSession { id: String },
    /// Send the platform clear sequence to a session.
    ClearSession { id: String },
    /// Write text to a session's input.
    SendInput { id: String, data: String },
    /// Resize a session's terminal.
    ResizeSession { id: String, cols: u16, rows: u16 },
    /// Mark a session as active.
    SetActive { id: String },
    /// Create a session cloned from the active session's config.
    SplitActive,
    /// List all live sessions.
    ListSessions,
    /// Host view gained focus, optionally on a specific session.
    Focus {
        #[serde(default)]
        id: Option<String>,
    },
    /// Host view lost focus.
    Blur,
    /// Renderer text selection changed.
    SetTextSelected { selected: bool },
    /// An interactive program took over the active session.
    SetInteractiveProcess { interactive: bool },
    /// Host sidebar focus changed.
    SetSidebarFocus { focused: bool },
    /// Dispose everything and stop.
    Shutdown,
}

impl Command {
    /// Returns the snake_case name of the command, as used in acks.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateSession { .. } => "create_session",
            Command::CloseSession { .. } => "close_session",
            Command::ClearSession { .. } => "clear_session",
            Command::SendInput { .. } => "send_input",
            Command::ResizeSession { .. } => "resize_session",
            Command::SetActive { .. } => "set_active",
            Command::SplitActive => "split_active",
            Command::ListSessions => "list_sessions",
            Command::Focus { .. } => "focus",
            Command::Blur => "blur",
            Command::SetTextSelected { .. } => "set_text_selected",
            Command::SetInteractiveProcess { .. } => "set_interactive_process",
            Command::SetSidebarFocus { .. } => "set_sidebar_focus",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Events emitted to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A session was created.
    SessionCreated { id: String, config: SessionConfig },
    /// Output bytes from a session, base64 encoded on the wire.
    Output {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// A session closed, explicitly or because its process exited.
    Closed { id: String },
    /// Boolean outcome of a per-session command.
    Ack { command: String, success: bool },
    /// Snapshot of live sessions.
    Sessions { sessions: Vec<SessionSummary> },
    /// A context key changed.
    Context { key: String, value: ContextValue },
    /// Host focus edge.
    FocusChanged { focused: bool },
    /// A command failed.
    Error { message: String },
}

/// Which process backend serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A real pseudo-terminal.
    Native,
    /// A plain child process with piped stdio.
    Fallback,
}

impl BackendKind {
    /// Whether resize requests reach the process.
    pub fn supports_resize(self) -> bool {
        matches!(self, BackendKind::Native)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Summary of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Backend serving the session, if attached.
    pub backend: Option<BackendKind>,
    /// Shell process ID, if known.
    pub pid: Option<u32>,
    /// Whether this is the active session.
    pub active: bool,
    /// Launch configuration.
    pub config: SessionConfig,
}

/// Value pushed for a context key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Boolean flag.
    Bool(bool),
    /// Counter.
    Count(usize),
    /// Optional identifier; `None` means unset.
    Id(Option<String>),
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<usize> for ContextValue {
    fn from(value: usize) -> Self {
        ContextValue::Count(value)
    }
}

impl From<Option<String>> for ContextValue {
    fn from(value: Option<String>) -> Self {
        ContextValue::Id(value)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
