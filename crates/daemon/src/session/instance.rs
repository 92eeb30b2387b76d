//! A single shell session.
//!
//! A [`Session`] couples a stable identifier and an immutable launch config
//! to at most one backend handle. Once disposed, every mutating call is a
//! silent no-op.

use protocol::SessionConfig;

use super::backend::{BackendHandle, BackendKind};

/// Unique identifier for a session.
pub type SessionId = String;

/// Returns the input that clears the screen in the platform shell.
pub fn clear_sequence() -> &'static [u8] {
    if cfg!(windows) {
        b"cls\r"
    } else {
        b"clear\r"
    }
}

/// One shell session and its backend.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    backend: Option<BackendHandle>,
    disposed: bool,
}

impl Session {
    /// Creates a session without a backend.
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        Self {
            id,
            config,
            backend: None,
            disposed: false,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the launch configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns whether the session has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Returns the backend flavor, once attached.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(BackendHandle::kind)
    }

    /// Returns the backend process ID, once attached.
    pub fn pid(&self) -> Option<u32> {
        self.backend.as_ref().and_then(BackendHandle::pid)
    }

    /// Attaches the backend handle.
    ///
    /// A handle arriving after disposal is terminated and dropped, and
    /// `false` is returned.
    pub fn attach_backend(&mut self, handle: BackendHandle) -> bool {
        if self.disposed {
            tracing::debug!(
                session_id = %self.id,
                pid = ?handle.pid(),
                "Dropping backend attached after disposal"
            );
            if let Err(e) = handle.terminate() {
                tracing::warn!(
                    session_id = %self.id,
                    error = %e,
                    "Failed to terminate late backend"
                );
            }
            return false;
        }

        if let Some(previous) = self.backend.replace(handle) {
            tracing::warn!(
                session_id = %self.id,
                pid = ?previous.pid(),
                "Replacing attached backend"
            );
            if let Err(e) = previous.terminate() {
                tracing::warn!(
                    session_id = %self.id,
                    error = %e,
                    "Failed to terminate replaced backend"
                );
            }
        }
        true
    }

    /// Writes data to the backend.
    pub fn write(&mut self, data: &[u8]) {
        if self.disposed {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.write(data) {
                tracing::debug!(session_id = %self.id, error = %e, "Write failed");
            }
        }
    }

    /// Clears the screen by sending the platform clear command.
    pub fn clear(&mut self) {
        self.write(clear_sequence());
    }

    /// Resizes the terminal.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if self.disposed {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.resize(cols, rows) {
                tracing::debug!(
                    session_id = %self.id,
                    cols = cols,
                    rows = rows,
                    error = %e,
                    "Resize failed"
                );
            }
        }
    }

    /// Disposes the session and terminates its backend. Runs once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(backend) = self.backend.as_ref() {
            if let Err(e) = backend.terminate() {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to terminate backend");
            }
        }
        tracing::debug!(session_id = %self.id, "Session disposed");
    }
}
