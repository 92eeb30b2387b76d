//! Process backend abstraction.
//!
//! A [`BackendHandle`] is the live handle to one spawned interactive
//! process. It comes in two flavors that present the same shape:
//!
//! - [`NativePty`]: a real pseudo-terminal. Resize is honored and stdout and
//!   stderr arrive merged, exactly as a terminal would render them.
//! - [`PipedProcess`]: a plain child process with piped stdio, used when no
//!   pseudo-terminal is available. Resize is accepted but has no effect, and
//!   stdout and stderr are captured separately and both forwarded as output.
//!
//! Output and the single exit notification arrive on one bounded channel per
//! handle, so output produced before the exit is always observed before it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::ChildKiller;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use protocol::BackendKind;

use super::piped::PipedProcess;
use super::pty::NativePty;

/// Capacity of the per-handle event queue.
///
/// Readers wait for room once this many chunks are pending, so a session
/// whose owner stops draining stops reading from its process.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Errors raised by a process backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Resizing the terminal failed.
    #[error("failed to resize terminal: {0}")]
    Resize(String),

    /// The OS refused to terminate the process.
    #[error("failed to terminate process: {0}")]
    Terminate(String),
}

/// How a backend process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
}

/// Events delivered by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A chunk of terminal output.
    Output(Vec<u8>),
    /// The process exited. Sent at most once, always last.
    Exit(BackendExit),
}

/// Everything needed to start a shell process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Inherited variables removed before spawning.
    pub env_remove: Vec<String>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

enum TerminateSignal {
    Native(Mutex<Box<dyn ChildKiller + Send + Sync>>),
    Fallback(CancellationToken),
}

struct TerminatorInner {
    signal: TerminateSignal,
    requested: AtomicBool,
    exited: AtomicBool,
}

/// Cloneable termination capability for a backend process.
///
/// The provisioning layer keeps one per live handle for bulk shutdown while
/// the session keeps exclusive ownership of the handle itself. Terminating
/// is idempotent and a no-op once the process has exited.
#[derive(Clone)]
pub struct Terminator {
    inner: Arc<TerminatorInner>,
}

impl Terminator {
    pub(crate) fn native(killer: Box<dyn ChildKiller + Send + Sync>) -> Self {
        Self::with_signal(TerminateSignal::Native(Mutex::new(killer)))
    }

    pub(crate) fn fallback(token: CancellationToken) -> Self {
        Self::with_signal(TerminateSignal::Fallback(token))
    }

    fn with_signal(signal: TerminateSignal) -> Self {
        Self {
            inner: Arc::new(TerminatorInner {
                signal,
                requested: AtomicBool::new(false),
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// Requests termination of the process.
    pub fn terminate(&self) -> Result<(), BackendError> {
        if self.has_exited() || self.inner.requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match &self.inner.signal {
            TerminateSignal::Native(killer) => {
                let mut killer = killer
                    .lock()
                    .map_err(|_| BackendError::Terminate("killer lock poisoned".to_string()))?;
                match killer.kill() {
                    Ok(()) => Ok(()),
                    // Lost the race with a natural exit.
                    Err(_) if self.has_exited() => Ok(()),
                    Err(e) => Err(BackendError::Terminate(e.to_string())),
                }
            }
            TerminateSignal::Fallback(token) => {
                token.cancel();
                Ok(())
            }
        }
    }

    /// Returns whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminator")
            .field("requested", &self.inner.requested.load(Ordering::SeqCst))
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Live handle to one spawned interactive process.
pub enum BackendHandle {
    /// Pseudo-terminal backed process.
    Native(NativePty),
    /// Plain piped child process.
    Fallback(PipedProcess),
}

impl BackendHandle {
    /// Returns which backend flavor this handle is.
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendHandle::Native(_) => BackendKind::Native,
            BackendHandle::Fallback(_) => BackendKind::Fallback,
        }
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        match self {
            BackendHandle::Native(pty) => pty.pid(),
            BackendHandle::Fallback(child) => child.pid(),
        }
    }

    /// Queues bytes for the process input. Never blocks.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        match self {
            BackendHandle::Native(pty) => pty.write(data),
            BackendHandle::Fallback(child) => child.write(data),
        }
    }

    /// Resizes the terminal. Accepted but ineffective on the fallback backend.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), BackendError> {
        match self {
            BackendHandle::Native(pty) => pty.resize(cols, rows),
            BackendHandle::Fallback(child) => child.resize(cols, rows),
        }
    }

    /// Terminates the process. Safe to call repeatedly and after exit.
    pub fn terminate(&self) -> Result<(), BackendError> {
        self.terminator().terminate()
    }

    /// Returns a termination capability that outlives borrows of the handle.
    pub fn terminator(&self) -> Terminator {
        match self {
            BackendHandle::Native(pty) => pty.terminator(),
            BackendHandle::Fallback(child) => child.terminator(),
        }
    }

    /// Takes the event receiver. Returns `None` if it was already taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<BackendEvent>> {
        match self {
            BackendHandle::Native(pty) => pty.take_events(),
            BackendHandle::Fallback(child) => child.take_events(),
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .finish()
    }
}
