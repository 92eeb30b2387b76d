//! Backend provisioning.
//!
//! The [`Provisioner`] decides which backend serves a new session and keeps
//! a termination capability for every handle it produced, so the whole set
//! can be shut down at once.
//!
//! Backend selection is a one-way state cell. The first provision probes
//! for a native pseudo-terminal. A failed probe or a single failed native
//! spawn moves the cell to fallback-only for the rest of the process
//! lifetime. The request that hit the failed spawn is retried on the
//! fallback backend and does not observe the failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::SessionConfig;
use thiserror::Error;

use super::backend::{BackendError, BackendHandle, LaunchSpec, Terminator};
use super::piped::PipedProcess;
use super::pty::{self, NativePty};
use crate::config::BackendMode;

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 30;

/// Inherited variables that would make a spawned shell believe it is part
/// of the host runtime.
pub const STRIPPED_ENV_VARS: &[&str] = &["ELECTRON_RUN_AS_NODE"];

const UNPROBED: u8 = 0;
const NATIVE_ELIGIBLE: u8 = 1;
const FALLBACK_ONLY: u8 = 2;

/// Errors raised while provisioning a backend.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Neither backend could start the process.
    #[error(
        "failed to start shell process (native: {}, fallback: {fallback})",
        .native.as_deref().unwrap_or("not attempted")
    )]
    Spawn {
        /// Native spawn failure, if native was attempted.
        native: Option<String>,
        /// Fallback spawn failure.
        fallback: String,
    },
}

/// Current backend selection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    /// No session has been provisioned yet.
    Unprobed,
    /// Native pseudo-terminals are used.
    NativeEligible,
    /// Every session uses the fallback backend. Final.
    FallbackOnly,
}

/// Constructs backend handles.
///
/// The system implementation talks to the OS. Tests substitute their own
/// to inject native failures.
pub trait BackendFactory: Send + Sync {
    /// Returns whether native pseudo-terminals are available at all.
    fn probe_native(&self) -> bool;

    /// Spawns a process on a native pseudo-terminal.
    fn spawn_native(&self, spec: &LaunchSpec) -> Result<BackendHandle, BackendError>;

    /// Spawns a process with piped stdio.
    fn spawn_fallback(&self, spec: &LaunchSpec) -> Result<BackendHandle, BackendError>;
}

/// Backend factory backed by portable-pty and tokio processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackendFactory;

impl BackendFactory for SystemBackendFactory {
    fn probe_native(&self) -> bool {
        pty::probe()
    }

    fn spawn_native(&self, spec: &LaunchSpec) -> Result<BackendHandle, BackendError> {
        NativePty::spawn(spec).map(BackendHandle::Native)
    }

    fn spawn_fallback(&self, spec: &LaunchSpec) -> Result<BackendHandle, BackendError> {
        PipedProcess::spawn(spec).map(BackendHandle::Fallback)
    }
}

/// Chooses and constructs backend handles.
pub struct Provisioner {
    factory: Arc<dyn BackendFactory>,
    state: AtomicU8,
    live: DashMap<u64, Terminator>,
    next_serial: AtomicU64,
    cols: u16,
    rows: u16,
}

impl Provisioner {
    /// Creates a provisioner over the system backends.
    pub fn new(mode: BackendMode) -> Self {
        Self::with_factory(Arc::new(SystemBackendFactory), mode)
    }

    /// Creates a provisioner over a custom backend factory.
    pub fn with_factory(factory: Arc<dyn BackendFactory>, mode: BackendMode) -> Self {
        let state = match mode {
            BackendMode::Auto => UNPROBED,
            BackendMode::Fallback => FALLBACK_ONLY,
        };
        Self {
            factory,
            state: AtomicU8::new(state),
            live: DashMap::new(),
            next_serial: AtomicU64::new(0),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    /// Sets the initial geometry of provisioned terminals.
    pub fn with_geometry(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Returns the current backend selection state.
    pub fn mode(&self) -> ProvisionMode {
        match self.state.load(Ordering::SeqCst) {
            UNPROBED => ProvisionMode::Unprobed,
            NATIVE_ELIGIBLE => ProvisionMode::NativeEligible,
            _ => ProvisionMode::FallbackOnly,
        }
    }

    /// Returns the number of provisioned handles whose process is still running.
    pub fn live_count(&self) -> usize {
        self.live.iter().filter(|entry| !entry.value().has_exited()).count()
    }

    /// Resolves how a session with `config` would be launched.
    pub fn launch_spec(&self, config: &SessionConfig) -> LaunchSpec {
        let program = config
            .shell
            .clone()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(default_shell);

        let cwd = config
            .cwd
            .as_ref()
            .filter(|cwd| !cwd.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
        ];
        for (key, value) in &config.env {
            env.retain(|(existing, _)| existing != key);
            env.push((key.clone(), value.clone()));
        }

        let env_remove = STRIPPED_ENV_VARS
            .iter()
            .filter(|var| !config.env.contains_key(**var))
            .map(|var| var.to_string())
            .collect();

        LaunchSpec {
            program,
            args: Vec::new(),
            cwd,
            env,
            env_remove,
            cols: self.cols,
            rows: self.rows,
        }
    }

    /// Provisions a backend handle for a session launched with `config`.
    pub async fn provision(&self, config: &SessionConfig) -> Result<BackendHandle, ProvisionError> {
        self.live.retain(|_, terminator| !terminator.has_exited());

        let spec = self.launch_spec(config);
        let mut native_error = None;

        if self.native_eligible().await {
            match self.spawn_native(&spec).await {
                Ok(handle) => return Ok(self.track(handle)),
                Err(e) => {
                    tracing::warn!(
                        program = %spec.program,
                        error = %e,
                        "Native PTY spawn failed, switching to fallback backend for all sessions"
                    );
                    self.state.store(FALLBACK_ONLY, Ordering::SeqCst);
                    native_error = Some(e);
                }
            }
        }

        match self.factory.spawn_fallback(&spec) {
            Ok(handle) => Ok(self.track(handle)),
            Err(e) => {
                tracing::error!(program = %spec.program, error = %e, "Fallback spawn failed");
                Err(ProvisionError::Spawn {
                    native: native_error,
                    fallback: e.to_string(),
                })
            }
        }
    }

    /// Terminates every provisioned handle. Never fails.
    pub fn dispose_all(&self) {
        let count = self.live.len();
        for entry in self.live.iter() {
            if let Err(e) = entry.value().terminate() {
                tracing::warn!(error = %e, "Failed to terminate backend process");
            }
        }
        self.live.clear();

        if count > 0 {
            tracing::info!(count = count, "Terminated all backend processes");
        }
    }

    async fn native_eligible(&self) -> bool {
        match self.mode() {
            ProvisionMode::NativeEligible => true,
            ProvisionMode::FallbackOnly => false,
            ProvisionMode::Unprobed => {
                let factory = self.factory.clone();
                let available = tokio::task::spawn_blocking(move || factory.probe_native())
                    .await
                    .unwrap_or(false);
                let next = if available { NATIVE_ELIGIBLE } else { FALLBACK_ONLY };

                match self
                    .state
                    .compare_exchange(UNPROBED, next, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        if available {
                            tracing::info!("Using native PTY backend");
                        } else {
                            tracing::warn!("Native PTY unavailable, using fallback backend");
                        }
                        available
                    }
                    Err(current) => current == NATIVE_ELIGIBLE,
                }
            }
        }
    }

    async fn spawn_native(&self, spec: &LaunchSpec) -> Result<BackendHandle, String> {
        let factory = self.factory.clone();
        let spec = spec.clone();
        match tokio::task::spawn_blocking(move || factory.spawn_native(&spec)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("spawn task failed: {e}")),
        }
    }

    fn track(&self, handle: BackendHandle) -> BackendHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.live.insert(serial, handle.terminator());
        tracing::debug!(backend = %handle.kind(), pid = ?handle.pid(), "Provisioned backend");
        handle
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("mode", &self.mode())
            .field("live", &self.live.len())
            .finish()
    }
}

/// Returns the platform shell used when a session does not name one.
pub fn default_shell() -> String {
    #[cfg(windows)]
    let (var, fallback) = ("COMSPEC", "cmd.exe");
    #[cfg(not(windows))]
    let (var, fallback) = ("SHELL", "/bin/sh");

    std::env::var(var)
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
