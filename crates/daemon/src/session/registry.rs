//! Session registry.
//!
//! The [`SessionRegistry`] owns every live [`Session`], enforces the session
//! cap, tracks the active session, and republishes backend activity as two
//! broadcast streams: output chunks and closed session IDs.
//!
//! The registry has a single owner. Backend events are queued per session
//! and only folded into registry state when the owner calls
//! [`SessionRegistry::process_next_event`] or
//! [`SessionRegistry::process_pending`], so the session map is never
//! touched from another task.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{SessionConfig, SessionSummary};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TryRecvError};
use uuid::Uuid;

use super::backend::{BackendEvent, EVENT_QUEUE_CAPACITY};
use super::instance::{Session, SessionId};
use super::provision::{ProvisionError, Provisioner};
use crate::config::Config;
use crate::focus::FocusTracker;

/// Maximum number of concurrent sessions.
pub const MAX_SESSIONS: usize = 5;

/// Capacity of the output and closed broadcast channels.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// A close-time flush must fit in the output channel.
const _: () = assert!(EVENT_QUEUE_CAPACITY < EVENT_CHANNEL_CAPACITY);

/// Errors raised by registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The session cap has been reached.
    #[error("session limit reached (max {max})")]
    CapacityExceeded { max: usize },

    /// No backend could be provisioned for the new session.
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),

    /// The registry has been shut down.
    #[error("session registry has been disposed")]
    Disposed,
}

/// A chunk of output from one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub id: SessionId,
    pub data: Vec<u8>,
}

struct SessionEntry {
    session: Session,
    events: Option<mpsc::Receiver<BackendEvent>>,
    serial: u64,
}

/// Owner of all live sessions.
pub struct SessionRegistry {
    entries: HashMap<SessionId, SessionEntry>,
    active_id: Option<SessionId>,
    provisioner: Provisioner,
    default_config: SessionConfig,
    output_tx: Option<broadcast::Sender<SessionOutput>>,
    closed_tx: Option<broadcast::Sender<SessionId>>,
    focus: Option<Arc<FocusTracker>>,
    next_serial: u64,
    disposed: bool,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(provisioner: Provisioner) -> Self {
        let (output_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: HashMap::new(),
            active_id: None,
            provisioner,
            default_config: SessionConfig::default(),
            output_tx: Some(output_tx),
            closed_tx: Some(closed_tx),
            focus: None,
            next_serial: 0,
            disposed: false,
        }
    }

    /// Creates a registry from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        let provisioner = Provisioner::new(config.backend.mode)
            .with_geometry(config.session.cols, config.session.rows);
        Self::new(provisioner).with_default_config(config.session.launch_config())
    }

    /// Sets the config used by [`create`](Self::create) when none is given.
    pub fn with_default_config(mut self, config: SessionConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Mirrors session count and active session into `focus`.
    pub fn with_focus_tracker(mut self, focus: Arc<FocusTracker>) -> Self {
        self.focus = Some(focus);
        self.sync_focus();
        self
    }

    /// Returns the provisioning layer.
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Creates a session and makes it active.
    pub async fn create(
        &mut self,
        config: Option<SessionConfig>,
    ) -> Result<SessionId, RegistryError> {
        if self.disposed {
            return Err(RegistryError::Disposed);
        }
        if self.entries.len() >= MAX_SESSIONS {
            tracing::warn!(max = MAX_SESSIONS, "Session limit reached");
            return Err(RegistryError::CapacityExceeded { max: MAX_SESSIONS });
        }

        let id = Uuid::new_v4().to_string();
        let config = config.unwrap_or_else(|| self.default_config.clone());
        let mut session = Session::new(id.clone(), config);

        let mut handle = match self.provisioner.provision(session.config()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to create session");
                return Err(e.into());
            }
        };
        let events = handle.take_events();
        let backend = handle.kind();
        let pid = handle.pid();
        session.attach_backend(handle);

        let serial = self.next_serial;
        self.next_serial += 1;
        self.entries.insert(
            id.clone(),
            SessionEntry {
                session,
                events,
                serial,
            },
        );
        self.active_id = Some(id.clone());
        self.sync_focus();

        tracing::info!(session_id = %id, backend = %backend, pid = ?pid, "Session created");
        Ok(id)
    }

    /// Closes a session. Returns `false` if the ID is unknown.
    ///
    /// Output already queued for the session is published as one chunk
    /// before the closed event. A queued exit is dropped.
    pub fn close(&mut self, id: &str) -> bool {
        let Some(mut entry) = self.entries.remove(id) else {
            return false;
        };

        if let Some(events) = entry.events.as_mut() {
            let mut queued = Vec::new();
            // The queue is bounded, so this takes at most one queue's worth.
            for _ in 0..EVENT_QUEUE_CAPACITY {
                match events.try_recv() {
                    Ok(BackendEvent::Output(data)) => queued.extend_from_slice(&data),
                    Ok(BackendEvent::Exit(_)) | Err(_) => break,
                }
            }
            if !queued.is_empty() {
                self.publish_output(id, queued);
            }
        }
        entry.session.dispose();

        if self.active_id.as_deref() == Some(id) {
            self.active_id = self.most_recent_id();
        }
        if let Some(tx) = &self.closed_tx {
            let _ = tx.send(id.to_string());
        }
        self.sync_focus();

        tracing::info!(session_id = %id, remaining = self.entries.len(), "Session closed");
        true
    }

    /// Clears a session's screen. Returns `false` if the ID is unknown.
    pub fn clear(&mut self, id: &str) -> bool {
        self.with_session(id, Session::clear)
    }

    /// Sends input to a session. Returns `false` if the ID is unknown.
    pub fn send_input(&mut self, id: &str, data: &[u8]) -> bool {
        self.with_session(id, |session| session.write(data))
    }

    /// Resizes a session's terminal. Returns `false` if the ID is unknown.
    pub fn resize(&mut self, id: &str, cols: u16, rows: u16) -> bool {
        self.with_session(id, |session| session.resize(cols, rows))
    }

    /// Makes `id` the active session. Unknown IDs are ignored.
    pub fn set_active(&mut self, id: &str) {
        if !self.entries.contains_key(id) {
            tracing::debug!(session_id = %id, "Ignoring activation of unknown session");
            return;
        }
        self.active_id = Some(id.to_string());
        self.sync_focus();
    }

    /// Creates a session with the active session's config.
    ///
    /// Returns `Ok(None)` when there is no active session.
    pub async fn split_active(&mut self) -> Result<Option<SessionId>, RegistryError> {
        let config = self
            .active_id
            .as_ref()
            .and_then(|id| self.entries.get(id))
            .map(|entry| entry.session.config().clone());

        match config {
            Some(config) => self.create(Some(config)).await.map(Some),
            None => Ok(None),
        }
    }

    /// Returns a summary of one session.
    pub fn get(&self, id: &str) -> Option<SessionSummary> {
        self.entries.get(id).map(|entry| self.summarize(entry))
    }

    /// Lists live sessions in creation order.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut entries: Vec<&SessionEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.serial);
        entries.into_iter().map(|entry| self.summarize(entry)).collect()
    }

    /// Returns the number of live sessions.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the active session ID.
    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    /// Returns whether `id` is a live session.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns whether [`dispose_all`](Self::dispose_all) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Subscribes to session output. Returns `None` after disposal.
    pub fn subscribe_output(&self) -> Option<broadcast::Receiver<SessionOutput>> {
        self.output_tx.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Subscribes to closed session IDs. Returns `None` after disposal.
    pub fn subscribe_closed(&self) -> Option<broadcast::Receiver<SessionId>> {
        self.closed_tx.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Waits for the next backend event from any session and applies it.
    ///
    /// Output is published and an exit closes the session. Pends while
    /// there are no sessions. Returns `false` once the registry is disposed.
    pub async fn process_next_event(&mut self) -> bool {
        if self.disposed {
            return false;
        }

        let (id, event) = {
            let pending: Vec<_> = self
                .entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let events = entry.events.as_mut()?;
                    Some(Box::pin(async move { (id.clone(), events.recv().await) }))
                })
                .collect();

            if pending.is_empty() {
                return std::future::pending().await;
            }

            let ((id, event), _, _) = futures_util::future::select_all(pending).await;
            (id, event)
        };

        self.apply_event(&id, event);
        true
    }

    /// Applies every backend event already queued, without waiting.
    ///
    /// Returns the number of events applied.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        let ids: Vec<SessionId> = self.entries.keys().cloned().collect();

        for id in ids {
            loop {
                let events = self.entries.get_mut(&id).and_then(|e| e.events.as_mut());
                let Some(events) = events else {
                    break;
                };
                let event = match events.try_recv() {
                    Ok(event) => Some(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => None,
                };

                let closes = !matches!(event, Some(BackendEvent::Output(_)));
                self.apply_event(&id, event);
                processed += 1;
                if closes {
                    break;
                }
            }
        }
        processed
    }

    /// Disposes every session and shuts the registry down for good.
    ///
    /// No closed events are emitted. Safe to call more than once.
    pub fn dispose_all(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.session.dispose();
        }
        self.active_id = None;
        self.provisioner.dispose_all();
        self.output_tx = None;
        self.closed_tx = None;
        self.sync_focus();

        tracing::info!(count = count, "Session registry disposed");
    }

    fn apply_event(&mut self, id: &str, event: Option<BackendEvent>) {
        match event {
            Some(BackendEvent::Output(data)) => {
                if self.entries.contains_key(id) {
                    self.publish_output(id, data);
                }
            }
            Some(BackendEvent::Exit(exit)) => {
                tracing::info!(
                    session_id = %id,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "Session process exited"
                );
                self.close(id);
            }
            None => {
                tracing::debug!(session_id = %id, "Backend event channel closed");
                self.close(id);
            }
        }
    }

    fn with_session(&mut self, id: &str, op: impl FnOnce(&mut Session)) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                op(&mut entry.session);
                true
            }
            None => false,
        }
    }

    fn publish_output(&self, id: &str, data: Vec<u8>) {
        if let Some(tx) = &self.output_tx {
            // No subscribers is fine.
            let _ = tx.send(SessionOutput {
                id: id.to_string(),
                data,
            });
        }
    }

    fn most_recent_id(&self) -> Option<SessionId> {
        self.entries
            .iter()
            .max_by_key(|(_, entry)| entry.serial)
            .map(|(id, _)| id.clone())
    }

    fn summarize(&self, entry: &SessionEntry) -> SessionSummary {
        let session = &entry.session;
        SessionSummary {
            id: session.id().to_string(),
            backend: session.backend_kind(),
            pid: session.pid(),
            active: self.active_id.as_deref() == Some(session.id()),
            config: session.config().clone(),
        }
    }

    fn sync_focus(&self) {
        if let Some(focus) = &self.focus {
            focus.sync_sessions(self.entries.len(), self.active_id.clone());
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.entries.len())
            .field("active_id", &self.active_id)
            .field("provisioner", &self.provisioner)
            .field("disposed", &self.disposed)
            .finish()
    }
}
