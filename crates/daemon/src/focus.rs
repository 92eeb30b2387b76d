//! Focus and context tracking.
//!
//! The [`FocusTracker`] mirrors registry and UI state into a set of context
//! keys that a host UI evaluates in its conditionals (keybindings, menus,
//! visibility rules). It never holds information the registry does not
//! already have. Every change is pushed through a [`ContextSink`]; the
//! tracker does not care how the sink stores or reacts to values.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use protocol::ContextValue;
use tokio::sync::broadcast;

use crate::session::MAX_SESSIONS;

/// Capacity of the focus change channel.
const FOCUS_CHANNEL_CAPACITY: usize = 16;

/// Context keys published by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// The terminal view has keyboard focus.
    TerminalFocus,
    /// Number of live sessions.
    TerminalCount,
    /// ID of the active session.
    ActiveTerminalId,
    /// Another session can be split off the active one.
    CanSplitTerminal,
    /// There is an active session.
    HasActiveTerminal,
    /// The webview hosting the terminal has focus.
    TerminalWebviewFocus,
    /// The sidebar hosting the terminal has focus.
    TerminalSidebarFocus,
    /// Text is selected in the terminal.
    TerminalTextSelected,
    /// A full-screen interactive program runs in the active session.
    IsInteractiveCli,
}

impl ContextKey {
    /// Every key, in publish order.
    pub const ALL: [ContextKey; 9] = [
        ContextKey::TerminalFocus,
        ContextKey::TerminalCount,
        ContextKey::ActiveTerminalId,
        ContextKey::CanSplitTerminal,
        ContextKey::HasActiveTerminal,
        ContextKey::TerminalWebviewFocus,
        ContextKey::TerminalSidebarFocus,
        ContextKey::TerminalTextSelected,
        ContextKey::IsInteractiveCli,
    ];

    /// Returns the key name seen by the host.
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKey::TerminalFocus => "shellmux.terminalFocus",
            ContextKey::TerminalCount => "shellmux.terminalCount",
            ContextKey::ActiveTerminalId => "shellmux.activeTerminalId",
            ContextKey::CanSplitTerminal => "shellmux.canSplitTerminal",
            ContextKey::HasActiveTerminal => "shellmux.hasActiveTerminal",
            ContextKey::TerminalWebviewFocus => "shellmux.terminalWebviewFocus",
            ContextKey::TerminalSidebarFocus => "shellmux.terminalSidebarFocus",
            ContextKey::TerminalTextSelected => "shellmux.terminalTextSelected",
            ContextKey::IsInteractiveCli => "shellmux.isInteractiveCLI",
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives context key updates.
pub trait ContextSink: Send + Sync {
    /// Publishes the new value of a key.
    fn publish(&self, key: ContextKey, value: ContextValue);
}

/// Tracked focus state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusState {
    pub focused: bool,
    pub active_id: Option<String>,
    pub session_count: usize,
    pub text_selected: bool,
    pub interactive_process: bool,
    pub sidebar_focused: bool,
}

impl FocusState {
    /// Whether there is a live active session.
    pub fn has_active_session(&self) -> bool {
        self.session_count > 0 && self.active_id.is_some()
    }

    /// Whether another session may be split off. Uses the registry's cap.
    pub fn can_split(&self) -> bool {
        self.session_count > 0 && self.session_count < MAX_SESSIONS
    }

    fn value(&self, key: ContextKey) -> ContextValue {
        match key {
            ContextKey::TerminalFocus | ContextKey::TerminalWebviewFocus => self.focused.into(),
            ContextKey::TerminalCount => self.session_count.into(),
            ContextKey::ActiveTerminalId => self.active_id.clone().into(),
            ContextKey::CanSplitTerminal => self.can_split().into(),
            ContextKey::HasActiveTerminal => self.has_active_session().into(),
            ContextKey::TerminalSidebarFocus => self.sidebar_focused.into(),
            ContextKey::TerminalTextSelected => self.text_selected.into(),
            ContextKey::IsInteractiveCli => self.interactive_process.into(),
        }
    }
}

/// Derives context keys from focus and session state.
pub struct FocusTracker {
    state: Mutex<FocusState>,
    sink: Arc<dyn ContextSink>,
    focus_tx: Mutex<Option<broadcast::Sender<bool>>>,
    disposed: AtomicBool,
}

impl FocusTracker {
    /// Creates a tracker and publishes the initial value of every key.
    pub fn new(sink: Arc<dyn ContextSink>) -> Self {
        let (focus_tx, _) = broadcast::channel(FOCUS_CHANNEL_CAPACITY);
        let tracker = Self {
            state: Mutex::new(FocusState::default()),
            sink,
            focus_tx: Mutex::new(Some(focus_tx)),
            disposed: AtomicBool::new(false),
        };
        tracker.publish_keys(&FocusState::default(), &ContextKey::ALL);
        tracker
    }

    /// Marks the terminal focused, optionally switching the active session.
    ///
    /// Focus change listeners only hear about the unfocused to focused edge.
    pub fn focus(&self, id: Option<&str>) {
        let Some((snapshot, was_focused)) = self.update(|state| {
            let was_focused = state.focused;
            state.focused = true;
            if let Some(id) = id {
                state.active_id = Some(id.to_string());
            }
            was_focused
        }) else {
            return;
        };

        let mut keys = vec![ContextKey::TerminalFocus, ContextKey::TerminalWebviewFocus];
        if id.is_some() {
            keys.push(ContextKey::ActiveTerminalId);
        }
        keys.extend([ContextKey::HasActiveTerminal, ContextKey::CanSplitTerminal]);
        self.publish_keys(&snapshot, &keys);

        if !was_focused {
            tracing::debug!(active_id = ?snapshot.active_id, "Terminal focused");
            self.notify_focus(true);
        }
    }

    /// Marks the terminal unfocused.
    pub fn blur(&self) {
        let Some((snapshot, was_focused)) = self.update(|state| {
            let was_focused = state.focused;
            state.focused = false;
            was_focused
        }) else {
            return;
        };

        self.publish_keys(
            &snapshot,
            &[ContextKey::TerminalFocus, ContextKey::TerminalWebviewFocus],
        );

        if was_focused {
            tracing::debug!("Terminal blurred");
            self.notify_focus(false);
        }
    }

    /// Sets the active session.
    pub fn set_active(&self, id: Option<String>) {
        if let Some((snapshot, ())) = self.update(|state| state.active_id = id) {
            self.publish_keys(
                &snapshot,
                &[
                    ContextKey::ActiveTerminalId,
                    ContextKey::HasActiveTerminal,
                    ContextKey::CanSplitTerminal,
                ],
            );
        }
    }

    /// Sets the number of live sessions.
    pub fn set_session_count(&self, count: usize) {
        if let Some((snapshot, ())) = self.update(|state| state.session_count = count) {
            self.publish_keys(
                &snapshot,
                &[
                    ContextKey::TerminalCount,
                    ContextKey::HasActiveTerminal,
                    ContextKey::CanSplitTerminal,
                ],
            );
        }
    }

    /// Sets session count and active session together.
    pub fn sync_sessions(&self, count: usize, active_id: Option<String>) {
        if let Some((snapshot, ())) = self.update(|state| {
            state.session_count = count;
            state.active_id = active_id;
        }) {
            self.publish_keys(
                &snapshot,
                &[
                    ContextKey::TerminalCount,
                    ContextKey::ActiveTerminalId,
                    ContextKey::HasActiveTerminal,
                    ContextKey::CanSplitTerminal,
                ],
            );
        }
    }

    /// Sets whether text is selected in the terminal.
    pub fn set_text_selected(&self, selected: bool) {
        if let Some((snapshot, ())) = self.update(|state| state.text_selected = selected) {
            self.publish_keys(&snapshot, &[ContextKey::TerminalTextSelected]);
        }
    }

    /// Sets whether an interactive program runs in the active session.
    pub fn set_interactive_process(&self, interactive: bool) {
        if let Some((snapshot, ())) = self.update(|state| state.interactive_process = interactive) {
            self.publish_keys(&snapshot, &[ContextKey::IsInteractiveCli]);
        }
    }

    /// Sets whether the hosting sidebar has focus.
    pub fn set_sidebar_focus(&self, focused: bool) {
        if let Some((snapshot, ())) = self.update(|state| state.sidebar_focused = focused) {
            self.publish_keys(&snapshot, &[ContextKey::TerminalSidebarFocus]);
        }
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> FocusState {
        self.lock_state().clone()
    }

    /// Returns whether the terminal is focused.
    pub fn is_focused(&self) -> bool {
        self.lock_state().focused
    }

    /// Subscribes to focus changes. Returns `None` after disposal.
    pub fn on_focus_change(&self) -> Option<broadcast::Receiver<bool>> {
        self.lock_focus_tx().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Returns whether the tracker has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resets every key to its initial value and closes the focus channel.
    ///
    /// Later mutations are ignored.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let reset = FocusState::default();
        *self.lock_state() = reset.clone();
        self.publish_keys(&reset, &ContextKey::ALL);
        self.lock_focus_tx().take();

        tracing::debug!("Focus tracker disposed");
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut FocusState) -> R) -> Option<(FocusState, R)> {
        if self.is_disposed() {
            return None;
        }
        let mut state = self.lock_state();
        let result = mutate(&mut state);
        Some((state.clone(), result))
    }

    fn publish_keys(&self, state: &FocusState, keys: &[ContextKey]) {
        for key in keys {
            self.sink.publish(*key, state.value(*key));
        }
    }

    fn notify_focus(&self, focused: bool) {
        if let Some(tx) = self.lock_focus_tx().as_ref() {
            // No subscribers is fine.
            let _ = tx.send(focused);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, FocusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_focus_tx(&self) -> MutexGuard<'_, Option<broadcast::Sender<bool>>> {
        self.focus_tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for FocusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocusTracker")
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// In-memory context store.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    values: DashMap<ContextKey, ContextValue>,
    publishes: AtomicUsize,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last published value of `key`.
    pub fn get(&self, key: ContextKey) -> Option<ContextValue> {
        self.values.get(&key).map(|value| value.clone())
    }

    /// Returns the boolean value of `key`, treating anything else as false.
    pub fn flag(&self, key: ContextKey) -> bool {
        matches!(self.get(key), Some(ContextValue::Bool(true)))
    }

    /// Returns the total number of publishes received.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }
}

impl ContextSink for MemoryContextStore {
    fn publish(&self, key: ContextKey, value: ContextValue) {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.values.insert(key, value);
    }
}
