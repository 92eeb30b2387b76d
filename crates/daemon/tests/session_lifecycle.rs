//! End-to-end session lifecycle tests.
//!
//! These tests drive the registry, provisioning and focus tracking together
//! against real `/bin/sh` processes:
//! - Capacity limits and recovery
//! - Closing, reassignment of the active session and idempotent disposal
//! - The one-way native to fallback downgrade
//! - Focus edge notifications

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::SessionConfig;
use shellmux::config::{BackendMode, Config};
use shellmux::focus::{ContextKey, FocusTracker, MemoryContextStore};
use shellmux::session::{
    BackendError, BackendFactory, BackendHandle, BackendKind, LaunchSpec, PipedProcess,
    ProvisionMode, Provisioner, RegistryError, SessionRegistry, MAX_SESSIONS,
};
use tempfile::TempDir;
use tokio::time::timeout;

/// Factory that reports native support but fails the first native spawn.
#[derive(Default)]
struct FlakyNativeFactory {
    native_attempts: AtomicUsize,
}

impl BackendFactory for FlakyNativeFactory {
    fn probe_native(&self) -> bool {
        true
    }

    fn spawn_native(&self, _spec: &LaunchSpec) -> Result<BackendHandle, BackendError> {
        self.native_attempts.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Spawn("simulated pty failure".to_string()))
    }

    fn spawn_fallback(&self, spec: &LaunchSpec) -> Result<BackendHandle, BackendError> {
        PipedProcess::spawn(spec).map(BackendHandle::Fallback)
    }
}

fn sh_config() -> SessionConfig {
    SessionConfig::default()
        .with_shell("/bin/sh")
        .with_cwd(std::env::temp_dir().to_string_lossy())
}

fn fallback_registry() -> SessionRegistry {
    SessionRegistry::new(Provisioner::new(BackendMode::Fallback)).with_default_config(sh_config())
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_five_sessions_then_rejection_then_recovery() {
    let mut registry = fallback_registry();
    let mut issued = Vec::new();

    for _ in 0..MAX_SESSIONS {
        issued.push(registry.create(None).await.unwrap());
    }
    assert_eq!(registry.count(), 5);

    let err = registry.create(None).await.unwrap_err();
    assert!(matches!(err, RegistryError::CapacityExceeded { max: 5 }));
    assert_eq!(err.to_string(), "session limit reached (max 5)");
    assert!(issued.iter().all(|id| registry.contains(id)));

    assert!(registry.close(&issued[2]));
    issued.push(registry.create(None).await.unwrap());

    issued.sort();
    issued.dedup();
    assert_eq!(issued.len(), 6);
    assert_eq!(registry.count(), 5);
    assert_eq!(registry.list().len(), 5);

    registry.dispose_all();
}

// =============================================================================
// Close and Dispose
// =============================================================================

#[tokio::test]
async fn test_close_exactly_once_and_active_reassignment() {
    let mut registry = fallback_registry();
    let mut closed = registry.subscribe_closed().unwrap();

    let a = registry.create(None).await.unwrap();
    let b = registry.create(None).await.unwrap();
    assert_eq!(registry.active_id(), Some(b.as_str()));

    assert!(registry.close(&b));
    assert!(!registry.close(&b));
    assert_eq!(registry.active_id(), Some(a.as_str()));

    assert!(registry.close(&a));
    assert_eq!(registry.active_id(), None);

    assert_eq!(closed.try_recv().unwrap(), b);
    assert_eq!(closed.try_recv().unwrap(), a);
    assert!(closed.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_session_commands_return_false() {
    let mut registry = fallback_registry();

    assert!(!registry.send_input("nope", b"echo hi\n"));
    assert!(!registry.resize("nope", 120, 40));
    assert!(!registry.clear("nope"));
    assert!(!registry.close("nope"));
}

#[tokio::test]
async fn test_dispose_all_twice() {
    let mut registry = fallback_registry();
    registry.create(None).await.unwrap();
    registry.create(None).await.unwrap();

    registry.dispose_all();
    let first = (registry.count(), registry.active_id().map(str::to_string));
    registry.dispose_all();
    let second = (registry.count(), registry.active_id().map(str::to_string));

    assert_eq!(first, (0, None));
    assert_eq!(first, second);
    assert!(matches!(registry.create(None).await, Err(RegistryError::Disposed)));
}

#[tokio::test]
async fn test_exit_before_close_emits_single_closed_event() {
    let mut registry = fallback_registry();
    let mut closed = registry.subscribe_closed().unwrap();
    let id = registry.create(None).await.unwrap();

    registry.send_input(&id, b"exit 0\n");
    for _ in 0..50 {
        if !registry.contains(&id) {
            break;
        }
        let _ = timeout(Duration::from_millis(100), registry.process_next_event()).await;
    }

    assert!(!registry.close(&id));
    assert_eq!(closed.try_recv().unwrap(), id);
    assert!(closed.try_recv().is_err());
}

#[tokio::test]
async fn test_close_with_queued_exit_emits_single_closed_event() {
    let mut registry = fallback_registry();
    let mut closed = registry.subscribe_closed().unwrap();
    let id = registry.create(None).await.unwrap();

    // Let the exit land in the session's queue without applying it.
    registry.send_input(&id, b"exit 0\n");
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(registry.contains(&id));

    assert!(registry.close(&id));
    assert!(!registry.close(&id));
    assert_eq!(registry.process_pending(), 0);
    assert!(timeout(Duration::from_millis(200), registry.process_next_event()).await.is_err());

    assert_eq!(closed.try_recv().unwrap(), id);
    assert!(closed.try_recv().is_err());
    assert_eq!(registry.count(), 0);
}

// =============================================================================
// Backend Downgrade
// =============================================================================

#[tokio::test]
async fn test_native_failure_downgrades_all_later_sessions() {
    let factory = Arc::new(FlakyNativeFactory::default());
    let provisioner = Provisioner::with_factory(factory.clone(), BackendMode::Auto);
    let mut registry = SessionRegistry::new(provisioner).with_default_config(sh_config());

    let first = registry.create(None).await.unwrap();
    assert_eq!(registry.provisioner().mode(), ProvisionMode::FallbackOnly);
    let second = registry.create(None).await.unwrap();

    assert_eq!(registry.get(&first).unwrap().backend, Some(BackendKind::Fallback));
    assert_eq!(registry.get(&second).unwrap().backend, Some(BackendKind::Fallback));
    assert!(!BackendKind::Fallback.supports_resize());
    assert_eq!(factory.native_attempts.load(Ordering::SeqCst), 1);

    // Resize on the fallback backend is accepted.
    assert!(registry.resize(&second, 132, 43));

    registry.dispose_all();
    assert_eq!(registry.provisioner().live_count(), 0);
}

// =============================================================================
// Focus Tracking
// =============================================================================

#[tokio::test]
async fn test_focus_twice_notifies_once() {
    let store = Arc::new(MemoryContextStore::new());
    let focus = Arc::new(FocusTracker::new(store.clone()));
    let mut registry = fallback_registry().with_focus_tracker(focus.clone());
    let mut changes = focus.on_focus_change().unwrap();

    let a = registry.create(None).await.unwrap();
    let b = registry.create(None).await.unwrap();

    focus.focus(Some(&a));
    focus.focus(Some(&b));

    assert_eq!(changes.try_recv().unwrap(), true);
    assert!(changes.try_recv().is_err());
    assert_eq!(focus.state().active_id.as_deref(), Some(b.as_str()));
    assert!(store.flag(ContextKey::TerminalFocus));

    registry.close(&a);
    registry.close(&b);
    assert!(!store.flag(ContextKey::HasActiveTerminal));
    assert_eq!(focus.state().active_id, None);

    registry.dispose_all();
    focus.dispose();
    assert!(!store.flag(ContextKey::TerminalFocus));
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_registry_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");

    let mut config = Config::default();
    config.session.default_shell = Some("/bin/sh".to_string());
    config.session.default_cwd = Some(temp_dir.path().to_string_lossy().into_owned());
    config.session.font_size = 16;
    config.backend.mode = BackendMode::Fallback;
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    loaded.validate().unwrap();

    let mut registry = SessionRegistry::from_config(&loaded);
    let id = registry.create(None).await.unwrap();

    let summary = registry.get(&id).unwrap();
    assert_eq!(summary.backend, Some(BackendKind::Fallback));
    assert_eq!(summary.config.shell.as_deref(), Some("/bin/sh"));
    assert_eq!(summary.config.display.font_size, 16);

    registry.dispose_all();
}
