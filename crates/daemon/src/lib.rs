//! # shellmux
//!
//! Multiplexes up to five interactive shell sessions behind a small command
//! surface.
//!
//! ## Overview
//!
//! - **Process backends**: native pseudo-terminals, with a plain piped child
//!   process as fallback when no pseudo-terminal can be used
//! - **Provisioning**: probes the native backend once and downgrades to the
//!   fallback backend for good after a native spawn failure
//! - **Session registry**: owns the sessions, enforces the cap, tracks the
//!   active session and republishes output and closure events
//! - **Focus tracking**: mirrors focus and session state into context keys
//!   for a host UI
//! - **Host adapter**: serves all of the above as JSON lines over stdio
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      Host (JSON lines)                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐     ┌─────────────────────────┐  │
//! │  │   Session Registry   │────▶│      Focus Tracker      │  │
//! │  └──────────┬───────────┘     └─────────────────────────┘  │
//! │             │                                              │
//! │  ┌──────────▼───────────┐                                  │
//! │  │     Provisioner      │                                  │
//! │  └──────────┬───────────┘                                  │
//! │  ┌──────────▼───────────┐     ┌─────────────────────────┐  │
//! │  │   Native PTY         │     │   Piped process         │  │
//! │  └──────────────────────┘     └─────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shellmux::{Config, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let mut registry = SessionRegistry::from_config(&config);
//!     let mut output = registry.subscribe_output().expect("registry is live");
//!
//!     let id = registry.create(None).await?;
//!     registry.send_input(&id, b"echo hello\n");
//!
//!     registry.process_next_event().await;
//!     if let Ok(chunk) = output.try_recv() {
//!         println!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//!
//!     registry.dispose_all();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Backends, provisioning, sessions and the registry
//! - [`focus`]: Focus state and context keys
//! - [`host`]: JSON lines front end

pub mod config;
pub mod focus;
pub mod host;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use focus::{ContextKey, ContextSink, FocusState, FocusTracker, MemoryContextStore};
pub use host::{ChannelContextSink, Host};
pub use session::{
    BackendHandle, BackendKind, Provisioner, RegistryError, Session, SessionId, SessionOutput,
    SessionRegistry, MAX_SESSIONS,
};
