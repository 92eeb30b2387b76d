//! Session management module.
//!
//! This module provides process backends, backend provisioning with the
//! native to fallback downgrade, individual sessions, and the registry that
//! owns them.

pub mod backend;
pub mod instance;
pub mod piped;
pub mod provision;
pub mod pty;
pub mod registry;

pub use backend::{
    BackendError, BackendEvent, BackendExit, BackendHandle, BackendKind, LaunchSpec, Terminator,
};
pub use instance::{clear_sequence, Session, SessionId};
pub use piped::PipedProcess;
pub use provision::{
    default_shell, BackendFactory, ProvisionError, ProvisionMode, Provisioner, SystemBackendFactory,
};
pub use pty::NativePty;
pub use registry::{RegistryError, SessionOutput, SessionRegistry, MAX_SESSIONS};
