//! # shellmux protocol
//!
//! Shared types for the shellmux session multiplexer:
//!
//! - **Session configuration**: the immutable launch config of a session
//! - **Commands**: what a host may ask the daemon to do
//! - **Events**: what the daemon reports back (output, closure, context keys)
//! - **Line codec**: newline-delimited JSON framing for stdio transports
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_line, encode_line, Command, Event};
//!
//! let cmd: Command = decode_line(r#"{"type":"create_session","data":{}}"#).unwrap();
//! assert_eq!(cmd, Command::CreateSession { config: None });
//!
//! let line = encode_line(&Event::Closed { id: "abc".into() }).unwrap();
//! assert!(line.ends_with('\n'));
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod session;

pub use codec::{decode_line, encode_line, MAX_LINE_LENGTH};
pub use error::{ProtocolError, Result};
pub use messages::{
    BackendKind, Command, ContextValue, Event, SessionSummary, PROTOCOL_VERSION,
};
pub use session::{DisplayPreferences, SessionConfig, DEFAULT_FONT_FAMILY, DEFAULT_FONT_SIZE};
