//! Newline-delimited JSON codec.
//!
//! Each message is a single JSON object terminated by `\n`. Lines longer
//! than [`MAX_LINE_LENGTH`] are rejected before parsing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum accepted line length (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Encodes a message as a single JSON line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line =
        serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes a single JSON line. Surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_LENGTH,
        });
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }

    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Command, Event};

    #[test]
    fn test_encode_appends_newline() {
        let line = encode_line(&Event::Closed {
            id: "s1".to_string(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let cmd: Command = decode_line("  {\"type\":\"blur\"}\r\n").unwrap();
        assert_eq!(cmd, Command::Blur);
    }

    #[test]
    fn test_decode_empty_line() {
        let result = decode_line::<Command>("   \n");
        assert!(matches!(result, Err(ProtocolError::EmptyLine)));
    }

    #[test]
    fn test_decode_oversized_line() {
        let line = "x".repeat(MAX_LINE_LENGTH + 1);
        let result = decode_line::<Command>(&line);
        assert!(matches!(result, Err(ProtocolError::LineTooLong { .. })));
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode_line::<Command>("not json");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }
}
