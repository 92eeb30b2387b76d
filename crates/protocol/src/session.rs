//! Session launch configuration shared between the host and the daemon.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default font size forwarded to renderers.
pub const DEFAULT_FONT_SIZE: u16 = 14;

/// Default font family forwarded to renderers.
pub const DEFAULT_FONT_FAMILY: &str = "Menlo, Monaco, \"Courier New\", monospace";

/// Immutable launch configuration for a session.
///
/// Every field is optional on the wire. The daemon fills in the shell,
/// working directory and environment defaults at provisioning time, so an
/// empty config is a valid request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable. `None` selects the platform shell.
    pub shell: Option<String>,
    /// Working directory. `None` selects the user's home directory.
    pub cwd: Option<String>,
    /// Environment variables applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Renderer preferences. Never interpreted by the daemon.
    pub display: DisplayPreferences,
}

impl SessionConfig {
    /// Sets the shell executable.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Display preferences, opaque to the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPreferences {
    /// Font size in points.
    pub font_size: u16,
    /// CSS-style font family list.
    pub font_family: String,
    /// Color palette entries (e.g. `background`, `brightRed`).
    pub theme: BTreeMap<String, String>,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            font_size: DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            theme: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.display.font_size, DEFAULT_FONT_SIZE);
        assert!(config.shell.is_none());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{"shell":"/bin/zsh","env":{"FOO":"bar"},"display":{"font_size":16}}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(config.display.font_size, 16);
        assert_eq!(config.display.font_family, DEFAULT_FONT_FAMILY);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_shell("/bin/sh")
            .with_cwd("/tmp")
            .with_env("A", "1");

        assert_eq!(config.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(config.cwd.as_deref(), Some("/tmp"));
        assert_eq!(config.env.len(), 1);
    }
}
