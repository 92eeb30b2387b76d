//! Configuration management for the shellmux daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{
    DisplayPreferences, SessionConfig as LaunchConfig, DEFAULT_FONT_FAMILY, DEFAULT_FONT_SIZE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("terminal geometry must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("font_size must be greater than 0")]
    InvalidFontSize,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the shellmux daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Defaults applied to new sessions.
    pub session: SessionConfig,

    /// Process backend selection.
    pub backend: BackendConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Defaults for sessions created without an explicit config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to use for new sessions. Unset means the platform shell.
    pub default_shell: Option<String>,

    /// Working directory for new sessions. Unset means the home directory.
    pub default_cwd: Option<String>,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Font size forwarded to the renderer.
    pub font_size: u16,

    /// Font family forwarded to the renderer.
    pub font_family: String,
}

/// How the process backend is chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Probe for a native pseudo-terminal and downgrade on failure.
    #[default]
    Auto,
    /// Never attempt a native pseudo-terminal.
    Fallback,
}

/// Process backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend selection mode.
    pub mode: BackendMode,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            default_cwd: None,
            cols: 80,
            rows: 30,
            font_size: DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
        }
    }
}

impl SessionConfig {
    /// Builds the launch config used when a session is created without one.
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            shell: self.default_shell.clone(),
            cwd: self.default_cwd.clone(),
            env: Default::default(),
            display: DisplayPreferences {
                font_size: self.font_size,
                font_family: self.font_family.clone(),
                theme: Default::default(),
            },
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellmux")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHELLMUX_SHELL: Override the default shell
    /// - SHELLMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(shell) = std::env::var("SHELLMUX_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = Some(shell);
            }
        }

        if let Ok(level) = std::env::var("SHELLMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.session.font_size == 0 {
            return Err(ConfigError::InvalidFontSize);
        }

        if let Some(shell) = &self.session.default_shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.session.cols, 80);
        assert_eq!(config.session.rows, 30);
        assert_eq!(config.session.font_size, 14);
        assert!(config.session.default_shell.is_none());
        assert_eq!(config.backend.mode, BackendMode::Auto);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[backend]
mode = "fallback"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.backend.mode, BackendMode::Fallback);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[session]
default_shell = "/bin/zsh"
default_cwd = "/work"
cols = 120
rows = 40
font_size = 16
font_family = "Fira Code"

[backend]
mode = "auto"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.session.default_cwd.as_deref(), Some("/work"));
        assert_eq!(config.session.cols, 120);
        assert_eq!(config.session.rows, 40);
        assert_eq!(config.session.font_family, "Fira Code");
        assert_eq!(config.backend.mode, BackendMode::Auto);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = \"debug\"\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_backend_mode() {
        let result = Config::from_toml("[backend]\nmode = \"winpty\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.default_cwd = Some("/srv".to_string());
        original.backend.mode = BackendMode::Fallback;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.session.cols = 132;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session.cols, 132);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_launch_config_carries_display_preferences() {
        let mut config = Config::default();
        config.session.default_shell = Some("/bin/sh".to_string());
        config.session.font_size = 18;

        let launch = config.session.launch_config();
        assert_eq!(launch.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(launch.display.font_size, 18);
        assert!(launch.env.is_empty());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_geometry() {
        let mut config = Config::default();
        config.session.rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidGeometry { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_missing_shell() {
        let mut config = Config::default();
        config.session.default_shell = Some("/definitely/not/a/shell".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_bad_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "chatty".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("chatty".to_string()))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_shell() {
        std::env::set_var("SHELLMUX_SHELL", "/bin/sh");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.default_shell.as_deref(), Some("/bin/sh"));

        std::env::remove_var("SHELLMUX_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::remove_var("SHELLMUX_SHELL");
        std::env::set_var("SHELLMUX_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.session.default_shell.is_none());

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("SHELLMUX_SHELL");
        std::env::set_var("SHELLMUX_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("SHELLMUX_LOG_LEVEL");
    }
}
