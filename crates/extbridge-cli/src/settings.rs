//! Service settings.
//!
//! Reads `config/default.toml` (or the file given with `--config`) into
//! [`Settings`].  Every section and key is optional; anything missing keeps
//! its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use extbridge_nri::BridgeConfig;
use extbridge_sandbox::ControllerConfig;
use serde::{Deserialize, Serialize};

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub nri: NriSettings,
    pub sandbox: SandboxSettings,
}

// ---------------------------------------------------------------------------
// [log]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}

// ---------------------------------------------------------------------------
// [nri]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NriSettings {
    /// Socket external plugins connect to.
    pub socket_path: PathBuf,
    /// Plugin names allowed to register.  Empty allows every plugin.
    pub allowed_plugins: Vec<String>,
    /// How long a plugin has to register after connecting.  Also its
    /// per-call deadline.
    pub registration_timeout_ms: u64,
    pub default_call_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_plugins: usize,
}

impl Default for NriSettings {
    fn default() -> Self {
        let bridge = BridgeConfig::default();
        Self {
            socket_path: PathBuf::from("/var/run/nri/nri.sock"),
            allowed_plugins: Vec::new(),
            registration_timeout_ms: 5_000,
            default_call_timeout_ms: bridge.default_call_timeout.as_millis() as u64,
            shutdown_grace_ms: bridge.shutdown_grace.as_millis() as u64,
            max_plugins: bridge.max_plugins,
        }
    }
}

impl NriSettings {
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new()
            .with_default_call_timeout(Duration::from_millis(self.default_call_timeout_ms))
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
            .with_max_plugins(self.max_plugins)
    }
}

// ---------------------------------------------------------------------------
// [sandbox]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub wait_ready_window_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            connect_timeout_ms: controller.connect_timeout.as_millis() as u64,
            call_timeout_ms: controller.call_timeout.as_millis() as u64,
            wait_ready_window_ms: controller.wait_ready_window.as_millis() as u64,
        }
    }
}

impl SandboxSettings {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::new()
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms))
            .with_wait_ready_window(Duration::from_millis(self.wait_ready_window_ms))
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    /// Load settings from `path`, or from [`DEFAULT_CONFIG_PATH`] when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        Self::parse(&content).with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.nri.registration_timeout(), Duration::from_secs(5));
        assert_eq!(
            settings.sandbox.controller_config().call_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = Settings::parse(
            r#"
            [log]
            format = "json"

            [nri]
            allowed_plugins = ["logger", "device-injector"]
            max_plugins = 4
            "#,
        )
        .unwrap();

        assert_eq!(settings.log.format, LogFormat::Json);
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.nri.allowed_plugins.len(), 2);
        assert_eq!(settings.nri.bridge_config().max_plugins, 4);
        assert_eq!(
            settings.nri.bridge_config().default_call_timeout,
            Duration::from_secs(2)
        );
        assert_eq!(settings.sandbox, SandboxSettings::default());
    }

    #[test]
    fn unknown_format_is_an_error() {
        assert!(Settings::parse("[log]\nformat = \"xml\"").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extbridge.toml");
        std::fs::write(&path, "[sandbox]\nconnect_timeout_ms = 250\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(
            settings.sandbox.controller_config().connect_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Settings::load(Some(&missing)).is_err());
    }
}
