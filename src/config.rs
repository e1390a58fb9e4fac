//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MAIN_PC_IP`, `MAIN_PC_PORT`, `PORT`
//! 2. **Config file** — path via `--config <path>`, or `hashi.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! A missing config file is created with the defaults on first load, so there
//! is always a file to edit.
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [client]                      # remote side (the machine without Discord)
//! main_pc_ip = "192.168.1.20"
//! main_pc_port = 3838
//! reconnect_interval_ms = 5000
//!
//! [server]                      # home side (the machine running Discord)
//! port = 3838
//! max_clients = 5
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File looked up in the current directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "hashi.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote-side settings: where the home machine is and how to reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address of the machine running Discord. Override with `MAIN_PC_IP`.
    #[serde(default = "default_main_pc_ip")]
    pub main_pc_ip: String,
    /// Tunnel port on that machine (default 3838). Override with `MAIN_PC_PORT`.
    #[serde(default = "default_port")]
    pub main_pc_port: u16,
    /// Delay before each reconnect attempt in milliseconds (default 5000).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Home-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the tunnel WebSocket listens on (default 3838). Override with `PORT`.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent tunnel sessions (default 5).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn default_main_pc_ip() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    3838
}
fn default_reconnect_interval_ms() -> u64 {
    5000
}
fn default_max_clients() -> usize {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            main_pc_ip: default_main_pc_ip(),
            main_pc_port: default_port(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_clients: default_max_clients(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Tunnel URL of the home side.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.main_pc_ip, self.main_pc_port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// `true` when the remote side would only ever reach itself.
    pub fn targets_localhost(&self) -> bool {
        matches!(self.main_pc_ip.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::read_or_create(&Self::file_path(path))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// The `--config` path with `~` expanded, or `hashi.toml` in the CWD.
    pub fn file_path(path: Option<&str>) -> PathBuf {
        path.map_or_else(
            || PathBuf::from(DEFAULT_CONFIG_FILE),
            |p| PathBuf::from(crate::util::expand_tilde(p).as_ref()),
        )
    }

    /// Parse `path`, writing the defaults there first if it does not exist.
    /// No env overrides are applied, so the result is safe to save back.
    pub fn read_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::read(path);
        }
        let config = Self::default();
        // Read-only locations simply run on the defaults.
        let _ = config.save(path);
        Ok(config)
    }

    /// Parse a TOML file without applying env overrides.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist as TOML, used by the `config set-*` subcommands.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply env var overrides. Unparseable port numbers are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ip) = var("MAIN_PC_IP") {
            self.client.main_pc_ip = ip;
        }
        if let Some(port) = var("MAIN_PC_PORT").and_then(|p| p.parse().ok()) {
            self.client.main_pc_port = port;
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[client]\nmain_pc_ip = \"10.0.0.2\"\n").unwrap();
        assert_eq!(config.client.main_pc_ip, "10.0.0.2");
        assert_eq!(config.client.main_pc_port, 3838);
        assert_eq!(config.client.reconnect_interval_ms, 5000);
        assert_eq!(config.server.port, 3838);
        assert_eq!(config.server.max_clients, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "MAIN_PC_IP" => Some("192.168.1.20".into()),
            "MAIN_PC_PORT" => Some("4000".into()),
            "PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.client.main_pc_ip, "192.168.1.20");
        assert_eq!(config.client.main_pc_port, 4000);
        assert_eq!(config.server.port, 3838);
    }

    #[test]
    fn client_url_and_localhost_warning() {
        let mut client = ClientConfig::default();
        assert!(client.targets_localhost());
        client.main_pc_ip = "10.1.1.1".into();
        client.main_pc_port = 9000;
        assert!(!client.targets_localhost());
        assert_eq!(client.url(), "ws://10.1.1.1:9000");
        assert_eq!(client.reconnect_interval(), Duration::from_secs(5));
    }

    #[test]
    fn save_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashi.toml");
        let mut config = Config::default();
        config.server.max_clients = 2;
        config.client.main_pc_ip = "pc.lan".into();
        config.save(&path).unwrap();

        let loaded = Config::read(&path).unwrap();
        assert_eq!(loaded.server.max_clients, 2);
        assert_eq!(loaded.client.main_pc_ip, "pc.lan");
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashi.toml");

        let config = Config::read_or_create(&path).unwrap();
        assert_eq!(config.server.port, 3838);
        assert!(path.exists());

        let written = Config::read(&path).unwrap();
        assert_eq!(written.client.main_pc_ip, "localhost");
        assert_eq!(written.server.max_clients, 5);
    }

    #[test]
    fn existing_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashi.toml");
        std::fs::write(&path, "[server]\nport = 4100\n").unwrap();

        let config = Config::read_or_create(&path).unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[server]\nport = 4100\n");
    }

    #[test]
    fn unwritable_location_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("hashi.toml");
        let config = Config::read_or_create(&path).unwrap();
        assert_eq!(config.server.port, 3838);
        assert!(!path.exists());
    }

    #[test]
    fn read_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(
            Config::read(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
