// Configuration management for the rendezvous CLI
//
// Optional JSON config stored in:
// - macOS: ~/Library/Application Support/rendezvous/config.json
// - Linux: ~/.config/rendezvous/config.json
// - Windows: %APPDATA%\rendezvous\config.json

use anyhow::{Context, Result};
use rendezvous_core::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings for `serve`
    pub server: ServerSettings,

    /// Settings for `join`
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on
    pub host: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// Seconds an unmatched relay socket may wait (0 = forever)
    pub pending_relay_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Root websocket URL of the rendezvous server
    pub url: String,

    /// Discovery reconnect delay in milliseconds
    pub reconnect_delay_ms: u64,

    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: u64,

    /// Relay retry delay in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            pending_relay_timeout: defaults
                .pending_relay_timeout
                .map_or(0, |t| t.as_secs()),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            url: defaults.url,
            reconnect_delay_ms: millis(defaults.reconnect_delay),
            heartbeat_ms: millis(defaults.heartbeat_interval),
            retry_delay_ms: millis(defaults.retry_delay),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("rendezvous");
        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load `path` if given, else the default file if present, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let file = Self::config_file()?;
                if !file.exists() {
                    return Ok(Config::default());
                }
                file
            }
        };

        let contents = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read config file {}", file.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", file.display()))?;
        Ok(config)
    }

    /// Save config to `path`, or the default file
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let file = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let dir = Self::config_dir()?;
                std::fs::create_dir_all(&dir).context("Failed to create config directory")?;
                dir.join("config.json")
            }
        };
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&file, contents).context("Failed to write config file")?;
        Ok(file)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server.host" => {
                self.server.host = value.parse().context("Invalid IP address")?;
            }
            "server.port" => {
                self.server.port = value.parse().context("Invalid port number")?;
            }
            "server.pending_relay_timeout" => {
                self.server.pending_relay_timeout = value.parse().context("Invalid number")?;
            }
            "client.url" => {
                ClientConfig::new(value).validate()?;
                self.client.url = value.to_string();
            }
            "client.reconnect_delay_ms" => {
                self.client.reconnect_delay_ms = value.parse().context("Invalid number")?;
            }
            "client.heartbeat_ms" => {
                let heartbeat: u64 = value.parse().context("Invalid number")?;
                anyhow::ensure!(heartbeat > 0, "Heartbeat interval must be at least 1 ms");
                self.client.heartbeat_ms = heartbeat;
            }
            "client.retry_delay_ms" => {
                self.client.retry_delay_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "server.host" => Some(self.server.host.to_string()),
            "server.port" => Some(self.server.port.to_string()),
            "server.pending_relay_timeout" => Some(self.server.pending_relay_timeout.to_string()),
            "client.url" => Some(self.client.url.clone()),
            "client.reconnect_delay_ms" => Some(self.client.reconnect_delay_ms.to_string()),
            "client.heartbeat_ms" => Some(self.client.heartbeat_ms.to_string()),
            "client.retry_delay_ms" => Some(self.client.retry_delay_ms.to_string()),
            _ => None,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host,
            port: self.server.port,
            pending_relay_timeout: match self.server.pending_relay_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.client.url.clone(),
            reconnect_delay: Duration::from_millis(self.client.reconnect_delay_ms),
            heartbeat_interval: Duration::from_millis(self.client.heartbeat_ms),
            retry_delay: Duration::from_millis(self.client.retry_delay_ms),
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library() {
        let config = Config::default();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server_config().pending_relay_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.client_config().retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"server":{"port":9000}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.client.url, ClientConfig::default().url);
    }

    #[test]
    fn test_set_get_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.set("client.url", "ws://relay.example.com:8080").unwrap();
        config.set("server.pending_relay_timeout", "0").unwrap();
        assert!(config.set("client.url", "http://nope").is_err());
        assert!(config.set("no.such.key", "1").is_err());
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.get("client.url").as_deref(), Some("ws://relay.example.com:8080"));
        assert_eq!(loaded.server_config().pending_relay_timeout, None);
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let mut config = Config::default();
        assert!(config.set("client.heartbeat_ms", "0").is_err());
        assert_eq!(config.client.heartbeat_ms, 5000);

        config.set("client.heartbeat_ms", "250").unwrap();
        assert_eq!(config.client_config().heartbeat_interval, Duration::from_millis(250));
        assert!(config.client_config().validate().is_ok());
    }

    #[test]
    fn test_zero_heartbeat_in_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"client":{"heartbeat_ms":0}}"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.client_config().validate().is_err());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(5)), 5000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_err());
    }
}
