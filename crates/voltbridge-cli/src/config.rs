//! Configuration – reads/writes `~/.voltbridge/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use voltbridge_cockpit::BridgeSettings;
use voltbridge_middleware::{HubSettings, ProducerSettings};
use voltbridge_types::BridgeError;

/// Persisted bridge configuration. Every field has a default, so a partial
/// (or empty) file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP + WebSocket listening port.
    pub http_port: u16,
    pub ws_path: String,
    /// Directory served for non-WebSocket `GET` requests.
    pub static_dir: PathBuf,
    /// `host:port` of the telemetry producer.
    pub producer_addr: String,
    /// Channels seeded with placeholder values at startup.
    pub channel_count: u16,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub reconnect_jitter_ms: u64,
    /// `0` disables status polling.
    pub poll_interval_secs: u64,
    pub synthetic_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Capacity of the hub's command queue.
    pub broadcast_queue: usize,
    /// Capacity of each viewer's outbound queue.
    pub viewer_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 5177,
            ws_path: "/ws".to_string(),
            static_dir: PathBuf::from("./static"),
            producer_addr: "127.0.0.1:1688".to_string(),
            channel_count: 24,
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
            write_timeout_secs: 5,
            reconnect_backoff_secs: 10,
            reconnect_jitter_ms: 1000,
            poll_interval_secs: 5,
            synthetic_interval_secs: 2,
            shutdown_timeout_secs: 10,
            broadcast_queue: 256,
            viewer_queue: 32,
        }
    }
}

impl Config {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if !self.ws_path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "ws_path must start with '/', got {:?}",
                self.ws_path
            )));
        }
        if self.producer_addr.trim().is_empty() {
            return Err(BridgeError::Config("producer_addr is empty".into()));
        }
        if self.channel_count == 0 {
            return Err(BridgeError::Config("channel_count must be > 0".into()));
        }
        if self.synthetic_interval_secs == 0 {
            return Err(BridgeError::Config("synthetic_interval_secs must be > 0".into()));
        }
        if self.broadcast_queue == 0 || self.viewer_queue == 0 {
            return Err(BridgeError::Config("queue capacities must be > 0".into()));
        }
        Ok(())
    }

    pub fn to_bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            http_port: self.http_port,
            ws_path: self.ws_path.clone(),
            static_dir: self.static_dir.clone(),
            channel_count: self.channel_count,
            producer: ProducerSettings {
                addr: self.producer_addr.clone(),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                read_timeout: Duration::from_secs(self.read_timeout_secs),
                write_timeout: Duration::from_secs(self.write_timeout_secs),
                reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
                reconnect_jitter: Duration::from_millis(self.reconnect_jitter_ms),
                poll_interval: (self.poll_interval_secs > 0)
                    .then(|| Duration::from_secs(self.poll_interval_secs)),
            },
            hub: HubSettings {
                command_capacity: self.broadcast_queue,
                viewer_capacity: self.viewer_queue,
            },
            synthetic_interval: Duration::from_secs(self.synthetic_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Return the path to `~/.voltbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".voltbridge").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist. Environment overrides are applied either way.
pub fn load_from(path: &Path) -> Result<Config, BridgeError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            BridgeError::Config(format!("failed to parse {}: {e}", path.display()))
        })?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PORT`, `VOLTBRIDGE_HTTP_PORT` | `http_port` (the latter wins) |
/// | `VOLTBRIDGE_PRODUCER_ADDR` | `producer_addr` |
/// | `VOLTBRIDGE_STATIC_DIR` | `static_dir` |
/// | `VOLTBRIDGE_CHANNELS` | `channel_count` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    for key in ["PORT", "VOLTBRIDGE_HTTP_PORT"] {
        if let Some(port) = var(key).and_then(|v| v.trim().parse::<u16>().ok()) {
            cfg.http_port = port;
        }
    }
    if let Some(addr) = var("VOLTBRIDGE_PRODUCER_ADDR").filter(|v| !v.trim().is_empty()) {
        cfg.producer_addr = addr;
    }
    if let Some(dir) = var("VOLTBRIDGE_STATIC_DIR").filter(|v| !v.is_empty()) {
        cfg.static_dir = PathBuf::from(dir);
    }
    if let Some(count) = var("VOLTBRIDGE_CHANNELS").and_then(|v| v.trim().parse::<u16>().ok()) {
        cfg.channel_count = count;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| BridgeError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let raw = fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&raw).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "producer_addr = \"10.0.0.7:1688\"\npoll_interval_secs = 0\n").unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let cfg: Config = toml::from_str(&raw).unwrap();
        assert_eq!(cfg.producer_addr, "10.0.0.7:1688");
        assert_eq!(cfg.http_port, 5177);
        assert_eq!(cfg.channel_count, 24);

        let settings = cfg.to_bridge_settings();
        assert_eq!(settings.producer.poll_interval, None);
        assert_eq!(settings.producer.reconnect_jitter, Duration::from_millis(1000));
        assert_eq!(settings.hub.viewer_capacity, 32);
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "http_port = \"not a number\"").unwrap();
        assert!(matches!(load_from(&path), Err(BridgeError::Config(_))));
    }

    #[test]
    fn config_path_points_to_voltbridge_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.voltbridge/config.toml"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        apply_overrides_from(
            &mut cfg,
            env(&[
                ("PORT", "8000"),
                ("VOLTBRIDGE_PRODUCER_ADDR", "pack.local:1688"),
                ("VOLTBRIDGE_STATIC_DIR", "/srv/www"),
                ("VOLTBRIDGE_CHANNELS", "48"),
            ]),
        );
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.producer_addr, "pack.local:1688");
        assert_eq!(cfg.static_dir, PathBuf::from("/srv/www"));
        assert_eq!(cfg.channel_count, 48);
    }

    #[test]
    fn voltbridge_port_beats_generic_port() {
        let mut cfg = Config::default();
        apply_overrides_from(
            &mut cfg,
            env(&[("PORT", "8000"), ("VOLTBRIDGE_HTTP_PORT", "9000")]),
        );
        assert_eq!(cfg.http_port, 9000);
    }

    #[test]
    fn env_overrides_ignore_invalid_values() {
        let mut cfg = Config::default();
        apply_overrides_from(
            &mut cfg,
            env(&[("PORT", "not-a-port"), ("VOLTBRIDGE_CHANNELS", "-3")]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(Config::default().validate().is_ok());

        let bad_path = Config {
            ws_path: "ws".into(),
            ..Config::default()
        };
        assert!(bad_path.validate().is_err());

        let no_queue = Config {
            viewer_queue: 0,
            ..Config::default()
        };
        assert!(no_queue.validate().is_err());

        let no_channels = Config {
            channel_count: 0,
            ..Config::default()
        };
        assert!(no_channels.validate().is_err());
    }

    #[test]
    fn zero_channel_count_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "channel_count = 0\n").unwrap();
        assert!(matches!(load_from(&path), Err(BridgeError::Config(_))));

        let mut cfg = Config::default();
        apply_overrides_from(&mut cfg, env(&[("VOLTBRIDGE_CHANNELS", "0")]));
        assert_eq!(cfg.channel_count, 0);
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));
    }
}
