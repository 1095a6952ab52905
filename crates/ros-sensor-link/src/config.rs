//! Sensor connection settings
//!
//! Settings can be kept in a TOML file so a sensor can be described once and
//! reused. Every field has a default, so a file only needs the keys it
//! changes:
//!
//! ```toml
//! unique_id = "sensor-1"
//! host = "10.0.0.5"
//! subscribers = ["mesh"]
//!
//! [pose]
//! position = [0.0, 1.5, 0.0]
//! ```

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::types::SensorPose;
use crate::websocket::TransportConfig;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default ROS bridge websocket port
pub const DEFAULT_PORT: u16 = 9090;

/// Settings for one sensor connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub unique_id: String,
    /// Display name of the sensor
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Subscriber aliases to resolve into topics
    pub subscribers: Vec<String>,
    /// TCP connect timeout; 0 waits for the OS default
    pub connect_timeout_ms: u64,
    /// How often the socket and decode threads check for work
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Bound on undecoded messages; unbounded when absent
    pub inbound_capacity: Option<usize>,
    pub max_frame_size: usize,
    /// Local placement of the sensor
    pub pose: SensorPose,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            unique_id: "mesh-sensor".to_string(),
            name: "Mesh Sensor".to_string(),
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            subscribers: vec!["mesh".to_string()],
            connect_timeout_ms: 10_000,
            poll_interval_ms: 10,
            shutdown_timeout_ms: 1_000,
            inbound_capacity: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pose: SensorPose::default(),
        }
    }
}

impl SensorConfig {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = toml::from_str(&contents).map_err(|e| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!("Loaded sensor settings from {:?}", path);
        Ok(config)
    }

    /// Write settings to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeToml {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        info!("Saved sensor settings to {:?}", path);
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: (self.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(self.connect_timeout_ms)),
            // A zero read timeout is rejected by the socket
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_message_size: self.max_frame_size,
            ..TransportConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            inbound_capacity: self.inbound_capacity,
        }
    }
}

/// Errors that can occur while loading or saving settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize TOML for {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
}
