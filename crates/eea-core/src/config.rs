//! Configuration types for the agent.
//!
//! Everything here is supplied at process start and treated as immutable
//! afterwards; the binary shares one `Arc<AgentConfig>` between threads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Device identifier, also used as the MQTT client id
    pub device_id: String,
    /// Broker access key (MQTT username)
    pub access_key: String,
    /// Broker access secret (MQTT password)
    pub access_secret: String,
    /// Prefix of every device topic
    pub base_topic: String,
    /// Broker connection settings
    pub broker: BrokerConfig,
    /// Guest execution settings
    pub guest: GuestConfig,
    /// Optional line sensor producer
    pub sensor: Option<SensorConfig>,
    /// Read `info` / `direct` / `exit` commands from stdin
    pub console: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            access_key: String::new(),
            access_secret: String::new(),
            base_topic: "losant".to_string(),
            broker: BrokerConfig::default(),
            guest: GuestConfig::default(),
            sensor: None,
            console: false,
        }
    }
}

impl AgentConfig {
    /// Parse a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("could not read `{}`: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("device_id", &self.device_id),
            ("access_key", &self.access_key),
            ("access_secret", &self.access_secret),
            ("base_topic", &self.base_topic),
            ("broker.host", &self.broker.host),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("`{}` must be set", name)));
            }
        }

        if self.guest.memory_pages == 0 {
            return Err(Error::Config("`guest.memory_pages` must be at least 1".into()));
        }
        if self.guest.pump_interval_ms == 0 {
            return Err(Error::Config("`guest.pump_interval_ms` must be positive".into()));
        }
        if !(0..=2).contains(&self.guest.trace_level) {
            return Err(Error::Config(format!(
                "`guest.trace_level` must be 0, 1 or 2 (got {})",
                self.guest.trace_level
            )));
        }
        if self.broker.request_capacity == 0 {
            return Err(Error::Config("`broker.request_capacity` must be positive".into()));
        }

        Ok(())
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Keep-alive interval (seconds)
    pub keep_alive_secs: u64,
    /// Delay between reconnect attempts while disconnected (seconds)
    pub reconnect_interval_secs: u64,
    /// Upper bound on one blocking network poll (milliseconds)
    pub poll_interval_ms: u64,
    /// Requests the transport accepts before it pushes back
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.losant.com".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            reconnect_interval_secs: 5,
            poll_interval_ms: 1000,
            request_capacity: 10,
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Guest bundle execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Agent protocol version reported in the hello message
    pub version: String,
    /// Guest trace verbosity: 0 = none, 1 = errors, 2 = verbose
    pub trace_level: i32,
    /// Use the memory exported by the bundle instead of importing one
    pub export_memory: bool,
    /// Initial size of the imported guest memory (64 KiB pages)
    pub memory_pages: u32,
    /// Fuel budget for a single guest call, unlimited when unset
    pub max_fuel_per_call: Option<u64>,
    /// Period between two pump calls (milliseconds)
    pub pump_interval_ms: u64,
    /// Maximum size of the guest's persisted storage (bytes)
    pub storage_size: i32,
    /// Interval at which the guest persists storage (milliseconds)
    pub storage_interval_ms: i32,
    /// Where the last received bundle is kept
    pub bundle_path: PathBuf,
    /// Where the guest's storage blob is kept
    pub storage_path: PathBuf,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            trace_level: 2,
            export_memory: false,
            memory_pages: 5,
            max_fuel_per_call: None,
            pump_interval_ms: 100,
            storage_size: 32768,
            storage_interval_ms: 30000,
            bundle_path: PathBuf::from("./data/bundle.wasm"),
            storage_path: PathBuf::from("./data/storage.json"),
        }
    }
}

impl GuestConfig {
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

/// Serial line sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Device path the readings are streamed from
    pub path: PathBuf,
    /// Back-off after a failed read or parse (milliseconds)
    #[serde(default = "default_sensor_retry_ms")]
    pub retry_ms: u64,
}

fn default_sensor_retry_ms() -> u64 {
    1000
}
