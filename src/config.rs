// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! TOML configuration.
//!
//! Every field has a default, an empty file is valid:
//!
//! ```toml
//! [bus]
//! device = "/dev/i2c-1"
//! address = 0x5A
//!
//! [sensor]
//! mode = 0x10
//! settle_delay_secs = 2
//!
//! [telemetry]
//! account = "my-user"
//! key = "aio_..."
//! ```

use crate::ccs811::{DEFAULT_ADDRESS, MODE_10S, MODE_1S, MODE_250MS, MODE_60S, MODE_IDLE};
use crate::controller::ControllerSettings;
use crate::runner::Cadence;
use crate::telemetry::{MqttSettings, Topics};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `telemetry.key`
pub const TELEMETRY_KEY_ENV: &str = "CCS811_TELEMETRY_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub sensor: SensorConfig,
    pub humidity: HumidityConfig,
    pub cadence: CadenceConfig,
    pub conditioning: ConditioningConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub device: String,
    pub address: u8,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            device: "/dev/i2c-1".to_string(),
            address: DEFAULT_ADDRESS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    pub mode: u8,
    pub settle_delay_secs: u64,
    pub startup_attempts: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            mode: MODE_1S,
            settle_delay_secs: 2,
            startup_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HumidityConfig {
    /// IIO device directory of the DHT22
    pub iio_device: String,
}

impl Default for HumidityConfig {
    fn default() -> Self {
        HumidityConfig {
            iio_device: "/sys/bus/iio/devices/iio:device0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CadenceConfig {
    pub interval_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        CadenceConfig {
            interval_secs: 10,
            error_backoff_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConditioningConfig {
    pub threshold_secs: u64,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        ConditioningConfig {
            threshold_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub account: String,
    pub key: String,
    pub temperature_feed: String,
    pub humidity_feed: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub publish_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            host: "io.adafruit.com".to_string(),
            port: 1883,
            client_id: "pico".to_string(),
            account: String::new(),
            key: String::new(),
            temperature_feed: "dht22.temperature".to_string(),
            humidity_feed: "dht22.humidity".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            publish_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Reads and validates the file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Config::parse(&text)?;
        if let Ok(key) = std::env::var(TELEMETRY_KEY_ENV) {
            config.telemetry.key = key;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text without validating
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if ![MODE_IDLE, MODE_1S, MODE_10S, MODE_60S, MODE_250MS].contains(&self.sensor.mode) {
            return Err(ConfigError::Invalid {
                field: "sensor.mode",
                reason: format!("{:#04x} is not a drive mode", self.sensor.mode),
            });
        }
        if self.bus.address > 0x7F {
            return Err(ConfigError::Invalid {
                field: "bus.address",
                reason: format!("{:#04x} is not a 7-bit address", self.bus.address),
            });
        }
        if self.sensor.startup_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "sensor.startup_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.telemetry.account.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "telemetry.account",
                reason: "must not be empty".to_string(),
            });
        }
        if self.telemetry.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid {
                field: "telemetry.keep_alive_secs",
                reason: "must be at least 5".to_string(),
            });
        }
        let longest_wait = self.cadence.interval_secs + self.cadence.error_backoff_secs;
        if self.telemetry.keep_alive_secs <= longest_wait {
            return Err(ConfigError::Invalid {
                field: "telemetry.keep_alive_secs",
                reason: format!(
                    "must exceed the longest wait between cycles ({}s)",
                    longest_wait
                ),
            });
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            operating_mode: self.sensor.mode,
            settle_delay: Duration::from_secs(self.sensor.settle_delay_secs),
            threshold: Duration::from_secs(self.conditioning.threshold_secs),
        }
    }

    pub fn cadence(&self) -> Cadence {
        Cadence {
            interval: Duration::from_secs(self.cadence.interval_secs),
            error_backoff: Duration::from_secs(self.cadence.error_backoff_secs),
        }
    }

    pub fn topics(&self) -> Topics {
        Topics::for_account(
            &self.telemetry.account,
            &self.telemetry.temperature_feed,
            &self.telemetry.humidity_feed,
        )
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let t = &self.telemetry;
        MqttSettings {
            host: t.host.clone(),
            port: t.port,
            client_id: t.client_id.clone(),
            username: t.account.clone(),
            password: t.key.clone(),
            keep_alive: Duration::from_secs(t.keep_alive_secs),
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            publish_timeout: Duration::from_secs(t.publish_timeout_secs),
        }
    }
}
