use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use rbp_sensor_model::Thresholds;

use crate::SensorError;

#[cfg(target_os = "windows")]
const DEFAULT_PORT: &str = "COM3";
#[cfg(not(target_os = "windows"))]
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Settings of the acquisition core. Fixed for the lifetime of the process.
///
/// Every field has a default, so a configuration file only needs to name what it
/// changes:
///
/// ```json
/// { "port": "/dev/ttyACM0", "store_path": "greenhouse.csv" }
/// ```
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial device, e.g. `COM3` or `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound for a single line read.
    pub read_timeout_ms: u64,
    /// Path of the CSV record store.
    pub store_path: PathBuf,
    /// Digits after the decimal point for logged readings.
    pub decimal_places: usize,
    /// Pause after an unexpected I/O error in the acquisition loop.
    pub io_backoff_ms: u64,
    /// Time given to the device to process a command after it is written.
    pub command_delay_ms: u64,
    /// Timeout of the transient connection used when acquisition is not running.
    pub command_open_timeout_ms: u64,
    /// Thresholds the front-end starts with.
    pub thresholds: Thresholds,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.into(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            store_path: PathBuf::from("registros_dht11.csv"),
            decimal_places: 2,
            io_backoff_ms: 100,
            command_delay_ms: 50,
            command_open_timeout_ms: 1000,
            thresholds: Thresholds::default(),
        }
    }
}

impl SensorConfig {
    /// Load the configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SensorError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| SensorError::Config {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        let config = serde_json::from_str::<Self>(&json).map_err(|e| SensorError::Config {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        log::debug!("Loaded configuration from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn io_backoff(&self) -> Duration {
        Duration::from_millis(self.io_backoff_ms)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn command_open_timeout(&self) -> Duration {
        Duration::from_millis(self.command_open_timeout_ms)
    }
}

#[test]
fn test_partial_config_keeps_defaults() {
    let config: SensorConfig =
        serde_json::from_str(r#"{ "port": "/dev/ttyACM0", "thresholds": { "min": 18, "max": 25.5 } }"#)
            .unwrap();

    assert_eq!(config.port, "/dev/ttyACM0");
    assert_eq!(config.baud_rate, 9600);
    assert_eq!(config.read_timeout(), Duration::from_secs(1));
    assert_eq!(config.decimal_places, 2);
    assert_eq!(config.thresholds, Thresholds::new(18.0, 25.5));
}

#[test]
fn test_config_file_errors() {
    let missing = std::env::temp_dir().join(format!("rbp-sensor-missing-{}.json", std::process::id()));
    assert!(matches!(
        SensorConfig::from_json_file(&missing),
        Err(SensorError::Config { .. })
    ));

    let broken = std::env::temp_dir().join(format!("rbp-sensor-broken-{}.json", std::process::id()));
    std::fs::write(&broken, "{ \"baud_rate\": \"fast\" }").unwrap();
    let result = SensorConfig::from_json_file(&broken);
    std::fs::remove_file(&broken).unwrap();

    assert!(matches!(result, Err(SensorError::Config { .. })));
}
