use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rbp_sensor_model::Sample;

use crate::SensorConfig;

/// Column names of the record store.
pub const HEADER: [&str; 3] = ["timestamp", "temperature", "humidity"];

/// How sample timestamps are written to the record store.
pub const TIMESTAMP_PATTERN: &str = "%Y-%m-%d %H:%M:%S";

/// Appends samples to a CSV record store while logging is enabled.
///
/// The store is only ever created or appended to. Each row is written with a freshly
/// opened handle that is closed again before [`append`](Self::append) returns.
#[derive(Debug)]
pub struct SampleLogger {
    path: PathBuf,
    decimal_places: usize,
    enabled: AtomicBool,
}

impl SampleLogger {
    /// Create a logger for `path`. Logging starts disabled and nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>, decimal_places: usize) -> Self {
        Self {
            path: path.into(),
            decimal_places,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(config.store_path.clone(), config.decimal_places)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logging_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable logging. Enabling makes sure the store exists first.
    pub fn set_logging(&self, enabled: bool) -> std::io::Result<()> {
        if enabled {
            self.ensure_store_initialized()?;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        log::info!(
            "Logging to {} {}",
            self.path.display(),
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Create the store with its header row unless it already exists.
    ///
    /// Returns whether the store was created by this call.
    pub fn ensure_store_initialized(&self) -> std::io::Result<bool> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                writeln!(file, "{}", HEADER.join(","))?;
                file.flush()?;
                log::debug!("Created record store {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Append `sample` if logging is enabled. Returns whether a row was written.
    pub fn append(&self, sample: &Sample) -> std::io::Result<bool> {
        if !self.logging_enabled() {
            return Ok(false);
        }

        // Recreates the header if the file was removed while logging.
        self.ensure_store_initialized()?;

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(self.format_row(sample).as_bytes())?;
        file.flush()?;
        Ok(true)
    }

    fn format_row(&self, sample: &Sample) -> String {
        format!(
            "{},{:.*},{:.*}\n",
            sample.timestamp().format(TIMESTAMP_PATTERN),
            self.decimal_places,
            sample.temperature(),
            self.decimal_places,
            sample.humidity()
        )
    }
}

#[cfg(test)]
pub(crate) fn temp_store(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    std::env::temp_dir().join(format!(
        "rbp-sensor-{name}-{}-{nanos}.csv",
        std::process::id()
    ))
}

#[cfg(test)]
fn sample(temperature: f32, humidity: f32) -> Sample {
    use chrono::TimeZone;

    let timestamp = chrono::Local.with_ymd_and_hms(2024, 5, 17, 9, 3, 7).unwrap();
    Sample::new(timestamp, temperature, humidity)
}

#[test]
fn test_store_initialization_is_idempotent() {
    let path = temp_store("init");
    let logger = SampleLogger::new(&path, 2);

    assert!(logger.ensure_store_initialized().unwrap());
    logger.set_logging(true).unwrap();
    logger.append(&sample(22.5, 55.0)).unwrap();
    assert!(!logger.ensure_store_initialized().unwrap());

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(
        contents,
        "timestamp,temperature,humidity\n2024-05-17 09:03:07,22.50,55.00\n"
    );
}

#[test]
fn test_existing_store_is_never_truncated() {
    let path = temp_store("existing");
    std::fs::write(&path, "timestamp,temperature,humidity\n2024-01-01 00:00:00,1.00,2.00\n").unwrap();

    let logger = SampleLogger::new(&path, 2);
    logger.set_logging(true).unwrap();
    logger.append(&sample(3.0, 4.0)).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(contents.lines().count(), 3);
    assert_eq!(contents.matches("timestamp").count(), 1);
    assert!(contents.contains("2024-01-01 00:00:00,1.00,2.00\n"));
}

#[test]
fn test_append_respects_logging_flag() {
    let path = temp_store("gating");
    let logger = SampleLogger::new(&path, 2);
    logger.ensure_store_initialized().unwrap();

    assert!(!logger.append(&sample(1.0, 10.0)).unwrap());
    logger.set_logging(true).unwrap();
    assert!(logger.append(&sample(2.0, 20.0)).unwrap());
    assert!(logger.append(&sample(3.0, 30.0)).unwrap());
    logger.set_logging(false).unwrap();
    assert!(!logger.append(&sample(4.0, 40.0)).unwrap());

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let rows: Vec<&str> = contents.lines().skip(1).collect();
    assert_eq!(
        rows,
        ["2024-05-17 09:03:07,2.00,20.00", "2024-05-17 09:03:07,3.00,30.00"]
    );
}

#[test]
fn test_disabled_logger_does_not_create_store() {
    let path = temp_store("untouched");
    let logger = SampleLogger::new(&path, 2);

    assert!(!logger.append(&sample(1.0, 1.0)).unwrap());
    assert!(!path.exists());
}

#[test]
fn test_decimal_places_and_parent_directories() {
    let dir = temp_store("nested").with_extension("");
    let path = dir.join("logs").join("samples.csv");
    let logger = SampleLogger::new(&path, 1);
    logger.set_logging(true).unwrap();
    logger.append(&sample(-3.456, 99.94)).unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    assert!(contents.ends_with("2024-05-17 09:03:07,-3.5,99.9\n"));
}
