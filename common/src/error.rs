use std::path::PathBuf;

/// Errors surfaced by the acquisition core.
///
/// Only failures a caller can act on are represented here. Malformed frames, recovered
/// read errors and misbehaving subscribers are handled inside the acquisition loop and
/// only show up in the log and in [`AcquisitionStats`](crate::AcquisitionStats).
#[derive(Debug)]
pub enum SensorError {
    /// The serial port could not be opened.
    ConnectionOpen {
        port: String,
        source: std::io::Error,
    },
    /// A threshold command could not be written to the device.
    CommandSend(std::io::Error),
    /// The configuration file could not be read or parsed.
    Config {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Any other I/O failure outside the acquisition loop.
    Io(std::io::Error),
}

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorError::ConnectionOpen { port, source } => {
                write!(f, "could not open serial port {port}: {source}")
            }
            SensorError::CommandSend(source) => {
                write!(f, "could not send command to the device: {source}")
            }
            SensorError::Config { path, source } => {
                write!(f, "invalid configuration {}: {source}", path.display())
            }
            SensorError::Io(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for SensorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SensorError::ConnectionOpen { source, .. } => Some(source),
            SensorError::CommandSend(source) => Some(source),
            SensorError::Config { source, .. } => Some(source.as_ref()),
            SensorError::Io(source) => Some(source),
        }
    }
}

#[test]
fn test_error_display() {
    let error = SensorError::ConnectionOpen {
        port: "COM3".into(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
    };

    assert_eq!(error.to_string(), "could not open serial port COM3: no such device");
    assert!(std::error::Error::source(&error).is_some());
}
