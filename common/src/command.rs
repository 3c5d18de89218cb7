use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rbp_sensor_model::Thresholds;

use crate::acquisition::ConnectionSlot;
use crate::serial::{ConnectorSharedPointer, SerialLink};
use crate::{lock, SensorConfig, SensorError};

/// Sends threshold updates to the microcontroller.
///
/// While the acquisition loop holds the connection, commands are written through it.
/// Otherwise a transient connection is opened for the single command and closed again.
/// The connection slot stays locked for the whole send, so the acquisition loop cannot
/// open its own handle while a transient one exists.
#[derive(Clone)]
pub struct CommandSender {
    connector: ConnectorSharedPointer,
    port: String,
    baud_rate: u32,
    open_timeout: Duration,
    delay: Duration,
    connection: ConnectionSlot,
}

impl CommandSender {
    /// A sender that is not attached to an acquisition loop and always opens its own
    /// transient connection.
    pub fn new(config: &SensorConfig, connector: ConnectorSharedPointer) -> Self {
        Self::with_connection(config, connector, Arc::new(Mutex::new(None)))
    }

    pub(crate) fn with_connection(
        config: &SensorConfig,
        connector: ConnectorSharedPointer,
        connection: ConnectionSlot,
    ) -> Self {
        Self {
            connector,
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            open_timeout: config.command_open_timeout(),
            delay: config.command_delay(),
            connection,
        }
    }

    /// Write `"<min>,<max>\n"` to the device. No acknowledgment is awaited and failures
    /// are not retried.
    pub fn send_thresholds(&self, thresholds: Thresholds) -> Result<(), SensorError> {
        let command = thresholds.to_command();

        match self.send(command.as_bytes()) {
            Ok(()) => {
                log::info!("Sent thresholds {}..{}", thresholds.min, thresholds.max);
                Ok(())
            }
            Err(e) => {
                log::error!("Sending thresholds {}..{} failed: {e}", thresholds.min, thresholds.max);
                Err(e)
            }
        }
    }

    fn send(&self, bytes: &[u8]) -> Result<(), SensorError> {
        let mut slot = lock(&self.connection);

        if let Some(link) = slot.as_mut() {
            return self.write_command(link.as_mut(), bytes);
        }

        let mut link = self
            .connector
            .open(&self.port, self.baud_rate, self.open_timeout)
            .map_err(|source| SensorError::ConnectionOpen {
                port: self.port.clone(),
                source,
            })?;
        log::debug!("Opened transient connection to {}", self.port);

        self.write_command(link.as_mut(), bytes)
    }

    fn write_command(&self, link: &mut dyn SerialLink, bytes: &[u8]) -> Result<(), SensorError> {
        link.write_all(bytes).map_err(SensorError::CommandSend)?;
        link.flush().map_err(SensorError::CommandSend)?;

        // Give the device time to process the line.
        std::thread::sleep(self.delay);
        Ok(())
    }
}

#[cfg(test)]
fn test_config() -> SensorConfig {
    SensorConfig {
        port: "loop".into(),
        read_timeout_ms: 10,
        command_delay_ms: 0,
        command_open_timeout_ms: 10,
        ..SensorConfig::default()
    }
}

#[test]
fn test_send_over_transient_connection() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let sender = CommandSender::new(&test_config(), Arc::new(connector.clone()));

    sender.send_thresholds(Thresholds::new(20.0, 28.0)).unwrap();

    assert_eq!(connector.written(), b"20,28\n");
    assert_eq!(connector.open_count(), 1);
    assert_eq!(connector.live_connections(), 0);
}

#[test]
fn test_send_reuses_acquisition_connection() {
    use crate::serial::LoopbackConnector;
    use crate::{Acquisition, SampleLogger};

    let connector = LoopbackConnector::new();
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("command"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);
    acquisition.start(|_: &rbp_sensor_model::Sample| {}).unwrap();

    acquisition
        .command_sender()
        .send_thresholds(Thresholds::new(18.5, 26.0))
        .unwrap();

    assert_eq!(connector.written(), b"18.5,26\n");
    assert_eq!(connector.open_count(), 1);

    acquisition.stop().join();
    let _ = std::fs::remove_file(acquisition.logger().path());

    // Once the loop is gone the sender falls back to a transient connection.
    acquisition
        .command_sender()
        .send_thresholds(Thresholds::new(20.0, 28.0))
        .unwrap();
    assert_eq!(connector.written(), b"18.5,26\n20,28\n");
    assert_eq!(connector.open_count(), 2);
    assert_eq!(connector.live_connections(), 0);
}

#[test]
fn test_send_failures_are_reported() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let sender = CommandSender::new(&test_config(), Arc::new(connector.clone()));

    connector.set_fail_open(true);
    assert!(matches!(
        sender.send_thresholds(Thresholds::default()),
        Err(SensorError::ConnectionOpen { .. })
    ));

    connector.set_fail_open(false);
    connector.set_fail_writes(true);
    assert!(matches!(
        sender.send_thresholds(Thresholds::default()),
        Err(SensorError::CommandSend(_))
    ));
    assert!(connector.written().is_empty());
    assert_eq!(connector.live_connections(), 0);
}
