//! The boundary between the acquisition core and the serial device.

mod loopback;
mod serialport_link;

pub use loopback::LoopbackConnector;
pub use serialport_link::SerialportConnector;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// An open, bidirectional byte stream to the microcontroller.
///
/// Reads must return [`std::io::ErrorKind::TimedOut`] once the timeout the link was
/// opened with has elapsed without data.
pub trait SerialLink: Read + Write + Send {
    /// Open a second handle to the same connection, so one side can read while the
    /// other writes.
    fn try_clone_link(&self) -> std::io::Result<SerialLinkPointer>;
}

pub type SerialLinkPointer = Box<dyn SerialLink>;

/// Opens serial links.
///
/// To be implemented for each kind of transport.
pub trait Connector: Send + Sync {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> std::io::Result<SerialLinkPointer>;
}

pub type ConnectorSharedPointer = Arc<dyn Connector>;
