use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::{Connector, SerialLink, SerialLinkPointer};

/// Opens real serial ports through the `serialport` crate. 8N1, no flow control.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialportConnector;

impl Connector for SerialportConnector {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> std::io::Result<SerialLinkPointer> {
        // On Windows, COM ports >= 10 need the \\.\COMxx format
        #[cfg(target_os = "windows")]
        let port = if port.starts_with("COM") && !port.starts_with(r"\\") {
            format!(r"\\.\{}", port)
        } else {
            port.to_string()
        };

        let port = serialport::new(port, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        log::debug!(
            "Opened {} at {} baud",
            port.name().unwrap_or_default(),
            baud_rate
        );
        Ok(Box::new(SerialportLink(port)))
    }
}

struct SerialportLink(Box<dyn SerialPort>);

impl Read for SerialportLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialportLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl SerialLink for SerialportLink {
    fn try_clone_link(&self) -> std::io::Result<SerialLinkPointer> {
        Ok(Box::new(SerialportLink(self.0.try_clone()?)))
    }
}
