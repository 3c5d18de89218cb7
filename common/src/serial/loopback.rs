use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Connector, SerialLink, SerialLinkPointer};
use crate::lock;

/// Upper bound for how long an idle read blocks before timing out.
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct LoopbackState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    opens: usize,
    live: usize,
    fail_open: bool,
    fail_writes: bool,
    fail_reads: usize,
}

/// An in-memory stand-in for a serial device.
///
/// Bytes passed to [`feed`](Self::feed) are what the device "sends"; everything written
/// to an open link is recorded and can be inspected with [`written`](Self::written).
/// All links opened by one connector share the same buffers, like handles to one port.
#[derive(Clone, Default)]
pub struct LoopbackConnector(Arc<Mutex<LoopbackState>>);

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose device has already sent `lines`, each terminated by `\n`.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let connector = Self::new();
        for line in lines {
            connector.feed(format!("{}\n", line.as_ref()).as_bytes());
        }
        connector
    }

    /// Queue bytes for reading.
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.0).inbound.extend(bytes);
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.0).outbound.clone()
    }

    /// All bytes written since the last call.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.0).outbound)
    }

    /// How many times [`Connector::open`] succeeded.
    pub fn open_count(&self) -> usize {
        lock(&self.0).opens
    }

    /// Connections that are still open. Clones of a link count as one connection.
    pub fn live_connections(&self) -> usize {
        lock(&self.0).live
    }

    /// Make subsequent opens fail with [`std::io::ErrorKind::NotFound`].
    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.0).fail_open = fail;
    }

    /// Make the next `count` reads fail with [`std::io::ErrorKind::BrokenPipe`].
    pub fn set_fail_reads(&self, count: usize) {
        lock(&self.0).fail_reads = count;
    }

    /// Make subsequent writes fail with [`std::io::ErrorKind::BrokenPipe`].
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.0).fail_writes = fail;
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, port: &str, _baud_rate: u32, timeout: Duration) -> std::io::Result<SerialLinkPointer> {
        let mut state = lock(&self.0);
        if state.fail_open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{port}: no such device"),
            ));
        }

        state.opens += 1;
        state.live += 1;

        Ok(Box::new(LoopbackLink {
            state: self.0.clone(),
            timeout,
            _connection: Arc::new(Connection(self.0.clone())),
        }))
    }
}

/// Closes the connection once the last link referring to it is dropped.
struct Connection(Arc<Mutex<LoopbackState>>);

impl Drop for Connection {
    fn drop(&mut self) {
        let mut state = lock(&self.0);
        state.live = state.live.saturating_sub(1);
    }
}

struct LoopbackLink {
    state: Arc<Mutex<LoopbackState>>,
    timeout: Duration,
    _connection: Arc<Connection>,
}

impl Read for LoopbackLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        {
            let mut state = lock(&self.state);
            if state.fail_reads > 0 {
                state.fail_reads -= 1;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "loopback device read error",
                ));
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }

        std::thread::sleep(self.timeout.min(IDLE_POLL));
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no data from loopback device",
        ))
    }
}

impl Write for LoopbackLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "loopback device disconnected",
            ));
        }
        state.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SerialLink for LoopbackLink {
    fn try_clone_link(&self) -> std::io::Result<SerialLinkPointer> {
        Ok(Box::new(LoopbackLink {
            state: self.state.clone(),
            timeout: self.timeout,
            _connection: self._connection.clone(),
        }))
    }
}

#[test]
fn test_loopback_round_trip() {
    let connector = LoopbackConnector::with_lines(["22.50,55.00"]);
    let mut link = connector.open("loop", 9600, Duration::from_millis(5)).unwrap();

    let mut buf = [0u8; 64];
    let n = link.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"22.50,55.00\n");

    let err = link.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    link.write_all(b"20,28\n").unwrap();
    assert_eq!(connector.written(), b"20,28\n");
}

#[test]
fn test_loopback_tracks_connections() {
    let connector = LoopbackConnector::new();
    let link = connector.open("loop", 9600, Duration::from_millis(5)).unwrap();
    let clone = link.try_clone_link().unwrap();
    assert_eq!(connector.open_count(), 1);
    assert_eq!(connector.live_connections(), 1);

    drop(link);
    assert_eq!(connector.live_connections(), 1);
    drop(clone);
    assert_eq!(connector.live_connections(), 0);

    connector.set_fail_open(true);
    let err = connector.open("loop", 9600, Duration::from_millis(5)).err().unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    assert_eq!(connector.open_count(), 1);
}

#[test]
fn test_loopback_read_failures() {
    let connector = LoopbackConnector::with_lines(["1,2"]);
    let mut link = connector.open("loop", 9600, Duration::from_millis(5)).unwrap();
    connector.set_fail_reads(2);

    let mut buf = [0u8; 16];
    for _ in 0..2 {
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }
    let n = link.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"1,2\n");
}
