use std::io::{BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use rbp_sensor_model::{parse_frame, Sample};

use crate::command::CommandSender;
use crate::serial::{ConnectorSharedPointer, SerialLinkPointer};
use crate::stats::{AcquisitionStats, Counters};
use crate::{lock, SampleLogger, SensorConfig, SensorError};

/// Receives every accepted sample, in wire order, on the acquisition thread.
///
/// Implementations must return quickly. A panic is caught and counted, it never stops
/// acquisition.
pub trait SampleSubscriber: Send {
    fn on_sample(&mut self, sample: &Sample);
}

impl<F> SampleSubscriber for F
where
    F: FnMut(&Sample) + Send,
{
    fn on_sample(&mut self, sample: &Sample) {
        self(sample)
    }
}

/// The writable handle of the connection owned by the acquisition loop, if it is open.
pub(crate) type ConnectionSlot = Arc<Mutex<Option<SerialLinkPointer>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// An acquisition thread already exists. Nothing was opened or spawned.
    AlreadyRunning,
}

/// Longest line kept while waiting for its newline. Anything longer is discarded up to
/// the next newline and counted as one malformed frame.
const MAX_LINE_BYTES: usize = 4 * 1024;

/// Where the acquisition thread is in its life.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    /// No thread exists.
    #[default]
    Idle,
    Opening,
    Reading,
    /// `stop` was called, the thread exits within one read timeout.
    Stopping,
}

#[derive(Default)]
struct Shared {
    phase: Mutex<Phase>,
    /// Notified whenever `phase` returns to `Idle`.
    idle: Condvar,
    /// Keep reading. Cleared by `stop`.
    running: AtomicBool,
    connection: ConnectionSlot,
    counters: Counters,
}

/// Reads frames from the serial device on a background thread and hands the samples to
/// the [`SampleLogger`] and a [`SampleSubscriber`].
pub struct Acquisition {
    config: Arc<SensorConfig>,
    connector: ConnectorSharedPointer,
    logger: Arc<SampleLogger>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Acquisition {
    pub fn new(config: SensorConfig, connector: ConnectorSharedPointer, logger: Arc<SampleLogger>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            logger,
            shared: Arc::default(),
            worker: Mutex::new(None),
        }
    }

    /// Open the configured port on a new background thread and start reading.
    ///
    /// Blocks only until the port has been opened. If it cannot be opened the thread
    /// exits and [`SensorError::ConnectionOpen`] is returned; acquisition can be started
    /// again later. Calling this while the loop is opening or reading does nothing. A
    /// thread still winding down after [`stop`](Self::stop) is waited for first.
    pub fn start<S>(&self, subscriber: S) -> Result<StartOutcome, SensorError>
    where
        S: SampleSubscriber + 'static,
    {
        {
            let mut phase = lock(&self.shared.phase);
            loop {
                match *phase {
                    Phase::Idle => break,
                    Phase::Stopping => {
                        log::debug!("Waiting for the previous acquisition thread to exit");
                        phase = self.shared.idle.wait(phase).unwrap_or_else(PoisonError::into_inner);
                    }
                    Phase::Opening | Phase::Reading => {
                        log::debug!("Acquisition already running, ignoring start");
                        return Ok(StartOutcome::AlreadyRunning);
                    }
                }
            }
            *phase = Phase::Opening;
        }

        // A previous thread has exited by now, its handle only needs collecting.
        if let Some(previous) = lock(&self.worker).take() {
            let _ = previous.join();
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let worker = Worker {
            config: self.config.clone(),
            connector: self.connector.clone(),
            logger: self.logger.clone(),
            shared: self.shared.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || worker.run(subscriber, ready_tx));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.set_idle();
                return Err(SensorError::Io(e));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *lock(&self.worker) = Some(handle);
                Ok(StartOutcome::Started)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SensorError::Io(std::io::Error::other(
                    "acquisition thread exited before opening the port",
                )))
            }
        }
    }

    /// Ask the acquisition thread to finish its current cycle and exit.
    ///
    /// Returns at once. The thread notices within one read timeout; use
    /// [`StopHandle::join`] to wait until it has released the connection.
    pub fn stop(&self) -> StopHandle {
        {
            let mut phase = lock(&self.shared.phase);
            if matches!(*phase, Phase::Opening | Phase::Reading) {
                log::info!("Stopping acquisition");
                *phase = Phase::Stopping;
            }
            self.shared.running.store(false, Ordering::SeqCst);
        }
        StopHandle {
            handle: lock(&self.worker).take(),
        }
    }

    /// Whether the read cycle is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the acquisition thread exists, including while it opens the port or
    /// winds down after [`stop`](Self::stop).
    pub fn is_active(&self) -> bool {
        *lock(&self.shared.phase) != Phase::Idle
    }

    /// Whether the acquisition loop currently holds an open connection.
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.connection).is_some()
    }

    pub fn logger(&self) -> &Arc<SampleLogger> {
        &self.logger
    }

    /// A sender that writes through this loop's connection while it is open.
    pub fn command_sender(&self) -> CommandSender {
        CommandSender::with_connection(&self.config, self.connector.clone(), self.shared.connection.clone())
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        // Detach the thread, it exits on its own.
        let _ = self.stop();
    }
}

/// Returned by [`Acquisition::stop`].
#[must_use = "dropping the handle does not wait for the acquisition thread"]
pub struct StopHandle {
    handle: Option<JoinHandle<()>>,
}

impl StopHandle {
    /// Wait until the acquisition thread has exited and closed its connection.
    pub fn join(self) {
        if let Some(handle) = self.handle {
            if handle.join().is_err() {
                log::error!("Acquisition thread panicked");
            }
        }
    }
}

/// Leaves the shared state idle however the thread exits.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.0.connection).take();
        self.0.set_idle();
    }
}

impl Shared {
    fn set_idle(&self) {
        let mut phase = lock(&self.phase);
        self.running.store(false, Ordering::SeqCst);
        *phase = Phase::Idle;
        self.idle.notify_all();
    }
}

/// The bytes of the line being received, kept across read timeouts.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
    /// The current line passed [`MAX_LINE_BYTES`] and is dropped when it ends.
    overflowed: bool,
}

impl LineBuffer {
    fn clear(&mut self) {
        self.bytes.clear();
        self.overflowed = false;
    }
}

struct Worker {
    config: Arc<SensorConfig>,
    connector: ConnectorSharedPointer,
    logger: Arc<SampleLogger>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run<S: SampleSubscriber>(self, mut subscriber: S, ready: SyncSender<Result<(), SensorError>>) {
        let _active = ActiveGuard(self.shared.clone());

        let link = match self.connect() {
            Ok(link) => link,
            Err(e) => {
                log::error!("{e}");
                let _ = ready.send(Err(e));
                return;
            }
        };

        {
            let mut phase = lock(&self.shared.phase);
            // A `stop` that raced the open leaves `running` cleared.
            if *phase == Phase::Opening {
                *phase = Phase::Reading;
                self.shared.running.store(true, Ordering::SeqCst);
            }
        }
        log::info!(
            "Acquisition started on {} at {} baud",
            self.config.port,
            self.config.baud_rate
        );
        let _ = ready.send(Ok(()));

        if let Err(e) = self.logger.ensure_store_initialized() {
            log::warn!("Could not create record store {}: {e}", self.logger.path().display());
            Counters::bump(&self.shared.counters.store_failures);
        }

        let mut reader = BufReader::new(link);
        let mut line = LineBuffer::default();
        while self.shared.running.load(Ordering::SeqCst) {
            self.cycle(&mut reader, &mut line, &mut subscriber);
        }

        log::info!("Acquisition stopped");
    }

    /// Open the port and publish its write half. The slot stays locked meanwhile, so a
    /// transient command connection is never open at the same time.
    fn connect(&self) -> Result<SerialLinkPointer, SensorError> {
        let mut slot = lock(&self.shared.connection);

        let open_error = |source: std::io::Error| SensorError::ConnectionOpen {
            port: self.config.port.clone(),
            source,
        };
        let link = self
            .connector
            .open(&self.config.port, self.config.baud_rate, self.config.read_timeout())
            .map_err(open_error)?;
        let writer = link.try_clone_link().map_err(open_error)?;

        *slot = Some(writer);
        Ok(link)
    }

    fn cycle<S: SampleSubscriber>(
        &self,
        reader: &mut BufReader<SerialLinkPointer>,
        line: &mut LineBuffer,
        subscriber: &mut S,
    ) {
        let limit = (MAX_LINE_BYTES - line.bytes.len()) as u64;
        match reader.by_ref().take(limit).read_until(b'\n', &mut line.bytes) {
            Ok(_) if line.bytes.ends_with(b"\n") => self.finish_line(line, subscriber),
            Ok(_) if line.bytes.len() >= MAX_LINE_BYTES => {
                if !line.overflowed {
                    log::warn!("Dropped a line longer than {MAX_LINE_BYTES} bytes");
                    Counters::bump(&self.shared.counters.malformed_frames);
                    line.overflowed = true;
                }
                line.bytes.clear();
            }
            // Whatever was left when the stream ended.
            Ok(0) if !line.bytes.is_empty() => self.finish_line(line, subscriber),
            Ok(_) => {}
            // No data this cycle. A partial line stays buffered until its newline arrives.
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => {
                log::warn!("Serial read failed: {e}");
                Counters::bump(&self.shared.counters.io_errors);
                std::thread::sleep(self.config.io_backoff());
            }
        }
    }

    fn finish_line<S: SampleSubscriber>(&self, line: &mut LineBuffer, subscriber: &mut S) {
        if !line.overflowed {
            self.handle_line(&line.bytes, subscriber);
        }
        line.clear();
    }

    fn handle_line<S: SampleSubscriber>(&self, line: &[u8], subscriber: &mut S) {
        // Bytes that are not valid UTF-8, like the noise after a board reset, are dropped.
        let text: String = line.utf8_chunks().map(|chunk| chunk.valid()).collect();

        let Some(sample) = parse_frame(&text) else {
            if !text.trim().is_empty() {
                log::trace!("Dropped malformed frame {:?}", text.trim());
                Counters::bump(&self.shared.counters.malformed_frames);
            }
            return;
        };

        Counters::bump(&self.shared.counters.samples);

        match self.logger.append(&sample) {
            Ok(true) => Counters::bump(&self.shared.counters.rows_written),
            Ok(false) => {}
            Err(e) => {
                log::warn!("Could not append to {}: {e}", self.logger.path().display());
                Counters::bump(&self.shared.counters.store_failures);
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_sample(&sample))).is_err() {
            log::error!("Sample subscriber panicked, sample dropped");
            Counters::bump(&self.shared.counters.subscriber_failures);
        }
    }
}

#[cfg(test)]
fn test_config() -> SensorConfig {
    SensorConfig {
        port: "loop".into(),
        read_timeout_ms: 10,
        io_backoff_ms: 5,
        command_delay_ms: 0,
        command_open_timeout_ms: 10,
        ..SensorConfig::default()
    }
}

#[cfg(test)]
fn channel_subscriber() -> (impl SampleSubscriber, mpsc::Receiver<Sample>) {
    let (tx, rx) = mpsc::channel();
    let subscriber = move |sample: &Sample| {
        let _ = tx.send(*sample);
    };
    (subscriber, rx)
}

#[cfg(test)]
const WAIT: std::time::Duration = std::time::Duration::from_secs(5);

#[test]
fn test_end_to_end_logging() {
    use crate::serial::LoopbackConnector;

    let path = crate::logger::temp_store("end-to-end");
    let connector = LoopbackConnector::with_lines(["22.50,55.00", "bad,data", "23.10,54.20"]);
    let logger = Arc::new(SampleLogger::new(&path, 2));
    logger.set_logging(true).unwrap();

    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);
    let (subscriber, samples) = channel_subscriber();
    assert_eq!(acquisition.start(subscriber).unwrap(), StartOutcome::Started);

    let first = samples.recv_timeout(WAIT).unwrap();
    let second = samples.recv_timeout(WAIT).unwrap();
    acquisition.stop().join();

    assert_eq!((first.temperature(), first.humidity()), (22.5, 55.0));
    assert_eq!((second.temperature(), second.humidity()), (23.1, 54.2));
    assert!(samples.try_recv().is_err());

    let contents = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "timestamp,temperature,humidity");
    assert!(lines[1].ends_with(",22.50,55.00"));
    assert!(lines[2].ends_with(",23.10,54.20"));

    let stats = acquisition.stats();
    assert_eq!(stats.samples, 2);
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.rows_written, 2);
}

#[test]
fn test_start_is_idempotent() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("idempotent"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);

    let (first, _first_rx) = channel_subscriber();
    let (second, _second_rx) = channel_subscriber();
    assert_eq!(acquisition.start(first).unwrap(), StartOutcome::Started);
    assert_eq!(acquisition.start(second).unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(connector.open_count(), 1);
    assert!(acquisition.is_running());

    acquisition.stop().join();
    assert!(!acquisition.is_active());
    assert_eq!(connector.live_connections(), 0);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_open_failure_leaves_loop_startable() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    connector.set_fail_open(true);
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("open-failure"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);

    let (subscriber, _rx) = channel_subscriber();
    let result = acquisition.start(subscriber);
    assert!(matches!(result, Err(SensorError::ConnectionOpen { ref port, .. }) if port == "loop"));
    assert!(!acquisition.is_running());
    assert!(!acquisition.is_active());

    connector.set_fail_open(false);
    let (subscriber, _rx) = channel_subscriber();
    assert_eq!(acquisition.start(subscriber).unwrap(), StartOutcome::Started);
    acquisition.stop().join();
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_panicking_subscriber_does_not_stop_acquisition() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::with_lines(["1,2", "3,4"]);
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("panic"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector), logger);

    let (tx, rx) = mpsc::channel();
    let subscriber = move |sample: &Sample| {
        if sample.temperature() == 1.0 {
            panic!("subscriber failure");
        }
        let _ = tx.send(*sample);
    };
    acquisition.start(subscriber).unwrap();

    let sample = rx.recv_timeout(WAIT).unwrap();
    acquisition.stop().join();

    assert_eq!(sample.temperature(), 3.0);
    assert_eq!(acquisition.stats().subscriber_failures, 1);
    assert_eq!(acquisition.stats().samples, 2);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_partial_line_is_completed_across_reads() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("partial"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);

    let (subscriber, samples) = channel_subscriber();
    acquisition.start(subscriber).unwrap();

    connector.feed(b"24.7");
    std::thread::sleep(std::time::Duration::from_millis(50));
    connector.feed(b"5,61.0\n");

    let sample = samples.recv_timeout(WAIT).unwrap();
    acquisition.stop().join();

    assert_eq!((sample.temperature(), sample.humidity()), (24.75, 61.0));
    assert_eq!(acquisition.stats().malformed_frames, 0);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_stop_releases_connection() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("stop"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);

    let (subscriber, _rx) = channel_subscriber();
    acquisition.start(subscriber).unwrap();
    assert!(acquisition.is_connected());
    assert_eq!(connector.live_connections(), 1);

    let handle = acquisition.stop();
    assert!(!acquisition.is_running());
    handle.join();

    assert!(!acquisition.is_connected());
    assert!(!acquisition.is_active());
    assert_eq!(connector.live_connections(), 0);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_start_after_unjoined_stop_starts_again() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("restart"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector.clone()), logger);

    let (first, _first_rx) = channel_subscriber();
    acquisition.start(first).unwrap();
    let _ = acquisition.stop();

    let (second, samples) = channel_subscriber();
    assert_eq!(acquisition.start(second).unwrap(), StartOutcome::Started);
    assert!(acquisition.is_running());
    assert_eq!(connector.open_count(), 2);

    connector.feed(b"21.00,47.00\n");
    let sample = samples.recv_timeout(WAIT).unwrap();
    assert_eq!((sample.temperature(), sample.humidity()), (21.0, 47.0));

    acquisition.stop().join();
    assert_eq!(connector.live_connections(), 0);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_invalid_bytes_are_dropped_from_frames() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    connector.feed(b"\xff22.50,55.00\n");
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("invalid-bytes"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector), logger);

    let (subscriber, samples) = channel_subscriber();
    acquisition.start(subscriber).unwrap();
    let sample = samples.recv_timeout(WAIT).unwrap();
    acquisition.stop().join();

    assert_eq!((sample.temperature(), sample.humidity()), (22.5, 55.0));
    assert_eq!(acquisition.stats().malformed_frames, 0);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_read_errors_do_not_stop_acquisition() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::with_lines(["19.50,60.00"]);
    connector.set_fail_reads(3);
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("read-errors"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector), logger);

    let (subscriber, samples) = channel_subscriber();
    acquisition.start(subscriber).unwrap();
    let sample = samples.recv_timeout(WAIT).unwrap();
    assert!(acquisition.is_running());
    acquisition.stop().join();

    assert_eq!((sample.temperature(), sample.humidity()), (19.5, 60.0));
    assert_eq!(acquisition.stats().io_errors, 3);
    assert_eq!(acquisition.stats().samples, 1);
    let _ = std::fs::remove_file(acquisition.logger().path());
}

#[test]
fn test_overlong_line_is_discarded() {
    use crate::serial::LoopbackConnector;

    let connector = LoopbackConnector::new();
    connector.feed(&[b'x'; MAX_LINE_BYTES + 900]);
    connector.feed(b"\n22.00,50.00\n");
    let logger = Arc::new(SampleLogger::new(crate::logger::temp_store("overlong"), 2));
    let acquisition = Acquisition::new(test_config(), Arc::new(connector), logger);

    let (subscriber, samples) = channel_subscriber();
    acquisition.start(subscriber).unwrap();
    let sample = samples.recv_timeout(WAIT).unwrap();
    acquisition.stop().join();

    assert_eq!((sample.temperature(), sample.humidity()), (22.0, 50.0));
    assert_eq!(acquisition.stats().malformed_frames, 1);
    assert_eq!(acquisition.stats().samples, 1);
    let _ = std::fs::remove_file(acquisition.logger().path());
}
