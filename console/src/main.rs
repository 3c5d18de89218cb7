//! RBP Sensor console
//!
//! Shows the readings of the RBP temperature/humidity board live, logs them to a CSV
//! file on request and sends new temperature limits to the board.
//!
//! ## Usage
//!
//! ```bash
//! # List available serial ports
//! cargo run --bin rbp-sensor -- --list-ports
//!
//! # Connect to a specific port
//! cargo run --bin rbp-sensor -- --port /dev/ttyACM0 --baud 9600
//!
//! # Try it without hardware
//! cargo run --bin rbp-sensor -- --demo
//! ```

mod demo;
mod options;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context;

use rbp_sensor_common::serial::{ConnectorSharedPointer, LoopbackConnector, SerialportConnector};
use rbp_sensor_common::{Acquisition, SampleLogger, SensorConfig, StartOutcome};
use rbp_sensor_model::{Sample, SharedThresholds, Thresholds};

use options::Options;

/// The commands understood by the interactive shell.
#[derive(Debug, PartialEq)]
enum Command {
    Start,
    Stop,
    LogOn,
    LogOff,
    Limits(Thresholds),
    Stats,
    Status,
    Help,
    Exit,
}

/// Our App struct that holds the acquisition loop and the thresholds shown next to
/// every reading.
///
/// The thresholds are shared with the acquisition thread, which classifies each sample
/// as it arrives, so they live in an `Arc<SharedThresholds>`.
struct App {
    config: SensorConfig,
    acquisition: Acquisition,
    thresholds: Arc<SharedThresholds>,
}

impl App {
    fn new(config: SensorConfig, connector: ConnectorSharedPointer) -> Self {
        let logger = Arc::new(SampleLogger::from_config(&config));
        let thresholds = Arc::new(SharedThresholds::new(config.thresholds));
        let acquisition = Acquisition::new(config.clone(), connector, logger);

        Self {
            config,
            acquisition,
            thresholds,
        }
    }

    /// Start reading from the board. Failing to open the port is shown to the user but
    /// does not end the program: limits can still be sent, and `start` tried again.
    fn start(&self) {
        // Every sample is printed together with its status, judged against the last
        // thresholds that were sent successfully.
        let thresholds = self.thresholds.clone();
        let subscriber = move |sample: &Sample| println!("{}", render(sample, &thresholds.load()));

        match self.acquisition.start(subscriber) {
            Ok(StartOutcome::Started) => println!("Reading from {}", self.config.port),
            Ok(StartOutcome::AlreadyRunning) => println!("Already reading from {}", self.config.port),
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    /// Run the interactive shell until `exit` or the end of input.
    fn run(&self) -> anyhow::Result<()> {
        println!(
            "RBP Sensor  |  Port: {}  |  Baud: {}  |  {}",
            self.config.port,
            self.config.baud_rate,
            chrono::Local::now().format("%Y-%m-%d %H:%M")
        );
        println!("Type 'help' for commands, 'exit' to quit\n");

        self.start();

        let stdin = io::stdin();
        loop {
            print!("> ");
            io::stdout().flush()?;

            let mut input = String::new();
            if stdin.read_line(&mut input).context("Failed to read command")? == 0 {
                break;
            }

            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            match parse_command(input) {
                Ok(Command::Exit) => break,
                Ok(command) => self.execute(command),
                Err(e) => eprintln!("Error: {e}"),
            }
        }

        Ok(())
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => {
                // Wait for the thread, so the port is free once we report it stopped.
                self.acquisition.stop().join();
                println!("Stopped reading from {}", self.config.port);
            }
            Command::LogOn => match self.acquisition.logger().set_logging(true) {
                Ok(()) => println!("Logging to {}", self.acquisition.logger().path().display()),
                Err(e) => eprintln!(
                    "Error: could not create {}: {e}",
                    self.acquisition.logger().path().display()
                ),
            },
            Command::LogOff => {
                if let Err(e) = self.acquisition.logger().set_logging(false) {
                    eprintln!("Error: {e}");
                }
                println!("Logging stopped");
            }
            Command::Limits(thresholds) => {
                match self.acquisition.command_sender().send_thresholds(thresholds) {
                    Ok(()) => {
                        // Only limits the board has accepted are used to judge readings.
                        self.thresholds.store(thresholds);
                        println!("Limits sent: {}-{} °C", thresholds.min, thresholds.max);
                    }
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            Command::Stats => {
                let stats = self.acquisition.stats();
                println!("Samples:             {}", stats.samples);
                println!("Rows written:        {}", stats.rows_written);
                println!("Malformed frames:    {}", stats.malformed_frames);
                println!("Read errors:         {}", stats.io_errors);
                println!("Record store errors: {}", stats.store_failures);
                println!("Subscriber errors:   {}", stats.subscriber_failures);
            }
            Command::Status => {
                let thresholds = self.thresholds.load();
                println!("Reading:  {}", if self.acquisition.is_running() { "yes" } else { "no" });
                println!(
                    "Logging:  {}",
                    if self.acquisition.logger().logging_enabled() { "yes" } else { "no" }
                );
                println!("Limits:   {}-{} °C", thresholds.min, thresholds.max);
            }
            Command::Help => print_help(),
            Command::Exit => {}
        }
    }

    /// Stop acquisition and wait until the port has been closed.
    fn shutdown(self) {
        self.acquisition.stop().join();
        println!("Goodbye!");
    }
}

fn parse_command(input: &str) -> Result<Command, String> {
    let parts: Vec<&str> = input.split_whitespace().collect();

    match parts.as_slice() {
        ["start"] => Ok(Command::Start),
        ["stop"] => Ok(Command::Stop),
        ["log", "on"] => Ok(Command::LogOn),
        ["log", "off"] => Ok(Command::LogOff),
        ["limits", min, max] => {
            let min = min.parse::<f32>();
            let max = max.parse::<f32>();
            match (min, max) {
                (Ok(min), Ok(max)) => Ok(Command::Limits(Thresholds::new(min, max))),
                _ => Err("Enter valid values: limits <min> <max>".to_string()),
            }
        }
        ["limits", ..] => Err("Usage: limits <min> <max>".to_string()),
        ["stats"] => Ok(Command::Stats),
        ["status"] => Ok(Command::Status),
        ["help"] => Ok(Command::Help),
        ["exit"] | ["quit"] => Ok(Command::Exit),
        _ => Err(format!("Unknown command: {input}. Type 'help' for commands")),
    }
}

/// One line of live output for a sample.
fn render(sample: &Sample, thresholds: &Thresholds) -> String {
    format!(
        "[{}] Temp: {:.2} °C  Hum: {:.2} %  Status: {}",
        sample.timestamp().format("%H:%M:%S"),
        sample.temperature(),
        sample.humidity(),
        thresholds.classify(sample.temperature())
    )
}

fn print_help() {
    println!("Commands:");
    println!("  start                 Start reading from the board");
    println!("  stop                  Stop reading and close the port");
    println!("  log on | log off      Start or stop logging samples to CSV");
    println!("  limits <min> <max>    Send temperature limits to the board");
    println!("  stats                 Show acquisition counters");
    println!("  status                Show reading, logging and limits");
    println!("  help                  Show this help");
    println!("  exit                  Quit");
}

fn list_ports() {
    println!("Available serial ports:");
    match serialport::available_ports() {
        Ok(ports) => {
            if ports.is_empty() {
                println!("  (none)");
            }
            for port in ports {
                match &port.port_type {
                    serialport::SerialPortType::UsbPort(info) => println!(
                        "  {} - USB (VID: 0x{:04x}, PID: 0x{:04x}) {}",
                        port.port_name,
                        info.vid,
                        info.pid,
                        info.product.as_deref().unwrap_or_default()
                    ),
                    serialport::SerialPortType::BluetoothPort => println!("  {} - Bluetooth", port.port_name),
                    serialport::SerialPortType::PciPort => println!("  {} - PCI", port.port_name),
                    serialport::SerialPortType::Unknown => println!("  {}", port.port_name),
                }
            }
        }
        Err(e) => eprintln!("Error listing ports: {e}"),
    }
}

/// A minimal main function that initializes the App and runs it.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = Options::parse(std::env::args().skip(1))?;
    if options.help {
        println!("{}", options::USAGE);
        return Ok(());
    }
    if options.list_ports {
        list_ports();
        return Ok(());
    }

    let config = options.load_config()?;

    // Without hardware, a simulated board stands in for the serial port.
    let connector: ConnectorSharedPointer = if options.demo {
        let loopback = LoopbackConnector::new();
        demo::spawn_demo_device(loopback.clone()).context("Failed to start demo device")?;
        Arc::new(loopback)
    } else {
        Arc::new(SerialportConnector)
    };

    let app = App::new(config, connector);
    let result = app.run();
    app.shutdown();
    result
}

#[test]
fn test_parse_commands() {
    assert_eq!(parse_command("start"), Ok(Command::Start));
    assert_eq!(parse_command("log  on"), Ok(Command::LogOn));
    assert_eq!(parse_command("log off"), Ok(Command::LogOff));
    assert_eq!(
        parse_command("limits 20 28.5"),
        Ok(Command::Limits(Thresholds::new(20.0, 28.5)))
    );
    assert_eq!(parse_command("quit"), Ok(Command::Exit));

    assert!(parse_command("limits 20").is_err());
    assert!(parse_command("limits low high").is_err());
    assert!(parse_command("reboot").is_err());
}

#[test]
fn test_render_sample() {
    use chrono::TimeZone;

    let timestamp = chrono::Local.with_ymd_and_hms(2024, 5, 17, 14, 30, 5).unwrap();
    let thresholds = Thresholds::new(20.0, 28.0);

    assert_eq!(
        render(&Sample::new(timestamp, 22.5, 55.0), &thresholds),
        "[14:30:05] Temp: 22.50 °C  Hum: 55.00 %  Status: OPTIMAL"
    );
    assert_eq!(
        render(&Sample::new(timestamp, 31.25, 40.0), &thresholds),
        "[14:30:05] Temp: 31.25 °C  Hum: 40.00 %  Status: OUT OF RANGE"
    );
}

#[test]
fn test_limits_are_stored_after_successful_send() {
    let path = std::env::temp_dir().join(format!("rbp-sensor-console-{}.csv", std::process::id()));
    let connector = LoopbackConnector::new();
    let config = SensorConfig {
        store_path: path,
        command_delay_ms: 0,
        ..SensorConfig::default()
    };
    let app = App::new(config, Arc::new(connector.clone()));

    app.execute(Command::Limits(Thresholds::new(18.0, 24.0)));
    assert_eq!(app.thresholds.load(), Thresholds::new(18.0, 24.0));
    assert_eq!(connector.written(), b"18,24\n");

    connector.set_fail_open(true);
    app.execute(Command::Limits(Thresholds::new(10.0, 12.0)));
    assert_eq!(app.thresholds.load(), Thresholds::new(18.0, 24.0));
}
