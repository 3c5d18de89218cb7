use std::path::PathBuf;

use anyhow::{bail, Context};

use rbp_sensor_common::SensorConfig;

pub const USAGE: &str = "\
Usage: rbp-sensor [OPTIONS]

Options:
  --list-ports       List available serial ports and exit
  --port <PORT>      Serial port of the sensor board
  --baud <RATE>      Baud rate
  --store <PATH>     CSV file samples are logged to
  --config <PATH>    JSON configuration file
  --demo             Use a simulated sensor board instead of a serial port
  -h, --help         Show this help";

/// Command line options. Anything given here overrides the configuration file.
#[derive(Debug, Default, PartialEq)]
pub struct Options {
    pub list_ports: bool,
    pub demo: bool,
    pub help: bool,
    pub config_path: Option<PathBuf>,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub store_path: Option<PathBuf>,
}

impl Options {
    /// Parse the arguments, without the program name.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--list-ports" => options.list_ports = true,
                "--demo" => options.demo = true,
                "-h" | "--help" => options.help = true,
                "--config" => options.config_path = Some(value(&mut args, &arg)?.into()),
                "--port" => options.port = Some(value(&mut args, &arg)?),
                "--store" => options.store_path = Some(value(&mut args, &arg)?.into()),
                "--baud" => {
                    let rate = value(&mut args, &arg)?;
                    let rate = rate
                        .parse()
                        .with_context(|| format!("Invalid baud rate {rate:?}"))?;
                    options.baud_rate = Some(rate);
                }
                other => bail!("Unknown argument {other:?}, see --help"),
            }
        }

        Ok(options)
    }

    /// Load the configuration file (`--config`, else the per-user one if it exists, else
    /// defaults) and apply the overrides.
    pub fn load_config(&self) -> anyhow::Result<SensorConfig> {
        let path = self
            .config_path
            .clone()
            .or_else(|| default_config_path().filter(|path| path.exists()));

        let mut config = match path {
            Some(path) => SensorConfig::from_json_file(&path)?,
            None => SensorConfig::default(),
        };

        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        if let Some(baud_rate) = self.baud_rate {
            config.baud_rate = baud_rate;
        }
        if let Some(store_path) = &self.store_path {
            config.store_path = store_path.clone();
        }

        Ok(config)
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next().with_context(|| format!("{flag} needs a value"))
}

/// `config.json` in the platform's per-user configuration directory.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "rbp-sensor")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

#[cfg(test)]
fn args(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

#[test]
fn test_parse_options() {
    let options = Options::parse(args("--port /dev/ttyACM0 --baud 115200 --store out.csv --demo")).unwrap();

    assert_eq!(
        options,
        Options {
            demo: true,
            port: Some("/dev/ttyACM0".into()),
            baud_rate: Some(115200),
            store_path: Some("out.csv".into()),
            ..Options::default()
        }
    );
}

#[test]
fn test_parse_rejects_bad_arguments() {
    assert!(Options::parse(args("--baud fast")).is_err());
    assert!(Options::parse(args("--port")).is_err());
    assert!(Options::parse(args("--verbose")).is_err());
}

#[test]
fn test_overrides_apply_to_config_file() {
    let path = std::env::temp_dir().join(format!("rbp-sensor-options-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "port": "COM7", "baud_rate": 19200 }"#).unwrap();

    let mut options = Options::parse(args("--baud 57600")).unwrap();
    options.config_path = Some(path.clone());
    let config = options.load_config();
    std::fs::remove_file(&path).unwrap();

    let config = config.unwrap();
    assert_eq!(config.port, "COM7");
    assert_eq!(config.baud_rate, 57600);
    assert_eq!(config.store_path, SensorConfig::default().store_path);
}
