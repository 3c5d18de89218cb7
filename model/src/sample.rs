use chrono::{DateTime, Local};

/// A validated, timestamped reading taken from one frame of serial input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    timestamp: DateTime<Local>,
    temperature: f32,
    humidity: f32,
}

impl Sample {
    pub fn new(timestamp: DateTime<Local>, temperature: f32, humidity: f32) -> Self {
        Self {
            timestamp,
            temperature,
            humidity,
        }
    }

    /// Local time at which the frame was accepted.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Temperature in degrees Celsius.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Relative humidity in percent.
    pub fn humidity(&self) -> f32 {
        self.humidity
    }
}

/// Parse one line of serial input into a [`Sample`].
///
/// A frame is `<temperature>,<humidity>[,<ignored>...]`. Surrounding whitespace is
/// stripped from the line and from each field. Returns `None` for empty lines, lines
/// with fewer than two fields and lines whose first two fields are not numbers.
///
/// No range checks are made here: whether `-200` is a plausible temperature is for
/// the consumer to decide.
pub fn parse_frame(raw_line: &str) -> Option<Sample> {
    let line = raw_line.trim();
    if line.is_empty() {
        return None;
    }

    let mut fields = line.split(',');
    let temperature = fields.next()?.trim().parse::<f32>().ok()?;
    let humidity = fields.next()?.trim().parse::<f32>().ok()?;

    Some(Sample::new(Local::now(), temperature, humidity))
}

#[test]
fn test_parse_valid_frame() {
    let before = Local::now();
    let sample = parse_frame("22.50,55.00\r\n").unwrap();
    let after = Local::now();

    assert_eq!(sample.temperature(), 22.5);
    assert_eq!(sample.humidity(), 55.0);
    assert!(sample.timestamp() >= before);
    assert!(sample.timestamp() <= after);
}

#[test]
fn test_parse_ignores_trailing_fields() {
    let sample = parse_frame("23.1, 54.2 ,ok,42").unwrap();

    assert_eq!(sample.temperature(), 23.1);
    assert_eq!(sample.humidity(), 54.2);
}

#[test]
fn test_parse_accepts_out_of_range_readings() {
    let sample = parse_frame("-200,5000").unwrap();

    assert_eq!(sample.temperature(), -200.0);
    assert_eq!(sample.humidity(), 5000.0);
}

#[test]
fn test_parse_rejects_malformed_frames() {
    for line in ["", "   \r\n", "22.5", "22.5,", ",55", "bad,data", "22.5,hum", "t=22,h=50"] {
        assert_eq!(parse_frame(line), None, "accepted {line:?}");
    }
}
