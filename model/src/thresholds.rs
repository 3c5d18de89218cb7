use core::sync::atomic::Ordering;

use serde::Deserialize;

/// The temperature band sent to the microcontroller and used to judge the latest sample.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub min: f32,
    pub max: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min: 20.0,
            max: 28.0,
        }
    }
}

impl Thresholds {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Classify a temperature against the band. Both bounds are inclusive.
    pub fn classify(&self, temperature: f32) -> Status {
        if self.min <= temperature && temperature <= self.max {
            Status::Optimal
        } else {
            Status::OutOfRange
        }
    }

    /// The command line understood by the microcontroller, `"<min>,<max>\n"`.
    ///
    /// Values use the shortest representation that round-trips, so whole numbers
    /// carry no fractional part: `20,28` rather than `20.0,28.0`.
    pub fn to_command(&self) -> String {
        format!("{},{}\n", self.min, self.max)
    }
}

/// Result of [`Thresholds::classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Optimal,
    OutOfRange,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Optimal => write!(f, "OPTIMAL"),
            Status::OutOfRange => write!(f, "OUT OF RANGE"),
        }
    }
}

/// Thresholds that can be read from the acquisition thread while the foreground
/// updates them, without taking a lock.
///
/// `min` and `max` are stored separately, so a reader racing a [`store`](Self::store)
/// may see one old and one new bound for a single sample.
#[derive(Debug)]
pub struct SharedThresholds {
    min: portable_atomic::AtomicF32,
    max: portable_atomic::AtomicF32,
}

impl SharedThresholds {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            min: portable_atomic::AtomicF32::new(thresholds.min),
            max: portable_atomic::AtomicF32::new(thresholds.max),
        }
    }

    pub fn load(&self) -> Thresholds {
        Thresholds {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self, thresholds: Thresholds) {
        self.min.store(thresholds.min, Ordering::Relaxed);
        self.max.store(thresholds.max, Ordering::Relaxed);
    }
}

impl Default for SharedThresholds {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

#[test]
fn test_classify_is_inclusive() {
    let thresholds = Thresholds::new(20.0, 28.0);

    assert_eq!(thresholds.classify(20.0), Status::Optimal);
    assert_eq!(thresholds.classify(24.3), Status::Optimal);
    assert_eq!(thresholds.classify(28.0), Status::Optimal);
    assert_eq!(thresholds.classify(19.99), Status::OutOfRange);
    assert_eq!(thresholds.classify(28.01), Status::OutOfRange);
    assert_eq!(thresholds.classify(f32::NAN), Status::OutOfRange);
}

#[test]
fn test_command_formatting() {
    assert_eq!(Thresholds::new(20.0, 28.0).to_command(), "20,28\n");
    assert_eq!(Thresholds::new(20.5, -3.25).to_command(), "20.5,-3.25\n");
}

#[test]
fn test_shared_thresholds() {
    let shared = SharedThresholds::default();
    assert_eq!(shared.load(), Thresholds::new(20.0, 28.0));

    shared.store(Thresholds::new(18.0, 25.5));
    assert_eq!(shared.load(), Thresholds::new(18.0, 25.5));
}
