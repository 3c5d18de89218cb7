//! Serial acquisition core for the RBP temperature/humidity sensor.
//!
//! An [`Acquisition`] owns the serial connection on one background thread, turns each
//! line into a [`Sample`](rbp_sensor_model::Sample), appends it to the record store via
//! the [`SampleLogger`] and hands it to a [`SampleSubscriber`]. The [`CommandSender`]
//! pushes threshold updates back to the microcontroller, reusing the loop's connection
//! when there is one.

mod acquisition;
mod command;
mod config;
mod error;
pub mod logger;
pub mod serial;
mod stats;

pub use acquisition::{Acquisition, SampleSubscriber, StartOutcome, StopHandle};
pub use command::CommandSender;
pub use config::SensorConfig;
pub use error::SensorError;
pub use logger::SampleLogger;
pub use stats::AcquisitionStats;

/// Lock a mutex, recovering the data if a previous holder panicked. Everything guarded
/// here stays consistent across a panic.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
