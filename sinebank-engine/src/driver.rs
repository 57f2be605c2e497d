//! Hardware capability the engine drives.
//!
//! The engine knows nothing about a vendor API: it creates tasks, binds channels,
//! configures a sample clock, writes channel-major buffers and reads batches back.
//! Every call returns a typed [`DriverResult`] and the caller classifies failures
//! once, at the boundary, through [`DriverError::class`].

use std::time::Duration;

use thiserror::Error;

use crate::registry::CardId;

/// Output/input voltage span a channel is bound with.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VoltageRange {
    pub min: f64,
    pub max: f64,
}

impl VoltageRange {
    pub const BIPOLAR_10V: Self = Self { min: -10.0, max: 10.0 };

    /// Largest magnitude the converter can represent in this range.
    #[inline]
    pub fn full_scale(&self) -> f64 { self.min.abs().max(self.max.abs()) }
}

impl Default for VoltageRange {
    fn default() -> Self { Self::BIPOLAR_10V }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleMode {
    Continuous,
    Finite,
}

/// How a failure should be treated by whoever receives it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected input; caller's state stays as it was.
    Configuration,
    /// Per-card hardware hiccup; retry next iteration, other cards unaffected.
    Transient,
    /// The worker cannot continue; clean up and go idle.
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("operation timed out")]
    Timeout,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("task in wrong state: {0}")]
    InvalidState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("driver failure: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DriverError::Unsupported(_) => ErrorClass::Configuration,
            DriverError::Fatal(_) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    /// Read timeouts are routine while a buffer fills; they are not worth a warning.
    #[inline]
    pub fn is_timeout(&self) -> bool { matches!(self, DriverError::Timeout) }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Task-oriented analog I/O capability.
///
/// Methods take `&self`: implementations synchronize internally so a driver can be
/// shared between the engine worker and whoever inspects it. Task values are owned
/// by the caller and handed back on every call; `close` consumes them.
pub trait Driver: Send + Sync + 'static {
    type Task: Send + 'static;

    fn create_output_task(&self, card: &CardId) -> DriverResult<Self::Task>;
    fn create_input_task(&self, card: &CardId) -> DriverResult<Self::Task>;

    fn bind_output_channel(&self, task: &mut Self::Task, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()>;
    fn bind_input_channel(&self, task: &mut Self::Task, card: &CardId, index: u16, range: VoltageRange) -> DriverResult<()>;

    fn configure_clock(&self, task: &mut Self::Task, rate: f64, mode: SampleMode, samples_per_channel: usize) -> DriverResult<()>;

    /// Let the device replay the written buffer indefinitely.
    fn enable_regeneration(&self, task: &mut Self::Task) -> DriverResult<()>;

    /// One buffer per bound channel, in bind order.
    fn write(&self, task: &mut Self::Task, buffers: &[Vec<f64>]) -> DriverResult<()>;

    fn start(&self, task: &mut Self::Task) -> DriverResult<()>;
    fn stop(&self, task: &mut Self::Task) -> DriverResult<()>;
    fn close(&self, task: Self::Task) -> DriverResult<()>;

    /// Up to `count` samples per bound channel, waiting at most `timeout`.
    fn read(&self, task: &mut Self::Task, count: usize, timeout: Duration) -> DriverResult<Vec<Vec<f64>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(DriverError::Timeout.class(), ErrorClass::Transient);
        assert!(DriverError::Timeout.is_timeout());
        assert_eq!(DriverError::Device("x".into()).class(), ErrorClass::Transient);
        assert_eq!(DriverError::Unsupported("x".into()).class(), ErrorClass::Configuration);
        assert_eq!(DriverError::Fatal("x".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn full_scale_of_asymmetric_range() {
        assert_eq!(VoltageRange { min: -5.0, max: 10.0 }.full_scale(), 10.0);
        assert_eq!(VoltageRange::default().full_scale(), 10.0);
    }
}
