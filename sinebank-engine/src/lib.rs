//! Sinebank Engine: multi-card sine generation with live input monitoring.
//!
//! Crate layout:
//! - [`registry`]    : channel addressing, per-channel config, control snapshots
//! - [`driver`]      : the `Driver` capability the engine talks to, plus its error taxonomy
//! - [`reconcile`]   : one worker pass, snapshot → hardware tasks (steppable in tests)
//! - [`engine`]      : `GenerationEngine` control surface, lifecycle and worker thread
//! - [`scope`]       : rolling acquisition windows with cached RMS/peak
//! - [`sim`]         : in-memory loopback driver
//! - `cpal_driver`   : audio-device backend (feature `realtime`)
//!
//! Hardware calls only ever happen on the worker thread, never under the control lock.

pub mod driver;
pub mod engine;
pub mod reconcile;
pub mod registry;
pub mod scope;
pub mod sim;

#[cfg(feature = "realtime")]
pub mod cpal_driver;

// Re-export the pieces most callers need.
pub use driver::{Driver, DriverError, DriverResult, ErrorClass, SampleMode, VoltageRange};
pub use engine::{EngineConfig, EngineError, EngineResult, EngineState, GenerationEngine, StartStatus};
pub use reconcile::{ReconcileSettings, Reconciler, StepReport};
pub use registry::{CardId, ChannelAddress, ChannelConfig, GenerationParameters, Topology};
pub use scope::ScopeBuffer;
pub use sim::SimDriver;

#[cfg(feature = "realtime")]
pub use cpal_driver::{default_input_rate, list_devices, CpalDriver, DeviceInfo};

pub use sinebank_core::meter::{ClipState, ClipThresholds, Measurement};
pub use sinebank_core::rate::{samples_per_cycle, AdvisorConfig, QualityThresholds, QualityTier, SampleRateAdvisor};
pub use sinebank_core::ParamError;
