pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod estimator;
mod estimator_proptest;
pub mod feedback;
pub mod hal;
#[cfg(feature = "simulation")]
pub mod hal_sim;
pub mod phase;
pub mod pulse;
pub mod session;
pub mod sync;
pub mod timebase;

pub use config::{ControlConfig, RefreshConfig, SessionConfig};
pub use controller::SpeedController;
pub use diagnostics::SweepReport;
pub use display::{DisplayCell, DisplayGuard, DisplayRefresher, DisplayValue};
pub use error::ControlError;
pub use estimator::{EstimatorConfig, FrequencyEstimator};
pub use feedback::HoldGains;
pub use hal::{Actuator, ActuatorFault, EdgeSensor, SegmentDisplay, SensorFault};
pub use phase::{ControlPhase, ControlSession, HoldSummary};
pub use pulse::{FrequencyCell, FrequencySource, PulseTimer};
pub use session::{
    ActuatorGuard, Orchestrator, SessionError, SessionMode, SessionOutcome, SessionReport,
};
pub use sync::{ControlSnapshot, SnapshotExchange, StopSignal};
pub use timebase::TimeBase;
