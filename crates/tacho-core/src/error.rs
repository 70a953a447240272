use crate::hal::{ActuatorFault, SensorFault};
use crate::phase::PhaseTransitionError;
use thiserror::Error;

/// Fatal controller errors. Each one ends the session through the
/// forced-zero teardown; none of them leaves the actuator driven.
///
/// Edge noise never shows up here (it is filtered inside the estimator),
/// and neither does an exhausted seek budget, which only logs a warning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("Calibration saw no rotation at full duty (max {max_hz}Hz)")]
    CalibrationFailure { max_hz: f32 },

    #[error("Actuator fault: {0}")]
    Actuator(#[from] ActuatorFault),

    #[error("Sensor fault: {0}")]
    Sensor(#[from] SensorFault),

    #[error(transparent)]
    Transition(#[from] PhaseTransitionError),
}
