use crate::pulse::PulseTimer;
use thiserror::Error;

/// Full-scale value of the PWM compare register the actuator maps onto.
pub const DUTY_FULL_SCALE: u16 = u16::MAX;

/// Errors raised by the actuator driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuatorFault {
    #[error("PWM carrier {carrier_hz}Hz rejected by driver")]
    UnsupportedCarrier { carrier_hz: u32 },

    #[error("Duty write of {duty_pct:.1}% failed: {reason}")]
    WriteFailed { duty_pct: f32, reason: String },

    #[error("Actuator already released")]
    Released,
}

/// Errors raised by the pulse sensor driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorFault {
    #[error("Edge handler already registered")]
    AlreadyAttached,

    #[error("Edge interrupt setup failed: {0}")]
    InterruptSetup(String),
}

/// PWM actuator driving the rotating load.
pub trait Actuator: Send {
    fn configure(&mut self, carrier_hz: u32) -> Result<(), ActuatorFault>;
    fn set_duty_percent(&mut self, duty_pct: f32) -> Result<(), ActuatorFault>;
    /// Zero duty and release the underlying PWM channel.
    fn stop(&mut self) -> Result<(), ActuatorFault>;
}

/// Pulse sensor delivering one call per qualifying falling edge.
///
/// The registered handler runs in interrupt context: it must complete before
/// the next edge, and it must not block or allocate.
pub trait EdgeSensor {
    fn on_falling_edge(&mut self, handler: PulseTimer) -> Result<(), SensorFault>;
    fn detach(&mut self);
}

/// Segment-level multiplexed display.
///
/// Positions are enabled one at a time by the refresher; the driver owns
/// pin polarity (common cathode vs. common anode).
pub trait SegmentDisplay: Send {
    fn positions(&self) -> usize;
    /// Drive segment lines; bit 0..6 = a..g, bit 7 = decimal point.
    fn set_segments(&mut self, pattern: u8);
    fn enable_position(&mut self, position: usize);
    fn disable_position(&mut self, position: usize);
    /// All positions off, all segment lines low.
    fn blank(&mut self);
    fn release(&mut self);
}

/// Map a duty percentage onto the full compare-register range.
pub fn duty_to_register(duty_pct: f32) -> u16 {
    if !duty_pct.is_finite() {
        return 0;
    }
    let clamped = duty_pct.clamp(0.0, 100.0);
    ((clamped / 100.0) * DUTY_FULL_SCALE as f32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_maps_linearly() {
        assert_eq!(duty_to_register(0.0), 0);
        assert_eq!(duty_to_register(100.0), u16::MAX);
        assert_eq!(duty_to_register(50.0), 32767);
    }

    #[test]
    fn duty_out_of_range_is_clamped() {
        assert_eq!(duty_to_register(-3.0), 0);
        assert_eq!(duty_to_register(140.0), u16::MAX);
        assert_eq!(duty_to_register(f32::NAN), 0);
    }
}
