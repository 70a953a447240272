//! Tiered proportional correction used while holding the target speed.

use serde::{Deserialize, Serialize};

pub const MIN_DUTY_PCT: f32 = 1.0;
pub const MAX_DUTY_PCT: f32 = 100.0;

/// Gain schedule for the hold phase, in duty percent per Hz of error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldGains {
    /// Errors beyond `large_error_factor * tolerance` use `large_gain`.
    pub large_error_factor: f32,
    pub large_gain: f32,
    /// Errors beyond the tolerance use `medium_gain`.
    pub medium_gain: f32,
    pub small_gain: f32,
    /// Scale applied when the error sign flipped since the last adjustment.
    pub sign_flip_damping: f32,
    /// Duty changes at or below this are not written to the actuator.
    pub deadband_pct: f32,
}

impl Default for HoldGains {
    fn default() -> Self {
        Self {
            large_error_factor: 3.0,
            large_gain: 0.05,
            medium_gain: 0.025,
            small_gain: 0.01,
            sign_flip_damping: 0.75,
            deadband_pct: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    /// Duty delta before damping.
    pub undamped_pct: f32,
    /// Duty delta to apply.
    pub pct: f32,
    pub damped: bool,
}

impl HoldGains {
    pub fn gain_for(&self, error_hz: f32, tolerance_hz: f32) -> f32 {
        let magnitude = error_hz.abs();
        if magnitude > tolerance_hz * self.large_error_factor {
            self.large_gain
        } else if magnitude > tolerance_hz {
            self.medium_gain
        } else {
            self.small_gain
        }
    }

    /// Duty delta for `error_hz = target - measured`.
    pub fn adjustment(
        &self,
        error_hz: f32,
        tolerance_hz: f32,
        previous_error_hz: Option<f32>,
    ) -> Adjustment {
        let undamped_pct = self.gain_for(error_hz, tolerance_hz) * error_hz;
        let damped = previous_error_hz.is_some_and(|prev| sign_flipped(prev, error_hz));
        let pct = if damped {
            undamped_pct * self.sign_flip_damping
        } else {
            undamped_pct
        };
        Adjustment {
            undamped_pct,
            pct,
            damped,
        }
    }

    /// New clamped duty, or `None` when the change falls inside the deadband.
    pub fn next_duty(&self, current_pct: f32, adjustment: &Adjustment) -> Option<f32> {
        let next = clamp_duty(current_pct + adjustment.pct);
        if (next - current_pct).abs() > self.deadband_pct {
            Some(next)
        } else {
            None
        }
    }
}

fn sign_flipped(previous: f32, current: f32) -> bool {
    (previous > 0.0 && current < 0.0) || (previous < 0.0 && current > 0.0)
}

/// Clamp into the running range; 0% is reserved for stopping.
pub fn clamp_duty(duty_pct: f32) -> f32 {
    duty_pct.clamp(MIN_DUTY_PCT, MAX_DUTY_PCT)
}
