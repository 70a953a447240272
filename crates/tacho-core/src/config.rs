use crate::estimator::EstimatorConfig;
use crate::feedback::HoldGains;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

/// Tunables for the calibrate/seek/hold/ramp-down sequence.
///
/// Defaults were tuned against a small brushed DC motor with a 5-slot
/// encoder disc; treat them as starting points for other rigs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub target_hz: f32,
    pub hold_duration: Duration,
    pub pwm_carrier_hz: u32,

    pub spin_up: Duration,
    pub calibration_samples: usize,
    pub calibration_interval: Duration,
    pub calibration_settle: Duration,

    pub seek_tolerance_hz: f32,
    pub seek_max_steps: usize,
    pub seek_step_pct: f32,
    pub seek_floor_pct: f32,
    /// Seek starts this far below the calibration estimate.
    pub seek_undershoot_pct: f32,
    pub step_settle: Duration,

    /// Hold tolerance as a fraction of the target.
    pub hold_tolerance_ratio: f32,
    pub hold_sample_interval: Duration,
    pub hold_adjust_interval: Duration,
    pub hold_gains: HoldGains,

    pub ramp_step_pct: f32,

    /// Duty increment of the ramp sweep diagnostic.
    pub sweep_step_pct: f32,
    /// Dwell at full duty between the up and down ramps.
    pub sweep_top_hold: Duration,
    /// Rise between consecutive sweep steps that marks the duty where the
    /// motor starts responding.
    pub sweep_rise_threshold_hz: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            target_hz: 50.0,
            hold_duration: Duration::from_secs(60),
            pwm_carrier_hz: 60,
            spin_up: Duration::from_secs(2),
            calibration_samples: 10,
            calibration_interval: Duration::from_secs(1),
            calibration_settle: Duration::from_secs(3),
            seek_tolerance_hz: 1.0,
            seek_max_steps: 50,
            seek_step_pct: 1.0,
            seek_floor_pct: 5.0,
            seek_undershoot_pct: 10.0,
            step_settle: Duration::from_millis(200),
            hold_tolerance_ratio: 0.02,
            hold_sample_interval: Duration::from_millis(100),
            hold_adjust_interval: Duration::from_millis(500),
            hold_gains: HoldGains::default(),
            ramp_step_pct: 1.0,
            sweep_step_pct: 5.0,
            sweep_top_hold: Duration::ZERO,
            sweep_rise_threshold_hz: 5.0,
        }
    }
}

impl ControlConfig {
    pub fn hold_tolerance_hz(&self) -> f32 {
        self.target_hz * self.hold_tolerance_ratio
    }
}

/// Timing of the multiplexed display refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub on_time: Duration,
    pub blank_time: Duration,
    /// Pause between the two blanking passes at teardown.
    pub teardown_pause: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            on_time: Duration::from_millis(2),
            blank_time: Duration::from_micros(500),
            teardown_pause: Duration::from_millis(1),
        }
    }
}

/// Everything a session needs besides the hardware handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub slots_per_revolution: NonZeroU32,
    pub estimator: EstimatorConfig,
    pub control: ControlConfig,
    pub refresh: RefreshConfig,
    /// Period of the task copying the frequency reading to the display.
    pub monitor_interval: Duration,
    /// No edge for this long reads as a stopped shaft.
    pub stall_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slots_per_revolution: NonZeroU32::MIN.saturating_add(4),
            estimator: EstimatorConfig::default(),
            control: ControlConfig::default(),
            refresh: RefreshConfig::default(),
            monitor_interval: Duration::from_millis(300),
            stall_timeout: Duration::from_secs(2),
        }
    }
}
