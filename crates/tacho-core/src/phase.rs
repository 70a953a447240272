use crate::diagnostics::SweepReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Controller phase. Progression is strictly forward; `Stopped` is terminal
/// and reachable from anywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ControlPhase {
    #[default]
    Idle,
    Calibrating,
    SeekingTarget,
    Holding,
    RampingDown,
    Stopped,
}

impl ControlPhase {
    pub fn can_transition_to(self, next: ControlPhase) -> bool {
        use ControlPhase::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Idle, Calibrating)
            | (Calibrating, SeekingTarget)
            | (SeekingTarget, Holding)
            | (Holding, RampingDown) => true,
            // Ramp sweep: characterization run goes straight to ramp-down.
            (Calibrating, RampingDown) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlPhase::Idle => "idle",
            ControlPhase::Calibrating => "calibrating",
            ControlPhase::SeekingTarget => "seeking_target",
            ControlPhase::Holding => "holding",
            ControlPhase::RampingDown => "ramping_down",
            ControlPhase::Stopped => "stopped",
        }
    }

    /// Numeric code for gauges.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ControlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutySample {
    pub duty_pct: f32,
    pub measured_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub max_hz: f32,
    pub mean_hz: f32,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeekSummary {
    pub duty_pct: f32,
    pub measured_hz: f32,
    pub steps: usize,
    /// Iteration budget ran out before the target came within tolerance.
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldSummary {
    pub mean_hz: f32,
    pub min_hz: f32,
    pub max_hz: f32,
    /// Fraction (0..1) of samples within the hold tolerance.
    pub within_tolerance: f32,
    pub samples: usize,
    pub adjustments: usize,
    pub start_duty_pct: f32,
    pub final_duty_pct: f32,
}

impl HoldSummary {
    pub fn from_readings(
        readings: &[f32],
        target_hz: f32,
        tolerance_hz: f32,
        start_duty_pct: f32,
        final_duty_pct: f32,
        adjustments: usize,
    ) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let count = readings.len() as f32;
        let mean_hz = readings.iter().sum::<f32>() / count;
        let min_hz = readings.iter().copied().fold(f32::INFINITY, f32::min);
        let max_hz = readings.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let good = readings
            .iter()
            .filter(|hz| (**hz - target_hz).abs() <= tolerance_hz)
            .count();
        Some(Self {
            mean_hz,
            min_hz,
            max_hz,
            within_tolerance: good as f32 / count,
            samples: readings.len(),
            adjustments,
            start_duty_pct,
            final_duty_pct,
        })
    }
}

/// Rejected phase change; indicates a controller bug, not a runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal phase transition {from} -> {to}")]
pub struct PhaseTransitionError {
    pub from: ControlPhase,
    pub to: ControlPhase,
}

/// Mutable state of one controller run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSession {
    pub target_hz: f32,
    pub tolerance_hz: f32,
    pub current_duty_pct: f32,
    pub max_observed_hz: f32,
    phase: ControlPhase,
    history: BTreeMap<ControlPhase, Vec<DutySample>>,
    pub calibration: Option<CalibrationSummary>,
    pub seek: Option<SeekSummary>,
    pub hold: Option<HoldSummary>,
    pub sweep: Option<SweepReport>,
}

impl ControlSession {
    pub fn new(target_hz: f32, tolerance_hz: f32) -> Self {
        Self {
            target_hz,
            tolerance_hz,
            current_duty_pct: 0.0,
            max_observed_hz: 0.0,
            phase: ControlPhase::Idle,
            history: BTreeMap::new(),
            calibration: None,
            seek: None,
            hold: None,
            sweep: None,
        }
    }

    pub fn phase(&self) -> ControlPhase {
        self.phase
    }

    pub fn enter(&mut self, next: ControlPhase) -> Result<(), PhaseTransitionError> {
        if !self.phase.can_transition_to(next) {
            return Err(PhaseTransitionError {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Terminal transition; idempotent.
    pub fn stop(&mut self) {
        self.phase = ControlPhase::Stopped;
        self.current_duty_pct = 0.0;
    }

    pub fn record(&mut self, measured_hz: f32) {
        let sample = DutySample {
            duty_pct: self.current_duty_pct,
            measured_hz,
        };
        self.history.entry(self.phase).or_default().push(sample);
    }

    pub fn history(&self, phase: ControlPhase) -> &[DutySample] {
        self.history.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }
}
