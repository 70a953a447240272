//! Open-loop ramp sweep used to characterize a rig before tuning the hold.

use crate::controller::SpeedController;
use crate::error::ControlError;
use crate::hal::Actuator;
use crate::phase::{ControlPhase, DutySample};
use crate::pulse::FrequencySource;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A sweep whose up ramp spans less than this is reported as unresponsive.
pub const RESPONSIVE_RANGE_HZ: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub up: Vec<DutySample>,
    pub down: Vec<DutySample>,
    pub up_start_hz: f32,
    pub up_max_hz: f32,
    pub up_end_hz: f32,
    pub down_start_hz: f32,
    pub down_min_hz: f32,
    pub down_end_hz: f32,
    /// Last duty before the reading first jumps by more than the rise
    /// threshold in one step.
    pub response_threshold_pct: Option<f32>,
    pub responsive: bool,
}

impl SweepReport {
    pub fn from_ramps(up: Vec<DutySample>, down: Vec<DutySample>, rise_threshold_hz: f32) -> Self {
        let up_max_hz = up.iter().map(|s| s.measured_hz).fold(0.0, f32::max);
        let down_min_hz = down
            .iter()
            .map(|s| s.measured_hz)
            .reduce(f32::min)
            .unwrap_or(0.0);
        let response_threshold_pct = up
            .windows(2)
            .find(|pair| pair[1].measured_hz - pair[0].measured_hz > rise_threshold_hz)
            .map(|pair| pair[0].duty_pct);

        let up_start_hz = reading(up.first());
        Self {
            up_start_hz,
            up_max_hz,
            up_end_hz: reading(up.last()),
            down_start_hz: reading(down.first()),
            down_min_hz,
            down_end_hz: reading(down.last()),
            response_threshold_pct,
            responsive: up_max_hz - up_start_hz > RESPONSIVE_RANGE_HZ,
            up,
            down,
        }
    }
}

fn reading(sample: Option<&DutySample>) -> f32 {
    sample.map_or(0.0, |s| s.measured_hz)
}

/// Duties visited from 0 to 100 inclusive in `step_pct` increments.
fn ramp_duties(step_pct: f32) -> Vec<f32> {
    let step = step_pct.clamp(f32::EPSILON, 100.0);
    let steps = (100.0 / step).ceil() as usize;
    (0..=steps).map(|i| (i as f32 * step).min(100.0)).collect()
}

impl<A: Actuator, F: FrequencySource> SpeedController<'_, A, F> {
    /// Ramp 0 -> 100 -> 0 and record the reading at every step.
    pub async fn sweep(&mut self) -> Result<SweepReport, ControlError> {
        let duties = ramp_duties(self.config.sweep_step_pct);
        info!(
            step_pct = self.config.sweep_step_pct,
            steps = duties.len(),
            "Starting ramp sweep"
        );

        self.enter(ControlPhase::Calibrating)?;
        let mut up = Vec::with_capacity(duties.len());
        for &duty in &duties {
            up.push(self.sweep_step(duty).await?);
        }
        self.session.max_observed_hz = up.iter().map(|s| s.measured_hz).fold(0.0, f32::max);

        if !self.config.sweep_top_hold.is_zero() {
            sleep(self.config.sweep_top_hold).await;
        }

        self.enter(ControlPhase::RampingDown)?;
        let mut down = Vec::with_capacity(duties.len());
        for &duty in duties.iter().rev().skip(1) {
            down.push(self.sweep_step(duty).await?);
        }

        let report = SweepReport::from_ramps(up, down, self.config.sweep_rise_threshold_hz);
        if report.responsive {
            info!(
                up_max_hz = report.up_max_hz,
                threshold_pct = ?report.response_threshold_pct,
                "Sweep complete"
            );
        } else {
            warn!(
                up_start_hz = report.up_start_hz,
                up_max_hz = report.up_max_hz,
                "Sweep complete, frequency does not follow duty"
            );
        }
        self.session.sweep = Some(report.clone());
        Ok(report)
    }

    async fn sweep_step(&mut self, duty_pct: f32) -> Result<DutySample, ControlError> {
        self.drive(duty_pct)?;
        sleep(self.config.step_settle).await;
        let measured_hz = self.sample();
        debug!(duty = duty_pct, measured_hz, "Sweep step");
        Ok(DutySample {
            duty_pct,
            measured_hz,
        })
    }
}
