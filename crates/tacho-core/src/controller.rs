use crate::config::ControlConfig;
use crate::display::DisplayCell;
use crate::error::ControlError;
use crate::feedback::clamp_duty;
use crate::hal::Actuator;
use crate::phase::{CalibrationSummary, ControlPhase, ControlSession, HoldSummary, SeekSummary};
use crate::pulse::FrequencySource;
use crate::sync::{ControlSnapshot, SnapshotExchange};
use crate::timebase::TimeBase;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Phase driver for one session. Borrowing the session lets the caller
/// keep the recorded history when the driver future is dropped on
/// cancellation.
pub struct SpeedController<'a, A: Actuator, F: FrequencySource> {
    pub(crate) actuator: &'a mut A,
    pub(crate) frequency: &'a F,
    pub(crate) display: &'a DisplayCell,
    pub(crate) config: &'a ControlConfig,
    pub(crate) session: &'a mut ControlSession,
    exchange: Option<&'a SnapshotExchange>,
    timebase: TimeBase,
    samples: u64,
    last_hz: f32,
}

impl<'a, A: Actuator, F: FrequencySource> SpeedController<'a, A, F> {
    pub fn new(
        actuator: &'a mut A,
        frequency: &'a F,
        display: &'a DisplayCell,
        config: &'a ControlConfig,
        session: &'a mut ControlSession,
        timebase: TimeBase,
    ) -> Self {
        Self {
            actuator,
            frequency,
            display,
            config,
            session,
            exchange: None,
            timebase,
            samples: 0,
            last_hz: 0.0,
        }
    }

    pub fn with_exchange(mut self, exchange: &'a SnapshotExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Calibrate, seek, hold, ramp down. Leaves the session in
    /// `RampingDown` with duty 0; the caller performs the terminal stop.
    pub async fn run(&mut self) -> Result<(), ControlError> {
        let calibration = self.calibrate().await?;
        let seek = self.seek_target(calibration.max_hz).await?;
        let hold_duty = self.hold(seek.duty_pct).await?;

        let anchored_duty = if calibration.max_hz > 0.0 {
            (self.config.target_hz / calibration.max_hz * 100.0).floor()
        } else {
            seek.duty_pct
        };
        self.ramp_down(hold_duty, anchored_duty).await
    }

    pub(crate) fn enter(&mut self, phase: ControlPhase) -> Result<(), ControlError> {
        let from = self.session.phase();
        self.session.enter(phase)?;
        info!(from = %from, to = %phase, "Phase transition");
        self.publish(self.last_hz);
        Ok(())
    }

    pub(crate) fn drive(&mut self, duty_pct: f32) -> Result<(), ControlError> {
        self.actuator.set_duty_percent(duty_pct)?;
        self.session.current_duty_pct = duty_pct;
        Ok(())
    }

    /// Read the shaft frequency, mirror it to the display and the history.
    pub(crate) fn sample(&mut self) -> f32 {
        let measured_hz = self.frequency.frequency_hz();
        self.display.set_frequency(measured_hz);
        self.session.record(measured_hz);
        self.samples += 1;
        self.last_hz = measured_hz;
        self.publish(measured_hz);
        measured_hz
    }

    fn publish(&self, measured_hz: f32) {
        if let Some(exchange) = self.exchange {
            exchange.publish(ControlSnapshot {
                timestamp_us: self.timebase.now_us(),
                sample_count: self.samples,
                phase: self.session.phase(),
                duty_pct: self.session.current_duty_pct,
                measured_hz,
                target_hz: self.config.target_hz,
            });
        }
    }

    /// Full duty, then record the top speed as the calibration anchor.
    pub async fn calibrate(&mut self) -> Result<CalibrationSummary, ControlError> {
        self.enter(ControlPhase::Calibrating)?;
        self.drive(100.0)?;
        sleep(self.config.spin_up).await;

        let samples = self.config.calibration_samples.max(1);
        let mut max_hz: f32 = 0.0;
        let mut total_hz = 0.0;
        for reading in 1..=samples {
            let hz = self.sample();
            max_hz = max_hz.max(hz);
            total_hz += hz;
            debug!(reading, hz, "Calibration reading");
            sleep(self.config.calibration_interval).await;
        }
        let mean_hz = total_hz / samples as f32;

        if !(max_hz > 0.0) {
            return Err(ControlError::CalibrationFailure { max_hz });
        }

        let summary = CalibrationSummary {
            max_hz,
            mean_hz,
            samples,
        };
        self.session.max_observed_hz = max_hz;
        self.session.calibration = Some(summary);
        info!(max_hz, mean_hz, "Calibration complete");

        // Coast to a stop so the seek does not start on residual momentum.
        self.drive(0.0)?;
        sleep(self.config.calibration_settle).await;
        self.frequency.request_reset();
        Ok(summary)
    }

    /// Step the duty from just below the calibration estimate until the
    /// reading is within the seek tolerance.
    pub async fn seek_target(&mut self, max_hz: f32) -> Result<SeekSummary, ControlError> {
        self.enter(ControlPhase::SeekingTarget)?;
        let target_hz = self.config.target_hz;
        let tolerance_hz = self.config.seek_tolerance_hz;
        self.session.tolerance_hz = tolerance_hz;

        let floor = self.config.seek_floor_pct;
        let estimate = if max_hz > 0.0 {
            (target_hz / max_hz * 100.0).round().max(floor)
        } else {
            floor
        };
        let mut duty = (estimate - self.config.seek_undershoot_pct).max(floor);
        info!(target_hz, estimate, start_duty = duty, "Seeking target");

        let mut measured_hz = 0.0;
        for step in 0..self.config.seek_max_steps {
            self.drive(duty)?;
            sleep(self.config.step_settle).await;
            measured_hz = self.sample();
            debug!(step, duty, measured_hz, "Seek step");

            if (measured_hz - target_hz).abs() <= tolerance_hz {
                info!(duty, measured_hz, steps = step + 1, "Target reached");
                let summary = SeekSummary {
                    duty_pct: duty,
                    measured_hz,
                    steps: step + 1,
                    budget_exhausted: false,
                };
                self.session.seek = Some(summary);
                return Ok(summary);
            }

            let step_pct = self.config.seek_step_pct;
            duty = if measured_hz < target_hz - tolerance_hz {
                clamp_duty(duty + step_pct)
            } else {
                clamp_duty(duty - step_pct)
            };
        }

        // The duty actually on the actuator is the one that produced the
        // last reading.
        let applied = self.session.current_duty_pct;
        warn!(
            target_hz,
            measured_hz,
            duty = applied,
            steps = self.config.seek_max_steps,
            "Seek budget exhausted, holding from best effort"
        );
        let summary = SeekSummary {
            duty_pct: applied,
            measured_hz,
            steps: self.config.seek_max_steps,
            budget_exhausted: true,
        };
        self.session.seek = Some(summary);
        Ok(summary)
    }

    /// Hold the target with tiered proportional correction. Returns the
    /// final duty.
    pub async fn hold(&mut self, start_duty_pct: f32) -> Result<f32, ControlError> {
        self.enter(ControlPhase::Holding)?;
        let target_hz = self.config.target_hz;
        let tolerance_hz = self.config.hold_tolerance_hz();
        self.session.tolerance_hz = tolerance_hz;
        let gains = self.config.hold_gains;

        let mut duty = start_duty_pct;
        self.drive(duty)?;
        info!(
            target_hz,
            tolerance_hz,
            start_duty = duty,
            seconds = self.config.hold_duration.as_secs_f32(),
            "Holding target"
        );

        let sample_interval = self.config.hold_sample_interval;
        let adjust_interval = self.config.hold_adjust_interval;
        let mut elapsed = Duration::ZERO;
        let mut last_adjust: Option<Duration> = None;
        let mut last_error: Option<f32> = None;
        let mut readings = Vec::new();
        let mut adjustments = 0;

        while elapsed < self.config.hold_duration {
            let measured_hz = self.sample();
            readings.push(measured_hz);
            let error_hz = target_hz - measured_hz;

            let due = last_adjust.map_or(true, |at| elapsed.saturating_sub(at) >= adjust_interval);
            if due {
                let adjustment = gains.adjustment(error_hz, tolerance_hz, last_error);
                if let Some(next) = gains.next_duty(duty, &adjustment) {
                    debug!(
                        error_hz,
                        from = duty,
                        to = next,
                        delta = adjustment.pct,
                        damped = adjustment.damped,
                        "Hold adjustment"
                    );
                    self.drive(next)?;
                    duty = next;
                    adjustments += 1;
                }
                last_error = Some(error_hz);
                last_adjust = Some(elapsed);
            }

            sleep(sample_interval).await;
            elapsed += sample_interval;
        }

        if let Some(summary) = HoldSummary::from_readings(
            &readings,
            target_hz,
            tolerance_hz,
            start_duty_pct,
            duty,
            adjustments,
        ) {
            info!(
                mean_hz = summary.mean_hz,
                min_hz = summary.min_hz,
                max_hz = summary.max_hz,
                within_tolerance_pct = summary.within_tolerance * 100.0,
                final_duty = duty,
                "Hold complete"
            );
            self.session.hold = Some(summary);
        }
        Ok(duty)
    }

    /// Step down to 0%, starting from whichever of the two duties is lower
    /// so the shaft never speeds up on the way down.
    pub async fn ramp_down(
        &mut self,
        hold_duty_pct: f32,
        anchored_duty_pct: f32,
    ) -> Result<(), ControlError> {
        self.enter(ControlPhase::RampingDown)?;
        let start = hold_duty_pct.floor().min(anchored_duty_pct.floor()).max(0.0);
        info!(start_duty = start, hold_duty_pct, anchored_duty_pct, "Ramping down");
        self.step_down_from(start).await
    }

    pub(crate) async fn step_down_from(&mut self, start_pct: f32) -> Result<(), ControlError> {
        let step = self.config.ramp_step_pct.max(f32::EPSILON);
        let mut duty = start_pct.clamp(0.0, 100.0);
        loop {
            self.drive(duty)?;
            sleep(self.config.step_settle).await;
            let measured_hz = self.sample();
            debug!(duty, measured_hz, "Ramp-down step");
            if duty <= 0.0 {
                return Ok(());
            }
            duty = (duty - step).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ActuatorFault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed sequence of readings, repeating the last one.
    struct ScriptedFrequency {
        readings: Vec<f32>,
        next: AtomicUsize,
        resets: AtomicUsize,
    }

    impl ScriptedFrequency {
        fn new(readings: &[f32]) -> Self {
            Self {
                readings: readings.to_vec(),
                next: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }
        }
    }

    impl FrequencySource for ScriptedFrequency {
        fn frequency_hz(&self) -> f32 {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            let last = self.readings.len() - 1;
            self.readings[i.min(last)]
        }

        fn request_reset(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reading follows the last written duty through a fixed gain.
    struct LinearPlant {
        hz_per_pct: f32,
        duty: Mutex<f32>,
    }

    impl FrequencySource for LinearPlant {
        fn frequency_hz(&self) -> f32 {
            (*self.duty.lock().unwrap() * self.hz_per_pct).round()
        }
    }

    #[derive(Default)]
    struct RecordingActuator {
        writes: Vec<f32>,
        fail_at: Option<usize>,
        plant: Option<std::sync::Arc<LinearPlant>>,
    }

    impl Actuator for RecordingActuator {
        fn configure(&mut self, _carrier_hz: u32) -> Result<(), ActuatorFault> {
            Ok(())
        }

        fn set_duty_percent(&mut self, duty_pct: f32) -> Result<(), ActuatorFault> {
            if self.fail_at == Some(self.writes.len()) {
                return Err(ActuatorFault::WriteFailed {
                    duty_pct,
                    reason: "bus error".into(),
                });
            }
            self.writes.push(duty_pct);
            if let Some(plant) = &self.plant {
                *plant.duty.lock().unwrap() = duty_pct;
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ActuatorFault> {
            Ok(())
        }
    }

    fn fast_config() -> ControlConfig {
        ControlConfig {
            target_hz: 50.0,
            hold_duration: Duration::from_secs(2),
            ..ControlConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_anchors_on_max_reading() {
        let source = ScriptedFrequency::new(&[
            70.0, 78.0, 80.0, 75.0, 79.0, 80.0, 77.0, 76.0, 79.0, 78.0,
        ]);
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);

        let mut controller = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        );
        let summary = controller.calibrate().await.unwrap();

        assert_eq!(summary.max_hz, 80.0);
        assert_eq!(summary.mean_hz, 77.2);
        assert_eq!(actuator.writes, vec![100.0, 0.0]);
        assert_eq!(source.resets.load(Ordering::Relaxed), 1);
        assert_eq!(session.max_observed_hz, 80.0);
        assert_eq!(session.history(ControlPhase::Calibrating).len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_without_rotation_fails() {
        let source = ScriptedFrequency::new(&[0.0]);
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);

        let result = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .calibrate()
        .await;

        assert_eq!(result, Err(ControlError::CalibrationFailure { max_hz: 0.0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_approaches_from_below_calibration_estimate() {
        // 1Hz per percent: target 50Hz is reached at 50%.
        let plant = std::sync::Arc::new(LinearPlant {
            hz_per_pct: 1.0,
            duty: Mutex::new(0.0),
        });
        let mut actuator = RecordingActuator {
            plant: Some(plant.clone()),
            ..Default::default()
        };
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);
        session.enter(ControlPhase::Calibrating).unwrap();

        let summary = SpeedController::new(
            &mut actuator,
            &*plant,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .seek_target(100.0)
        .await
        .unwrap();

        // Estimate 50%, start 10 points lower, climb 1% per step.
        assert_eq!(actuator.writes[0], 40.0);
        assert!(!summary.budget_exhausted);
        assert_eq!(summary.duty_pct, 49.0);
        assert_eq!(summary.steps, 10);
        assert_eq!(display.get().value, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_budget_exhaustion_is_not_an_error() {
        let source = ScriptedFrequency::new(&[5.0]);
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);
        session.enter(ControlPhase::Calibrating).unwrap();

        let summary = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .seek_target(80.0)
        .await
        .unwrap();

        assert!(summary.budget_exhausted);
        assert_eq!(summary.steps, 50);
        assert_eq!(actuator.writes.len(), 50);
        assert!(actuator.writes.iter().all(|d| (1.0..=100.0).contains(d)));
        assert_eq!(summary.duty_pct, *actuator.writes.last().unwrap());
    }

    fn holding_session(config: &ControlConfig) -> ControlSession {
        let mut session = ControlSession::new(config.target_hz, 1.0);
        session.enter(ControlPhase::Calibrating).unwrap();
        session.enter(ControlPhase::SeekingTarget).unwrap();
        session
    }

    fn oscillating(low: f32, high: f32) -> Vec<f32> {
        (0..20).map(|i| if i % 10 < 5 { low } else { high }).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn hold_damps_oscillation_and_reports_statistics() {
        let source = ScriptedFrequency::new(&oscillating(44.0, 56.0));
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = holding_session(&config);

        let final_duty = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .hold(40.0)
        .await
        .unwrap();

        // 2s at 100ms sampling, adjustments every 500ms.
        let summary = session.hold.unwrap();
        assert_eq!(summary.samples, 20);
        assert_eq!(summary.adjustments, 4);
        assert_eq!(summary.min_hz, 44.0);
        assert_eq!(summary.max_hz, 56.0);
        assert_eq!(summary.within_tolerance, 0.0);

        // +0.3 undamped, then +-0.225 after every sign flip.
        let deltas: Vec<f32> = actuator.writes.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(deltas.len(), 4);
        assert!((deltas[0] - 0.3).abs() < 1e-4, "{deltas:?}");
        for delta in &deltas[1..] {
            assert!((delta.abs() - 0.225).abs() < 1e-4, "{deltas:?}");
        }
        assert!((final_duty - 40.075).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_deadband_ignores_small_oscillation() {
        // 48<->52 around 50Hz asks for 0.05pp and 0.0375pp changes.
        let source = ScriptedFrequency::new(&oscillating(48.0, 52.0));
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = holding_session(&config);

        let final_duty = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .hold(40.0)
        .await
        .unwrap();

        assert_eq!(actuator.writes, vec![40.0]);
        assert_eq!(final_duty, 40.0);
        assert_eq!(session.hold.unwrap().adjustments, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_down_starts_from_lower_duty() {
        let source = ScriptedFrequency::new(&[10.0]);
        let mut actuator = RecordingActuator::default();
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);
        for phase in [
            ControlPhase::Calibrating,
            ControlPhase::SeekingTarget,
            ControlPhase::Holding,
        ] {
            session.enter(phase).unwrap();
        }

        SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .ramp_down(12.7, 5.0)
        .await
        .unwrap();

        assert_eq!(actuator.writes, vec![5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        assert!(actuator.writes.windows(2).all(|w| w[1] < w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn actuator_fault_aborts_phase() {
        let source = ScriptedFrequency::new(&[10.0]);
        let mut actuator = RecordingActuator {
            fail_at: Some(3),
            ..Default::default()
        };
        let display = DisplayCell::new();
        let config = fast_config();
        let mut session = ControlSession::new(config.target_hz, 1.0);
        session.enter(ControlPhase::Calibrating).unwrap();

        let result = SpeedController::new(
            &mut actuator,
            &source,
            &display,
            &config,
            &mut session,
            TimeBase::new(),
        )
        .seek_target(80.0)
        .await;

        assert!(matches!(result, Err(ControlError::Actuator(_))));
        assert_eq!(actuator.writes.len(), 3);
    }
}
