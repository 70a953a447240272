//! Session orchestration: owns the hardware handles and background tasks of
//! one run and funnels every way out of it through a single teardown.

use crate::config::{RefreshConfig, SessionConfig};
use crate::controller::SpeedController;
use crate::display::{DisplayCell, DisplayGuard, DisplayRefresher};
use crate::error::ControlError;
use crate::hal::{Actuator, EdgeSensor, SegmentDisplay};
use crate::phase::{ControlPhase, ControlSession};
use crate::pulse::{FrequencyCell, FrequencySource, PulseTimer};
use crate::sync::{SnapshotExchange, StopSignal};
use crate::timebase::TimeBase;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Calibrate, seek, hold and ramp down.
    #[default]
    Hold,
    /// Open-loop ramp sweep.
    Sweep,
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hold" => Ok(SessionMode::Hold),
            "sweep" => Ok(SessionMode::Sweep),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    /// Stop was requested before the phase sequence finished.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub mode: SessionMode,
    pub outcome: SessionOutcome,
    pub elapsed_us: u64,
    pub rejected_edges: u64,
    pub session: ControlSession,
}

/// A fatal fault. Teardown has already run when this is returned.
#[derive(Debug, Error)]
#[error("Session aborted during {phase}: {source}")]
pub struct SessionError {
    pub phase: ControlPhase,
    #[source]
    pub source: ControlError,
    pub session: ControlSession,
}

/// Forces the actuator to zero if it is dropped before [`ActuatorGuard::release`],
/// e.g. when the session future is dropped or a phase panics.
pub struct ActuatorGuard<A: Actuator> {
    actuator: A,
    released: bool,
}

impl<A: Actuator> ActuatorGuard<A> {
    pub fn new(actuator: A) -> Self {
        Self {
            actuator,
            released: false,
        }
    }

    /// Zero duty and release the channel. The guard is inert afterwards.
    pub fn release(&mut self) -> Result<(), ControlError> {
        self.released = true;
        let zeroed = self.actuator.set_duty_percent(0.0);
        self.actuator.stop()?;
        zeroed?;
        Ok(())
    }
}

impl<A: Actuator> Deref for ActuatorGuard<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.actuator
    }
}

impl<A: Actuator> DerefMut for ActuatorGuard<A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.actuator
    }
}

impl<A: Actuator> Drop for ActuatorGuard<A> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Actuator dropped while driven, forcing duty to zero");
        if let Err(e) = self.actuator.set_duty_percent(0.0) {
            error!(error = %e, "Emergency zero failed");
        }
        if let Err(e) = self.actuator.stop() {
            error!(error = %e, "Emergency stop failed");
        }
    }
}

/// One controller run against a set of hardware handles.
pub struct Orchestrator<A, S, D>
where
    A: Actuator,
    S: EdgeSensor,
    D: SegmentDisplay + 'static,
{
    actuator: A,
    sensor: S,
    display: D,
    config: SessionConfig,
    mode: SessionMode,
    stop: StopSignal,
    timebase: TimeBase,
    frequency: Arc<FrequencyCell>,
    display_cell: Arc<DisplayCell>,
    exchange: Option<Arc<SnapshotExchange>>,
}

impl<A, S, D> Orchestrator<A, S, D>
where
    A: Actuator,
    S: EdgeSensor,
    D: SegmentDisplay + 'static,
{
    pub fn new(actuator: A, sensor: S, display: D, config: SessionConfig) -> Self {
        let timebase = TimeBase::new();
        let frequency = Arc::new(FrequencyCell::new(timebase, config.stall_timeout));
        Self {
            actuator,
            sensor,
            display,
            config,
            mode: SessionMode::Hold,
            stop: StopSignal::new(),
            timebase,
            frequency,
            display_cell: Arc::new(DisplayCell::new()),
            exchange: None,
        }
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Publish a [`crate::sync::ControlSnapshot`] on every sample.
    pub fn with_exchange(mut self, exchange: Arc<SnapshotExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Handle for requesting a stop from outside the session.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn frequency(&self) -> Arc<FrequencyCell> {
        Arc::clone(&self.frequency)
    }

    pub async fn run(self) -> Result<SessionReport, SessionError> {
        let Self {
            actuator,
            mut sensor,
            display,
            config,
            mode,
            stop,
            timebase,
            frequency,
            display_cell,
            exchange,
        } = self;

        let control = &config.control;
        let started_us = timebase.now_us();
        let mut session = ControlSession::new(control.target_hz, control.hold_tolerance_hz());
        let mut actuator = ActuatorGuard::new(actuator);
        info!(
            ?mode,
            target_hz = control.target_hz,
            slots = config.slots_per_revolution.get(),
            "Session starting"
        );

        let refresher = tokio::spawn(
            DisplayRefresher::new(
                display,
                Arc::clone(&display_cell),
                config.refresh.clone(),
                stop.clone(),
            )
            .run(),
        );
        let monitor = tokio::spawn(monitor_frequency(
            Arc::clone(&frequency),
            Arc::clone(&display_cell),
            config.monitor_interval,
            stop.clone(),
        ));

        let mut teardown = Teardown {
            stop: stop.clone(),
            refresher: Some(refresher),
            monitor: Some(monitor),
            refresh: config.refresh.clone(),
        };

        let result = drive(
            &mut actuator,
            &mut sensor,
            &config,
            mode,
            &stop,
            timebase,
            &frequency,
            &display_cell,
            exchange.as_deref(),
            &mut session,
        )
        .await;

        let phase = session.phase();
        let teardown_result = teardown.run(actuator, &mut sensor, &mut session).await;

        let outcome = match (result, teardown_result) {
            (Ok(outcome), Ok(())) => outcome,
            (Err(source), _) | (Ok(_), Err(source)) => {
                error!(%phase, error = %source, "Session failed");
                return Err(SessionError {
                    phase,
                    source,
                    session,
                });
            }
        };

        let report = SessionReport {
            mode,
            outcome,
            elapsed_us: timebase.now_us().saturating_sub(started_us),
            rejected_edges: frequency.rejected_edges(),
            session,
        };
        info!(
            outcome = ?report.outcome,
            rejected_edges = report.rejected_edges,
            elapsed_ms = report.elapsed_us / 1000,
            "Session finished"
        );
        Ok(report)
    }
}

/// Bring up the hardware and race the phase sequence against the stop signal.
#[allow(clippy::too_many_arguments)]
async fn drive<A: Actuator, S: EdgeSensor>(
    actuator: &mut ActuatorGuard<A>,
    sensor: &mut S,
    config: &SessionConfig,
    mode: SessionMode,
    stop: &StopSignal,
    timebase: TimeBase,
    frequency: &Arc<FrequencyCell>,
    display_cell: &DisplayCell,
    exchange: Option<&SnapshotExchange>,
    session: &mut ControlSession,
) -> Result<SessionOutcome, ControlError> {
    actuator.configure(config.control.pwm_carrier_hz)?;
    sensor.on_falling_edge(PulseTimer::new(
        config.slots_per_revolution,
        config.estimator,
        Arc::clone(frequency),
        timebase,
    ))?;

    let mut controller = SpeedController::new(
        &mut **actuator,
        &**frequency,
        display_cell,
        &config.control,
        session,
        timebase,
    );
    if let Some(exchange) = exchange {
        controller = controller.with_exchange(exchange);
    }

    tokio::select! {
        biased;
        () = stop.wait() => Ok(SessionOutcome::Cancelled),
        result = run_mode(&mut controller, mode) => result.map(|()| SessionOutcome::Completed),
    }
}

async fn run_mode<A: Actuator, F: FrequencySource>(
    controller: &mut SpeedController<'_, A, F>,
    mode: SessionMode,
) -> Result<(), ControlError> {
    match mode {
        SessionMode::Hold => controller.run().await,
        SessionMode::Sweep => controller.sweep().await.map(|_| ()),
    }
}

/// Copies the current reading into the display cell until stopped.
async fn monitor_frequency(
    frequency: Arc<FrequencyCell>,
    display: Arc<DisplayCell>,
    interval: Duration,
    stop: StopSignal,
) {
    while !stop.is_set() {
        display.set_frequency(frequency.frequency_hz());
        tokio::select! {
            () = sleep(interval) => {}
            () = stop.wait() => break,
        }
    }
    debug!("Frequency monitor stopped");
}

/// Background tasks of a session. Dropping it before [`Teardown::run`]
/// finishes (the session future was dropped or a phase panicked) stops
/// and aborts the tasks; the aborted refresher blanks the display as it
/// is dropped.
struct Teardown<D: SegmentDisplay> {
    stop: StopSignal,
    refresher: Option<JoinHandle<DisplayGuard<D>>>,
    monitor: Option<JoinHandle<()>>,
    refresh: RefreshConfig,
}

impl<D: SegmentDisplay> Teardown<D> {
    /// Stop tasks, zero the actuator, blank twice, release everything.
    async fn run<A: Actuator, S: EdgeSensor>(
        &mut self,
        mut actuator: ActuatorGuard<A>,
        sensor: &mut S,
        session: &mut ControlSession,
    ) -> Result<(), ControlError> {
        self.stop.set();

        if let Some(monitor) = self.monitor.as_mut() {
            if let Err(e) = monitor.await {
                error!(error = %e, "Frequency monitor task failed");
            }
            self.monitor = None;
        }
        let display = match self.refresher.as_mut() {
            Some(refresher) => {
                let joined = refresher.await;
                self.refresher = None;
                match joined {
                    Ok(display) => Some(display),
                    Err(e) => {
                        error!(error = %e, "Display refresher task failed");
                        None
                    }
                }
            }
            None => None,
        };

        if let Err(e) = actuator.set_duty_percent(0.0) {
            error!(error = %e, "Forcing duty to zero failed");
        }

        if let Some(mut display) = display {
            for _ in 0..2 {
                display.blank();
                sleep(self.refresh.teardown_pause).await;
            }
            display.release();
        }

        let released = actuator.release();
        if let Err(e) = &released {
            error!(error = %e, "Actuator release failed");
        }
        sensor.detach();
        session.stop();
        info!("Teardown complete, actuator at zero");
        released
    }
}

impl<D: SegmentDisplay> Drop for Teardown<D> {
    fn drop(&mut self) {
        self.stop.set();
        let pending = self.monitor.is_some() || self.refresher.is_some();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
        if pending {
            warn!("Session dropped before teardown, background tasks aborted");
        }
    }
}
