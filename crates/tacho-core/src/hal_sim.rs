//! Simulation backend: a PWM-driven motor with first-order speed response,
//! an optical encoder generating edges from the simulated shaft, and a
//! segment display that records what it was asked to show.

use crate::hal::{
    duty_to_register, Actuator, ActuatorFault, EdgeSensor, SegmentDisplay, SensorFault,
};
use crate::pulse::PulseTimer;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Below this the simulated shaft produces no edges.
const MIN_EDGE_HZ: f32 = 0.2;
const STALLED_POLL: Duration = Duration::from_millis(20);
const BOUNCE_OFFSET_US: u64 = 150;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Brushed DC motor: no motion below the stiction duty, linear above it,
/// first-order lag towards the commanded speed.
#[derive(Debug, Clone)]
pub struct SimulatedMotor {
    shaft_hz: f32,
    duty_pct: f32,

    max_hz: f32,
    stiction_pct: f32,
    time_constant_s: f32,

    last_update: Option<Instant>,
}

impl SimulatedMotor {
    pub fn new(max_hz: f32) -> Self {
        Self {
            shaft_hz: 0.0,
            duty_pct: 0.0,
            max_hz,
            stiction_pct: 8.0,
            time_constant_s: 0.25,
            last_update: None,
        }
    }

    pub fn with_stiction(mut self, stiction_pct: f32) -> Self {
        self.stiction_pct = stiction_pct;
        self
    }

    pub fn with_time_constant(mut self, time_constant: Duration) -> Self {
        self.time_constant_s = time_constant.as_secs_f32();
        self
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    /// Steady-state speed for a duty cycle.
    pub fn steady_state_hz(&self, duty_pct: f32) -> f32 {
        if duty_pct <= self.stiction_pct {
            return 0.0;
        }
        let span = 100.0 - self.stiction_pct;
        self.max_hz * ((duty_pct - self.stiction_pct) / span).min(1.0)
    }

    pub fn set_duty(&mut self, duty_pct: f32, now: Instant) {
        self.advance_to(now);
        self.duty_pct = duty_pct.clamp(0.0, 100.0);
    }

    pub fn step(&mut self, dt_s: f32) {
        let target = self.steady_state_hz(self.duty_pct);
        let error = target - self.shaft_hz;
        self.shaft_hz += error * (1.0 - (-dt_s / self.time_constant_s).exp());
        self.shaft_hz = self.shaft_hz.max(0.0);
    }

    pub fn advance_to(&mut self, now: Instant) {
        if let Some(last) = self.last_update {
            let dt = now.saturating_duration_since(last);
            if !dt.is_zero() {
                self.step(dt.as_secs_f32());
            }
        }
        self.last_update = Some(now);
    }

    pub fn shaft_hz(&self) -> f32 {
        self.shaft_hz
    }

    pub fn duty_pct(&self) -> f32 {
        self.duty_pct
    }
}

#[derive(Debug, Clone, Default)]
pub struct PwmState {
    pub carrier_hz: Option<u32>,
    pub duty_pct: f32,
    pub register: u16,
    pub writes: usize,
    pub released: bool,
    fail_after: Option<usize>,
}

/// PWM channel feeding a [`SimulatedMotor`].
pub struct SimulatedPwm {
    motor: Arc<Mutex<SimulatedMotor>>,
    state: Arc<Mutex<PwmState>>,
}

impl SimulatedPwm {
    pub fn new(motor: Arc<Mutex<SimulatedMotor>>) -> Self {
        Self {
            motor,
            state: Arc::new(Mutex::new(PwmState::default())),
        }
    }

    /// Every duty write after the first `writes` succeeds fails.
    pub fn fail_after(self, writes: usize) -> Self {
        lock(&self.state).fail_after = Some(writes);
        self
    }

    pub fn probe(&self) -> PwmProbe {
        PwmProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Actuator for SimulatedPwm {
    fn configure(&mut self, carrier_hz: u32) -> Result<(), ActuatorFault> {
        if carrier_hz == 0 {
            return Err(ActuatorFault::UnsupportedCarrier { carrier_hz });
        }
        let mut state = lock(&self.state);
        state.carrier_hz = Some(carrier_hz);
        state.released = false;
        Ok(())
    }

    fn set_duty_percent(&mut self, duty_pct: f32) -> Result<(), ActuatorFault> {
        let mut state = lock(&self.state);
        if state.released {
            return Err(ActuatorFault::Released);
        }
        // Zeroing always goes through so a faulted driver can still be stopped.
        if duty_pct > 0.0 && state.fail_after.is_some_and(|limit| state.writes >= limit) {
            return Err(ActuatorFault::WriteFailed {
                duty_pct,
                reason: "injected fault".to_string(),
            });
        }
        state.writes += 1;
        state.register = duty_to_register(duty_pct);
        state.duty_pct = duty_pct.clamp(0.0, 100.0);
        lock(&self.motor).set_duty(state.duty_pct, Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ActuatorFault> {
        let mut state = lock(&self.state);
        state.duty_pct = 0.0;
        state.register = 0;
        state.released = true;
        lock(&self.motor).set_duty(0.0, Instant::now());
        Ok(())
    }
}

/// Read-only view of a [`SimulatedPwm`] after it has been moved away.
#[derive(Clone)]
pub struct PwmProbe {
    state: Arc<Mutex<PwmState>>,
}

impl PwmProbe {
    pub fn snapshot(&self) -> PwmState {
        lock(&self.state).clone()
    }
}

/// Optical encoder disc on the simulated shaft.
///
/// Edge timestamps are computed from the shaft speed rather than taken from
/// the wake-up time, so timer granularity does not quantize the readings.
pub struct SimulatedEncoder {
    motor: Arc<Mutex<SimulatedMotor>>,
    slots_per_revolution: NonZeroU32,
    bounce_every: Option<u32>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedEncoder {
    pub fn new(
        motor: Arc<Mutex<SimulatedMotor>>,
        slots_per_revolution: NonZeroU32,
    ) -> Self {
        Self {
            motor,
            slots_per_revolution,
            bounce_every: None,
            task: None,
        }
    }

    /// Emit a contact-bounce edge right after every `every`-th real edge.
    pub fn with_bounce(mut self, every: u32) -> Self {
        self.bounce_every = (every > 0).then_some(every);
        self
    }

    pub fn is_attached(&self) -> bool {
        self.task.is_some()
    }
}

impl EdgeSensor for SimulatedEncoder {
    fn on_falling_edge(&mut self, mut handler: PulseTimer) -> Result<(), SensorFault> {
        if self.task.is_some() {
            return Err(SensorFault::AlreadyAttached);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SensorFault::InterruptSetup(e.to_string()))?;

        let motor = Arc::clone(&self.motor);
        let slots = self.slots_per_revolution.get() as f32;
        // Stamp edges on the same clock the frequency cell reads.
        let timebase = handler.timebase();
        let bounce_every = self.bounce_every;

        self.task = Some(runtime.spawn(async move {
            let mut last_edge_us = timebase.now_us();
            let mut edges: u64 = 0;
            loop {
                let now_us = timebase.now_us();
                let shaft_hz = {
                    let mut motor = lock(&motor);
                    motor.advance_to(Instant::now());
                    motor.shaft_hz()
                };
                if shaft_hz < MIN_EDGE_HZ {
                    last_edge_us = now_us;
                    sleep(STALLED_POLL).await;
                    continue;
                }

                let period_us = (1_000_000.0 / (shaft_hz * slots)).max(1.0) as u64;
                let edge_us = last_edge_us + period_us;
                if edge_us > now_us {
                    sleep(Duration::from_micros(edge_us - now_us)).await;
                }
                handler.on_falling_edge(edge_us);
                last_edge_us = edge_us;
                edges += 1;

                if bounce_every.is_some_and(|every| edges % u64::from(every) == 0) {
                    handler.on_falling_edge(edge_us + BOUNCE_OFFSET_US);
                }
            }
        }));
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SimulatedEncoder {
    fn drop(&mut self) {
        self.detach();
    }
}

#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub segments: u8,
    pub enabled: Vec<bool>,
    /// Last pattern each position was lit with.
    pub rendered: Vec<u8>,
    pub max_enabled_at_once: usize,
    pub blanks: usize,
    pub released: bool,
}

impl DisplayState {
    pub fn is_blank(&self) -> bool {
        self.segments == 0 && self.enabled.iter().all(|on| !on)
    }
}

/// Segment display that records its pin state.
pub struct RecordingDisplay {
    positions: usize,
    state: Arc<Mutex<DisplayState>>,
}

impl RecordingDisplay {
    pub fn new(positions: usize) -> Self {
        let state = DisplayState {
            enabled: vec![false; positions],
            rendered: vec![0; positions],
            ..Default::default()
        };
        Self {
            positions,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn probe(&self) -> DisplayProbe {
        DisplayProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl SegmentDisplay for RecordingDisplay {
    fn positions(&self) -> usize {
        self.positions
    }

    fn set_segments(&mut self, pattern: u8) {
        lock(&self.state).segments = pattern;
    }

    fn enable_position(&mut self, position: usize) {
        let mut state = lock(&self.state);
        if position >= self.positions {
            return;
        }
        state.enabled[position] = true;
        state.rendered[position] = state.segments;
        let lit = state.enabled.iter().filter(|on| **on).count();
        state.max_enabled_at_once = state.max_enabled_at_once.max(lit);
    }

    fn disable_position(&mut self, position: usize) {
        if let Some(on) = lock(&self.state).enabled.get_mut(position) {
            *on = false;
        }
    }

    fn blank(&mut self) {
        let mut state = lock(&self.state);
        state.segments = 0;
        state.enabled.iter_mut().for_each(|on| *on = false);
        state.blanks += 1;
    }

    fn release(&mut self) {
        self.blank();
        lock(&self.state).released = true;
    }
}

#[derive(Clone)]
pub struct DisplayProbe {
    state: Arc<Mutex<DisplayState>>,
}

impl DisplayProbe {
    pub fn snapshot(&self) -> DisplayState {
        lock(&self.state).clone()
    }
}
