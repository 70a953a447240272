//! Edge capture and the interrupt-to-task frequency handoff.
//!
//! [`PulseTimer`] is the only writer of estimator state and runs in the
//! sensor's interrupt context. [`FrequencyCell`] is what the cooperative
//! tasks read: every field is a single atomic scalar, so a reader never
//! observes a torn value. Readers never mutate estimator state; a reset is
//! requested through a flag the edge handler applies on the next edge.

use crate::estimator::{EstimatorConfig, FrequencyEstimator};
use crate::timebase::TimeBase;
use atomic_float::AtomicF32;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NO_EDGE: u64 = u64::MAX;

/// Anything the control loop can poll for the current shaft frequency.
pub trait FrequencySource: Send + Sync {
    /// Current shaft frequency in whole Hz.
    fn frequency_hz(&self) -> f32;

    /// Ask the producer to drop its filter history before the next reading.
    fn request_reset(&self) {}
}

impl<T: FrequencySource + ?Sized> FrequencySource for Arc<T> {
    fn frequency_hz(&self) -> f32 {
        (**self).frequency_hz()
    }

    fn request_reset(&self) {
        (**self).request_reset()
    }
}

/// Published estimator output, shared between edge context and tasks.
#[derive(Debug)]
pub struct FrequencyCell {
    smoothed_hz: AtomicF32,
    last_edge_us: AtomicU64,
    rejected_edges: AtomicU64,
    reset_requested: AtomicBool,
    stall_timeout_us: u64,
    timebase: TimeBase,
}

impl FrequencyCell {
    pub fn new(timebase: TimeBase, stall_timeout: Duration) -> Self {
        Self {
            smoothed_hz: AtomicF32::new(0.0),
            last_edge_us: AtomicU64::new(NO_EDGE),
            rejected_edges: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
            stall_timeout_us: stall_timeout.as_micros() as u64,
            timebase,
        }
    }

    /// Frequency as of `now_us`; reads 0 once the shaft has produced no
    /// edge for longer than the stall timeout.
    pub fn frequency_at(&self, now_us: u64) -> f32 {
        if self.reset_requested.load(Ordering::Acquire) {
            return 0.0;
        }
        let last = self.last_edge_us.load(Ordering::Acquire);
        if last == NO_EDGE || now_us.saturating_sub(last) > self.stall_timeout_us {
            return 0.0;
        }
        self.smoothed_hz.load(Ordering::Acquire).round()
    }

    pub fn rejected_edges(&self) -> u64 {
        self.rejected_edges.load(Ordering::Relaxed)
    }

    fn take_reset(&self) -> bool {
        self.reset_requested.swap(false, Ordering::AcqRel)
    }

    /// `accepted_at_us` is on this cell's clock, not the driver's; `None`
    /// for a rejected edge, which must not keep a stalled reading alive.
    fn publish(&self, estimator: &FrequencyEstimator, accepted_at_us: Option<u64>) {
        self.rejected_edges
            .store(estimator.rejected_edges(), Ordering::Relaxed);
        if let Some(at_us) = accepted_at_us {
            self.smoothed_hz
                .store(estimator.smoothed_hz(), Ordering::Release);
            self.last_edge_us.store(at_us, Ordering::Release);
        }
    }
}

impl FrequencySource for FrequencyCell {
    fn frequency_hz(&self) -> f32 {
        self.frequency_at(self.timebase.now_us())
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }
}

/// Edge handler handed to the sensor driver.
#[derive(Debug)]
pub struct PulseTimer {
    estimator: FrequencyEstimator,
    cell: Arc<FrequencyCell>,
    timebase: TimeBase,
}

impl PulseTimer {
    pub fn new(
        slots_per_revolution: NonZeroU32,
        config: EstimatorConfig,
        cell: Arc<FrequencyCell>,
        timebase: TimeBase,
    ) -> Self {
        Self {
            estimator: FrequencyEstimator::new(slots_per_revolution, config),
            cell,
            timebase,
        }
    }

    /// Edge with a driver-supplied timestamp. The driver's counter only
    /// has to be monotonic; it is used for intervals, never for staleness.
    pub fn on_falling_edge(&mut self, timestamp_us: u64) {
        if self.cell.take_reset() {
            self.estimator.reset();
        }
        let accepted = self.estimator.on_edge(timestamp_us);
        let accepted_at_us = accepted.then(|| self.timebase.now_us());
        self.cell.publish(&self.estimator, accepted_at_us);
    }

    /// Edge from a driver without hardware capture; stamps it now.
    pub fn capture(&mut self) {
        let timestamp_us = self.timebase.now_us();
        self.on_falling_edge(timestamp_us);
    }

    /// Clock the stall check compares edge timestamps against.
    pub fn timebase(&self) -> TimeBase {
        self.timebase
    }

    pub fn cell(&self) -> &Arc<FrequencyCell> {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn timer(slots: u32) -> PulseTimer {
        let timebase = TimeBase::new();
        let cell = Arc::new(FrequencyCell::new(timebase, Duration::from_secs(2)));
        PulseTimer::new(
            NonZeroU32::new(slots).unwrap(),
            EstimatorConfig::default(),
            cell,
            timebase,
        )
    }

    /// Edges `period` apart, stamped with a driver counter starting at
    /// `counter_us` and advancing the paused clock in step.
    async fn spin(timer: &mut PulseTimer, counter_us: u64, period: Duration, edges: u64) -> u64 {
        let period_us = period.as_micros() as u64;
        let mut ts = counter_us;
        for _ in 0..edges {
            timer.on_falling_edge(ts);
            advance(period).await;
            ts += period_us;
        }
        ts
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_rounded_frequency() {
        let mut timer = timer(5);
        spin(&mut timer, 0, Duration::from_millis(20), 30).await;
        assert_eq!(timer.cell().frequency_hz(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_shaft_reads_zero() {
        let mut timer = timer(1);
        spin(&mut timer, 0, Duration::from_millis(50), 10).await;

        advance(Duration::from_secs(1)).await;
        assert_eq!(timer.cell().frequency_hz(), 20.0);
        advance(Duration::from_millis(1_500)).await;
        assert_eq!(timer.cell().frequency_hz(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn chatter_after_shaft_stops_does_not_hold_reading() {
        let mut timer = timer(1);
        let mut ts = spin(&mut timer, 0, Duration::from_millis(50), 10).await;
        assert_eq!(timer.cell().frequency_hz(), 20.0);

        // 5s of 500us chatter; only the first edge spans a real interval.
        for _ in 0..10_000 {
            timer.on_falling_edge(ts);
            advance(Duration::from_micros(500)).await;
            ts += 500;
        }

        assert_eq!(timer.cell().rejected_edges(), 9_999);
        assert_eq!(timer.cell().frequency_hz(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_counter_need_not_share_the_cell_clock() {
        let mut timer = timer(1);
        advance(Duration::from_secs(3)).await;

        // Counter starting at zero, well behind the cell's clock.
        spin(&mut timer, 0, Duration::from_millis(50), 20).await;
        assert_eq!(timer.cell().frequency_hz(), 20.0);

        // Counter far ahead of it still stalls out.
        let mut ahead = self::timer(1);
        spin(&mut ahead, 3_600_000_000, Duration::from_millis(50), 20).await;
        assert_eq!(ahead.cell().frequency_hz(), 20.0);
        advance(Duration::from_millis(2_500)).await;
        assert_eq!(ahead.cell().frequency_hz(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_request_applies_on_next_edge() {
        let mut timer = timer(1);
        let ts = spin(&mut timer, 0, Duration::from_millis(10), 10).await;
        timer.cell().request_reset();
        assert_eq!(timer.cell().frequency_hz(), 0.0);

        // First edge after the reset only re-arms the interval timer.
        timer.on_falling_edge(ts + 1_000_000);
        assert_eq!(timer.cell().frequency_hz(), 0.0);
        advance(Duration::from_millis(50)).await;
        timer.on_falling_edge(ts + 1_050_000);
        assert_eq!(timer.cell().frequency_hz(), 20.0);
    }

    #[test]
    fn rejected_edges_are_counted() {
        let mut timer = timer(1);
        timer.on_falling_edge(0);
        timer.on_falling_edge(100);
        timer.on_falling_edge(200);
        assert_eq!(timer.cell().rejected_edges(), 2);
    }
}
