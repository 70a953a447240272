use crate::phase::ControlPhase;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Latest control-loop state, published for telemetry readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlSnapshot {
    pub timestamp_us: u64,
    pub sample_count: u64,
    pub phase: ControlPhase,
    pub duty_pct: f32,
    pub measured_hz: f32,
    pub target_hz: f32,
}

struct TripleBuffer<T: Copy + Default> {
    slots: [UnsafeCell<T>; 3],
    index: AtomicUsize,
}

unsafe impl<T: Copy + Default + Send> Send for TripleBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for TripleBuffer<T> {}

impl<T: Copy + Default> TripleBuffer<T> {
    fn new() -> Self {
        let slots = std::array::from_fn(|_| UnsafeCell::new(T::default()));
        Self {
            slots,
            index: AtomicUsize::new(0),
        }
    }

    fn write(&self, value: T) {
        let current = self.index.load(Ordering::Relaxed);
        let next = (current + 1) % 3;
        unsafe {
            *self.slots[next].get() = value;
        }
        self.index.store(next, Ordering::Release);
    }

    fn read(&self) -> T {
        let idx = self.index.load(Ordering::Acquire);
        unsafe { *self.slots[idx].get() }
    }
}

/// Single-writer handoff of [`ControlSnapshot`]s.
///
/// The controller is the only writer. Readers on other threads (metrics)
/// get the most recently completed snapshot without locking.
pub struct SnapshotExchange {
    control: TripleBuffer<ControlSnapshot>,
}

impl SnapshotExchange {
    pub fn new() -> Self {
        Self {
            control: TripleBuffer::new(),
        }
    }

    /// Called by the controller after every sample (non-blocking).
    pub fn publish(&self, snapshot: ControlSnapshot) {
        self.control.write(snapshot);
    }

    pub fn latest(&self) -> ControlSnapshot {
        self.control.read()
    }
}

impl Default for SnapshotExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative stop flag shared by the session tasks.
///
/// Pollers check [`StopSignal::is_set`] between sleeps; the phase driver
/// races [`StopSignal::wait`] so it is dropped at its current await point.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once [`StopSignal::set`] has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn latest_snapshot_wins() {
        let exchange = SnapshotExchange::new();
        exchange.publish(ControlSnapshot {
            sample_count: 1,
            duty_pct: 10.0,
            ..Default::default()
        });
        exchange.publish(ControlSnapshot {
            sample_count: 2,
            duty_pct: 20.0,
            ..Default::default()
        });
        let latest = exchange.latest();
        assert_eq!(latest.sample_count, 2);
        assert_eq!(latest.duty_pct, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_after_set() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        stop.set();
        waiter.await.unwrap();
        assert!(stop.is_set());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let stop = StopSignal::new();
        stop.set();
        stop.wait().await;
    }
}
