//! Edge-interval frequency estimation.
//!
//! Raw period measurement at low pulse rates is noisy and picks up contact
//! bounce. Each edge runs through a noise-floor gate, a median-of-5 window,
//! a spike clamp and an asymmetric exponential moving average. Everything is
//! O(1) and allocation-free so it can run in interrupt context.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// Number of instantaneous readings kept for the median filter.
pub const MEDIAN_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Edges closer together than this are treated as bounce.
    pub min_dt_us: u64,
    /// Ceiling on a new reading relative to the current smoothed value.
    pub max_jump_ratio: f32,
    /// EMA gain when the reading is rising.
    pub alpha_up: f32,
    /// EMA gain when the reading is falling.
    pub alpha_down: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_dt_us: 900,
            max_jump_ratio: 1.2,
            alpha_up: 0.18,
            alpha_down: 0.45,
        }
    }
}

/// Fixed-capacity FIFO of the most recent instantaneous readings.
#[derive(Debug, Clone, Copy)]
struct RecentWindow {
    samples: [f32; MEDIAN_WINDOW],
    len: usize,
    next: usize,
}

impl RecentWindow {
    const fn new() -> Self {
        Self {
            samples: [0.0; MEDIAN_WINDOW],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, value: f32) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % MEDIAN_WINDOW;
        self.len = (self.len + 1).min(MEDIAN_WINDOW);
    }

    fn median(&self) -> Option<f32> {
        if self.len == 0 {
            return None;
        }
        let mut sorted = self.samples;
        let live = &mut sorted[..self.len];
        live.sort_unstable_by(f32::total_cmp);
        let mid = self.len / 2;
        if self.len % 2 == 1 {
            Some(live[mid])
        } else {
            Some(0.5 * (live[mid - 1] + live[mid]))
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

#[derive(Debug, Clone)]
pub struct FrequencyEstimator {
    config: EstimatorConfig,
    slots_per_revolution: NonZeroU32,
    last_timestamp_us: Option<u64>,
    smoothed_hz: f32,
    recent: RecentWindow,
    rejected_edges: u64,
}

impl FrequencyEstimator {
    pub fn new(slots_per_revolution: NonZeroU32, config: EstimatorConfig) -> Self {
        Self {
            config,
            slots_per_revolution,
            last_timestamp_us: None,
            smoothed_hz: 0.0,
            recent: RecentWindow::new(),
            rejected_edges: 0,
        }
    }

    /// Feed one qualifying sensor edge. Returns `false` when the edge was
    /// rejected as noise.
    pub fn on_edge(&mut self, timestamp_us: u64) -> bool {
        let Some(last) = self.last_timestamp_us.replace(timestamp_us) else {
            return true;
        };

        let dt_us = timestamp_us.saturating_sub(last);
        if dt_us == 0 || dt_us < self.config.min_dt_us {
            self.rejected_edges += 1;
            return false;
        }

        let inst_hz = 1_000_000.0 / dt_us as f32 / self.slots_per_revolution.get() as f32;
        if !inst_hz.is_finite() {
            self.rejected_edges += 1;
            return false;
        }
        self.recent.push(inst_hz);

        let Some(mut median_hz) = self.recent.median() else {
            return true;
        };

        let ceiling = self.smoothed_hz * self.config.max_jump_ratio;
        if self.smoothed_hz > 0.0 && median_hz > ceiling {
            median_hz = ceiling;
        }

        if self.smoothed_hz == 0.0 {
            self.smoothed_hz = median_hz;
        } else {
            let alpha = if median_hz >= self.smoothed_hz {
                self.config.alpha_up
            } else {
                self.config.alpha_down
            };
            self.smoothed_hz = (1.0 - alpha) * self.smoothed_hz + alpha * median_hz;
        }
        self.smoothed_hz = self.smoothed_hz.max(0.0);
        true
    }

    /// Smoothed shaft frequency, rounded to whole Hz.
    pub fn frequency_hz(&self) -> f32 {
        self.smoothed_hz.round()
    }

    /// Unrounded smoothed shaft frequency.
    pub fn smoothed_hz(&self) -> f32 {
        self.smoothed_hz
    }

    /// Edges dropped by the noise-floor gate since construction.
    pub fn rejected_edges(&self) -> u64 {
        self.rejected_edges
    }

    pub fn slots_per_revolution(&self) -> NonZeroU32 {
        self.slots_per_revolution
    }

    /// Forget all history; the next edge only arms the interval timer.
    pub fn reset(&mut self) {
        self.last_timestamp_us = None;
        self.smoothed_hz = 0.0;
        self.recent.clear();
    }
}
