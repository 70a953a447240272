//! Multiplexed seven-segment output.
//!
//! Writers publish a number into [`DisplayCell`]; [`DisplayRefresher`] is the
//! only task touching the segment driver.

use crate::config::RefreshConfig;
use crate::hal::SegmentDisplay;
use crate::sync::StopSignal;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Four digits: values wrap at this modulus.
pub const DISPLAY_MODULUS: u32 = 10_000;

/// Segment bit for the decimal point.
pub const SEGMENT_DP: u8 = 0x80;

/// Digit patterns, bit 0..6 = a..g.
pub const DIGIT_PATTERNS: [u8; 10] = [
    0x3F, // 0
    0x06, // 1
    0x5B, // 2
    0x4F, // 3
    0x66, // 4
    0x6D, // 5
    0x7D, // 6
    0x07, // 7
    0x7F, // 8
    0x67, // 9
];

const DP_FLAG: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayValue {
    pub value: u16,
    pub show_decimal_point: bool,
}

impl DisplayValue {
    /// Segment pattern for `position` (0 = most significant) on a display
    /// with `positions` digits. Leading zeros are shown.
    pub fn pattern(&self, position: usize, positions: usize) -> u8 {
        let shift = positions.saturating_sub(position + 1) as u32;
        let digit = (u32::from(self.value) / 10u32.saturating_pow(shift)) % 10;
        let mut pattern = DIGIT_PATTERNS[digit as usize];
        if self.show_decimal_point {
            pattern |= SEGMENT_DP;
        }
        pattern
    }
}

/// Last-writer-wins number shown on the display, packed into one atomic
/// word so the refresher never reads a value/flag mismatch.
#[derive(Debug, Default)]
pub struct DisplayCell {
    packed: AtomicU32,
}

impl DisplayCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the low four digits are kept.
    pub fn set_number(&self, value: u32, show_decimal_point: bool) {
        let mut packed = value % DISPLAY_MODULUS;
        if show_decimal_point {
            packed |= DP_FLAG;
        }
        self.packed.store(packed, Ordering::Release);
    }

    /// Convenience for frequency readings; negative and NaN read as 0.
    pub fn set_frequency(&self, hz: f32) {
        let value = if hz.is_finite() && hz > 0.0 {
            hz.round() as u32
        } else {
            0
        };
        self.set_number(value, false);
    }

    pub fn get(&self) -> DisplayValue {
        let packed = self.packed.load(Ordering::Acquire);
        DisplayValue {
            value: (packed & 0xFFFF) as u16,
            show_decimal_point: packed & DP_FLAG != 0,
        }
    }
}

/// Blanks and releases the display if dropped before
/// [`DisplayGuard::release`], e.g. when the refresh task is aborted.
pub struct DisplayGuard<D: SegmentDisplay> {
    display: D,
    released: bool,
}

impl<D: SegmentDisplay> DisplayGuard<D> {
    pub fn new(display: D) -> Self {
        Self {
            display,
            released: false,
        }
    }

    /// Blank once more and release the driver. The guard is inert afterwards.
    pub fn release(&mut self) {
        self.released = true;
        self.display.blank();
        self.display.release();
    }
}

impl<D: SegmentDisplay> std::fmt::Debug for DisplayGuard<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayGuard")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<D: SegmentDisplay> Deref for DisplayGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.display
    }
}

impl<D: SegmentDisplay> DerefMut for DisplayGuard<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.display
    }
}

impl<D: SegmentDisplay> Drop for DisplayGuard<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Display dropped while lit, blanking");
        self.display.blank();
        self.display.release();
    }
}

/// Cooperative refresh task for a [`SegmentDisplay`].
pub struct DisplayRefresher<D: SegmentDisplay> {
    display: DisplayGuard<D>,
    cell: Arc<DisplayCell>,
    config: RefreshConfig,
    stop: StopSignal,
}

impl<D: SegmentDisplay> DisplayRefresher<D> {
    pub fn new(
        display: D,
        cell: Arc<DisplayCell>,
        config: RefreshConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            display: DisplayGuard::new(display),
            cell,
            config,
            stop,
        }
    }

    /// Refresh until stopped, then blank and hand the display back so the
    /// caller can confirm the blank and release it.
    pub async fn run(mut self) -> DisplayGuard<D> {
        let positions = self.display.positions();
        let mut frames: u64 = 0;

        'refresh: while !self.stop.is_set() {
            let frame = self.cell.get();
            for position in 0..positions {
                if self.stop.is_set() {
                    break 'refresh;
                }
                self.display.disable_position(position);
                self.display.set_segments(frame.pattern(position, positions));
                self.display.enable_position(position);
                sleep(self.config.on_time).await;

                self.display.disable_position(position);
                self.display.set_segments(0);
                sleep(self.config.blank_time).await;
            }
            frames += 1;
        }

        self.display.blank();
        debug!(frames, "Display refresh stopped");
        self.display
    }
}
