//! Binned accumulators: 1-d and 2-d histograms.
//!
//! Bin lookup uses the precomputed `bin_count / range` factor. Fills below
//! the axis minimum go to underflow, fills at or above `min + range` go to
//! overflow, NaN values are dropped. The backing storage lives in a
//! long-lived arena outside the per-run arenas so accumulated contents
//! survive analysis rebuilds.

use core_arena::{Arena, ArenaError};

use crate::param::ParamVec;

/// One axis: `[min, min + range)` divided into the storage's bin count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Binning {
    pub min: f64,
    pub range: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct H1D {
    pub data: ParamVec,
    pub binning: Binning,
    /// `bin_count / range`, precomputed at construction.
    pub binning_factor: f64,
    pub entry_count: f64,
    pub underflow: f64,
    pub overflow: f64,
}

impl H1D {
    pub fn new(arena: &mut Arena, bin_count: usize, min: f64, max: f64) -> Result<H1D, ArenaError> {
        let data = ParamVec::push(arena, bin_count, 0.0)?;
        Ok(Self::with_storage(data, min, max))
    }

    /// Wraps existing storage, e.g. when reusing accumulated bins across an
    /// analysis rebuild.
    pub fn with_storage(data: ParamVec, min: f64, max: f64) -> H1D {
        let range = max - min;

        H1D {
            binning: Binning { min, range },
            binning_factor: data.len() as f64 / range,
            data,
            entry_count: 0.0,
            underflow: 0.0,
            overflow: 0.0,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.data.len()
    }

    /// Bin index for `x`, `None` for under/overflow.
    pub fn bin(&self, x: f64) -> Option<usize> {
        if x < self.binning.min || x >= self.binning.min + self.binning.range {
            return None;
        }
        Some(((x - self.binning.min) * self.binning_factor) as usize)
    }

    #[inline]
    pub fn fill(&mut self, x: f64) {
        // Comparing against the axis bounds directly also routes NaN away
        // from the bin computation: both comparisons are false for NaN.
        if x < self.binning.min {
            self.underflow += 1.0;
        } else if x >= self.binning.min + self.binning.range {
            self.overflow += 1.0;
        } else if x.is_nan() {
            // dropped
        } else {
            let bin = ((x - self.binning.min) * self.binning_factor) as usize;
            debug_assert!(bin < self.bin_count());
            self.data.set(bin, self.data.get(bin) + 1.0);
            self.entry_count += 1.0;
        }
    }

    pub fn value(&self, x: f64) -> f64 {
        self.bin(x).map_or(0.0, |b| self.data.get(b))
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.entry_count = 0.0;
        self.underflow = 0.0;
        self.overflow = 0.0;
    }
}

/// Row-major linearized 2-d histogram. The x check runs first; only points
/// inside both axes increment a bin.
#[derive(Debug, Clone, Copy)]
pub struct H2D {
    pub data: ParamVec,
    pub binnings: [Binning; 2],
    pub bin_counts: [usize; 2],
    pub binning_factors: [f64; 2],
    pub entry_count: f64,
    pub underflow: f64,
    pub overflow: f64,
}

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;

impl H2D {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arena: &mut Arena,
        x_bins: usize,
        x_min: f64,
        x_max: f64,
        y_bins: usize,
        y_min: f64,
        y_max: f64,
    ) -> Result<H2D, ArenaError> {
        let data = ParamVec::push(arena, x_bins * y_bins, 0.0)?;
        Ok(Self::with_storage(data, x_bins, x_min, x_max, y_bins, y_min, y_max))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_storage(
        data: ParamVec,
        x_bins: usize,
        x_min: f64,
        x_max: f64,
        y_bins: usize,
        y_min: f64,
        y_max: f64,
    ) -> H2D {
        debug_assert_eq!(data.len(), x_bins * y_bins);

        H2D {
            data,
            binnings: [
                Binning { min: x_min, range: x_max - x_min },
                Binning { min: y_min, range: y_max - y_min },
            ],
            bin_counts: [x_bins, y_bins],
            binning_factors: [
                x_bins as f64 / (x_max - x_min),
                y_bins as f64 / (y_max - y_min),
            ],
            entry_count: 0.0,
            underflow: 0.0,
            overflow: 0.0,
        }
    }

    #[inline]
    pub fn fill(&mut self, x: f64, y: f64) {
        let bx = self.binnings[X_AXIS];
        let by = self.binnings[Y_AXIS];

        if x < bx.min {
            self.underflow += 1.0;
        } else if x >= bx.min + bx.range {
            self.overflow += 1.0;
        } else if y < by.min {
            self.underflow += 1.0;
        } else if y >= by.min + by.range {
            self.overflow += 1.0;
        } else if x.is_nan() || y.is_nan() {
            // dropped
        } else {
            let x_bin = ((x - bx.min) * self.binning_factors[X_AXIS]) as usize;
            let y_bin = ((y - by.min) * self.binning_factors[Y_AXIS]) as usize;
            let linear = y_bin * self.bin_counts[X_AXIS] + x_bin;

            debug_assert!(linear < self.data.len());
            self.data.set(linear, self.data.get(linear) + 1.0);
            self.entry_count += 1.0;
        }
    }

    pub fn value(&self, x_bin: usize, y_bin: usize) -> f64 {
        self.data.get(y_bin * self.bin_counts[X_AXIS] + x_bin)
    }
}
