//! Percentiles of analog ensembles.
//!
//! Ensemble members are ranked with the Gringorten plotting position
//!
//! ```text
//! F(i) = (i + 1 - a) / (n + b),   i = 0..n-1,   a = 0.44, b = 0.12
//! ```
//!
//! and the value at a given cumulative frequency is linearly interpolated over the sorted members.
//! Frequencies below `F(0)` or above `F(n-1)` are clamped to the smallest or largest member.

use crate::error::ForecastError;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Gringorten `a` parameter.
pub const GRINGORTEN_A: f64 = 0.44;
/// Gringorten `b` parameter.
pub const GRINGORTEN_B: f64 = 0.12;

/// Returns the cumulative frequency of each member of a sorted ensemble of `n` members.
pub fn cumulative_frequency(n: usize) -> Array1<f64> {
    let divisor = n as f64 + GRINGORTEN_B;
    Array1::from_iter((0..n).map(|i| (i as f64 + 1.0 - GRINGORTEN_A) / divisor))
}

/// Converts a percentile in `[0, 100]` into an interpolation fraction in `[0, 1]`.
pub fn percentile_fraction(percentile: f64) -> Result<f64, ForecastError> {
    if !(0.0..=100.0).contains(&percentile) {
        return Err(ForecastError::invalid(
            "percentile",
            format!("{percentile} is not between 0 and 100"),
        ));
    }
    Ok(percentile / 100.0)
}

/// One-dimensional linear interpolation of `x` over the increasing points `xp` with values `fp`.
///
/// Values of `x` outside of `xp` take the first or last value of `fp`. Returns NaN when there are
/// no points.
pub fn interpolate(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    let (Some(&x_first), Some(&x_last)) = (xp.first(), xp.last()) else {
        return f64::NAN;
    };
    if x <= x_first {
        return fp[0];
    }
    if x >= x_last {
        return fp[fp.len() - 1];
    }
    // First index with xp[index] > x; 1 <= index < len here.
    let index = xp.partition_point(|&p| p <= x);
    let (x0, x1) = (xp[index - 1], xp[index]);
    let (y0, y1) = (fp[index - 1], fp[index]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Returns the sorted finite members of an ensemble.
fn sorted_members<'a>(values: impl IntoIterator<Item = &'a f64>) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.into_iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Returns the value of an ensemble at the cumulative frequency `fraction`.
///
/// NaN members are ignored. An ensemble without members yields NaN.
pub fn ensemble_percentile(values: ArrayView1<f64>, fraction: f64) -> f64 {
    let sorted = sorted_members(values.iter());
    let frequency = cumulative_frequency(sorted.len());
    interpolate(fraction, frequency.as_slice().unwrap_or(&[]), &sorted)
}

/// Returns the value of an ensemble at each of the cumulative frequencies in `fractions`.
pub fn ensemble_percentiles(values: ArrayView1<f64>, fractions: &[f64]) -> Vec<f64> {
    let sorted = sorted_members(values.iter());
    let frequency = cumulative_frequency(sorted.len());
    let frequency = frequency.as_slice().unwrap_or(&[]);
    fractions
        .iter()
        .map(|&fraction| interpolate(fraction, frequency, &sorted))
        .collect()
}

/// Returns the value at the cumulative frequency `fraction` for each row of `block`.
///
/// Rows are entities and columns are the analogs of one lead time.
pub fn row_percentiles(block: ArrayView2<f64>, fraction: f64) -> Array1<f64> {
    block.map_axis(Axis(1), |row| ensemble_percentile(row, fraction))
}
