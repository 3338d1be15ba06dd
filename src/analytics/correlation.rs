// =============================================================================
// Pairwise Pearson Correlation over time-aligned close series
// =============================================================================
//
// Two instruments only correlate over buckets they both traded: the series
// are inner-joined on candle time, the last `window` shared samples feed the
// standard Pearson formula, and anything that prevents a well-defined rho
// (too few shared buckets, zero variance) comes back as a coverage gap so
// the caller can skip the pair instead of persisting a bogus number.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Why a pair produced no correlation value this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageGap {
    /// Fewer aligned samples than the requested window.
    TooFewAligned { aligned: usize, required: usize },
    /// One or both aligned series are constant; rho is undefined.
    ZeroVariance,
}

impl std::fmt::Display for CoverageGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewAligned { aligned, required } => {
                write!(f, "only {aligned} aligned samples (need {required})")
            }
            Self::ZeroVariance => write!(f, "zero variance in aligned window"),
        }
    }
}

/// A close observation at a candle bucket time.
pub type ClosePoint = (DateTime<Utc>, f64);

/// Inner-join two close series on bucket time and return the last `window`
/// shared samples as parallel vectors (oldest-first). `None` when fewer than
/// `window` buckets align.
pub fn align_series(
    a: &[ClosePoint],
    b: &[ClosePoint],
    window: usize,
) -> Option<(Vec<f64>, Vec<f64>)> {
    let b_by_time: HashMap<DateTime<Utc>, f64> = b.iter().copied().collect();

    let mut xs = Vec::with_capacity(window);
    let mut ys = Vec::with_capacity(window);
    for (t, close_a) in a {
        if let Some(close_b) = b_by_time.get(t) {
            xs.push(*close_a);
            ys.push(*close_b);
        }
    }

    if xs.len() < window {
        return None;
    }
    // Keep only the trailing window of shared samples.
    let start = xs.len() - window;
    Some((xs.split_off(start), ys.split_off(start)))
}

/// Standard Pearson correlation coefficient of two equal-length series.
///
/// `None` when the series are shorter than 2 samples or either side has zero
/// variance. The result is clamped into [-1, 1] to absorb float drift.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    let rho = cov / (var_x.sqrt() * var_y.sqrt());
    rho.is_finite().then(|| rho.clamp(-1.0, 1.0))
}

/// Correlate two instruments over their shared trailing `window`.
pub fn pair_correlation(
    a: &[ClosePoint],
    b: &[ClosePoint],
    window: usize,
) -> Result<f64, CoverageGap> {
    let (xs, ys) = align_series(a, b, window).ok_or_else(|| {
        let b_times: HashMap<DateTime<Utc>, f64> = b.iter().copied().collect();
        let aligned = a.iter().filter(|(t, _)| b_times.contains_key(t)).count();
        CoverageGap::TooFewAligned {
            aligned,
            required: window,
        }
    })?;
    pearson(&xs, &ys).ok_or(CoverageGap::ZeroVariance)
}
