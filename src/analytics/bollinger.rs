// =============================================================================
// Bollinger Bands
// =============================================================================
//
// middle = SMA(window), upper/lower = middle +- k * sigma, where sigma is the
// population deviation of the window (the classic band definition; the HV
// module uses the sample convention instead — both are documented and fixed).

use super::{mean, population_stddev};

/// Result of a Bollinger band calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Compute Bollinger bands over the last `window` closes with band width
/// `num_std` standard deviations.
///
/// Returns `None` when fewer than `window` samples exist or the result is
/// non-finite. A constant series collapses all three bands onto the mean.
pub fn bollinger(closes: &[f64], window: usize, num_std: f64) -> Option<Bollinger> {
    if window == 0 || closes.len() < window {
        return None;
    }

    let tail = &closes[closes.len() - window..];
    let middle = mean(tail);
    let sigma = population_stddev(tail)?;

    let upper = middle + num_std * sigma;
    let lower = middle - num_std * sigma;

    (upper.is_finite() && lower.is_finite()).then_some(Bollinger {
        upper,
        middle,
        lower,
    })
}
