// =============================================================================
// Historical Volatility — annualized stddev of log returns
// =============================================================================
//
// For closes c1..cn and a trailing window w (needs n >= w + 1):
//
//   r_i = ln(c_i / c_{i-1})          for the last w consecutive pairs
//   HV  = stddev(r) * sqrt(252) * 100
//
// The stddev is the *sample* deviation (N-1 denominator); 252 trading days
// annualize, and the result is expressed in percent.

use super::sample_stddev;

/// Annualization factor: square root of 252 trading days.
const ANNUALIZATION: f64 = 252.0;

/// Compute historical volatility over the trailing `window` log returns.
///
/// Returns `None` when:
/// - `window < 2` (a single return has no deviation),
/// - fewer than `window + 1` closes are available,
/// - any close in the window is non-positive or non-finite (log undefined).
///
/// A constant series yields `Some(0.0)`.
pub fn historical_volatility(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 || closes.len() < window + 1 {
        return None;
    }

    let tail = &closes[closes.len() - (window + 1)..];
    let mut returns = Vec::with_capacity(window);
    for pair in tail.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        if prev <= 0.0 || cur <= 0.0 || !prev.is_finite() || !cur.is_finite() {
            return None;
        }
        returns.push((cur / prev).ln());
    }

    let sd = sample_stddev(&returns)?;
    let hv = sd * ANNUALIZATION.sqrt() * 100.0;
    hv.is_finite().then_some(hv)
}
