// =============================================================================
// Simple Moving Average
// =============================================================================

use super::mean;

/// Arithmetic mean of the last `window` closes.
///
/// Returns `None` when `window` is zero or there are fewer than `window`
/// samples; a short series never silently averages what it has.
pub fn sma(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let value = mean(&closes[closes.len() - window..]);
    value.is_finite().then_some(value)
}
