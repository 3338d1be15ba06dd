// =============================================================================
// Analytics Module
// =============================================================================
//
// Pure, deterministic, side-effect-free computations over candle sequences.
// Every public function returns `Option<T>` (or a coverage-gap Result) so
// callers are forced to handle insufficient-data and degenerate inputs;
// a metric that cannot be computed is omitted, never reported as zero.
//
// Inputs arrive oldest-first. Prices are parsed upstream into decimals;
// the statistics here run in f64 and results are rounded back to fixed-scale
// decimals at the persistence edge.

pub mod atr;
pub mod best_pairs;
pub mod bollinger;
pub mod correlation;
pub mod sma;
pub mod volatility;

/// Arithmetic mean of a non-empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (N-1 denominator). `None` for fewer than two
/// samples.
pub(crate) fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Population standard deviation (N denominator). `None` for an empty slice.
pub(crate) fn population_stddev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}
