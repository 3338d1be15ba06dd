// =============================================================================
// Average True Range
// =============================================================================
//
// True Range for each bar (needs the previous close):
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR(period) here is the plain arithmetic mean of the last `period` TR
// values — no Wilder smoothing — so a flat series reads exactly zero.

/// One bar of the fields ATR needs.
#[derive(Debug, Clone, Copy)]
pub struct AtrBar {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Compute ATR over the last `period` true ranges.
///
/// Returns `None` when:
/// - `period` is zero,
/// - fewer than `period + 1` bars are available (each TR needs a previous
///   close),
/// - any intermediate value is non-finite.
pub fn atr(bars: &[AtrBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = pair[1];
        let hl = bar.high - bar.low;
        let hc = (bar.high - prev_close).abs();
        let lc = (bar.low - prev_close).abs();
        let tr = hl.max(hc).max(lc);
        if !tr.is_finite() {
            return None;
        }
        true_ranges.push(tr);
    }

    let tail = &true_ranges[true_ranges.len() - period..];
    let value = tail.iter().sum::<f64>() / period as f64;
    value.is_finite().then_some(value)
}
