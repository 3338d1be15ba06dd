// =============================================================================
// Scheduled Jobs
// =============================================================================
//
// Two jobs drive the pipeline: the hourly ingest (fetch + derive + persist +
// cache + publish) and the daily correlation pass (matrix + ranking). Both
// are plain async functions over shared handles; the scheduler wraps them
// with job-log tracking and deadlines.

pub mod daily_correlation;
pub mod hourly;

use crate::types::Severity;

pub use daily_correlation::{DailyCorrelationJob, DAILY_JOB_NAME};
pub use hourly::{HourlyJob, HOURLY_JOB_NAME};

/// What a completed job reports back to the scheduler for the job log.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub records_processed: i64,
    /// Partial-coverage or other advisory note, recorded alongside a
    /// successful status.
    pub note: Option<String>,
}

/// Severity of a volatility alert, by how far hv20 exceeds the threshold.
pub fn volatility_severity(hv: f64, threshold: f64) -> Severity {
    let ratio = if threshold > 0.0 { hv / threshold } else { f64::INFINITY };
    if ratio >= 1.5 {
        Severity::Critical
    } else if ratio >= 1.2 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Severity of a correlation alert, by correlation magnitude.
pub fn correlation_severity(rho: f64) -> Severity {
    let magnitude = rho.abs();
    if magnitude >= 0.9 {
        Severity::Critical
    } else if magnitude >= 0.8 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatility_severity_scales_with_excess() {
        // 2.45 against a 2.0 threshold is a warning, not an info note.
        assert_eq!(volatility_severity(2.45, 2.0), Severity::Warning);
        assert_eq!(volatility_severity(2.1, 2.0), Severity::Info);
        assert_eq!(volatility_severity(3.1, 2.0), Severity::Critical);
    }

    #[test]
    fn correlation_severity_by_magnitude() {
        assert_eq!(correlation_severity(0.72), Severity::Info);
        assert_eq!(correlation_severity(-0.85), Severity::Warning);
        assert_eq!(correlation_severity(0.95), Severity::Critical);
        assert_eq!(correlation_severity(-0.99), Severity::Critical);
    }
}
