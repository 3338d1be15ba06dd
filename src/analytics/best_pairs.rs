// =============================================================================
// Best-Pairs Classification & Ranking
// =============================================================================
//
// Every correlated pair falls into exactly one category, decided by the
// first matching rule (threshold defaults to 0.7):
//
//   rho <= -threshold        -> hedging
//   rho <  -0.4              -> negatively_correlated
//   |rho| < 0.4              -> uncorrelated
//   0.4 <= |rho| < threshold -> moderate
//   |rho| >= threshold       -> high_correlation
//
// Within a category, pairs rank by |rho| descending; ties break on
// (pair1, pair2) ascending so the ordering is fully deterministic.

use serde::{Deserialize, Serialize};

use crate::types::Instrument;

/// Boundary between "uncorrelated" and the directional categories.
const WEAK_BOUNDARY: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairCategory {
    Hedging,
    NegativelyCorrelated,
    Uncorrelated,
    Moderate,
    HighCorrelation,
}

impl PairCategory {
    /// All categories, in rule order.
    pub const ALL: [PairCategory; 5] = [
        Self::Hedging,
        Self::NegativelyCorrelated,
        Self::Uncorrelated,
        Self::Moderate,
        Self::HighCorrelation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hedging => "hedging",
            Self::NegativelyCorrelated => "negatively_correlated",
            Self::Uncorrelated => "uncorrelated",
            Self::Moderate => "moderate",
            Self::HighCorrelation => "high_correlation",
        }
    }

    /// Classify a correlation value. `threshold` is the configured high-
    /// correlation magnitude (0.7 by default); rules apply in order.
    pub fn classify(rho: f64, threshold: f64) -> Self {
        if rho <= -threshold {
            Self::Hedging
        } else if rho < -WEAK_BOUNDARY {
            Self::NegativelyCorrelated
        } else if rho.abs() < WEAK_BOUNDARY {
            Self::Uncorrelated
        } else if rho.abs() < threshold {
            Self::Moderate
        } else {
            Self::HighCorrelation
        }
    }
}

impl std::str::FromStr for PairCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hedging" => Ok(Self::Hedging),
            "negatively_correlated" => Ok(Self::NegativelyCorrelated),
            "uncorrelated" => Ok(Self::Uncorrelated),
            "moderate" => Ok(Self::Moderate),
            "high_correlation" => Ok(Self::HighCorrelation),
            other => Err(format!("unknown pair category: {other}")),
        }
    }
}

impl std::fmt::Display for PairCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, ranked correlation pair ready for persistence.
#[derive(Debug, Clone, Serialize)]
pub struct RankedPair {
    pub pair1: Instrument,
    pub pair2: Instrument,
    pub correlation: f64,
    pub category: PairCategory,
    /// 1-based rank within the category at this snapshot time.
    pub rank: i64,
    pub reason: String,
}

/// Classify every `(pair1, pair2, rho)` entry and rank it within its
/// category. Input pairs are expected canonically ordered (`pair1 < pair2`).
pub fn classify_and_rank(
    entries: &[(Instrument, Instrument, f64)],
    threshold: f64,
) -> Vec<RankedPair> {
    let mut ranked = Vec::with_capacity(entries.len());

    for category in PairCategory::ALL {
        let mut members: Vec<&(Instrument, Instrument, f64)> = entries
            .iter()
            .filter(|(_, _, rho)| PairCategory::classify(*rho, threshold) == category)
            .collect();

        members.sort_by(|a, b| {
            b.2.abs()
                .partial_cmp(&a.2.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (&a.0, &a.1).cmp(&(&b.0, &b.1)))
        });

        for (idx, (p1, p2, rho)) in members.into_iter().enumerate() {
            ranked.push(RankedPair {
                pair1: p1.clone(),
                pair2: p2.clone(),
                correlation: *rho,
                category,
                rank: idx as i64 + 1,
                reason: describe(p1, p2, *rho, category),
            });
        }
    }

    ranked
}

fn describe(p1: &Instrument, p2: &Instrument, rho: f64, category: PairCategory) -> String {
    match category {
        PairCategory::Hedging => format!(
            "{p1} and {p2} move strongly inversely (rho {rho:.3}); one can hedge the other"
        ),
        PairCategory::NegativelyCorrelated => {
            format!("{p1} and {p2} tend to move in opposite directions (rho {rho:.3})")
        }
        PairCategory::Uncorrelated => {
            format!("{p1} and {p2} show no meaningful linear relationship (rho {rho:.3})")
        }
        PairCategory::Moderate => {
            format!("{p1} and {p2} are moderately correlated (rho {rho:.3})")
        }
        PairCategory::HighCorrelation => format!(
            "{p1} and {p2} move almost in lockstep (rho {rho:.3}); avoid doubling exposure"
        ),
    }
}
