// =============================================================================
// Shared types used across the Meridian FX engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// An instrument identifier from the tracked universe, e.g. `EUR_USD` or
/// `XAU_USD`. Case-sensitive; the broker expects the exact spelling.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    /// Validate and wrap an instrument identifier.
    ///
    /// Accepted shape: two non-empty uppercase alphanumeric legs joined by a
    /// single underscore (`EUR_USD`, `XAU_USD`, `SPX500_USD`).
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        {
            let mut parts = raw.split('_');
            let (Some(base), Some(quote)) = (parts.next(), parts.next()) else {
                return None;
            };
            if parts.next().is_some() || base.is_empty() || quote.is_empty() {
                return None;
            }
            let leg_ok = |s: &str| {
                s.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            };
            if !leg_ok(base) || !leg_ok(quote) {
                return None;
            }
        }
        Some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Asset class derived from the identifier. Spot-metal codes (XAU, XAG)
    /// on either leg classify as Metal; two ISO three-letter currency legs
    /// classify as FX; anything else (indices, commodities) is a CFD.
    pub fn asset_class(&self) -> AssetClass {
        let mut parts = self.0.split('_');
        let base = parts.next().unwrap_or_default();
        let quote = parts.next().unwrap_or_default();

        const METALS: [&str; 2] = ["XAU", "XAG"];
        if METALS.contains(&base) || METALS.contains(&quote) {
            return AssetClass::Metal;
        }

        let is_ccy = |s: &str| s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase());
        if is_ccy(base) && is_ccy(quote) {
            AssetClass::Fx
        } else {
            AssetClass::Cfd
        }
    }
}

impl std::fmt::Display for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad asset grouping. Only FX and Metal instruments enter the correlation
/// matrix; CFDs are ingested but excluded from pairwise statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetClass {
    Fx,
    Metal,
    Cfd,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fx => "FX",
            Self::Metal => "METAL",
            Self::Cfd => "CFD",
        }
    }

    /// Whether instruments of this class participate in correlation runs.
    pub fn correlates(&self) -> bool {
        matches!(self, Self::Fx | Self::Metal)
    }
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle time-bucket size. H1 is the primary ingestion granularity; the
/// remaining variants exist so stored rows and broker requests can name any
/// bucket the upstream API supports.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D,
    W,
    M,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D => "D",
            Self::W => "W",
            Self::M => "M",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M1" => Ok(Self::M1),
            "M5" => Ok(Self::M5),
            "M15" => Ok(Self::M15),
            "M30" => Ok(Self::M30),
            "H1" => Ok(Self::H1),
            "H4" => Ok(Self::H4),
            "D" => Ok(Self::D),
            "W" => Ok(Self::W),
            "M" => Ok(Self::M),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity carried on volatility and correlation bus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
