//! Units tag carried with every spectrum.
//!
//! Published spectra use two conventions that differ by a multipole-dependent
//! factor: `Cℓ` and `Dℓ = ℓ(ℓ+1)Cℓ / 2π`. Which one a file uses is often only
//! implied by a header keyword, so every spectrum carries a [`UnitsTag`]
//! recording what was decided and how.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Power spectrum convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Units {
    Cl,
    Dl,
    Unknown,
}

impl Units {
    /// Factor that converts a value in `self` units at `ell` into `target` units.
    ///
    /// Returns `None` when either side is [`Units::Unknown`].
    pub fn conversion_to(&self, target: Units, ell: u32) -> Option<f64> {
        match (self, target) {
            (Units::Cl, Units::Cl) | (Units::Dl, Units::Dl) => Some(1.0),
            (Units::Cl, Units::Dl) => Some(dl_factor(ell)),
            (Units::Dl, Units::Cl) => Some(1.0 / dl_factor(ell)),
            _ => None,
        }
    }

    /// The other convention.
    pub fn other(&self) -> Units {
        match self {
            Units::Cl => Units::Dl,
            Units::Dl => Units::Cl,
            Units::Unknown => Units::Unknown,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Cl => write!(f, "Cl"),
            Units::Dl => write!(f, "Dl"),
            Units::Unknown => write!(f, "Unknown"),
        }
    }
}

/// `ℓ(ℓ+1) / 2π`, the Cl → Dl factor.
pub fn dl_factor(ell: u32) -> f64 {
    let l = ell as f64;
    l * (l + 1.0) / (2.0 * std::f64::consts::PI)
}

/// How the units decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Header,
    MagnitudeHeuristic,
    Chi2Precheck,
}

/// How much the units decision can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Header keyword or explicit configuration, not cross-checked
    Declared,
    /// Cross-checked against a units-known reference
    Verified,
    /// Magnitude heuristic only
    Heuristic,
    /// No usable evidence
    Unresolved,
}

/// Units decision plus the audit trail behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitsTag {
    pub units: Units,
    pub method: ResolutionMethod,
    pub confidence: Confidence,
    /// Header keyword that seeded the guess
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_keyword: Option<String>,
    /// Units the header declared, kept even if the precheck overruled it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_units: Option<Units>,
    /// Median of values above the heuristic ℓ cut
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnitude_median: Option<f64>,
    /// 90th percentile of values above the heuristic ℓ cut
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnitude_p90: Option<f64>,
    /// chi²/dof against the reference when read as Cl
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chi2_per_dof_as_cl: Option<f64>,
    /// chi²/dof against the reference when read as Dl
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chi2_per_dof_as_dl: Option<f64>,
}

impl UnitsTag {
    pub fn declared(units: Units, keyword: Option<String>) -> Self {
        Self {
            units,
            method: ResolutionMethod::Header,
            confidence: Confidence::Declared,
            header_keyword: keyword,
            header_units: Some(units),
            magnitude_median: None,
            magnitude_p90: None,
            chi2_per_dof_as_cl: None,
            chi2_per_dof_as_dl: None,
        }
    }

    pub fn unresolved() -> Self {
        Self {
            units: Units::Unknown,
            method: ResolutionMethod::MagnitudeHeuristic,
            confidence: Confidence::Unresolved,
            header_keyword: None,
            header_units: None,
            magnitude_median: None,
            magnitude_p90: None,
            chi2_per_dof_as_cl: None,
            chi2_per_dof_as_dl: None,
        }
    }

    /// True when the units came from evidence stronger than the magnitude guess.
    pub fn is_trusted(&self) -> bool {
        matches!(self.confidence, Confidence::Declared | Confidence::Verified)
    }
}
