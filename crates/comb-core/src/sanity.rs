//! Sanity gate between residuals and statistics.
//!
//! A chi²/dof or median |residual| this far off means the inputs are not
//! comparable (wrong units, wrong file, wrong column), not that the sky has a
//! comb in it. Strict runs abort here; non-strict runs keep going with a
//! warning and lose confirmatory eligibility.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Thresholds;
use comb_types::{PipelineError, RunWarning, Stage, WarningKind};

/// Gate result for a run that was allowed to continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityOutcome {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
}

/// True when either aggregate crosses its catastrophic threshold.
pub fn is_catastrophic(
    chi2_per_dof: f64,
    median_abs_residual: f64,
    thresholds: &Thresholds,
) -> bool {
    !chi2_per_dof.is_finite()
        || !median_abs_residual.is_finite()
        || chi2_per_dof > thresholds.catastrophic_chi2_per_dof
        || median_abs_residual > thresholds.catastrophic_median_abs_residual
}

pub fn check(
    chi2_per_dof: f64,
    median_abs_residual: f64,
    strict: bool,
    thresholds: &Thresholds,
) -> Result<SanityOutcome, PipelineError> {
    if !is_catastrophic(chi2_per_dof, median_abs_residual, thresholds) {
        return Ok(SanityOutcome {
            passed: true,
            warnings: Vec::new(),
        });
    }

    let err = PipelineError::CatastrophicMismatch {
        chi2_per_dof,
        median_abs_residual,
        chi2_limit: thresholds.catastrophic_chi2_per_dof,
        residual_limit: thresholds.catastrophic_median_abs_residual,
    };
    if strict {
        return Err(err);
    }

    warn!(
        chi2_per_dof,
        median_abs_residual, "Sanity gate failed; run is not eligible for CONFIRMED"
    );
    Ok(SanityOutcome {
        passed: false,
        warnings: vec![RunWarning::new(
            WarningKind::SanityDemoted,
            Stage::Sanity,
            err.to_string(),
        )],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limits_passes() {
        let outcome = check(1.2, 0.8, true, &Thresholds::default()).unwrap();
        assert!(outcome.passed);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_strict_aborts() {
        let t = Thresholds::default();
        assert!(matches!(
            check(2e6, 1.0, true, &t),
            Err(PipelineError::CatastrophicMismatch { .. })
        ));
        assert!(check(1.0, 2e4, true, &t).is_err());
        assert!(check(f64::NAN, 1.0, true, &t).is_err());
    }

    #[test]
    fn test_non_strict_demotes() {
        let outcome = check(2e6, 1.0, false, &Thresholds::default()).unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.warnings[0].kind, WarningKind::SanityDemoted);
        assert!(outcome.warnings[0].message.contains("CatastrophicMismatchError"));
    }

    #[test]
    fn test_thresholds_are_overridable() {
        let t = Thresholds {
            catastrophic_chi2_per_dof: 10.0,
            ..Thresholds::default()
        };
        assert!(check(11.0, 1.0, true, &t).is_err());
        assert!(check(11.0, 1.0, true, &Thresholds::default()).is_ok());
    }
}
