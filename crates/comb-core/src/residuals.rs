//! Residuals and whitening.
//!
//! Diagonal whitening divides each bin by its sigma. Covariance whitening
//! factors `C = L Lᵀ` and solves `L r = (obs − model)` by forward
//! substitution, so correlated bins come out approximately i.i.d. N(0, 1)
//! under the null. A covariance that is not positive definite is a numerical
//! error; there is no fallback to the diagonal.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Thresholds, WhiteningMode};
use crate::sanity;
use crate::stats;
use comb_types::{Covariance, PipelineError, RunWarning, Stage};

/// Whitening actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedWhitening {
    Diagonal,
    Cholesky,
}

/// One standardized residual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualBin {
    pub ell: u32,
    pub residual: f64,
}

/// Standardized residuals plus the aggregates the sanity gate reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualRecord {
    pub bins: Vec<ResidualBin>,
    pub chi2: f64,
    pub dof: usize,
    pub chi2_per_dof: f64,
    pub median_abs_residual: f64,
    pub whitening: AppliedWhitening,
    pub sanity_checks_passed: bool,
    pub units_mismatch_warning: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
}

impl ResidualRecord {
    pub fn ells(&self) -> Vec<u32> {
        self.bins.iter().map(|b| b.ell).collect()
    }

    pub fn residuals(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.residual).collect()
    }
}

/// Lower-triangular Cholesky factor, row-major.
pub fn cholesky(cov: &Covariance) -> Result<Vec<f64>, PipelineError> {
    let n = cov.dim();
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = cov.get(i, j);
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return Err(PipelineError::numerical(
                        Stage::Residuals,
                        format!(
                            "covariance is not positive definite (pivot {} = {:e})",
                            i, sum
                        ),
                    ));
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Ok(l)
}

/// Solve `L x = b` for lower-triangular row-major `L`.
pub fn forward_substitute(l: &[f64], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut x = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * x[k];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Standardize `observed − model` and run the sanity gate.
///
/// `Auto` uses the covariance when one is given; `Covariance` requires one.
/// In strict mode a catastrophic mismatch is returned as an error; otherwise
/// the record comes back flagged.
#[allow(clippy::too_many_arguments)]
pub fn compute_residuals(
    ell: &[u32],
    observed: &[f64],
    model: &[f64],
    sigma: Option<&[f64]>,
    covariance: Option<&Covariance>,
    whitening: WhiteningMode,
    strict: bool,
    thresholds: &Thresholds,
) -> Result<ResidualRecord, PipelineError> {
    let n = ell.len();
    if n == 0 {
        return Err(PipelineError::numerical(
            Stage::Residuals,
            "no bins to compute residuals over",
        ));
    }
    if observed.len() != n || model.len() != n {
        return Err(PipelineError::numerical(
            Stage::Residuals,
            format!(
                "length mismatch: {} multipoles, {} observed, {} model",
                n,
                observed.len(),
                model.len()
            ),
        ));
    }

    let diff: Vec<f64> = observed.iter().zip(model).map(|(o, m)| o - m).collect();

    let use_covariance = match whitening {
        WhiteningMode::Diagonal => false,
        WhiteningMode::Covariance => {
            if covariance.is_none() {
                return Err(PipelineError::numerical(
                    Stage::Residuals,
                    "whitening mode 'covariance' needs a covariance matrix",
                ));
            }
            true
        }
        WhiteningMode::Auto => covariance.is_some(),
    };

    let (residuals, applied) = match covariance.filter(|_| use_covariance) {
        Some(cov) => {
            if cov.dim() != n {
                return Err(PipelineError::numerical(
                    Stage::Residuals,
                    format!("covariance is {}x{} but there are {} bins", cov.dim(), cov.dim(), n),
                ));
            }
            let l = cholesky(cov)?;
            (forward_substitute(&l, &diff), AppliedWhitening::Cholesky)
        }
        None => {
            let sigma = sigma.ok_or_else(|| {
                PipelineError::numerical(Stage::Residuals, "no per-bin sigma available")
            })?;
            if sigma.len() != n {
                return Err(PipelineError::numerical(
                    Stage::Residuals,
                    format!("{} sigmas for {} bins", sigma.len(), n),
                ));
            }
            if let Some((i, s)) = sigma.iter().enumerate().find(|(_, s)| !(**s > 0.0)) {
                return Err(PipelineError::numerical(
                    Stage::Residuals,
                    format!("sigma at ell={} is {} (must be positive)", ell[i], s),
                ));
            }
            let r = diff.iter().zip(sigma).map(|(d, s)| d / s).collect();
            (r, AppliedWhitening::Diagonal)
        }
    };

    let chi2: f64 = residuals.iter().map(|r| r * r).sum();
    let chi2_per_dof = chi2 / n as f64;
    let median_abs_residual = stats::median_abs(&residuals).unwrap_or(f64::NAN);

    debug!(bins = n, chi2_per_dof, median_abs_residual, whitening = ?applied, "Residuals computed");

    let outcome = sanity::check(chi2_per_dof, median_abs_residual, strict, thresholds)?;

    Ok(ResidualRecord {
        bins: ell
            .iter()
            .zip(&residuals)
            .map(|(&ell, &residual)| ResidualBin { ell, residual })
            .collect(),
        chi2,
        dof: n,
        chi2_per_dof,
        median_abs_residual,
        whitening: applied,
        sanity_checks_passed: outcome.passed,
        units_mismatch_warning: !outcome.passed,
        warnings: outcome.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bins(n: u32) -> (Vec<u32>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let ell: Vec<u32> = (2..2 + n).collect();
        let model: Vec<f64> = ell.iter().map(|&l| 1000.0 + l as f64).collect();
        let observed: Vec<f64> = model
            .iter()
            .enumerate()
            .map(|(i, m)| m + if i % 2 == 0 { 10.0 } else { -10.0 })
            .collect();
        let sigma = vec![10.0; n as usize];
        (ell, observed, model, sigma)
    }

    #[test]
    fn test_diagonal_whitening() {
        let (ell, obs, model, sigma) = bins(6);
        let rec = compute_residuals(
            &ell,
            &obs,
            &model,
            Some(&sigma),
            None,
            WhiteningMode::Auto,
            true,
            &Thresholds::default(),
        )
        .unwrap();
        assert_eq!(rec.whitening, AppliedWhitening::Diagonal);
        assert_eq!(rec.residuals(), vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0]);
        assert_eq!(rec.chi2_per_dof, 1.0);
        assert_eq!(rec.median_abs_residual, 1.0);
        assert!(rec.sanity_checks_passed);
        assert!(!rec.units_mismatch_warning);
    }

    #[test]
    fn test_diagonal_covariance_matches_diagonal_whitening() {
        let (ell, obs, model, sigma) = bins(5);
        let cov = Covariance::from_sigmas(&sigma);
        let t = Thresholds::default();
        let a = compute_residuals(
            &ell,
            &obs,
            &model,
            Some(&sigma),
            None,
            WhiteningMode::Diagonal,
            true,
            &t,
        )
        .unwrap();
        let b = compute_residuals(
            &ell,
            &obs,
            &model,
            None,
            Some(&cov),
            WhiteningMode::Covariance,
            true,
            &t,
        )
        .unwrap();
        assert_eq!(b.whitening, AppliedWhitening::Cholesky);
        for (x, y) in a.residuals().iter().zip(b.residuals()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let cov = Covariance::new(3, vec![4.0, 2.0, 0.4, 2.0, 5.0, 1.0, 0.4, 1.0, 3.0]).unwrap();
        let l = cholesky(&cov).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| l[i * 3 + k] * l[j * 3 + k]).sum();
                assert!((v - cov.get(i, j)).abs() < 1e-12);
            }
        }
        let x = forward_substitute(&l, &[2.0, 1.0, 0.0]);
        assert!((x[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_covariance_is_numerical_error() {
        let cov = Covariance::new(2, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let err = compute_residuals(
            &[2, 3],
            &[1.0, 2.0],
            &[0.0, 0.0],
            None,
            Some(&cov),
            WhiteningMode::Covariance,
            true,
            &Thresholds::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Numerical { stage: Stage::Residuals, .. }));
    }

    #[test]
    fn test_units_mismatch_strict_vs_non_strict() {
        let (ell, obs, model, sigma) = bins(20);
        let scaled: Vec<f64> = obs.iter().map(|v| v * 1e7).collect();
        let t = Thresholds::default();

        let run = |strict| {
            compute_residuals(
                &ell,
                &scaled,
                &model,
                Some(&sigma),
                None,
                WhiteningMode::Auto,
                strict,
                &t,
            )
        };
        let err = run(true).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::CatastrophicMismatch { chi2_per_dof, .. } if chi2_per_dof > 1e6
        ));

        let rec = run(false).unwrap();
        assert!(rec.chi2_per_dof > 1e6);
        assert!(rec.units_mismatch_warning);
        assert!(!rec.sanity_checks_passed);
        assert_eq!(rec.warnings.len(), 1);
    }

    #[test]
    fn test_rejects_bad_sigma_and_missing_inputs() {
        let t = Thresholds::default();
        let single = |sigma: Option<&[f64]>, mode| {
            compute_residuals(&[2], &[1.0], &[0.0], sigma, None, mode, true, &t)
        };
        assert!(single(Some(&[0.0]), WhiteningMode::Auto).is_err());
        assert!(single(None, WhiteningMode::Auto).is_err());
        assert!(single(Some(&[1.0]), WhiteningMode::Covariance).is_err());
        let empty = compute_residuals(&[], &[], &[], None, None, WhiteningMode::Auto, true, &t);
        assert!(empty.is_err());
    }
}
