//! Synthetic false-positive-rate calibration.
//!
//! Generates observation/model pairs with no comb in them, runs each through
//! residuals, the comb statistic and the Monte Carlo calibrator, and counts
//! how often `p < alpha`. A well-calibrated test rejects at about `alpha`.
//! These runs are always non-strict and never produce a confirmatory record.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

use crate::comb::{self, CombBasis};
use crate::config::{NullModel, Thresholds, WhiteningMode};
use crate::montecarlo::{self, trial_rng};
use crate::residuals::compute_residuals;
use comb_types::{PipelineError, Spectrum, Stage};

/// Stream reserved for synthetic data so it never overlaps null trials.
const SYNTHETIC_STREAM: u64 = u64::MAX;

/// First multipole of synthetic spectra.
const SYNTHETIC_ELL_MIN: u32 = 2;

/// Upper bounds on calibration size; both are allocated up front.
pub const MAX_CALIBRATION_TRIALS: u64 = 1_000_000;
pub const MAX_CALIBRATION_BINS: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    pub trials: u64,
    pub bins: u32,
    pub mc_samples: u64,
    pub seed: u64,
    pub alpha: f64,
    pub periods: Vec<f64>,
    pub null_model: NullModel,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            trials: 200,
            bins: 500,
            mc_samples: 199,
            seed: 0,
            alpha: 0.05,
            periods: vec![20.0, 40.0, 80.0],
            null_model: NullModel::Permute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub settings: CalibrationSettings,
    pub false_positives: u64,
    pub false_positive_rate: f64,
    /// Binomial standard error of the rate at `alpha`
    pub standard_error: f64,
    /// Rate within three standard errors of `alpha`
    pub within_tolerance: bool,
    pub p_values: Vec<f64>,
}

/// A smooth `Dl`-like model and a noisy draw around it, both with sigmas.
///
/// `bins` is capped at [`MAX_CALIBRATION_BINS`].
pub(crate) fn synthetic_pair(seed: u64, trial: u64, bins: u32) -> (Spectrum, Spectrum) {
    let mut rng = trial_rng(seed, SYNTHETIC_STREAM, trial);
    let end = SYNTHETIC_ELL_MIN.saturating_add(bins.min(MAX_CALIBRATION_BINS));
    let ells: Vec<u32> = (SYNTHETIC_ELL_MIN..end).collect();
    let model: Vec<f64> = ells
        .iter()
        .map(|&l| {
            let x = l as f64;
            5000.0 * (-x / 1500.0).exp() * (1.0 + 0.3 * (PI * x / 300.0).sin().powi(2)) + 100.0
        })
        .collect();
    let sigma: Vec<f64> = model.iter().map(|m| 0.02 * m + 5.0).collect();
    let observed: Vec<f64> = model
        .iter()
        .zip(&sigma)
        .map(|(m, s)| m + s * rng.sample::<f64, _>(StandardNormal))
        .collect();
    (
        Spectrum::from_columns(&ells, &model, Some(&sigma)),
        Spectrum::from_columns(&ells, &observed, Some(&sigma)),
    )
}

/// Run `settings.trials` synthetic null experiments.
pub fn run_calibration(settings: &CalibrationSettings) -> Result<CalibrationReport, PipelineError> {
    if settings.trials == 0 || settings.bins < 2 || settings.mc_samples == 0 {
        return Err(PipelineError::config(
            "calibration needs trials >= 1, bins >= 2 and mc_samples >= 1",
        ));
    }
    if !(settings.alpha > 0.0 && settings.alpha < 1.0) {
        return Err(PipelineError::config(format!(
            "alpha {} must be in (0, 1)",
            settings.alpha
        )));
    }
    if settings.trials > MAX_CALIBRATION_TRIALS || settings.bins > MAX_CALIBRATION_BINS {
        return Err(PipelineError::config(format!(
            "calibration is limited to {} trials and {} bins",
            MAX_CALIBRATION_TRIALS, MAX_CALIBRATION_BINS
        )));
    }
    if settings.periods.is_empty() {
        return Err(PipelineError::config("calibration needs at least one period"));
    }

    let thresholds = Thresholds::default();
    let ell_max = SYNTHETIC_ELL_MIN + (settings.bins - 1);
    let mut periods = settings.periods.clone();
    periods.sort_by(|a, b| a.total_cmp(b));

    let mut p_values = Vec::with_capacity(settings.trials as usize);
    for t in 0..settings.trials {
        let (model, observed) = synthetic_pair(settings.seed, t, settings.bins);
        let record = compute_residuals(
            &observed.ells(),
            &observed.values(),
            &model.values(),
            observed.sigmas().as_deref(),
            None,
            WhiteningMode::Diagonal,
            false,
            &thresholds,
        )?;
        let ells = record.ells();
        let residuals = record.residuals();
        let statistic =
            comb::score_candidates(&ells, &residuals, &periods, SYNTHETIC_ELL_MIN, ell_max)?;
        let basis = CombBasis::new(&ells, &periods);
        let calibration = montecarlo::calibrate(
            statistic.best_score,
            settings.seed.wrapping_add(t),
            0,
            settings.mc_samples,
            &basis,
            &residuals,
            settings.null_model,
        )?;
        debug!(trial = t, p_value = calibration.p_value, "Synthetic trial");
        p_values.push(calibration.p_value);
    }

    let false_positives = p_values.iter().filter(|&&p| p < settings.alpha).count() as u64;
    let rate = false_positives as f64 / settings.trials as f64;
    let standard_error = (settings.alpha * (1.0 - settings.alpha) / settings.trials as f64).sqrt();
    let within_tolerance = (rate - settings.alpha).abs() <= 3.0 * standard_error;
    if !rate.is_finite() {
        return Err(PipelineError::numerical(Stage::Verdict, "false-positive rate is not finite"));
    }

    info!(
        trials = settings.trials,
        false_positives,
        rate,
        alpha = settings.alpha,
        within_tolerance,
        "Calibration complete"
    );

    Ok(CalibrationReport {
        settings: settings.clone(),
        false_positives,
        false_positive_rate: rate,
        standard_error,
        within_tolerance,
        p_values,
    })
}
