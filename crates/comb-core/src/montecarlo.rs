//! Monte Carlo null calibration.
//!
//! Each trial is a pure function of `(seed, stream, index)`: a `ChaCha8Rng`
//! seeded from the pre-registered seed, on the dataset's stream, positioned at
//! a word offset derived from the trial index. Trials can therefore run in any
//! order on any number of threads and still yield the same ensemble, and the
//! exceedance count is a commutative reduction over it.
//!
//! The statistic of a trial is the maximum score over the same period set as
//! the observed statistic, so scanning several candidate periods is paid for
//! in the p-value.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::comb::CombBasis;
use crate::config::NullModel;
use comb_types::encoding::sha256_f64s;
use comb_types::{PipelineError, Stage};

/// Word offset between consecutive trials (2³² words of keystream each).
const TRIAL_WORD_SHIFT: u32 = 32;

/// Null calibration of one observed statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullCalibration {
    pub observed: f64,
    pub n_samples: u64,
    pub exceed_count: u64,
    pub p_value: f64,
    pub seed: u64,
    pub stream: u64,
    pub null_model: NullModel,
    /// SHA-256 of the ensemble as little-endian f64s in trial order
    pub ensemble_digest: String,
}

/// Generator for trial `index`.
pub fn trial_rng(seed: u64, stream: u64, index: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng.set_word_pos((index as u128) << TRIAL_WORD_SHIFT);
    rng
}

/// One null realization of `residuals`.
pub fn null_realization(
    residuals: &[f64],
    null_model: NullModel,
    rng: &mut ChaCha8Rng,
) -> Vec<f64> {
    match null_model {
        NullModel::Permute => {
            let mut shuffled = residuals.to_vec();
            shuffled.shuffle(rng);
            shuffled
        }
        NullModel::SignFlip => residuals
            .iter()
            .map(|r| if rng.gen::<bool>() { *r } else { -*r })
            .collect(),
        NullModel::Gaussian => (0..residuals.len())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect(),
    }
}

/// Maximum comb score of null realization `index`.
pub fn trial(
    seed: u64,
    stream: u64,
    index: u64,
    basis: &CombBasis,
    residuals: &[f64],
    null_model: NullModel,
) -> f64 {
    let mut rng = trial_rng(seed, stream, index);
    let realization = null_realization(residuals, null_model, &mut rng);
    basis.max(&realization).1
}

/// Null ensemble in trial order, computed in parallel.
pub fn null_ensemble(
    seed: u64,
    stream: u64,
    n_samples: u64,
    basis: &CombBasis,
    residuals: &[f64],
    null_model: NullModel,
) -> Vec<f64> {
    (0..n_samples)
        .into_par_iter()
        .map(|i| trial(seed, stream, i, basis, residuals, null_model))
        .collect()
}

/// Same ensemble computed on the calling thread.
pub fn null_ensemble_sequential(
    seed: u64,
    stream: u64,
    n_samples: u64,
    basis: &CombBasis,
    residuals: &[f64],
    null_model: NullModel,
) -> Vec<f64> {
    (0..n_samples)
        .map(|i| trial(seed, stream, i, basis, residuals, null_model))
        .collect()
}

/// `(#{null ≥ observed} + 1) / (N + 1)`.
pub fn p_value(observed: f64, ensemble: &[f64]) -> (u64, f64) {
    let exceed = ensemble.iter().filter(|&&s| s >= observed).count() as u64;
    let p = (exceed + 1) as f64 / (ensemble.len() as u64 + 1) as f64;
    (exceed, p)
}

/// Calibrate `observed` against `n_samples` null realizations.
pub fn calibrate(
    observed: f64,
    seed: u64,
    stream: u64,
    n_samples: u64,
    basis: &CombBasis,
    residuals: &[f64],
    null_model: NullModel,
) -> Result<NullCalibration, PipelineError> {
    if n_samples == 0 {
        return Err(PipelineError::numerical(
            Stage::MonteCarlo,
            "Monte Carlo sample count must be at least 1",
        ));
    }
    if !observed.is_finite() {
        return Err(PipelineError::numerical(
            Stage::MonteCarlo,
            format!("observed statistic is not finite ({})", observed),
        ));
    }

    let ensemble = null_ensemble(seed, stream, n_samples, basis, residuals, null_model);
    if let Some(i) = ensemble.iter().position(|s| !s.is_finite()) {
        return Err(PipelineError::numerical(
            Stage::MonteCarlo,
            format!("null trial {} produced a non-finite statistic", i),
        ));
    }
    let (exceed_count, p) = p_value(observed, &ensemble);
    let ensemble_digest = sha256_f64s(&ensemble);

    info!(
        stream,
        n_samples,
        exceed_count,
        p_value = p,
        digest = %&ensemble_digest[..16],
        "Null calibration complete"
    );

    Ok(NullCalibration {
        observed,
        n_samples,
        exceed_count,
        p_value: p,
        seed,
        stream,
        null_model,
        ensemble_digest,
    })
}
