//! Pre-registration record.
//!
//! A [`TestConfig`] is authored before any result is looked at. It fixes the
//! datasets and their ℓ ranges, the candidate periods, the whitening mode, the
//! Monte Carlo sample count and seed, the combination rule and every
//! threshold. The SHA-256 of its canonical JSON is the experiment's identity:
//! changing anything, including raising `mc_samples` after a near miss,
//! produces a different hash and therefore a different experiment.
//!
//! ```json
//! {
//!   "experiment_id": "comb-2025-a",
//!   "datasets": [
//!     {"id": "planck", "observation": "planck_tt.txt", "model": "lcdm_tt.txt",
//!      "ell_min": 30, "ell_max": 2000, "p_threshold": 0.001}
//!   ],
//!   "candidate_periods": [42.0, 84.0],
//!   "mc_samples": 10000,
//!   "seed": 20250301
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use comb_types::encoding::sha256_hex;
use comb_types::{PipelineError, Units};

/// Smallest period the comb statistic accepts; shorter periods alias on integer ℓ.
pub const MIN_PERIOD: f64 = 2.0;

/// Upper bound on exploratory grid size.
pub const MAX_SCAN_PERIODS: usize = 100_000;

/// Domain-calibrated safety margins. All overridable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// chi²/dof above this is a data/format incompatibility
    #[serde(default = "default_catastrophic_chi2_per_dof")]
    pub catastrophic_chi2_per_dof: f64,

    /// median|residual| above this is a data/format incompatibility
    #[serde(default = "default_catastrophic_median_abs_residual")]
    pub catastrophic_median_abs_residual: f64,

    /// Magnitude heuristic: median or p90 above this means Dl
    #[serde(default = "default_magnitude_cutoff")]
    pub magnitude_cutoff: f64,

    /// Magnitude heuristic only looks at ℓ above this
    #[serde(default = "default_magnitude_min_ell")]
    pub magnitude_min_ell: u32,

    /// Lower edge of the plausible chi²/dof band for units auto-resolution
    #[serde(default = "default_plausible_chi2_min")]
    pub plausible_chi2_min: f64,

    /// Upper edge of the plausible chi²/dof band for units auto-resolution
    #[serde(default = "default_plausible_chi2_max")]
    pub plausible_chi2_max: f64,
}

fn default_catastrophic_chi2_per_dof() -> f64 {
    1e6
}
fn default_catastrophic_median_abs_residual() -> f64 {
    1e4
}
fn default_magnitude_cutoff() -> f64 {
    100.0
}
fn default_magnitude_min_ell() -> u32 {
    30
}
fn default_plausible_chi2_min() -> f64 {
    1.0
}
fn default_plausible_chi2_max() -> f64 {
    100.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            catastrophic_chi2_per_dof: default_catastrophic_chi2_per_dof(),
            catastrophic_median_abs_residual: default_catastrophic_median_abs_residual(),
            magnitude_cutoff: default_magnitude_cutoff(),
            magnitude_min_ell: default_magnitude_min_ell(),
            plausible_chi2_min: default_plausible_chi2_min(),
            plausible_chi2_max: default_plausible_chi2_max(),
        }
    }
}

/// How residuals are standardized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteningMode {
    /// Divide by per-bin sigma
    Diagonal,
    /// Multiply by the inverse Cholesky factor; covariance required
    Covariance,
    /// Covariance when one is supplied, otherwise diagonal
    #[default]
    Auto,
}

/// How null realizations are generated from the observed residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullModel {
    /// Shuffle residuals across bins (preserves the marginal exactly)
    #[default]
    Permute,
    /// Flip residual signs at random (preserves per-bin magnitude)
    SignFlip,
    /// Draw i.i.d. standard normal residuals
    Gaussian,
}

/// Rule combining per-dataset results into a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CombinationRule {
    /// CONFIRMED needs every dataset significant with best periods agreeing
    /// within `period_tolerance`.
    AllSignificantAgree {
        #[serde(default)]
        period_tolerance: f64,
    },
}

impl Default for CombinationRule {
    fn default() -> Self {
        CombinationRule::AllSignificantAgree {
            period_tolerance: 0.0,
        }
    }
}

/// Unconstrained period grid, reported separately and never used for the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploratoryScan {
    pub min_period: f64,
    pub max_period: f64,
    pub step: f64,
}

impl ExploratoryScan {
    /// Grid size, or `None` when it is not finite or exceeds [`MAX_SCAN_PERIODS`].
    pub fn grid_len(&self) -> Option<usize> {
        let span = ((self.max_period - self.min_period) / self.step).floor();
        if !span.is_finite() || span < 0.0 || span + 1.0 > MAX_SCAN_PERIODS as f64 {
            return None;
        }
        Some(span as usize + 1)
    }

    /// Periods from `min_period` to `max_period` inclusive; empty for an unbounded grid.
    pub fn periods(&self) -> Vec<f64> {
        let n = self.grid_len().unwrap_or(0);
        (0..n)
            .map(|i| self.min_period + i as f64 * self.step)
            .collect()
    }
}

/// One dataset of the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    /// Observed spectrum file
    pub observation: PathBuf,
    /// Model spectrum file; doubles as the units-known reference
    pub model: PathBuf,
    /// Optional full covariance of the observation, in file row order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance: Option<PathBuf>,
    /// Inclusive pre-registered ℓ range
    pub ell_min: u32,
    pub ell_max: u32,
    /// Significance threshold for this dataset
    pub p_threshold: f64,
    /// Units of the model file when its header does not declare them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_units: Option<Units>,
}

impl DatasetConfig {
    pub fn contains_ell(&self, ell: u32) -> bool {
        ell >= self.ell_min && ell <= self.ell_max
    }
}

fn default_strict() -> bool {
    true
}

/// The pre-registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub experiment_id: String,
    pub datasets: Vec<DatasetConfig>,
    pub candidate_periods: Vec<f64>,
    #[serde(default)]
    pub whitening: WhiteningMode,
    #[serde(default)]
    pub null_model: NullModel,
    pub mc_samples: u64,
    pub seed: u64,
    #[serde(default)]
    pub combination_rule: CombinationRule,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploratory_scan: Option<ExploratoryScan>,
}

impl TestConfig {
    /// Load a config file. Paths inside stay as authored.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| PipelineError::Parse {
            file: path.to_path_buf(),
            line: Some(e.line()),
            message: format!("invalid pre-registration JSON: {}", e),
        })
    }

    /// SHA-256 of the canonical JSON encoding.
    pub fn config_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Reject records that cannot define a well-posed test.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let err = |m: String| Err(PipelineError::config(m));

        if self.experiment_id.trim().is_empty() {
            return err("experiment_id must not be empty".into());
        }
        if self.datasets.is_empty() {
            return err("at least one dataset is required".into());
        }
        let mut ids = HashSet::new();
        for ds in &self.datasets {
            if !ids.insert(ds.id.as_str()) {
                return err(format!("duplicate dataset id '{}'", ds.id));
            }
            if ds.ell_min == 0 || ds.ell_min > ds.ell_max {
                return err(format!(
                    "dataset '{}': invalid ell range [{}, {}]",
                    ds.id, ds.ell_min, ds.ell_max
                ));
            }
            if !(ds.p_threshold > 0.0 && ds.p_threshold < 1.0) {
                return err(format!(
                    "dataset '{}': p_threshold {} must be in (0, 1)",
                    ds.id, ds.p_threshold
                ));
            }
            if ds.model_units == Some(Units::Unknown) {
                return err(format!("dataset '{}': model_units cannot be Unknown", ds.id));
            }
        }

        if self.candidate_periods.is_empty() {
            return err("candidate_periods must list at least one period".into());
        }
        for (i, p) in self.candidate_periods.iter().enumerate() {
            if !p.is_finite() || *p < MIN_PERIOD {
                return err(format!(
                    "candidate period {} must be finite and >= {}",
                    p, MIN_PERIOD
                ));
            }
            if self.candidate_periods[..i].contains(p) {
                return err(format!("candidate period {} listed twice", p));
            }
        }

        if self.mc_samples == 0 {
            return err("mc_samples must be at least 1".into());
        }

        let CombinationRule::AllSignificantAgree { period_tolerance } = &self.combination_rule;
        if !period_tolerance.is_finite() || *period_tolerance < 0.0 {
            return err(format!(
                "period_tolerance {} must be finite and non-negative",
                period_tolerance
            ));
        }

        let t = &self.thresholds;
        for (name, v) in [
            ("catastrophic_chi2_per_dof", t.catastrophic_chi2_per_dof),
            (
                "catastrophic_median_abs_residual",
                t.catastrophic_median_abs_residual,
            ),
            ("magnitude_cutoff", t.magnitude_cutoff),
            ("plausible_chi2_min", t.plausible_chi2_min),
            ("plausible_chi2_max", t.plausible_chi2_max),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return err(format!("threshold {} = {} must be positive", name, v));
            }
        }
        if t.plausible_chi2_min >= t.plausible_chi2_max {
            return err("plausible_chi2_min must be below plausible_chi2_max".into());
        }

        if let Some(scan) = &self.exploratory_scan {
            if !(scan.min_period >= MIN_PERIOD
                && scan.max_period > scan.min_period
                && scan.step > 0.0
                && scan.max_period.is_finite())
            {
                return err(format!(
                    "exploratory_scan needs {} <= min_period < max_period and step > 0",
                    MIN_PERIOD
                ));
            }
            if scan.grid_len().is_none() {
                return err(format!(
                    "exploratory_scan grid exceeds {} periods",
                    MAX_SCAN_PERIODS
                ));
            }
        }
        Ok(())
    }

    /// Candidate periods in ascending order.
    pub fn sorted_periods(&self) -> Vec<f64> {
        let mut periods = self.candidate_periods.clone();
        periods.sort_by(|a, b| a.total_cmp(b));
        periods
    }
}

/// Resolve a path from the config relative to `base_dir`.
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
