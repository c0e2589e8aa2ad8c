//! Comb test statistic.
//!
//! For a period `P` the score is the normalized matched-filter power
//!
//! ```text
//! S(P) = |Σᵢ rᵢ · exp(−2πi ℓᵢ / P)|² / n
//! ```
//!
//! over the residual bins inside the pre-registered ℓ range. It is defined for
//! any set of integer multipoles, so gaps in coverage need no special casing,
//! and under white N(0, 1) residuals it is ≈ Exp(1) at every period.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

use comb_types::{PipelineError, RunWarning, Stage, WarningKind};

/// Minimum fraction of integer multipoles in the range that must carry a bin
/// before coverage is reported as uneven.
const COVERAGE_WARN_FRACTION: f64 = 0.5;

/// Score at one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodScore {
    pub period: f64,
    pub score: f64,
}

/// Arg-max over a period set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombResult {
    pub best_period: f64,
    pub best_score: f64,
    pub scores: Vec<PeriodScore>,
    pub bins_used: usize,
    pub ell_min: u32,
    pub ell_max: u32,
    /// False for an exploratory grid
    pub pre_registered: bool,
}

/// Precomputed `cos`/`sin` tables for a fixed set of multipoles and periods.
///
/// Monte Carlo trials only change the residual values, so every trial reuses
/// the same basis.
#[derive(Debug, Clone)]
pub struct CombBasis {
    periods: Vec<f64>,
    n: usize,
    cos: Vec<f64>,
    sin: Vec<f64>,
}

impl CombBasis {
    /// `periods` are scored in the order given; callers sort them ascending so
    /// ties resolve to the smaller period.
    pub fn new(ells: &[u32], periods: &[f64]) -> Self {
        let n = ells.len();
        let mut cos = Vec::with_capacity(n * periods.len());
        let mut sin = Vec::with_capacity(n * periods.len());
        for &p in periods {
            for &ell in ells {
                let phase = 2.0 * PI * ell as f64 / p;
                cos.push(phase.cos());
                sin.push(phase.sin());
            }
        }
        Self {
            periods: periods.to_vec(),
            n,
            cos,
            sin,
        }
    }

    pub fn periods(&self) -> &[f64] {
        &self.periods
    }

    pub fn bins(&self) -> usize {
        self.n
    }

    /// Score at the period with index `k`.
    pub fn score_at(&self, k: usize, residuals: &[f64]) -> f64 {
        let row = k * self.n..(k + 1) * self.n;
        let (mut re, mut im) = (0.0, 0.0);
        for ((r, c), s) in residuals.iter().zip(&self.cos[row.clone()]).zip(&self.sin[row]) {
            re += r * c;
            im -= r * s;
        }
        (re * re + im * im) / self.n as f64
    }

    pub fn scores(&self, residuals: &[f64]) -> Vec<f64> {
        (0..self.periods.len())
            .map(|k| self.score_at(k, residuals))
            .collect()
    }

    /// Index and value of the maximum score; the first maximum wins ties.
    pub fn max(&self, residuals: &[f64]) -> (usize, f64) {
        let mut best = (0, f64::NEG_INFINITY);
        for k in 0..self.periods.len() {
            let s = self.score_at(k, residuals);
            if s > best.1 {
                best = (k, s);
            }
        }
        best
    }
}

/// Matched-filter power of `residuals` at a single period.
pub fn comb_power(ells: &[u32], residuals: &[f64], period: f64) -> f64 {
    CombBasis::new(ells, &[period]).score_at(0, residuals)
}

/// Bins whose multipole lies in `[ell_min, ell_max]`.
pub fn select_range(
    ells: &[u32],
    residuals: &[f64],
    ell_min: u32,
    ell_max: u32,
) -> (Vec<u32>, Vec<f64>) {
    ells.iter()
        .zip(residuals)
        .filter(|(l, _)| **l >= ell_min && **l <= ell_max)
        .map(|(&l, &r)| (l, r))
        .unzip()
}

fn score(
    ells: &[u32],
    residuals: &[f64],
    periods: &[f64],
    ell_min: u32,
    ell_max: u32,
    pre_registered: bool,
) -> Result<CombResult, PipelineError> {
    if periods.is_empty() {
        return Err(PipelineError::numerical(Stage::Statistic, "no periods to score"));
    }
    let (ells, residuals) = select_range(ells, residuals, ell_min, ell_max);
    if ells.is_empty() {
        return Err(PipelineError::numerical(
            Stage::Statistic,
            format!("no residual bins inside ell range [{}, {}]", ell_min, ell_max),
        ));
    }

    let mut sorted = periods.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let basis = CombBasis::new(&ells, &sorted);
    let scores = basis.scores(&residuals);
    let (best, best_score) = basis.max(&residuals);

    debug!(
        bins = ells.len(),
        periods = sorted.len(),
        best_period = sorted[best],
        best_score,
        pre_registered,
        "Comb statistic"
    );

    Ok(CombResult {
        best_period: sorted[best],
        best_score,
        scores: sorted
            .iter()
            .zip(scores)
            .map(|(&period, score)| PeriodScore { period, score })
            .collect(),
        bins_used: ells.len(),
        ell_min,
        ell_max,
        pre_registered,
    })
}

/// Score the pre-registered candidate periods.
pub fn score_candidates(
    ells: &[u32],
    residuals: &[f64],
    periods: &[f64],
    ell_min: u32,
    ell_max: u32,
) -> Result<CombResult, PipelineError> {
    score(ells, residuals, periods, ell_min, ell_max, true)
}

/// Score an unconstrained grid. The result is labeled non-pre-registered.
pub fn exploratory_scan(
    ells: &[u32],
    residuals: &[f64],
    grid: &[f64],
    ell_min: u32,
    ell_max: u32,
) -> Result<CombResult, PipelineError> {
    score(ells, residuals, grid, ell_min, ell_max, false)
}

/// Coverage warnings for the bins inside a range. Ranges are reported as
/// given, never narrowed.
pub fn coverage_warnings(
    dataset: &str,
    ells: &[u32],
    ell_min: u32,
    ell_max: u32,
    periods: &[f64],
) -> Vec<RunWarning> {
    let inside: Vec<u32> = ells
        .iter()
        .copied()
        .filter(|&l| l >= ell_min && l <= ell_max)
        .collect();
    let mut warnings = Vec::new();
    let (Some(&first), Some(&last)) = (inside.first(), inside.last()) else {
        return warnings;
    };

    let span = (last - first) as f64;
    let longest = periods.iter().copied().fold(0.0, f64::max);
    if span < longest {
        warnings.push(
            RunWarning::new(
                WarningKind::EllCoverage,
                Stage::Statistic,
                format!(
                    "covered ell span {}..{} is shorter than the longest candidate period {}",
                    first, last, longest
                ),
            )
            .for_dataset(dataset),
        );
    }

    let expected = (ell_max - ell_min + 1) as f64;
    let fraction = inside.len() as f64 / expected;
    if fraction < COVERAGE_WARN_FRACTION {
        warnings.push(
            RunWarning::new(
                WarningKind::EllCoverage,
                Stage::Statistic,
                format!(
                    "{} of {} multipoles in [{}, {}] carry a bin ({:.0}%)",
                    inside.len(),
                    expected,
                    ell_min,
                    ell_max,
                    fraction * 100.0
                ),
            )
            .for_dataset(dataset),
        );
    }
    warnings
}
