//! Verdict combination and the run record.
//!
//! A [`VerdictRecord`] is written exactly once per run, whatever the outcome.
//! FAIL records carry the aborting stage and no statistical fields at all:
//! every p-value lives in an `Option` that is skipped when empty, so the key
//! never appears in the JSON of an aborted run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::comb::CombResult;
use crate::config::{CombinationRule, Thresholds, WhiteningMode};
use crate::montecarlo::NullCalibration;
use crate::residuals::{AppliedWhitening, ResidualRecord};
use comb_provenance::{ConsumedFile, LedgerRecord};
use comb_types::{PipelineError, RunWarning, Stage, Units, UnitsTag};

/// Combined outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Confirmed,
    Candidate,
    Null,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Confirmed => "CONFIRMED",
            Verdict::Candidate => "CANDIDATE",
            Verdict::Null => "NULL",
            Verdict::Fail => "FAIL",
        }
    }

    /// Whether the run completed; only FAIL exits non-zero.
    pub fn is_completed(&self) -> bool {
        !matches!(self, Verdict::Fail)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Residual aggregates kept in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualSummary {
    pub bins: usize,
    pub chi2: f64,
    pub dof: usize,
    pub chi2_per_dof: f64,
    pub median_abs_residual: f64,
    pub whitening: AppliedWhitening,
    pub sanity_checks_passed: bool,
    pub units_mismatch_warning: bool,
}

impl From<&ResidualRecord> for ResidualSummary {
    fn from(r: &ResidualRecord) -> Self {
        Self {
            bins: r.bins.len(),
            chi2: r.chi2,
            dof: r.dof,
            chi2_per_dof: r.chi2_per_dof,
            median_abs_residual: r.median_abs_residual,
            whitening: r.whitening,
            sanity_checks_passed: r.sanity_checks_passed,
            units_mismatch_warning: r.units_mismatch_warning,
        }
    }
}

/// Everything recorded about one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub ell_min: u32,
    pub ell_max: u32,
    pub p_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_units: Option<UnitsTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_units: Option<UnitsTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residuals: Option<ResidualSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistic: Option<CombResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<NullCalibration>,
}

impl DatasetOutcome {
    pub fn new(dataset: impl Into<String>, ell_min: u32, ell_max: u32, p_threshold: f64) -> Self {
        Self {
            dataset: dataset.into(),
            ell_min,
            ell_max,
            p_threshold,
            observation_units: None,
            model_units: None,
            residuals: None,
            statistic: None,
            calibration: None,
        }
    }

    pub fn p_value(&self) -> Option<f64> {
        self.calibration.as_ref().map(|c| c.p_value)
    }

    pub fn best_period(&self) -> Option<f64> {
        self.statistic.as_ref().map(|s| s.best_period)
    }

    /// p below this dataset's threshold. Missing p-values are not significant.
    pub fn is_significant(&self) -> bool {
        self.p_value().is_some_and(|p| p < self.p_threshold)
    }

    /// Remove every statistical result.
    pub fn strip_statistics(&mut self) {
        self.statistic = None;
        self.calibration = None;
    }
}

/// Exploratory free scan, reported next to but never inside the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploratoryResult {
    pub dataset: String,
    pub pre_registered: bool,
    pub scan: CombResult,
    /// Calibrated against the grid maximum, so already trials-corrected
    pub calibration: NullCalibration,
}

/// Where and why a run aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl FailureInfo {
    pub fn from_error(err: &PipelineError, dataset: Option<String>) -> Self {
        Self {
            stage: err.stage(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            dataset,
        }
    }
}

/// A manifest consulted by the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub entries: usize,
}

/// Inputs and settings that identify the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mc_samples: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitening: Option<WhiteningMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combination_rule: Option<CombinationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
    pub strict: bool,
    #[serde(default)]
    pub data_files: Vec<ConsumedFile>,
    #[serde(default)]
    pub manifests: Vec<ManifestRef>,
    /// Config fields replaced from the command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tool_version: String,
}

/// The immutable record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub run_id: String,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
    /// False when a non-strict sanity failure demoted the run
    pub eligible_for_confirmation: bool,
    pub provenance: Provenance,
    pub datasets: Vec<DatasetOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exploratory: Vec<ExploratoryResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl VerdictRecord {
    pub fn exit_code(&self) -> i32 {
        if self.verdict.is_completed() {
            0
        } else {
            1
        }
    }

    /// Units decided for `dataset`'s observation.
    pub fn observation_units(&self, dataset: &str) -> Option<Units> {
        self.datasets
            .iter()
            .find(|d| d.dataset == dataset)
            .and_then(|d| d.observation_units.as_ref())
            .map(|t| t.units)
    }
}

impl LedgerRecord for VerdictRecord {
    fn run_id(&self) -> String {
        self.run_id.clone()
    }

    fn verdict_tag(&self) -> String {
        self.verdict.to_string()
    }

    fn config_hash(&self) -> Option<String> {
        self.provenance.config_hash.clone()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Apply the pre-registered combination rule to completed datasets.
pub fn combine(outcomes: &[DatasetOutcome], rule: &CombinationRule, eligible: bool) -> Verdict {
    let CombinationRule::AllSignificantAgree { period_tolerance } = rule;

    let significant: Vec<&DatasetOutcome> =
        outcomes.iter().filter(|o| o.is_significant()).collect();
    if significant.is_empty() {
        return Verdict::Null;
    }
    if significant.len() < outcomes.len() {
        return Verdict::Candidate;
    }

    let periods: Vec<f64> = significant.iter().filter_map(|o| o.best_period()).collect();
    let lo = periods.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = periods.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let agree = periods.len() == significant.len() && hi - lo <= *period_tolerance;

    if agree && eligible {
        Verdict::Confirmed
    } else {
        Verdict::Candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comb::PeriodScore;
    use crate::config::NullModel;

    fn outcome(id: &str, threshold: f64, p: f64, period: f64) -> DatasetOutcome {
        let mut o = DatasetOutcome::new(id, 30, 2000, threshold);
        o.statistic = Some(CombResult {
            best_period: period,
            best_score: 12.0,
            scores: vec![PeriodScore {
                period,
                score: 12.0,
            }],
            bins_used: 1971,
            ell_min: 30,
            ell_max: 2000,
            pre_registered: true,
        });
        o.calibration = Some(NullCalibration {
            observed: 12.0,
            n_samples: 9999,
            exceed_count: ((p * 10000.0).round() as u64).saturating_sub(1),
            p_value: p,
            seed: 1,
            stream: 0,
            null_model: NullModel::Permute,
            ensemble_digest: "00".repeat(32),
        });
        o
    }

    fn rule() -> CombinationRule {
        CombinationRule::default()
    }

    #[test]
    fn test_all_significant_and_agreeing_is_confirmed() {
        let outcomes = vec![outcome("a", 0.01, 0.001, 42.0), outcome("b", 0.005, 0.002, 42.0)];
        assert_eq!(combine(&outcomes, &rule(), true), Verdict::Confirmed);
    }

    #[test]
    fn test_one_significant_is_candidate() {
        let outcomes = vec![outcome("a", 0.01, 1e-4, 42.0), outcome("b", 0.01, 0.919, 42.0)];
        assert_eq!(combine(&outcomes, &rule(), true), Verdict::Candidate);
        assert_eq!(outcomes[0].p_value(), Some(1e-4));
        assert_eq!(outcomes[1].p_value(), Some(0.919));
    }

    #[test]
    fn test_none_significant_is_null() {
        let outcomes = vec![outcome("a", 0.01, 0.3, 42.0), outcome("b", 0.01, 0.6, 84.0)];
        assert_eq!(combine(&outcomes, &rule(), true), Verdict::Null);
    }

    #[test]
    fn test_period_disagreement_and_tolerance() {
        let outcomes = vec![outcome("a", 0.01, 0.001, 42.0), outcome("b", 0.01, 0.001, 43.0)];
        assert_eq!(combine(&outcomes, &rule(), true), Verdict::Candidate);
        let loose = CombinationRule::AllSignificantAgree {
            period_tolerance: 1.0,
        };
        assert_eq!(combine(&outcomes, &loose, true), Verdict::Confirmed);
    }

    #[test]
    fn test_ineligible_run_cannot_confirm() {
        let outcomes = vec![outcome("a", 0.01, 0.001, 42.0)];
        assert_eq!(combine(&outcomes, &rule(), false), Verdict::Candidate);
    }

    #[test]
    fn test_fail_record_has_no_p_value() {
        let now = Utc::now();
        let err = PipelineError::Integrity {
            file: "planck_tt.txt".into(),
            expected: "aa".repeat(32),
            actual: "bb".repeat(32),
        };
        let mut partial = outcome("a", 0.01, 0.001, 42.0);
        partial.strip_statistics();
        let record = VerdictRecord {
            run_id: "r".into(),
            verdict: Verdict::Fail,
            created_at: now,
            eligible_for_confirmation: false,
            provenance: Provenance {
                experiment_id: Some("exp".into()),
                config_hash: Some("cc".repeat(32)),
                config_path: None,
                seed: Some(1),
                mc_samples: Some(100),
                whitening: None,
                combination_rule: None,
                thresholds: None,
                strict: true,
                data_files: Vec::new(),
                manifests: Vec::new(),
                overrides: Vec::new(),
                started_at: now,
                finished_at: now,
                tool_version: "test".into(),
            },
            datasets: vec![partial],
            exploratory: Vec::new(),
            warnings: Vec::new(),
            failure: Some(FailureInfo::from_error(&err, None)),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("p_value"));
        assert!(json.contains("\"FAIL\""));
        assert!(json.contains("integrity_error"));
        assert!(json.contains("planck_tt.txt"));
        assert_eq!(record.exit_code(), 1);

        let back: VerdictRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verdict, Verdict::Fail);
        assert_eq!(back.failure.unwrap().stage, Stage::Manifest);
    }
}
