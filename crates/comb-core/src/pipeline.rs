//! End-to-end forensic run.
//!
//! Stage order is fixed: config → manifests → load/units/residuals/sanity for
//! every dataset → comb statistic and Monte Carlo for every dataset →
//! exploratory scan → verdict. Nothing randomized starts until every dataset
//! has been loaded and checked. Any [`PipelineError`] turns the run into a
//! FAIL record with all statistical fields removed; [`run`] itself never
//! fails, so every run leaves a record behind.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::comb::{self, CombBasis};
use crate::config::{resolve_path, DatasetConfig, TestConfig};
use crate::loader::{self, UnitPatternTable};
use crate::montecarlo;
use crate::residuals::{compute_residuals, ResidualRecord};
use crate::units;
use crate::verdict::{
    combine, DatasetOutcome, ExploratoryResult, FailureInfo, ManifestRef, Provenance, Verdict,
    VerdictRecord,
};
use comb_provenance::manifest::{verify_consumed, ConsumedFile, ManifestSet};
use comb_types::encoding::sha256_file;
use comb_types::{PipelineError, RunWarning, Spectrum, Stage, UnitsTag, WarningKind};

pub const TOOL_VERSION: &str = concat!("comb-forensics ", env!("CARGO_PKG_VERSION"));

/// Everything a run needs besides the data on disk.
#[derive(Debug, Clone)]
pub struct RunInputs {
    /// The pre-registration record, paths as authored
    pub config: TestConfig,
    /// Directory relative config paths resolve against
    pub base_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub manifests: Vec<PathBuf>,
    /// Human-readable list of command-line overrides
    pub overrides: Vec<String>,
    pub patterns: UnitPatternTable,
}

impl RunInputs {
    pub fn new(config: TestConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
            config_path: None,
            manifests: Vec::new(),
            overrides: Vec::new(),
            patterns: UnitPatternTable::default(),
        }
    }

    pub fn with_manifests(mut self, manifests: Vec<PathBuf>) -> Self {
        self.manifests = manifests;
        self
    }
}

/// Residuals of one dataset, kept between the checking and statistics passes.
struct PreparedDataset {
    ells: Vec<u32>,
    residuals: Vec<f64>,
}

/// Mutable state threaded through the stages.
struct RunState {
    outcomes: Vec<DatasetOutcome>,
    prepared: Vec<PreparedDataset>,
    exploratory: Vec<ExploratoryResult>,
    warnings: Vec<RunWarning>,
    data_files: Vec<ConsumedFile>,
    manifests: Vec<ManifestRef>,
    eligible: bool,
    current_dataset: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            outcomes: Vec::new(),
            prepared: Vec::new(),
            exploratory: Vec::new(),
            warnings: Vec::new(),
            data_files: Vec::new(),
            manifests: Vec::new(),
            eligible: true,
            current_dataset: None,
        }
    }
}

/// Run the pipeline and return the record. Errors become FAIL records.
pub fn run(inputs: &RunInputs) -> VerdictRecord {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4().to_string();
    let config = &inputs.config;
    info!(
        run_id = %run_id,
        experiment = %config.experiment_id,
        datasets = config.datasets.len(),
        strict = config.strict,
        "Starting run"
    );

    let mut state = RunState::new();
    let outcome = execute(inputs, &mut state);

    let (verdict, failure) = match outcome {
        Ok(verdict) => (verdict, None),
        Err(err) => {
            warn!(stage = %err.stage(), kind = err.kind(), "Run aborted: {}", err);
            for o in &mut state.outcomes {
                o.strip_statistics();
            }
            state.exploratory.clear();
            (
                Verdict::Fail,
                Some(FailureInfo::from_error(&err, state.current_dataset.clone())),
            )
        }
    };

    let finished_at = Utc::now();
    info!(run_id = %run_id, verdict = %verdict, "Run finished");

    VerdictRecord {
        run_id,
        verdict,
        created_at: finished_at,
        eligible_for_confirmation: state.eligible && failure.is_none(),
        provenance: Provenance {
            experiment_id: Some(config.experiment_id.clone()),
            config_hash: Some(config.config_hash()),
            config_path: inputs.config_path.clone(),
            seed: Some(config.seed),
            mc_samples: Some(config.mc_samples),
            whitening: Some(config.whitening),
            combination_rule: Some(config.combination_rule.clone()),
            thresholds: Some(config.thresholds.clone()),
            strict: config.strict,
            data_files: state.data_files,
            manifests: state.manifests,
            overrides: inputs.overrides.clone(),
            started_at,
            finished_at,
            tool_version: TOOL_VERSION.to_string(),
        },
        datasets: state.outcomes,
        exploratory: state.exploratory,
        warnings: state.warnings,
        failure,
    }
}

/// FAIL record for a run that could not even assemble its inputs, such as an
/// unreadable config file.
pub fn failure_record(
    err: &PipelineError,
    config_path: Option<PathBuf>,
    strict: bool,
    overrides: Vec<String>,
) -> VerdictRecord {
    let now = Utc::now();
    VerdictRecord {
        run_id: Uuid::new_v4().to_string(),
        verdict: Verdict::Fail,
        created_at: now,
        eligible_for_confirmation: false,
        provenance: Provenance {
            experiment_id: None,
            config_hash: None,
            config_path,
            seed: None,
            mc_samples: None,
            whitening: None,
            combination_rule: None,
            thresholds: None,
            strict,
            data_files: Vec::new(),
            manifests: Vec::new(),
            overrides,
            started_at: now,
            finished_at: now,
            tool_version: TOOL_VERSION.to_string(),
        },
        datasets: Vec::new(),
        exploratory: Vec::new(),
        warnings: Vec::new(),
        failure: Some(FailureInfo::from_error(err, None)),
    }
}

fn execute(inputs: &RunInputs, state: &mut RunState) -> Result<Verdict, PipelineError> {
    let config = &inputs.config;
    config.validate()?;

    if !inputs.overrides.is_empty() {
        state.warnings.push(RunWarning::new(
            WarningKind::ConfigOverride,
            Stage::Config,
            format!(
                "pre-registered values overridden: {}",
                inputs.overrides.join(", ")
            ),
        ));
    }

    check_provenance(inputs, state)?;

    for ds in &config.datasets {
        state.current_dataset = Some(ds.id.clone());
        let (outcome, prepared) =
            prepare_dataset(inputs, ds, &state.data_files, &mut state.warnings)?;
        if let Some(r) = &outcome.residuals {
            if !r.sanity_checks_passed {
                state.eligible = false;
            }
        }
        state.outcomes.push(outcome);
        state.prepared.push(prepared);
    }
    state.current_dataset = None;

    let periods = config.sorted_periods();
    for (i, ds) in config.datasets.iter().enumerate() {
        state.current_dataset = Some(ds.id.clone());
        let prepared = &state.prepared[i];
        let statistic = comb::score_candidates(
            &prepared.ells,
            &prepared.residuals,
            &periods,
            ds.ell_min,
            ds.ell_max,
        )?;
        let basis = CombBasis::new(&prepared.ells, &periods);
        let calibration = montecarlo::calibrate(
            statistic.best_score,
            config.seed,
            i as u64,
            config.mc_samples,
            &basis,
            &prepared.residuals,
            config.null_model,
        )?;
        info!(
            dataset = %ds.id,
            best_period = statistic.best_period,
            score = statistic.best_score,
            p_value = calibration.p_value,
            threshold = ds.p_threshold,
            "Dataset statistic"
        );
        state.outcomes[i].statistic = Some(statistic);
        state.outcomes[i].calibration = Some(calibration);
    }

    if let Some(scan) = &config.exploratory_scan {
        let grid = scan.periods();
        let offset = config.datasets.len() as u64;
        for (i, ds) in config.datasets.iter().enumerate() {
            state.current_dataset = Some(ds.id.clone());
            let prepared = &state.prepared[i];
            let result = comb::exploratory_scan(
                &prepared.ells,
                &prepared.residuals,
                &grid,
                ds.ell_min,
                ds.ell_max,
            )?;
            let basis = CombBasis::new(&prepared.ells, &grid);
            let calibration = montecarlo::calibrate(
                result.best_score,
                config.seed,
                offset + i as u64,
                config.mc_samples,
                &basis,
                &prepared.residuals,
                config.null_model,
            )?;
            state.exploratory.push(ExploratoryResult {
                dataset: ds.id.clone(),
                pre_registered: false,
                scan: result,
                calibration,
            });
        }
    }
    state.current_dataset = None;

    Ok(combine(&state.outcomes, &config.combination_rule, state.eligible))
}

/// Manifest validation plus hash verification of every file the run reads.
fn check_provenance(inputs: &RunInputs, state: &mut RunState) -> Result<(), PipelineError> {
    let manifest_paths: Vec<PathBuf> = inputs
        .manifests
        .iter()
        .map(|p| resolve_path(&inputs.base_dir, p))
        .collect();
    let set = ManifestSet::load(&manifest_paths)?;
    for (path, named) in manifest_paths.iter().zip(set.iter()) {
        let (sha256, _) = sha256_file(path).map_err(|e| PipelineError::io(path, e))?;
        state.manifests.push(ManifestRef {
            name: named.name.clone(),
            path: path.clone(),
            sha256,
            entries: named.manifest.files.len(),
        });
    }
    let reports = set.validate_all()?;
    info!(
        manifests = reports.len(),
        files = reports.iter().map(|r| r.files.len()).sum::<usize>(),
        "Manifests validated"
    );

    let consumed = consumed_files(&inputs.config, &inputs.base_dir);
    let (files, warnings) = verify_consumed(&consumed, &set, inputs.config.strict)?;
    state.data_files = files;
    state.warnings.extend(warnings);
    Ok(())
}

/// Every input path of the config, resolved and de-duplicated in order.
pub fn consumed_files(config: &TestConfig, base_dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for ds in &config.datasets {
        let files = [Some(&ds.observation), Some(&ds.model), ds.covariance.as_ref()];
        for p in files.into_iter().flatten() {
            let resolved = resolve_path(base_dir, p);
            if !paths.contains(&resolved) {
                paths.push(resolved);
            }
        }
    }
    paths
}

/// The bytes just parsed must be the bytes hashed during the manifest stage.
fn ensure_verified(
    path: &Path,
    sha256: &str,
    verified: &[ConsumedFile],
) -> Result<(), PipelineError> {
    match verified.iter().find(|f| f.path == path) {
        Some(f) if f.sha256 == sha256 => Ok(()),
        Some(f) => Err(PipelineError::Integrity {
            file: path.to_path_buf(),
            expected: f.sha256.clone(),
            actual: sha256.to_string(),
        }),
        None => Err(PipelineError::MissingManifestEntry {
            file: path.to_path_buf(),
            sha256: sha256.to_string(),
        }),
    }
}

/// Units tag for the model file. The model is the units reference, so its
/// units must come from its header or the config, never from magnitudes.
fn model_units(
    path: &Path,
    ds: &DatasetConfig,
    header_tag: &UnitsTag,
) -> Result<UnitsTag, PipelineError> {
    match (ds.model_units, header_tag.is_trusted()) {
        (Some(configured), true) if configured != header_tag.units => {
            Err(PipelineError::UnitsResolution {
                file: path.to_path_buf(),
                message: format!(
                    "config declares model units {} but the header declares {}",
                    configured, header_tag.units
                ),
            })
        }
        (Some(configured), _) => Ok(UnitsTag {
            magnitude_median: header_tag.magnitude_median,
            magnitude_p90: header_tag.magnitude_p90,
            ..UnitsTag::declared(configured, header_tag.header_keyword.clone())
        }),
        (None, true) => Ok(header_tag.clone()),
        (None, false) => Err(PipelineError::UnitsResolution {
            file: path.to_path_buf(),
            message: format!(
                "model units are not declared (header guess {} is {:?}); \
                 add a Cl/Dl header keyword or set model_units",
                header_tag.units, header_tag.confidence
            ),
        }),
    }
}

fn prepare_dataset(
    inputs: &RunInputs,
    ds: &DatasetConfig,
    verified: &[ConsumedFile],
    warnings: &mut Vec<RunWarning>,
) -> Result<(DatasetOutcome, PreparedDataset), PipelineError> {
    let config = &inputs.config;
    let thresholds = &config.thresholds;
    let obs_path = resolve_path(&inputs.base_dir, &ds.observation);
    let model_path = resolve_path(&inputs.base_dir, &ds.model);
    let mut outcome = DatasetOutcome::new(&ds.id, ds.ell_min, ds.ell_max, ds.p_threshold);

    let obs = loader::load(&obs_path, &inputs.patterns, thresholds)?;
    let model = loader::load(&model_path, &inputs.patterns, thresholds)?;
    for (path, meta) in [(&obs_path, &obs.metadata), (&model_path, &model.metadata)] {
        ensure_verified(path, &meta.sha256, verified)?;
        if !meta.conflicting_keywords.is_empty() {
            warnings.push(
                RunWarning::new(
                    WarningKind::UnitsAmbiguity,
                    Stage::Units,
                    format!(
                        "{}: header names both conventions ({})",
                        path.display(),
                        meta.conflicting_keywords.join(", ")
                    ),
                )
                .for_dataset(&ds.id),
            );
        }
    }

    let mut obs_spectrum = obs.spectrum;
    if let Some(cov_path) = &ds.covariance {
        let cov_path = resolve_path(&inputs.base_dir, cov_path);
        let (cov, sha256) = loader::load_covariance(&cov_path)?;
        ensure_verified(&cov_path, &sha256, verified)?;
        if cov.dim() != obs_spectrum.len() {
            return Err(PipelineError::Parse {
                file: cov_path,
                line: None,
                message: format!(
                    "covariance is {}x{} but {} has {} rows",
                    cov.dim(),
                    cov.dim(),
                    obs_path.display(),
                    obs_spectrum.len()
                ),
            });
        }
        obs_spectrum = obs_spectrum.with_covariance(cov);
    }

    let model_tag = model_units(&model_path, ds, &model.units)?;
    outcome.model_units = Some(model_tag.clone());

    let (obs_tag, unit_warnings) = units::resolve(
        &obs_path,
        &obs.units,
        &obs_spectrum,
        Some((&model.spectrum, &model_tag)),
        thresholds,
    )?;
    warnings.extend(unit_warnings.into_iter().map(|w| w.for_dataset(&ds.id)));
    outcome.observation_units = Some(obs_tag.clone());

    let obs_in_model_units = units::convert(&obs_spectrum, obs_tag.units, model_tag.units)?;
    let record = residuals_for(ds, &obs_in_model_units, &model.spectrum, config)?;
    warnings.extend(record.warnings.iter().cloned().map(|w| w.for_dataset(&ds.id)));
    warnings.extend(comb::coverage_warnings(
        &ds.id,
        &record.ells(),
        ds.ell_min,
        ds.ell_max,
        &config.candidate_periods,
    ));

    info!(
        dataset = %ds.id,
        units = %obs_tag.units,
        reference_units = %model_tag.units,
        bins = record.dof,
        chi2_per_dof = record.chi2_per_dof,
        sanity = record.sanity_checks_passed,
        "Dataset checked"
    );
    outcome.residuals = Some((&record).into());
    Ok((
        outcome,
        PreparedDataset {
            ells: record.ells(),
            residuals: record.residuals(),
        },
    ))
}

/// Align observation and model on the shared multipoles inside the
/// pre-registered range, then compute residuals.
fn residuals_for(
    ds: &DatasetConfig,
    obs: &Spectrum,
    model: &Spectrum,
    config: &TestConfig,
) -> Result<ResidualRecord, PipelineError> {
    let mut ells = Vec::new();
    let mut obs_idx = Vec::new();
    let mut model_idx = Vec::new();
    for (i, p) in obs.points.iter().enumerate() {
        if !ds.contains_ell(p.ell) {
            continue;
        }
        if let Some(j) = model.index_of(p.ell) {
            ells.push(p.ell);
            obs_idx.push(i);
            model_idx.push(j);
        }
    }
    if ells.is_empty() {
        return Err(PipelineError::numerical(
            Stage::Residuals,
            format!(
                "dataset '{}': observation and model share no multipoles in [{}, {}]",
                ds.id, ds.ell_min, ds.ell_max
            ),
        ));
    }

    let observed: Vec<f64> = obs_idx.iter().map(|&i| obs.points[i].value).collect();
    let predicted: Vec<f64> = model_idx.iter().map(|&j| model.points[j].value).collect();
    let covariance = match &obs.covariance {
        Some(c) => Some(
            c.select(&obs_idx)
                .map_err(|e| PipelineError::numerical(Stage::Residuals, e.to_string()))?,
        ),
        None => None,
    };

    let obs_sigma =
        units::bin_sigmas(obs).map(|s| obs_idx.iter().map(|&i| s[i]).collect::<Vec<_>>());
    let sigma = obs_sigma.or_else(|| {
        model
            .sigmas()
            .map(|s| model_idx.iter().map(|&j| s[j]).collect())
    });

    compute_residuals(
        &ells,
        &observed,
        &predicted,
        sigma.as_deref(),
        covariance.as_ref(),
        config.whitening,
        config.strict,
        &config.thresholds,
    )
}
