//! Run command - execute a pre-registered comb test

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;

use super::home::default_strict;
use super::output::{format_record, print_json};
use comb_core::config::{CombinationRule, DatasetConfig, NullModel, Thresholds, WhiteningMode};
use comb_core::{failure_record, pipeline, RunInputs, TestConfig, VerdictRecord};
use comb_provenance::paths::run_record_path;
use comb_provenance::Ledger;
use comb_types::PipelineError;

const DEFAULT_ELL_MIN: u32 = 2;
const DEFAULT_ELL_MAX: u32 = 5000;
const DEFAULT_P_THRESHOLD: f64 = 0.01;
const DEFAULT_MC_SAMPLES: u64 = 9999;

#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Pre-registration JSON. Relative paths inside resolve against its directory.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Observation spectrum (one dataset per file; flag-built runs only)
    #[arg(long = "obs")]
    pub observations: Vec<PathBuf>,

    /// Model/reference spectrum; one shared file or one per --obs
    #[arg(long = "model")]
    pub models: Vec<PathBuf>,

    /// Covariance matrix, one per --obs
    #[arg(long = "covariance")]
    pub covariances: Vec<PathBuf>,

    /// SHA-256 manifest (repeatable)
    #[arg(long = "manifest")]
    pub manifests: Vec<PathBuf>,

    /// Candidate period (repeatable; replaces the config's set)
    #[arg(long = "period")]
    pub periods: Vec<f64>,

    /// Monte Carlo sample count
    #[arg(long)]
    pub mc_samples: Option<u64>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Lower multipole bound for every dataset
    #[arg(long)]
    pub ell_min: Option<u32>,

    /// Upper multipole bound for every dataset
    #[arg(long)]
    pub ell_max: Option<u32>,

    /// Significance threshold for every dataset
    #[arg(long)]
    pub p_threshold: Option<f64>,

    /// Abort on data anomalies (default; also COMB_FORENSICS_STRICT)
    #[arg(long, overrides_with = "no_strict")]
    pub strict: bool,

    /// Demote data anomalies to warnings (synthetic calibration only)
    #[arg(long, overrides_with = "strict")]
    pub no_strict: bool,

    /// Experiment id for flag-built runs
    #[arg(long, default_value = "cli")]
    pub experiment_id: String,
}

impl RunCmd {
    fn strict_flag(&self) -> Option<bool> {
        match (self.strict, self.no_strict) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    pub fn execute(&self, ledger_dir: &Path, json_output: bool, verbose: bool) -> Result<i32> {
        let ledger = Ledger::open(ledger_dir)?;

        let record = match self.build_inputs() {
            Ok(inputs) => pipeline::run(&inputs),
            Err(err) => {
                // The record still goes into the ledger.
                let strict = self.strict_flag().unwrap_or_else(default_strict);
                failure_record(&err, self.config.clone(), strict, Vec::new())
            }
        };

        ledger
            .append(&record)
            .context("failed to write run record")?;
        let path = run_record_path(ledger.root(), &record.run_id);
        info!(run_id = %record.run_id, path = %path.display(), "Recorded");

        report(&record, &path, json_output, verbose)?;
        Ok(record.exit_code())
    }

    /// Config from file or flags, with overrides applied and listed.
    fn build_inputs(&self) -> Result<RunInputs, PipelineError> {
        let (mut config, base_dir) = match &self.config {
            Some(path) => {
                if !self.observations.is_empty() || !self.models.is_empty() {
                    return Err(PipelineError::config(
                        "use either --config or --obs/--model, not both",
                    ));
                }
                let config = TestConfig::load(path)?;
                let base = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (config, base)
            }
            None => (self.config_from_flags()?, PathBuf::from(".")),
        };

        let overrides = if self.config.is_some() {
            self.apply_overrides(&mut config)
        } else {
            Vec::new()
        };

        // Manifests are named relative to the working directory, not the config.
        let manifests = self.manifests.iter().map(|p| absolute(p)).collect();
        let mut inputs = RunInputs::new(config, base_dir).with_manifests(manifests);
        inputs.config_path = self.config.clone();
        inputs.overrides = overrides;
        Ok(inputs)
    }

    fn apply_overrides(&self, config: &mut TestConfig) -> Vec<String> {
        let mut overrides = Vec::new();
        if !self.periods.is_empty() {
            config.candidate_periods = self.periods.clone();
            overrides.push(format!("candidate_periods={:?}", self.periods));
        }
        if let Some(n) = self.mc_samples {
            config.mc_samples = n;
            overrides.push(format!("mc_samples={}", n));
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
            overrides.push(format!("seed={}", seed));
        }
        if let Some(strict) = self.strict_flag() {
            config.strict = strict;
            overrides.push(format!("strict={}", strict));
        }
        for ds in &mut config.datasets {
            if let Some(l) = self.ell_min {
                ds.ell_min = l;
            }
            if let Some(l) = self.ell_max {
                ds.ell_max = l;
            }
            if let Some(p) = self.p_threshold {
                ds.p_threshold = p;
            }
        }
        if let Some(l) = self.ell_min {
            overrides.push(format!("ell_min={}", l));
        }
        if let Some(l) = self.ell_max {
            overrides.push(format!("ell_max={}", l));
        }
        if let Some(p) = self.p_threshold {
            overrides.push(format!("p_threshold={}", p));
        }
        overrides
    }

    fn config_from_flags(&self) -> Result<TestConfig, PipelineError> {
        if self.observations.is_empty() {
            return Err(PipelineError::config("--config or at least one --obs is required"));
        }
        let n = self.observations.len();
        if self.models.len() != 1 && self.models.len() != n {
            return Err(PipelineError::config(format!(
                "need one shared --model or one per --obs ({} given for {} observations)",
                self.models.len(),
                n
            )));
        }
        if !self.covariances.is_empty() && self.covariances.len() != n {
            return Err(PipelineError::config(format!(
                "need one --covariance per --obs ({} given for {} observations)",
                self.covariances.len(),
                n
            )));
        }

        let datasets = self
            .observations
            .iter()
            .enumerate()
            .map(|(i, obs)| DatasetConfig {
                id: dataset_id(obs, i),
                observation: obs.clone(),
                model: self.models.get(i).unwrap_or(&self.models[0]).clone(),
                covariance: self.covariances.get(i).cloned(),
                ell_min: self.ell_min.unwrap_or(DEFAULT_ELL_MIN),
                ell_max: self.ell_max.unwrap_or(DEFAULT_ELL_MAX),
                p_threshold: self.p_threshold.unwrap_or(DEFAULT_P_THRESHOLD),
                model_units: None,
            })
            .collect();

        Ok(TestConfig {
            experiment_id: self.experiment_id.clone(),
            datasets,
            candidate_periods: self.periods.clone(),
            whitening: WhiteningMode::Auto,
            null_model: NullModel::Permute,
            mc_samples: self.mc_samples.unwrap_or(DEFAULT_MC_SAMPLES),
            seed: self.seed.unwrap_or(0),
            combination_rule: CombinationRule::default(),
            thresholds: Thresholds::default(),
            strict: self.strict_flag().unwrap_or_else(default_strict),
            exploratory_scan: None,
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// File stem, made unique by position when stems repeat.
fn dataset_id(path: &Path, index: usize) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| format!("{}-{}", index, s))
        .unwrap_or_else(|| format!("dataset-{}", index))
}

fn report(record: &VerdictRecord, path: &Path, json_output: bool, verbose: bool) -> Result<()> {
    if json_output {
        return print_json(record);
    }
    print!("{}", format_record(record, Some(path), verbose));
    if !record.verdict.is_completed() {
        eprintln!(
            "run {} aborted; no statistical result was produced",
            record.run_id
        );
    }
    Ok(())
}
