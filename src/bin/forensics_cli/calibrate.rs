//! Calibrate command - false-positive rate on synthetic null spectra

use anyhow::Result;
use clap::{Parser, ValueEnum};

use super::output::print_json;
use comb_core::config::NullModel;
use comb_core::{run_calibration, CalibrationSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum NullModelArg {
    Permute,
    SignFlip,
    Gaussian,
}

impl From<NullModelArg> for NullModel {
    fn from(arg: NullModelArg) -> Self {
        match arg {
            NullModelArg::Permute => NullModel::Permute,
            NullModelArg::SignFlip => NullModel::SignFlip,
            NullModelArg::Gaussian => NullModel::Gaussian,
        }
    }
}

#[derive(Parser, Debug)]
pub struct CalibrateCmd {
    /// Number of synthetic experiments
    #[arg(long, default_value_t = 200)]
    pub trials: u64,

    /// Multipole bins per synthetic spectrum
    #[arg(long, default_value_t = 500)]
    pub bins: u32,

    /// Null realizations per experiment
    #[arg(long, default_value_t = 199)]
    pub mc_samples: u64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Nominal false-positive rate
    #[arg(long, default_value_t = 0.05)]
    pub alpha: f64,

    /// Candidate period (repeatable)
    #[arg(long = "period")]
    pub periods: Vec<f64>,

    #[arg(long, value_enum, default_value = "permute")]
    pub null_model: NullModelArg,
}

impl CalibrateCmd {
    pub fn execute(&self, json_output: bool) -> Result<i32> {
        let defaults = CalibrationSettings::default();
        let settings = CalibrationSettings {
            trials: self.trials,
            bins: self.bins,
            mc_samples: self.mc_samples,
            seed: self.seed,
            alpha: self.alpha,
            periods: if self.periods.is_empty() {
                defaults.periods
            } else {
                self.periods.clone()
            },
            null_model: self.null_model.into(),
        };

        let report = run_calibration(&settings)?;
        if json_output {
            print_json(&report)?;
        } else {
            let status = if report.within_tolerance {
                "\x1b[32mwithin tolerance\x1b[0m"
            } else {
                "\x1b[31mOUT OF TOLERANCE\x1b[0m"
            };
            println!(
                "False-positive rate: {:.4} ({} of {} trials at alpha = {})",
                report.false_positive_rate,
                report.false_positives,
                settings.trials,
                settings.alpha
            );
            println!(
                "Expected {:.4} ± {:.4} (3σ band): {}",
                settings.alpha,
                3.0 * report.standard_error,
                status
            );
        }
        Ok(if report.within_tolerance { 0 } else { 1 })
    }
}
