//! Forensic comb test for angular power spectra.
//!
//! The crate is organized by pipeline stage:
//! - [`config`]: the pre-registration record and its hash
//! - [`loader`]: spectrum and covariance files, header keyword table
//! - [`units`]: Cl/Dl resolution with an audit trail
//! - [`residuals`] and [`sanity`]: whitening and the catastrophic-mismatch gate
//! - [`comb`]: the matched-filter statistic
//! - [`montecarlo`]: seeded, order-independent null calibration
//! - [`verdict`]: combination rule and the immutable run record
//! - [`pipeline`]: the stages wired together
//! - [`calibration`]: synthetic false-positive-rate runs

pub mod calibration;
pub mod comb;
pub mod config;
pub mod loader;
pub mod montecarlo;
pub mod pipeline;
pub mod residuals;
pub mod sanity;
pub mod stats;
pub mod units;
pub mod verdict;

pub use calibration::{run_calibration, CalibrationReport, CalibrationSettings};
pub use comb::{score_candidates, CombBasis, CombResult};
pub use config::{
    CombinationRule, DatasetConfig, ExploratoryScan, NullModel, TestConfig, Thresholds,
    WhiteningMode,
};
pub use loader::{LoadedSpectrum, UnitPatternTable};
pub use montecarlo::NullCalibration;
pub use pipeline::{failure_record, run, RunInputs, TOOL_VERSION};
pub use residuals::{compute_residuals, ResidualRecord};
pub use sanity::SanityOutcome;
pub use verdict::{combine, DatasetOutcome, Verdict, VerdictRecord};
