//! Stage-based error taxonomy for the forensic pipeline.
//!
//! The pipeline processes in order:
//! Config -> Manifest -> Load -> Units -> Residuals -> Sanity -> Statistic -> MonteCarlo -> Verdict
//!
//! Every fatal condition is a [`PipelineError`] tied to the [`Stage`] that raised
//! it, so a FAIL record can always name where the run stopped. Non-fatal
//! conditions are [`RunWarning`]s and are accumulated into the record instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Config,
    Manifest,
    Load,
    Units,
    Residuals,
    Sanity,
    Statistic,
    MonteCarlo,
    Verdict,
}

impl Stage {
    pub fn short_name(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Manifest => "manifest",
            Stage::Load => "load",
            Stage::Units => "units",
            Stage::Residuals => "residuals",
            Stage::Sanity => "sanity",
            Stage::Statistic => "statistic",
            Stage::MonteCarlo => "monte_carlo",
            Stage::Verdict => "verdict",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Fatal pipeline errors. Any of these aborts the run with no statistical output.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// File content does not match the manifest hash.
    Integrity {
        file: PathBuf,
        expected: String,
        actual: String,
    },
    /// A manifest entry points at a file that is not on disk.
    MissingFile { file: PathBuf },
    /// A consumed file is not listed in any manifest (strict mode).
    MissingManifestEntry { file: PathBuf, sha256: String },
    /// A consumed file matches more than one manifest entry.
    AmbiguousManifestEntry { file: PathBuf, matches: usize },
    /// The file is an HTML/XML error page rather than data.
    DownloadFailure { file: PathBuf, signature: String },
    /// Malformed spectrum, covariance, manifest or config text.
    Parse {
        file: PathBuf,
        line: Option<usize>,
        message: String,
    },
    /// Filesystem failure.
    Io { path: PathBuf, message: String },
    /// Units could not be decided against an available reference.
    UnitsResolution { file: PathBuf, message: String },
    /// Residual aggregates exceed the catastrophic thresholds in strict mode.
    CatastrophicMismatch {
        chi2_per_dof: f64,
        median_abs_residual: f64,
        chi2_limit: f64,
        residual_limit: f64,
    },
    /// Singular covariance, non-positive sigma, empty input and similar.
    Numerical { stage: Stage, message: String },
    /// Invalid pre-registration record.
    Config { message: String },
}

impl PipelineError {
    /// Stage this error aborts.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Integrity { .. }
            | PipelineError::MissingFile { .. }
            | PipelineError::MissingManifestEntry { .. }
            | PipelineError::AmbiguousManifestEntry { .. }
            | PipelineError::DownloadFailure { .. } => Stage::Manifest,
            PipelineError::Parse { .. } | PipelineError::Io { .. } => Stage::Load,
            PipelineError::UnitsResolution { .. } => Stage::Units,
            PipelineError::CatastrophicMismatch { .. } => Stage::Sanity,
            PipelineError::Numerical { stage, .. } => *stage,
            PipelineError::Config { .. } => Stage::Config,
        }
    }

    /// Stable machine-readable kind, used in FAIL records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Integrity { .. } => "integrity_error",
            PipelineError::MissingFile { .. } => "missing_file",
            PipelineError::MissingManifestEntry { .. } => "missing_manifest_entry",
            PipelineError::AmbiguousManifestEntry { .. } => "ambiguous_manifest_entry",
            PipelineError::DownloadFailure { .. } => "download_failure_error",
            PipelineError::Parse { .. } => "parse_error",
            PipelineError::Io { .. } => "io_error",
            PipelineError::UnitsResolution { .. } => "units_resolution_error",
            PipelineError::CatastrophicMismatch { .. } => "catastrophic_mismatch_error",
            PipelineError::Numerical { .. } => "numerical_error",
            PipelineError::Config { .. } => "config_error",
        }
    }

    pub fn io(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        PipelineError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn numerical(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::Numerical {
            stage,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config {
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Integrity {
                file,
                expected,
                actual,
            } => write!(
                f,
                "IntegrityError: {} sha256 mismatch (expected {}, actual {})",
                file.display(),
                expected,
                actual
            ),
            PipelineError::MissingFile { file } => {
                write!(f, "IntegrityError: manifest file {} does not exist", file.display())
            }
            PipelineError::MissingManifestEntry { file, sha256 } => write!(
                f,
                "IntegrityError: {} (sha256 {}) is not listed in any manifest",
                file.display(),
                sha256
            ),
            PipelineError::AmbiguousManifestEntry { file, matches } => write!(
                f,
                "IntegrityError: {} matches {} manifest entries, expected exactly one",
                file.display(),
                matches
            ),
            PipelineError::DownloadFailure { file, signature } => write!(
                f,
                "DownloadFailureError: {} starts with '{}' and looks like an HTML/XML error page, \
                 not data",
                file.display(),
                signature
            ),
            PipelineError::Parse {
                file,
                line,
                message,
            } => {
                write!(f, "ParseError: {}", file.display())?;
                if let Some(line) = line {
                    write!(f, " line {}", line)?;
                }
                write!(f, ": {}", message)
            }
            PipelineError::Io { path, message } => {
                write!(f, "IoError: {}: {}", path.display(), message)
            }
            PipelineError::UnitsResolution { file, message } => {
                write!(f, "UnitsResolutionError: {}: {}", file.display(), message)
            }
            PipelineError::CatastrophicMismatch {
                chi2_per_dof,
                median_abs_residual,
                chi2_limit,
                residual_limit,
            } => write!(
                f,
                "CatastrophicMismatchError: chi2/dof = {:.3e} (limit {:.1e}), \
                 median|residual| = {:.3e} (limit {:.1e}); \
                 likely a units or format incompatibility, not a physical signal",
                chi2_per_dof, chi2_limit, median_abs_residual, residual_limit
            ),
            PipelineError::Numerical { stage, message } => {
                write!(f, "NumericalError at {}: {}", stage, message)
            }
            PipelineError::Config { message } => write!(f, "ConfigError: {}", message),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Kind of non-fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Units decided without a reference; result is heuristic.
    UnitsAmbiguity,
    /// Header keyword disagreed with the chi² precheck.
    UnitsHeaderOverruled,
    /// Sanity gate failed in non-strict mode.
    SanityDemoted,
    /// Consumed file not listed in any manifest (non-strict mode).
    UnmanifestedFile,
    /// Few or uneven bins inside the pre-registered ℓ range.
    EllCoverage,
    /// Config fields overridden from the command line.
    ConfigOverride,
}

/// Non-fatal condition accumulated into the run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub message: String,
}

impl RunWarning {
    pub fn new(kind: WarningKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            dataset: None,
            message: message.into(),
        }
    }

    pub fn for_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.stage)?;
        if let Some(ds) = &self.dataset {
            write!(f, " {}:", ds)?;
        }
        write!(f, " {}", self.message)
    }
}
