//! Shared types for the comb-forensics workspace.
//!
//! This crate provides the foundational data model used by both the provenance
//! layer and the statistical core, so neither has to depend on the other:
//!
//! - [`spectrum`]: angular power spectra, column layouts and covariance matrices
//! - [`units`]: the Cl/Dl units tag that travels with every spectrum
//! - [`errors`]: stage-based error taxonomy and non-fatal run warnings
//! - [`encoding`]: SHA-256 helpers used for data and config hashes
//! - [`env_utils`]: boolean environment flags

pub mod encoding;
pub mod env_utils;
pub mod errors;
pub mod spectrum;
pub mod units;

pub use errors::{PipelineError, RunWarning, Stage, WarningKind};
pub use spectrum::{ColumnLayout, Covariance, Spectrum, SpectrumPoint};
pub use units::{dl_factor, Confidence, ResolutionMethod, Units, UnitsTag};
