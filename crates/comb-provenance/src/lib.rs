//! Data provenance for comb-forensics runs.
//!
//! This crate provides:
//! - [`manifest`]: SHA-256 manifests for published data files, and the validator
//!   that checks consumed files against them before anything is parsed
//! - [`ledger`]: append-only, hash-chained storage of one immutable record per run
//! - [`paths`]: atomic and create-new file writes

pub mod ledger;
pub mod manifest;
pub mod paths;

pub use ledger::{Ledger, LedgerEntry, LedgerRecord};
pub use manifest::{
    detect_error_page, generate, validate, verify_consumed, ConsumedFile, Manifest, ManifestEntry,
    ManifestSet, ValidationReport,
};
