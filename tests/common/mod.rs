#![allow(dead_code)]
//! Shared fixtures for integration tests.
//!
//! Spectra are written as plain text into a temp directory; a [`Release`]
//! bundles that directory with helpers for manifests and configs.

use serde_json::{json, Value};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use comb_provenance::generate;

pub const ELL_MIN: u32 = 2;
pub const ELL_MAX: u32 = 600;
pub const SIGMA: f64 = 10.0;

/// Smooth Dl-like model, one row per multipole.
pub fn model_rows() -> Vec<(u32, f64, f64)> {
    (ELL_MIN..=ELL_MAX)
        .map(|l| (l, 1000.0 + l as f64, SIGMA))
        .collect()
}

/// Model plus a cosine comb of the given period and amplitude.
pub fn comb_rows(period: f64, amplitude: f64) -> Vec<(u32, f64, f64)> {
    model_rows()
        .into_iter()
        .map(|(l, v, s)| (l, v + amplitude * (2.0 * PI * l as f64 / period).cos(), s))
        .collect()
}

/// Model plus an alternating-sign offset; carries no power at long periods.
pub fn null_rows() -> Vec<(u32, f64, f64)> {
    model_rows()
        .into_iter()
        .map(|(l, v, s)| (l, if l % 2 == 0 { v + 5.0 } else { v - 5.0 }, s))
        .collect()
}

pub fn write_spectrum(path: &Path, header: &str, rows: &[(u32, f64, f64)]) {
    let mut text = format!("# {}\n", header);
    for (l, v, s) in rows {
        text.push_str(&format!("{} {:.10e} {:.10e}\n", l, v, s));
    }
    fs::write(path, text).expect("write spectrum");
}

/// A temp data release: spectra under `data/`, configs and manifests beside it.
pub struct Release {
    pub dir: TempDir,
}

impl Release {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir(dir.path().join("data")).expect("create data dir");
        let release = Self { dir };
        release.spectrum("model.txt", "ell Dl sigma", &model_rows());
        release
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn data(&self) -> PathBuf {
        self.root().join("data")
    }

    pub fn spectrum(&self, name: &str, header: &str, rows: &[(u32, f64, f64)]) -> PathBuf {
        let path = self.data().join(name);
        write_spectrum(&path, header, rows);
        path
    }

    /// Hash `data/` into `data/release.json`.
    pub fn write_manifest(&self) -> PathBuf {
        let path = self.data().join("release.json");
        let manifest = generate(&self.data(), Some(&path)).expect("generate manifest");
        fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).expect("write manifest");
        path
    }

    /// Pre-registration JSON with one dataset per observation file.
    pub fn config_json(&self, observations: &[&str], strict: bool) -> Value {
        let datasets: Vec<Value> = observations
            .iter()
            .enumerate()
            .map(|(i, obs)| {
                json!({
                    "id": format!("ds{}", i),
                    "observation": format!("data/{}", obs),
                    "model": "data/model.txt",
                    "ell_min": 30,
                    "ell_max": ELL_MAX,
                    "p_threshold": 0.01
                })
            })
            .collect();
        json!({
            "experiment_id": "integration",
            "datasets": datasets,
            "candidate_periods": [40.0, 70.0],
            "mc_samples": 199,
            "seed": 11,
            "strict": strict
        })
    }

    pub fn write_config(&self, name: &str, config: &Value) -> PathBuf {
        let path = self.root().join(name);
        fs::write(&path, serde_json::to_vec_pretty(config).unwrap()).expect("write config");
        path
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root().join("ledger")
    }
}
