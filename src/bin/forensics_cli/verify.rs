//! Verify command - check a data release against its manifest

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::output::print_json;
use comb_provenance::{validate, Manifest, ValidationReport};

#[derive(Parser, Debug)]
pub struct VerifyCmd {
    /// Manifest JSON to check
    #[arg(long)]
    pub manifest: PathBuf,

    /// Directory the manifest's relative paths resolve against (default: the manifest's directory)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    manifest: PathBuf,
    data_dir: PathBuf,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl VerifyCmd {
    pub fn execute(&self, json_output: bool) -> Result<i32> {
        let data_dir = self.data_dir.clone().unwrap_or_else(|| {
            self.manifest
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let result = Manifest::load(&self.manifest).and_then(|m| validate(&m, &data_dir));
        let output = match result {
            Ok(report) => VerifyOutput {
                manifest: self.manifest.clone(),
                data_dir,
                ok: true,
                report: Some(report),
                stage: None,
                kind: None,
                error: None,
            },
            Err(err) => VerifyOutput {
                manifest: self.manifest.clone(),
                data_dir,
                ok: false,
                report: None,
                stage: Some(err.stage().to_string()),
                kind: Some(err.kind().to_string()),
                error: Some(err.to_string()),
            },
        };

        if json_output {
            print_json(&output)?;
        } else if let Some(report) = &output.report {
            println!(
                "\x1b[32mOK\x1b[0m  {} files verified against {}",
                report.files.len(),
                self.manifest.display()
            );
            for f in &report.files {
                println!("  {}  {}", &f.sha256[..12.min(f.sha256.len())], f.path.display());
            }
        } else {
            println!(
                "\x1b[31mFAILED\x1b[0m  {} ({})",
                self.manifest.display(),
                output.kind.as_deref().unwrap_or("error")
            );
            if let Some(e) = &output.error {
                println!("  {}", e);
            }
        }
        Ok(if output.ok { 0 } else { 1 })
    }
}
