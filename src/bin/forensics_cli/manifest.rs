//! Manifest commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::output::print_json;
use comb_provenance::generate;
use comb_provenance::paths::atomic_write;

#[derive(Parser, Debug)]
pub struct ManifestCmd {
    #[command(subcommand)]
    command: ManifestSubcommand,
}

#[derive(Subcommand, Debug)]
enum ManifestSubcommand {
    /// Hash every file under a directory into a manifest
    Generate {
        /// Data release directory
        dir: PathBuf,
        /// Write the manifest here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

impl ManifestCmd {
    pub fn execute(&self, json_output: bool) -> Result<i32> {
        match &self.command {
            ManifestSubcommand::Generate { dir, output } => {
                let manifest = generate(dir, output.as_deref())
                    .with_context(|| format!("failed to hash {}", dir.display()))?;
                match output {
                    Some(path) => {
                        let bytes = serde_json::to_vec_pretty(&manifest)?;
                        atomic_write(path, &bytes)?;
                        if json_output {
                            print_json(&serde_json::json!({
                                "output": path,
                                "files": manifest.files.len(),
                            }))?;
                        } else {
                            println!(
                                "Wrote {} ({} files)",
                                path.display(),
                                manifest.files.len()
                            );
                        }
                    }
                    None => print_json(&manifest)?,
                }
                Ok(0)
            }
        }
    }
}
