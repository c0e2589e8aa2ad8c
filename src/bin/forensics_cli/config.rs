//! Pre-registration helpers

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::output::print_json;
use comb_core::TestConfig;

#[derive(Parser, Debug)]
pub struct ConfigCmd {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommand {
    /// Print the SHA-256 identity of a pre-registration file
    Hash {
        file: PathBuf,
    },
    /// Check that a pre-registration file defines a well-posed test
    Validate {
        file: PathBuf,
    },
}

impl ConfigCmd {
    pub fn execute(&self, json_output: bool) -> Result<i32> {
        match &self.command {
            ConfigSubcommand::Hash { file } => {
                let config = TestConfig::load(file)?;
                let hash = config.config_hash();
                if json_output {
                    print_json(&serde_json::json!({
                        "experiment_id": config.experiment_id,
                        "config_hash": hash,
                    }))?;
                } else {
                    println!("{}", hash);
                }
                Ok(0)
            }
            ConfigSubcommand::Validate { file } => {
                let result = TestConfig::load(file).and_then(|c| c.validate().map(|_| c));
                match result {
                    Ok(config) => {
                        if json_output {
                            print_json(&serde_json::json!({
                                "ok": true,
                                "experiment_id": config.experiment_id,
                                "config_hash": config.config_hash(),
                            }))?;
                        } else {
                            println!(
                                "\x1b[32mOK\x1b[0m  {} ({} datasets, {} periods)",
                                config.experiment_id,
                                config.datasets.len(),
                                config.candidate_periods.len()
                            );
                        }
                        Ok(0)
                    }
                    Err(err) => {
                        if json_output {
                            print_json(&serde_json::json!({
                                "ok": false,
                                "kind": err.kind(),
                                "error": err.to_string(),
                            }))?;
                        } else {
                            println!("\x1b[31mINVALID\x1b[0m  {}", err);
                        }
                        Ok(1)
                    }
                }
            }
        }
    }
}
