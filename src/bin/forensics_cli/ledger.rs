//! Ledger commands - browse and audit recorded runs

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;

use super::output::{format_record, print_json};
use comb_core::VerdictRecord;
use comb_provenance::paths::run_record_path;
use comb_provenance::Ledger;

#[derive(Parser, Debug)]
pub struct LedgerCmd {
    #[command(subcommand)]
    command: LedgerSubcommand,
}

#[derive(Subcommand, Debug)]
enum LedgerSubcommand {
    /// List recorded runs, oldest first
    List {
        /// Only the most recent N runs
        #[arg(long)]
        last: Option<usize>,
    },
    /// Show one run record
    Show {
        /// Run id
        run_id: String,
    },
    /// Re-hash every record and check the entry chain
    Verify,
}

impl LedgerCmd {
    pub fn execute(&self, ledger_dir: &Path, json_output: bool) -> Result<i32> {
        let ledger = Ledger::open(ledger_dir)?;
        match &self.command {
            LedgerSubcommand::List { last } => {
                let mut entries = ledger.entries()?;
                if let Some(n) = last {
                    let skip = entries.len().saturating_sub(*n);
                    entries.drain(..skip);
                }
                if json_output {
                    print_json(&entries)?;
                } else if entries.is_empty() {
                    println!("No runs recorded in {}", ledger_dir.display());
                } else {
                    println!(
                        "{:<36}  {:<25}  {:<9}  CONFIG",
                        "RUN", "CREATED", "VERDICT"
                    );
                    for e in &entries {
                        let hash = e
                            .config_hash
                            .as_deref()
                            .map(|h| &h[..12.min(h.len())])
                            .unwrap_or("-");
                        println!(
                            "{:<36}  {:<25}  {:<9}  {}",
                            e.run_id,
                            e.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                            e.verdict,
                            hash
                        );
                    }
                }
                Ok(0)
            }
            LedgerSubcommand::Show { run_id } => {
                let record: VerdictRecord = ledger.load(run_id)?;
                if json_output {
                    print_json(&record)?;
                } else {
                    let path = run_record_path(ledger.root(), run_id);
                    print!("{}", format_record(&record, Some(&path), true));
                }
                Ok(0)
            }
            LedgerSubcommand::Verify => match ledger.verify_chain() {
                Ok(count) => {
                    if json_output {
                        print_json(&serde_json::json!({ "ok": true, "runs": count }))?;
                    } else {
                        println!("\x1b[32mOK\x1b[0m  {} runs, chain intact", count);
                    }
                    Ok(0)
                }
                Err(err) => {
                    if json_output {
                        print_json(&serde_json::json!({
                            "ok": false,
                            "error": format!("{:#}", err)
                        }))?;
                    } else {
                        println!("\x1b[31mFAILED\x1b[0m  {:#}", err);
                    }
                    Ok(1)
                }
            },
        }
    }
}
