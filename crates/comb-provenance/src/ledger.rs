//! Append-only ledger of run records.
//!
//! Layout under the ledger root:
//!
//! ```text
//! runs/<run_id>.json   # full record, written once with create-new semantics
//! ledger.jsonl         # one LedgerEntry per run, hash-chained
//! ```
//!
//! Every entry stores the SHA-256 of its record file and of the previous
//! ledger line, so deleting or editing an earlier run is detectable with
//! [`Ledger::verify_chain`]. The chain alone cannot see a dropped final line;
//! a record file under `runs/` with no entry catches that case.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::paths::{ensure_parent_dirs, ledger_index_path, run_record_path, runs_dir, write_new};
use comb_types::encoding::sha256_hex;

/// Records the ledger can store.
pub trait LedgerRecord: Serialize + DeserializeOwned {
    fn run_id(&self) -> String;
    /// Verdict tag (CONFIRMED, CANDIDATE, NULL, FAIL).
    fn verdict_tag(&self) -> String;
    fn config_hash(&self) -> Option<String>;
    fn created_at(&self) -> DateTime<Utc>;
}

/// One line of `ledger.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub verdict: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub record_file: String,
    pub record_sha256: String,
    /// SHA-256 of the previous ledger line; `None` for the first run
    pub prev_entry_sha256: Option<String>,
}

/// Append-only run ledger rooted at a directory.
pub struct Ledger {
    root: PathBuf,
    index_lock: parking_lot::Mutex<()>,
}

impl Ledger {
    /// Open (and create if needed) a ledger at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| anyhow!("Failed to create ledger root {}: {}", root.display(), e))?;
        Ok(Self {
            root,
            index_lock: parking_lot::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `record` once and append its index line.
    ///
    /// Fails if a record with the same run id already exists.
    pub fn append<R: LedgerRecord>(&self, record: &R) -> Result<LedgerEntry> {
        let run_id = record.run_id();
        let bytes = serde_json::to_vec_pretty(record).context("serialize run record")?;
        let record_path = run_record_path(&self.root, &run_id);

        // Serialize appends across threads to keep jsonl lines and the chain intact.
        let _guard = self.index_lock.lock();
        write_new(&record_path, &bytes)?;

        let index_path = ledger_index_path(&self.root);
        let prev = last_line(&index_path)?.map(|line| sha256_hex(line.as_bytes()));
        let entry = LedgerEntry {
            run_id: run_id.clone(),
            created_at: record.created_at(),
            verdict: record.verdict_tag(),
            config_hash: record.config_hash(),
            record_file: format!("runs/{}.json", run_id),
            record_sha256: sha256_hex(&bytes),
            prev_entry_sha256: prev,
        };
        let line = serde_json::to_string(&entry).context("serialize ledger entry")?;
        ensure_parent_dirs(&index_path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)
            .map_err(|e| anyhow!("Failed to open ledger index: {}", e))?;
        writeln!(file, "{}", line).map_err(|e| anyhow!("Failed to append ledger entry: {}", e))?;

        info!(
            run_id = %run_id,
            verdict = %entry.verdict,
            record = %record_path.display(),
            "Run record written"
        );
        Ok(entry)
    }

    /// All index entries in append order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let index_path = ledger_index_path(&self.root);
        if !index_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&index_path)
            .with_context(|| format!("open {}", index_path.display()))?;
        let mut entries = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line)
                .with_context(|| format!("ledger line {} is not a valid entry", i + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Load a stored record by run id.
    pub fn load<R: LedgerRecord>(&self, run_id: &str) -> Result<R> {
        let path = run_record_path(&self.root, run_id);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("no record for run {} at {}", run_id, path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse record {}", path.display()))
    }

    /// Recompute record hashes and the entry chain, then require an entry for
    /// every record under `runs/`. Returns the number of runs.
    pub fn verify_chain(&self) -> Result<usize> {
        let index_path = ledger_index_path(&self.root);
        let text = if index_path.exists() {
            std::fs::read_to_string(&index_path)?
        } else {
            String::new()
        };
        let mut prev: Option<String> = None;
        let mut indexed = HashSet::new();
        for (i, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            let entry: LedgerEntry = serde_json::from_str(line)
                .with_context(|| format!("ledger line {} is not a valid entry", i + 1))?;
            if entry.prev_entry_sha256 != prev {
                return Err(anyhow!(
                    "ledger chain broken at run {} (line {})",
                    entry.run_id,
                    i + 1
                ));
            }
            let bytes = std::fs::read(self.root.join(&entry.record_file))
                .with_context(|| format!("record for run {} is missing", entry.run_id))?;
            if sha256_hex(&bytes) != entry.record_sha256 {
                return Err(anyhow!("record for run {} was modified", entry.run_id));
            }
            prev = Some(sha256_hex(line.as_bytes()));
            indexed.insert(entry.run_id);
        }

        // A record without a ledger line means the index lost its tail.
        for run_id in self.stored_run_ids()? {
            if !indexed.contains(&run_id) {
                return Err(anyhow!("record for run {} has no ledger entry", run_id));
            }
        }
        Ok(indexed.len())
    }

    /// Run ids of every record file under `runs/`.
    fn stored_run_ids(&self) -> Result<Vec<String>> {
        let dir = runs_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn last_line(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .map(str::to_string))
}
