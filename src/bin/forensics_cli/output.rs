//! Output formatting for the comb-forensics CLI
//!
//! Human-readable summaries go to stdout; with `--json` the same data is
//! printed as pretty JSON instead.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use comb_core::{Verdict, VerdictRecord};

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn verdict_color(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Confirmed => "\x1b[32m",
        Verdict::Candidate => "\x1b[33m",
        Verdict::Null => "\x1b[36m",
        Verdict::Fail => "\x1b[31m",
    }
}

/// Human-readable summary of a run record.
pub fn format_record(record: &VerdictRecord, record_path: Option<&Path>, verbose: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\x1b[1m{}\x1b[0m  run {}\n",
        verdict_color(record.verdict),
        record.verdict,
        record.run_id
    ));
    let p = &record.provenance;
    if let Some(exp) = &p.experiment_id {
        out.push_str(&format!("Experiment: {}\n", exp));
    }
    if let Some(hash) = &p.config_hash {
        out.push_str(&format!("Config hash: {}\n", hash));
    }
    if let (Some(seed), Some(n)) = (p.seed, p.mc_samples) {
        out.push_str(&format!(
            "Seed: {}  MC samples: {}  strict: {}\n",
            seed, n, p.strict
        ));
    }
    if !record.eligible_for_confirmation && record.verdict != Verdict::Fail {
        out.push_str("\x1b[33mNot eligible for CONFIRMED (sanity gate demoted)\x1b[0m\n");
    }

    if !record.datasets.is_empty() {
        out.push_str("\n\x1b[1mDatasets:\x1b[0m\n");
    }
    for d in &record.datasets {
        out.push_str(&format!(
            "  {}  ell [{}, {}]  threshold {}\n",
            d.dataset, d.ell_min, d.ell_max, d.p_threshold
        ));
        if let Some(u) = &d.observation_units {
            out.push_str(&format!(
                "    units: {} via {:?} ({:?})\n",
                u.units, u.method, u.confidence
            ));
        }
        if let Some(r) = &d.residuals {
            out.push_str(&format!(
                "    residuals: {} bins, chi2/dof {:.4}, median|r| {:.4}, {:?}\n",
                r.bins, r.chi2_per_dof, r.median_abs_residual, r.whitening
            ));
        }
        if let (Some(s), Some(c)) = (&d.statistic, &d.calibration) {
            let mark = if d.is_significant() { "*" } else { "" };
            out.push_str(&format!(
                "    best period {}  score {:.4}  p = {:.6}{}  ({} of {} null trials exceeded)\n",
                s.best_period, s.best_score, c.p_value, mark, c.exceed_count, c.n_samples
            ));
            if verbose {
                for ps in &s.scores {
                    out.push_str(&format!("      P = {:<10} S = {:.4}\n", ps.period, ps.score));
                }
            }
        }
    }

    if !record.exploratory.is_empty() {
        out.push_str("\n\x1b[1mExploratory (not pre-registered, excluded from verdict):\x1b[0m\n");
        for e in &record.exploratory {
            out.push_str(&format!(
                "  {}  best period {}  trials-corrected p = {:.6}\n",
                e.dataset, e.scan.best_period, e.calibration.p_value
            ));
        }
    }

    if !record.warnings.is_empty() {
        out.push_str(&format!("\n\x1b[1mWarnings:\x1b[0m {}\n", record.warnings.len()));
        for w in &record.warnings {
            out.push_str(&format!("  {}\n", w));
        }
    }

    if let Some(f) = &record.failure {
        out.push_str(&format!(
            "\n\x1b[31mAborted at stage '{}' ({})\x1b[0m\n  {}\n",
            f.stage, f.kind, f.message
        ));
        if let Some(ds) = &f.dataset {
            out.push_str(&format!("  dataset: {}\n", ds));
        }
    }

    if let Some(path) = record_path {
        out.push_str(&format!("\nRecord: {}\n", path.display()));
    }
    out
}

/// Format an error for display
pub fn format_error(error: &anyhow::Error, json_output: bool) -> String {
    if json_output {
        #[derive(Serialize)]
        struct ErrorJson {
            error: String,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            causes: Vec<String>,
        }

        let err = ErrorJson {
            error: error.to_string(),
            causes: error.chain().skip(1).map(|c| c.to_string()).collect(),
        };
        let mut out = serde_json::to_string_pretty(&err).unwrap_or_else(|_| "{}".to_string());
        out.push('\n');
        out
    } else {
        let mut out = format!("\x1b[31mError:\x1b[0m {}\n", error);
        let mut causes = error.chain().skip(1).peekable();
        if causes.peek().is_some() {
            out.push_str("Caused by:\n");
            for (idx, cause) in causes.enumerate() {
                out.push_str(&format!("  {}: {}\n", idx + 1, cause));
            }
        }
        out
    }
}
