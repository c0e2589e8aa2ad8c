//! Inspect command - load a spectrum and report how its units were decided

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use super::output::print_json;
use comb_core::config::Thresholds;
use comb_core::loader::{self, SpectrumMetadata};
use comb_core::{units, UnitPatternTable};
use comb_types::{RunWarning, Units, UnitsTag};

fn parse_units(s: &str) -> Result<Units, String> {
    match s.to_ascii_lowercase().as_str() {
        "cl" => Ok(Units::Cl),
        "dl" => Ok(Units::Dl),
        other => Err(format!("unknown units '{}', expected Cl or Dl", other)),
    }
}

#[derive(Parser, Debug)]
pub struct InspectCmd {
    /// Spectrum file
    pub file: PathBuf,

    /// Reference spectrum with known units, for the chi² precheck
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Units of the reference when its header does not declare them
    #[arg(long, value_parser = parse_units)]
    pub reference_units: Option<Units>,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    metadata: SpectrumMetadata,
    initial: UnitsTag,
    resolved: UnitsTag,
    warnings: Vec<RunWarning>,
}

impl InspectCmd {
    pub fn execute(&self, json_output: bool) -> Result<i32> {
        let patterns = UnitPatternTable::default();
        let thresholds = Thresholds::default();

        let loaded = loader::load(&self.file, &patterns, &thresholds)?;
        let reference = match &self.reference {
            Some(path) => {
                let r = loader::load(path, &patterns, &thresholds)?;
                let tag = match self.reference_units {
                    Some(u) => UnitsTag::declared(u, None),
                    None => r.units,
                };
                Some((r.spectrum, tag))
            }
            None => None,
        };

        let (resolved, warnings) = units::resolve(
            &self.file,
            &loaded.units,
            &loaded.spectrum,
            reference.as_ref().map(|(s, t)| (s, t)),
            &thresholds,
        )?;

        let output = InspectOutput {
            metadata: loaded.metadata,
            initial: loaded.units,
            resolved,
            warnings,
        };

        if json_output {
            print_json(&output)?;
            return Ok(0);
        }

        let m = &output.metadata;
        println!("{}", m.path.display());
        println!("  sha256: {}", m.sha256);
        println!("  rows:   {} ({:?})", m.rows, m.layout);
        if !m.conflicting_keywords.is_empty() {
            println!("  conflicting header keywords: {}", m.conflicting_keywords.join(", "));
        }
        print_tag("initial", &output.initial);
        print_tag("resolved", &output.resolved);
        for w in &output.warnings {
            println!("  \x1b[33mwarning:\x1b[0m {}", w);
        }
        Ok(0)
    }
}

fn print_tag(label: &str, tag: &UnitsTag) {
    println!(
        "  {:<9} {} via {:?} ({:?})",
        format!("{}:", label),
        tag.units,
        tag.method,
        tag.confidence
    );
    if let Some(k) = &tag.header_keyword {
        println!("            header keyword '{}'", k);
    }
    if let (Some(med), Some(p90)) = (tag.magnitude_median, tag.magnitude_p90) {
        println!("            median {:.4e}, p90 {:.4e}", med, p90);
    }
    if let (Some(cl), Some(dl)) = (tag.chi2_per_dof_as_cl, tag.chi2_per_dof_as_dl) {
        println!("            chi²/dof as Cl {:.4e}, as Dl {:.4e}", cl, dl);
    }
}
