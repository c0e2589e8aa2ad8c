//! End-to-end pipeline runs against on-disk data releases.

mod common;

use common::{comb_rows, null_rows, Release};
use comb_core::{run, RunInputs, TestConfig, Verdict};
use comb_provenance::Ledger;
use comb_types::{Stage, WarningKind};
use serde_json::json;

fn inputs(release: &Release, observations: &[&str], strict: bool) -> RunInputs {
    let config: TestConfig =
        serde_json::from_value(release.config_json(observations, strict)).unwrap();
    let manifest = release.write_manifest();
    RunInputs::new(config, release.root()).with_manifests(vec![manifest])
}

#[test]
fn test_two_agreeing_detections_confirm() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &comb_rows(40.0, 12.0));
    release.spectrum("b.txt", "ell Dl sigma", &comb_rows(40.0, 10.0));

    let record = run(&inputs(&release, &["a.txt", "b.txt"], true));
    assert_eq!(record.verdict, Verdict::Confirmed, "{:?}", record.failure);
    assert!(record.eligible_for_confirmation);
    for d in &record.datasets {
        assert_eq!(d.best_period(), Some(40.0));
        assert!(d.p_value().unwrap() < d.p_threshold);
    }
    assert_eq!(record.provenance.data_files.len(), 3);
    assert!(record
        .provenance
        .data_files
        .iter()
        .all(|f| f.manifest.as_deref() == Some("release")));
}

#[test]
fn test_single_detection_is_candidate_and_keeps_both_p_values() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &comb_rows(40.0, 12.0));
    release.spectrum("b.txt", "ell Dl sigma", &null_rows());

    let record = run(&inputs(&release, &["a.txt", "b.txt"], true));
    assert_eq!(record.verdict, Verdict::Candidate);
    assert!(record.datasets[0].is_significant());
    assert!(!record.datasets[1].is_significant());
    assert!(record.datasets.iter().all(|d| d.p_value().is_some()));
}

#[test]
fn test_no_detection_is_null_and_recorded() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &null_rows());
    release.spectrum("b.txt", "ell Dl sigma", &null_rows());

    let record = run(&inputs(&release, &["a.txt", "b.txt"], true));
    assert_eq!(record.verdict, Verdict::Null);
    assert_eq!(record.exit_code(), 0);

    let ledger = Ledger::open(release.ledger_dir()).unwrap();
    ledger.append(&record).unwrap();
    let stored: comb_core::VerdictRecord = ledger.load(&record.run_id).unwrap();
    assert_eq!(stored.verdict, Verdict::Null);
    assert_eq!(stored.datasets.len(), 2);
    assert!(stored.datasets.iter().all(|d| d.calibration.is_some()));
    assert_eq!(ledger.verify_chain().unwrap(), 1);
}

#[test]
fn test_tampered_file_fails_without_p_values() {
    let release = Release::new();
    let obs = release.spectrum("a.txt", "ell Dl sigma", &comb_rows(40.0, 12.0));
    let config: TestConfig =
        serde_json::from_value(release.config_json(&["a.txt"], true)).unwrap();
    let manifest = release.write_manifest();

    let mut text = std::fs::read_to_string(&obs).unwrap();
    text.push_str("# appended after hashing\n");
    std::fs::write(&obs, text).unwrap();

    let record = run(&RunInputs::new(config, release.root()).with_manifests(vec![manifest]));
    assert_eq!(record.verdict, Verdict::Fail);
    assert_ne!(record.exit_code(), 0);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Manifest);
    assert_eq!(failure.kind, "integrity_error");
    assert!(failure.message.contains("a.txt"));

    let json = serde_json::to_string(&record).unwrap();
    assert!(!json.contains("p_value"));
    assert!(!json.contains("best_period"));
}

#[test]
fn test_html_error_page_is_a_download_failure() {
    let release = Release::new();
    std::fs::write(
        release.data().join("a.txt"),
        "<!DOCTYPE html>\n<html><body>404 Not Found</body></html>\n",
    )
    .unwrap();

    let record = run(&inputs(&release, &["a.txt"], true));
    assert_eq!(record.verdict, Verdict::Fail);
    assert_eq!(record.failure.as_ref().unwrap().kind, "download_failure_error");
}

#[test]
fn test_same_config_and_seed_reproduce_the_statistics() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &comb_rows(70.0, 4.0));
    let run_inputs = inputs(&release, &["a.txt"], true);

    let first = run(&run_inputs);
    let second = run(&run_inputs);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.provenance.config_hash, second.provenance.config_hash);
    assert_eq!(first.datasets, second.datasets);
    assert_eq!(first.verdict, second.verdict);
}

#[test]
fn test_scaled_observation_is_blocked_in_strict_mode() {
    let release = Release::new();
    let scaled: Vec<_> = null_rows()
        .into_iter()
        .map(|(l, v, s)| (l, v * 1e7, s))
        .collect();
    release.spectrum("a.txt", "ell Dl sigma", &scaled);

    let strict = run(&inputs(&release, &["a.txt"], true));
    assert_eq!(strict.verdict, Verdict::Fail);
    assert_eq!(strict.failure.as_ref().unwrap().stage, Stage::Sanity);
    assert_eq!(strict.failure.as_ref().unwrap().dataset.as_deref(), Some("ds0"));
    assert!(strict.datasets.iter().all(|d| d.calibration.is_none()));

    let relaxed = run(&inputs(&release, &["a.txt"], false));
    assert!(relaxed.verdict.is_completed());
    assert_ne!(relaxed.verdict, Verdict::Confirmed);
    assert!(!relaxed.eligible_for_confirmation);
    let residuals = relaxed.datasets[0].residuals.as_ref().unwrap();
    assert!(!residuals.sanity_checks_passed);
    assert!(residuals.units_mismatch_warning);
    assert!(relaxed
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::SanityDemoted));
}

#[test]
fn test_cl_observation_is_converted_to_model_units() {
    let release = Release::new();
    // Same comb, stored as Cl with a header that claims nothing.
    let cl: Vec<_> = comb_rows(40.0, 12.0)
        .into_iter()
        .map(|(l, v, s)| {
            let f = comb_types::dl_factor(l);
            (l, v / f, s / f)
        })
        .collect();
    release.spectrum("a.txt", "multipole value error", &cl);

    let record = run(&inputs(&release, &["a.txt"], true));
    assert_eq!(record.verdict, Verdict::Confirmed, "{:?}", record.failure);
    let units = record.datasets[0].observation_units.as_ref().unwrap();
    assert_eq!(units.units, comb_types::Units::Cl);
    assert!(units.is_trusted());
    assert!(units.chi2_per_dof_as_cl.unwrap() < units.chi2_per_dof_as_dl.unwrap());
}

#[test]
fn test_exploratory_scan_is_reported_outside_the_verdict() {
    let release = Release::new();
    release.spectrum("a.txt", "ell Dl sigma", &null_rows());
    let mut config = release.config_json(&["a.txt"], true);
    config["exploratory_scan"] = json!({"min_period": 20.0, "max_period": 120.0, "step": 5.0});
    let config: TestConfig = serde_json::from_value(config).unwrap();
    let manifest = release.write_manifest();

    let record = run(&RunInputs::new(config, release.root()).with_manifests(vec![manifest]));
    assert_eq!(record.verdict, Verdict::Null);
    assert_eq!(record.exploratory.len(), 1);
    assert!(!record.exploratory[0].pre_registered);
    assert_eq!(record.exploratory[0].scan.scores.len(), 21);
}
