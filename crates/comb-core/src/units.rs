//! Units resolution.
//!
//! Three sources of evidence, weakest first:
//!
//! 1. the magnitude heuristic (`Dl` values are large, `Cl` values are tiny),
//! 2. a header keyword,
//! 3. a chi² precheck against a units-known reference, which reads the
//!    candidate both ways and keeps the reading whose chi²/dof lands nearest
//!    the plausible band.
//!
//! Only the precheck yields [`Confidence::Verified`]. Without a reference the
//! tag stays declared or heuristic, and a heuristic tag is reported as a
//! [`WarningKind::UnitsAmbiguity`] warning.

use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Thresholds;
use crate::stats;
use comb_types::{
    Confidence, PipelineError, ResolutionMethod, RunWarning, Spectrum, Stage, Units, UnitsTag,
    WarningKind,
};

/// Median and 90th percentile of the values above the heuristic ℓ cut.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnitudeStats {
    pub median: f64,
    pub p90: f64,
}

/// Guess units from magnitudes. `None` when no bin lies above the ℓ cut.
pub fn magnitude_heuristic(
    spectrum: &Spectrum,
    thresholds: &Thresholds,
) -> Option<(Units, MagnitudeStats)> {
    let values: Vec<f64> = spectrum
        .points
        .iter()
        .filter(|p| p.ell > thresholds.magnitude_min_ell)
        .map(|p| p.value)
        .collect();
    let median = stats::median(&values)?;
    let p90 = stats::percentile(&values, 90.0)?;
    let units = if median > thresholds.magnitude_cutoff || p90 > thresholds.magnitude_cutoff {
        Units::Dl
    } else {
        Units::Cl
    };
    Some((units, MagnitudeStats { median, p90 }))
}

/// Initial tag from a header declaration, falling back to magnitudes.
///
/// Magnitude statistics are recorded either way for the audit trail.
pub fn initial_guess(
    declared: Option<(Units, String)>,
    spectrum: &Spectrum,
    thresholds: &Thresholds,
) -> UnitsTag {
    let magnitude = magnitude_heuristic(spectrum, thresholds);
    let mut tag = match (&declared, magnitude) {
        (Some((units, keyword)), _) => UnitsTag::declared(*units, Some(keyword.clone())),
        (None, Some((units, _))) => UnitsTag {
            units,
            confidence: Confidence::Heuristic,
            ..UnitsTag::unresolved()
        },
        (None, None) => UnitsTag::unresolved(),
    };
    if let Some((_, m)) = magnitude {
        tag.magnitude_median = Some(m.median);
        tag.magnitude_p90 = Some(m.p90);
    }
    tag
}

/// Per-bin uncertainties: the sigma column, else the covariance diagonal.
pub fn bin_sigmas(spectrum: &Spectrum) -> Option<Vec<f64>> {
    spectrum.sigmas().or_else(|| {
        spectrum
            .covariance
            .as_ref()
            .map(|c| c.diagonal().into_iter().map(f64::sqrt).collect())
    })
}

/// chi²/dof of `candidate` read as `as_units`, compared with `reference` in
/// `ref_units` over the multipoles both share.
///
/// Uncertainties come from the reference when it has them, otherwise from the
/// candidate (converted along with its values).
pub fn interpretation_chi2(
    candidate: &Spectrum,
    as_units: Units,
    reference: &Spectrum,
    ref_units: Units,
) -> Result<f64, String> {
    let ref_sigmas = bin_sigmas(reference);
    let cand_sigmas = bin_sigmas(candidate);
    if ref_sigmas.is_none() && cand_sigmas.is_none() {
        return Err("neither spectrum carries uncertainties".into());
    }

    let mut chi2 = 0.0;
    let mut n = 0usize;
    for (ci, point) in candidate.points.iter().enumerate() {
        let Some(ri) = reference.index_of(point.ell) else {
            continue;
        };
        let factor = as_units
            .conversion_to(ref_units, point.ell)
            .ok_or_else(|| format!("cannot convert {} to {}", as_units, ref_units))?;
        let sigma = ref_sigmas
            .as_ref()
            .map(|rs| rs[ri])
            .or_else(|| cand_sigmas.as_ref().map(|cs| cs[ci] * factor))
            .unwrap_or(f64::NAN);
        if !(sigma > 0.0) {
            return Err(format!("non-positive uncertainty at ell={}", point.ell));
        }
        let r = (point.value * factor - reference.points[ri].value) / sigma;
        chi2 += r * r;
        n += 1;
    }
    if n == 0 {
        return Err("no multipoles in common with the reference".into());
    }
    Ok(chi2 / n as f64)
}

/// Distance from `chi2_per_dof` to the plausible band `[lo, hi]`.
///
/// Decades of excess above `hi`, zero otherwise. A reading below `lo` fits
/// the reference better than its uncertainties require and still counts as
/// plausible. Non-finite values are infinitely far.
pub fn plausibility_distance(chi2_per_dof: f64, thresholds: &Thresholds) -> f64 {
    let hi = thresholds.plausible_chi2_max;
    if !chi2_per_dof.is_finite() {
        f64::INFINITY
    } else if chi2_per_dof > hi {
        (chi2_per_dof / hi).log10()
    } else {
        0.0
    }
}

/// Both readings of a candidate and the one chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoResolution {
    pub units: Units,
    pub chi2_per_dof_as_cl: f64,
    pub chi2_per_dof_as_dl: f64,
}

/// Two-branch comparison: nearest the plausible band wins, then the closer fit;
/// on an exact tie the header-declared units, and without a header `Cl`.
pub fn auto_resolve(
    candidate: &Spectrum,
    reference: &Spectrum,
    ref_units: Units,
    header_units: Option<Units>,
    thresholds: &Thresholds,
) -> Result<AutoResolution, String> {
    let as_cl = interpretation_chi2(candidate, Units::Cl, reference, ref_units)?;
    let as_dl = interpretation_chi2(candidate, Units::Dl, reference, ref_units)?;
    if !as_cl.is_finite() && !as_dl.is_finite() {
        return Err("chi²/dof is non-finite under both readings".into());
    }

    let d_cl = plausibility_distance(as_cl, thresholds);
    let d_dl = plausibility_distance(as_dl, thresholds);
    let units = match d_cl.total_cmp(&d_dl).then(as_cl.total_cmp(&as_dl)) {
        Ordering::Less => Units::Cl,
        Ordering::Greater => Units::Dl,
        Ordering::Equal => match header_units {
            Some(Units::Dl) => Units::Dl,
            _ => Units::Cl,
        },
    };
    let chosen = if units == Units::Cl { as_cl } else { as_dl };
    debug!(
        as_cl,
        as_dl,
        d_cl,
        d_dl,
        chosen = %units,
        below_band = chosen < thresholds.plausible_chi2_min,
        "Units precheck"
    );
    Ok(AutoResolution {
        units,
        chi2_per_dof_as_cl: as_cl,
        chi2_per_dof_as_dl: as_dl,
    })
}

/// Final units decision for a loaded spectrum.
///
/// With a reference, the chi² precheck always runs and its result wins over
/// the header. Without one, a declared tag is kept and anything weaker is
/// returned with a warning.
pub fn resolve(
    file: &Path,
    tag: &UnitsTag,
    spectrum: &Spectrum,
    reference: Option<(&Spectrum, &UnitsTag)>,
    thresholds: &Thresholds,
) -> Result<(UnitsTag, Vec<RunWarning>), PipelineError> {
    let units_error = |message: String| PipelineError::UnitsResolution {
        file: file.to_path_buf(),
        message,
    };

    let Some((ref_spectrum, ref_tag)) = reference else {
        let mut warnings = Vec::new();
        if !tag.is_trusted() {
            warnings.push(RunWarning::new(
                WarningKind::UnitsAmbiguity,
                Stage::Units,
                format!(
                    "{}: no reference to verify units; using {} ({:?})",
                    file.display(),
                    tag.units,
                    tag.confidence
                ),
            ));
        }
        return Ok((tag.clone(), warnings));
    };

    if ref_tag.units == Units::Unknown || !ref_tag.is_trusted() {
        return Err(units_error(format!(
            "reference units are not established ({} / {:?})",
            ref_tag.units, ref_tag.confidence
        )));
    }

    let resolution = auto_resolve(
        spectrum,
        ref_spectrum,
        ref_tag.units,
        tag.header_units,
        thresholds,
    )
    .map_err(units_error)?;

    let mut warnings = Vec::new();
    if let Some(header) = tag.header_units {
        if header != resolution.units {
            warnings.push(RunWarning::new(
                WarningKind::UnitsHeaderOverruled,
                Stage::Units,
                format!(
                    "{}: header declares {} but the precheck favours {} \
                     (chi²/dof {:.3e} as Cl, {:.3e} as Dl)",
                    file.display(),
                    header,
                    resolution.units,
                    resolution.chi2_per_dof_as_cl,
                    resolution.chi2_per_dof_as_dl
                ),
            ));
        }
    }

    info!(
        file = %file.display(),
        units = %resolution.units,
        chi2_as_cl = resolution.chi2_per_dof_as_cl,
        chi2_as_dl = resolution.chi2_per_dof_as_dl,
        "Units resolved"
    );

    let resolved = UnitsTag {
        units: resolution.units,
        method: ResolutionMethod::Chi2Precheck,
        confidence: Confidence::Verified,
        chi2_per_dof_as_cl: Some(resolution.chi2_per_dof_as_cl),
        chi2_per_dof_as_dl: Some(resolution.chi2_per_dof_as_dl),
        ..tag.clone()
    };
    Ok((resolved, warnings))
}

/// Convert `spectrum` from `from` to `to` units.
pub fn convert(spectrum: &Spectrum, from: Units, to: Units) -> Result<Spectrum, PipelineError> {
    if from == Units::Unknown || to == Units::Unknown {
        return Err(PipelineError::numerical(
            Stage::Units,
            format!("cannot convert {} to {}", from, to),
        ));
    }
    spectrum
        .map_by_ell(|ell| from.conversion_to(to, ell).unwrap_or(1.0))
        .map_err(|e| PipelineError::numerical(Stage::Units, e.to_string()))
}
