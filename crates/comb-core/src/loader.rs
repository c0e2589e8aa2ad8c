//! Spectrum and covariance file loading.
//!
//! Spectrum files are whitespace-delimited text with an optional `#` header:
//!
//! ```text
//! # ell  D_ell  sigma
//! 2      1012.3  410.2
//! 3      1050.8  350.9
//! ```
//!
//! The column layout is fixed by the first data row and every later row must
//! agree. Header keywords seed the units guess through a [`UnitPatternTable`];
//! callers can extend the table without touching this module.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::Thresholds;
use crate::units;
use comb_provenance::manifest::detect_error_page_bytes;
use comb_types::encoding::sha256_hex;
use comb_types::{ColumnLayout, Covariance, PipelineError, Spectrum, SpectrumPoint, Units, UnitsTag};

/// Characters dropped when normalizing a header token.
const SEPARATORS: &[char] = &['_', '-', '^', '{', '}', '(', ')', '\\', '$', '.', ':', '/'];

/// Relative tolerance for covariance symmetry.
const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// A header keyword spelling mapped to a units convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPattern {
    pub units: Units,
    /// Normalized stem, e.g. `dell`
    pub stem: String,
}

/// Table of header keyword spellings.
///
/// A token matches when its normalized form equals a stem, optionally followed
/// by one of the spectrum suffixes (`tt`, `ee`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPatternTable {
    patterns: Vec<UnitPattern>,
    suffixes: Vec<String>,
}

impl Default for UnitPatternTable {
    fn default() -> Self {
        let mut table = Self {
            patterns: Vec::new(),
            suffixes: ["tt", "ee", "te", "et", "bb", "tb", "eb", "pp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        for stem in ["dl", "dell", "dℓ", "dlell"] {
            table.add(Units::Dl, stem);
        }
        for stem in ["cl", "cell", "cℓ", "clell"] {
            table.add(Units::Cl, stem);
        }
        table
    }
}

impl UnitPatternTable {
    /// Empty table; nothing matches until patterns are added.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            suffixes: Vec::new(),
        }
    }

    /// Register a spelling. The keyword is normalized the same way header
    /// tokens are, so `"D_{\ell}"` and `"dell"` are the same pattern.
    pub fn add(&mut self, units: Units, keyword: &str) -> &mut Self {
        let stem = normalize_token(keyword);
        if !stem.is_empty() && !self.patterns.iter().any(|p| p.stem == stem) {
            self.patterns.push(UnitPattern { units, stem });
        }
        self
    }

    /// Register a spectrum suffix such as `"tt"`.
    pub fn add_suffix(&mut self, suffix: &str) -> &mut Self {
        let suffix = normalize_token(suffix);
        if !suffix.is_empty() && !self.suffixes.contains(&suffix) {
            self.suffixes.push(suffix);
        }
        self
    }

    /// Units named by a single header token, if any.
    pub fn match_token(&self, token: &str) -> Option<Units> {
        let norm = normalize_token(token);
        if norm.is_empty() {
            return None;
        }
        self.patterns.iter().find_map(|p| {
            let rest = norm.strip_prefix(p.stem.as_str())?;
            (rest.is_empty() || self.suffixes.iter().any(|s| s == rest)).then_some(p.units)
        })
    }

    /// Scan header lines. Returns the declared units and the keyword that
    /// declared them, or `None` when no keyword or conflicting keywords appear.
    pub fn match_header(&self, header_lines: &[String]) -> HeaderMatch {
        let mut found: Vec<(Units, String)> = Vec::new();
        for line in header_lines {
            for token in line.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '|')) {
                if let Some(units) = self.match_token(token) {
                    found.push((units, token.to_string()));
                }
            }
        }
        let has_cl = found.iter().any(|(u, _)| *u == Units::Cl);
        let has_dl = found.iter().any(|(u, _)| *u == Units::Dl);
        match (has_cl, has_dl) {
            (false, false) => HeaderMatch::None,
            (true, true) => HeaderMatch::Conflicting(found.into_iter().map(|(_, k)| k).collect()),
            _ => {
                let (units, keyword) = found.swap_remove(0);
                HeaderMatch::Declared { units, keyword }
            }
        }
    }
}

/// Outcome of scanning a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderMatch {
    None,
    Declared { units: Units, keyword: String },
    Conflicting(Vec<String>),
}

/// Lowercase, drop unit annotations in brackets, strip separators.
fn normalize_token(token: &str) -> String {
    let token = token.split('[').next().unwrap_or("");
    token
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && !SEPARATORS.contains(c))
        .collect()
}

/// File-level facts recorded alongside a spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumMetadata {
    pub path: PathBuf,
    pub sha256: String,
    pub header_lines: Vec<String>,
    pub rows: usize,
    pub layout: ColumnLayout,
    /// Header keywords that named both conventions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_keywords: Vec<String>,
}

/// A parsed spectrum with its initial units guess.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSpectrum {
    pub spectrum: Spectrum,
    pub units: UnitsTag,
    pub metadata: SpectrumMetadata,
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> PipelineError {
    PipelineError::Parse {
        file: path.to_path_buf(),
        line: Some(line),
        message: message.into(),
    }
}

fn read_text(path: &Path) -> Result<(String, String), PipelineError> {
    let bytes = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    if let Some(signature) = detect_error_page_bytes(&bytes) {
        return Err(PipelineError::DownloadFailure {
            file: path.to_path_buf(),
            signature: signature.to_string(),
        });
    }
    let sha256 = sha256_hex(&bytes);
    let text = String::from_utf8(bytes).map_err(|e| PipelineError::Parse {
        file: path.to_path_buf(),
        line: None,
        message: format!("not UTF-8 text: {}", e),
    })?;
    Ok((text, sha256))
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_ell(field: &str, path: &Path, line: usize) -> Result<u32, PipelineError> {
    let v: f64 = field
        .parse()
        .map_err(|_| parse_error(path, line, format!("multipole '{}' is not a number", field)))?;
    if !v.is_finite() || v < 1.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        return Err(parse_error(
            path,
            line,
            format!("multipole '{}' is not a positive integer", field),
        ));
    }
    Ok(v as u32)
}

fn parse_float(field: &str, what: &str, path: &Path, line: usize) -> Result<f64, PipelineError> {
    let v: f64 = field
        .parse()
        .map_err(|_| parse_error(path, line, format!("{} '{}' is not a number", what, field)))?;
    if !v.is_finite() {
        return Err(parse_error(path, line, format!("{} '{}' is not finite", what, field)));
    }
    Ok(v)
}

/// Parse spectrum text already read from `path`.
pub fn parse_spectrum(
    text: &str,
    path: &Path,
) -> Result<(Spectrum, Vec<String>), PipelineError> {
    let mut header_lines = Vec::new();
    let mut points: Vec<SpectrumPoint> = Vec::new();
    let mut layout: Option<(ColumnLayout, usize)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            if points.is_empty() {
                header_lines.push(header.trim().to_string());
            }
            continue;
        }

        let fields = split_row(line);
        let (row_layout, columns) = match layout {
            Some(l) => l,
            None => {
                let l = ColumnLayout::from_column_count(fields.len()).ok_or_else(|| {
                    parse_error(path, line_no, "need at least 2 columns (ell, value)")
                })?;
                layout = Some((l, fields.len()));
                (l, fields.len())
            }
        };
        if fields.len() != columns {
            return Err(parse_error(
                path,
                line_no,
                format!(
                    "row has {} columns but the first data row has {}",
                    fields.len(),
                    columns
                ),
            ));
        }

        let ell = parse_ell(fields[0], path, line_no)?;
        let value = parse_float(fields[1], "value", path, line_no)?;
        let sigma = if row_layout.has_sigma() {
            Some(parse_float(fields[2], "sigma", path, line_no)?)
        } else {
            None
        };
        if let Some(prev) = points.last() {
            if ell <= prev.ell {
                return Err(parse_error(
                    path,
                    line_no,
                    format!(
                        "multipoles must be strictly increasing ({} follows {})",
                        ell, prev.ell
                    ),
                ));
            }
        }
        points.push(SpectrumPoint { ell, value, sigma });
    }

    let (layout, _) = layout.ok_or_else(|| PipelineError::Parse {
        file: path.to_path_buf(),
        line: None,
        message: "no data rows".into(),
    })?;
    Ok((Spectrum::new(points, layout), header_lines))
}

/// Load a spectrum and make the initial units guess.
///
/// HTML/XML error pages are rejected before any numeric parsing.
pub fn load(
    path: &Path,
    patterns: &UnitPatternTable,
    thresholds: &Thresholds,
) -> Result<LoadedSpectrum, PipelineError> {
    let (text, sha256) = read_text(path)?;
    let (spectrum, header_lines) = parse_spectrum(&text, path)?;

    let header = patterns.match_header(&header_lines);
    let mut conflicting_keywords = Vec::new();
    let declared = match header {
        HeaderMatch::Declared { units, keyword } => Some((units, keyword)),
        HeaderMatch::Conflicting(keywords) => {
            conflicting_keywords = keywords;
            None
        }
        HeaderMatch::None => None,
    };
    let units = units::initial_guess(declared, &spectrum, thresholds);

    debug!(
        file = %path.display(),
        rows = spectrum.len(),
        layout = ?spectrum.layout,
        units = %units.units,
        method = ?units.method,
        "Loaded spectrum"
    );

    Ok(LoadedSpectrum {
        metadata: SpectrumMetadata {
            path: path.to_path_buf(),
            sha256,
            header_lines,
            rows: spectrum.len(),
            layout: spectrum.layout,
            conflicting_keywords,
        },
        spectrum,
        units,
    })
}

/// Load a square, symmetric covariance matrix, with the SHA-256 of the bytes read.
pub fn load_covariance(path: &Path) -> Result<(Covariance, String), PipelineError> {
    let (text, sha256) = read_text(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = split_row(line)
            .into_iter()
            .map(|f| parse_float(f, "covariance entry", path, idx + 1))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }

    let dim = rows.len();
    if dim == 0 {
        return Err(PipelineError::Parse {
            file: path.to_path_buf(),
            line: None,
            message: "covariance has no rows".into(),
        });
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(PipelineError::Parse {
            file: path.to_path_buf(),
            line: None,
            message: format!(
                "covariance is not square: row {} has {} entries, expected {}",
                i + 1,
                row.len(),
                dim
            ),
        });
    }
    for i in 0..dim {
        for j in (i + 1)..dim {
            let (a, b) = (rows[i][j], rows[j][i]);
            let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
            if (a - b).abs() / scale > SYMMETRY_TOLERANCE {
                return Err(PipelineError::Parse {
                    file: path.to_path_buf(),
                    line: None,
                    message: format!("covariance is not symmetric at ({}, {})", i, j),
                });
            }
        }
    }

    let data: Vec<f64> = rows.into_iter().flatten().collect();
    let cov = Covariance::new(dim, data).map_err(|e| PipelineError::Parse {
        file: path.to_path_buf(),
        line: None,
        message: e.to_string(),
    })?;
    Ok((cov, sha256))
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_types::{Confidence, ResolutionMethod};
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_keyword_variants() {
        let table = UnitPatternTable::default();
        for dl in ["Dl", "D_ell", "Dℓ", "DlTT", "D_l^TT", "D_{\\ell}", "DL_EE", "Dl[uK^2]"] {
            assert_eq!(table.match_token(dl), Some(Units::Dl), "{dl}");
        }
        for cl in ["Cl", "C_ell", "ClTT", "C_l", "cℓ"] {
            assert_eq!(table.match_token(cl), Some(Units::Cl), "{cl}");
        }
        for none in ["ell", "sigma", "L", "class", "Dlx"] {
            assert_eq!(table.match_token(none), None, "{none}");
        }
    }

    #[test]
    fn test_custom_pattern() {
        let mut table = UnitPatternTable::default();
        assert_eq!(table.match_token("PowerDL"), None);
        table.add(Units::Dl, "Power_DL");
        assert_eq!(table.match_token("PowerDL"), Some(Units::Dl));
        assert_eq!(table.match_token("power-dl-tt"), Some(Units::Dl));
    }

    #[test]
    fn test_conflicting_header() {
        let table = UnitPatternTable::default();
        let header = vec!["ell Cl Dl".to_string()];
        assert!(matches!(table.match_header(&header), HeaderMatch::Conflicting(_)));
    }

    #[test]
    fn test_three_column_with_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(
            temp_dir.path(),
            "obs.txt",
            "# ell D_ell sigma\n2 1000.0 10.0\n3 1100.0 11.0\n\n4 1200.0 12.0\n",
        );
        let loaded = load(&path, &UnitPatternTable::default(), &Thresholds::default()).unwrap();
        assert_eq!(loaded.spectrum.layout, ColumnLayout::ThreeColumn);
        assert_eq!(loaded.spectrum.ells(), vec![2, 3, 4]);
        assert_eq!(loaded.spectrum.sigmas(), Some(vec![10.0, 11.0, 12.0]));
        assert_eq!(loaded.units.units, Units::Dl);
        assert_eq!(loaded.units.method, ResolutionMethod::Header);
        assert_eq!(loaded.units.header_keyword.as_deref(), Some("D_ell"));
        assert_eq!(loaded.metadata.rows, 3);
    }

    #[test]
    fn test_two_column_without_header_uses_magnitude() {
        let temp_dir = TempDir::new().unwrap();
        let rows: String = (2..200)
            .map(|l| format!("{} {}\n", l, 2500.0))
            .collect();
        let path = write(temp_dir.path(), "obs.txt", &rows);
        let loaded = load(&path, &UnitPatternTable::default(), &Thresholds::default()).unwrap();
        assert_eq!(loaded.spectrum.layout, ColumnLayout::TwoColumn);
        assert_eq!(loaded.spectrum.sigmas(), None);
        assert_eq!(loaded.units.units, Units::Dl);
        assert_eq!(loaded.units.method, ResolutionMethod::MagnitudeHeuristic);
        assert_eq!(loaded.units.confidence, Confidence::Heuristic);
    }

    #[test]
    fn test_html_is_never_parsed() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(temp_dir.path(), "obs.txt", "<html><body>Not Found</body></html>");
        let err = load(&path, &UnitPatternTable::default(), &Thresholds::default()).unwrap_err();
        assert!(matches!(err, PipelineError::DownloadFailure { .. }));
    }

    #[test]
    fn test_inconsistent_columns_name_line() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(temp_dir.path(), "obs.txt", "2 1.0 0.1\n3 2.0\n");
        match load(&path, &UnitPatternTable::default(), &Thresholds::default()) {
            Err(PipelineError::Parse { line, .. }) => assert_eq!(line, Some(2)),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_multipoles() {
        let temp_dir = TempDir::new().unwrap();
        let table = UnitPatternTable::default();
        let t = Thresholds::default();
        for body in ["2.5 1.0\n", "0 1.0\n", "3 1.0\n2 1.0\n", "# only header\n"] {
            let path = write(temp_dir.path(), "bad.txt", body);
            assert!(load(&path, &table, &t).is_err(), "{body:?}");
        }
    }

    #[test]
    fn test_covariance_loading() {
        let temp_dir = TempDir::new().unwrap();
        let ok = write(temp_dir.path(), "cov.txt", "# cov\n4 1\n1 9\n");
        let (cov, sha256) = load_covariance(&ok).unwrap();
        assert_eq!(sha256, sha256_hex(b"# cov\n4 1\n1 9\n"));
        assert_eq!(cov.dim(), 2);
        assert_eq!(cov.diagonal(), vec![4.0, 9.0]);

        let asym = write(temp_dir.path(), "asym.txt", "4 1\n2 9\n");
        assert!(load_covariance(&asym).is_err());
        let ragged = write(temp_dir.path(), "ragged.txt", "4 1\n9\n");
        assert!(load_covariance(&ragged).is_err());
    }
}
