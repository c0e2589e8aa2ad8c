//! SHA-256 manifests and the manifest validator.
//!
//! A manifest is produced upstream for each data release:
//!
//! ```json
//! {
//!   "generated": "2025-03-01T12:00:00Z",
//!   "hash_algorithm": "SHA-256",
//!   "files": [
//!     {"filename": "planck_tt.txt", "path": "planck/planck_tt.txt",
//!      "size": 51234, "sha256": "…"}
//!   ]
//! }
//! ```
//!
//! Validation is fail-fast: the first mismatch aborts. A file whose leading
//! bytes look like an HTML/XML document is reported as a download failure
//! rather than an integrity error, because a saved error page is the most
//! common way a "data file" ends up wrong.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use comb_types::encoding::{normalize_digest, sha256_file};
use comb_types::{PipelineError, RunWarning, Stage, WarningKind};

pub const HASH_ALGORITHM: &str = "SHA-256";

/// Leading-byte signatures of HTML/XML documents, lowercase.
const ERROR_PAGE_SIGNATURES: &[&str] = &["<html", "<!doctype", "<?xml"];

/// Bytes inspected when sniffing for an error page.
const SNIFF_LEN: usize = 512;

/// One hashed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    /// Path relative to the manifest's data directory
    pub path: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Hashed inventory of a data release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub generated: String,
    pub hash_algorithm: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load and sanity-check a manifest file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|e| PipelineError::Parse {
                file: path.to_path_buf(),
                line: Some(e.line()),
                message: format!("invalid manifest JSON: {}", e),
            })?;
        let algo = manifest.hash_algorithm.replace('-', "").to_ascii_lowercase();
        if algo != "sha256" {
            return Err(PipelineError::Parse {
                file: path.to_path_buf(),
                line: None,
                message: format!(
                    "unsupported hash_algorithm '{}', expected {}",
                    manifest.hash_algorithm, HASH_ALGORITHM
                ),
            });
        }
        Ok(manifest)
    }
}

/// A named manifest with the directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct NamedManifest {
    pub name: String,
    pub data_dir: PathBuf,
    pub manifest: Manifest,
}

/// All manifests consulted in a run, keyed by dataset/release name.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    manifests: Vec<NamedManifest>,
}

impl ManifestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load manifests; each is named by its file stem and resolves paths
    /// relative to its own directory.
    pub fn load(paths: &[PathBuf]) -> Result<Self, PipelineError> {
        let mut set = Self::new();
        for path in paths {
            let manifest = Manifest::load(path)?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("manifest")
                .to_string();
            let data_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            set.insert(name, data_dir, manifest);
        }
        Ok(set)
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        manifest: Manifest,
    ) {
        self.manifests.push(NamedManifest {
            name: name.into(),
            data_dir: data_dir.into(),
            manifest,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedManifest> {
        self.manifests.iter()
    }

    /// Validate every manifest against its data directory.
    pub fn validate_all(&self) -> Result<Vec<ValidationReport>, PipelineError> {
        self.manifests
            .iter()
            .map(|m| validate(&m.manifest, &m.data_dir))
            .collect()
    }
}

/// A file that passed hash verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Result of validating one manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files: Vec<VerifiedFile>,
}

/// Check whether leading bytes look like an HTML/XML document.
///
/// Leading whitespace and a UTF-8 BOM are skipped; matching is case-insensitive.
pub fn detect_error_page_bytes(bytes: &[u8]) -> Option<&'static str> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let head = &bytes[start..];
    ERROR_PAGE_SIGNATURES.iter().copied().find(|sig| {
        head.len() >= sig.len() && head[..sig.len()].eq_ignore_ascii_case(sig.as_bytes())
    })
}

/// Sniff a file for an HTML/XML error page.
pub fn detect_error_page(path: &Path) -> Result<(), PipelineError> {
    let mut file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut buf = Vec::with_capacity(SNIFF_LEN);
    file.by_ref()
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut buf)
        .map_err(|e| PipelineError::io(path, e))?;
    match detect_error_page_bytes(&buf) {
        Some(signature) => Err(PipelineError::DownloadFailure {
            file: path.to_path_buf(),
            signature: signature.to_string(),
        }),
        None => Ok(()),
    }
}

fn hash_file(path: &Path) -> Result<(String, u64), PipelineError> {
    sha256_file(path).map_err(|e| PipelineError::io(path, format!("{:#}", e)))
}

/// Verify every entry of `manifest` against files under `data_dir`.
///
/// Stops at the first failing file.
pub fn validate(manifest: &Manifest, data_dir: &Path) -> Result<ValidationReport, PipelineError> {
    info!(
        data_dir = %data_dir.display(),
        entries = manifest.files.len(),
        "Validating manifest"
    );
    let mut files = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        let path = data_dir.join(&entry.path);
        if !path.is_file() {
            return Err(PipelineError::MissingFile { file: path });
        }
        detect_error_page(&path)?;

        let expected = normalize_digest(&entry.sha256).map_err(|e| PipelineError::Parse {
            file: path.clone(),
            line: None,
            message: e.to_string(),
        })?;
        let (actual, size) = hash_file(&path)?;
        if actual != expected {
            return Err(PipelineError::Integrity {
                file: path,
                expected,
                actual,
            });
        }
        if size != entry.size {
            warn!(
                file = %path.display(),
                manifest_size = entry.size,
                actual_size = size,
                "Hash matches but manifest size differs"
            );
        }
        debug!(file = %path.display(), sha256 = %actual, "Manifest entry verified");
        files.push(VerifiedFile {
            filename: entry.filename.clone(),
            path,
            size,
            sha256: actual,
        });
    }
    Ok(ValidationReport { files })
}

/// Provenance of a file the pipeline actually read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumedFile {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_entry: Option<String>,
}

/// Check that each consumed file matches exactly one manifest entry by hash.
///
/// In strict mode a file missing from every manifest is fatal; otherwise it is
/// hashed, recorded and reported as a warning.
pub fn verify_consumed(
    consumed: &[PathBuf],
    manifests: &ManifestSet,
    strict: bool,
) -> Result<(Vec<ConsumedFile>, Vec<RunWarning>), PipelineError> {
    let mut files = Vec::with_capacity(consumed.len());
    let mut warnings = Vec::new();

    for path in consumed {
        detect_error_page(path)?;
        let (sha256, size) = hash_file(path)?;
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let mut by_hash: Vec<(&NamedManifest, &ManifestEntry)> = Vec::new();
        let mut by_name: Vec<(&NamedManifest, &ManifestEntry)> = Vec::new();
        for named in manifests.iter() {
            for entry in &named.manifest.files {
                let entry_hash = normalize_digest(&entry.sha256).unwrap_or_default();
                if entry_hash == sha256 {
                    by_hash.push((named, entry));
                } else if entry.filename == filename {
                    by_name.push((named, entry));
                }
            }
        }

        if by_hash.len() > 1 {
            let same_name: Vec<_> = by_hash
                .iter()
                .filter(|(_, e)| e.filename == filename)
                .copied()
                .collect();
            if same_name.len() == 1 {
                by_hash = same_name;
            } else {
                return Err(PipelineError::AmbiguousManifestEntry {
                    file: path.clone(),
                    matches: by_hash.len(),
                });
            }
        }

        match by_hash.first() {
            Some((named, entry)) => {
                debug!(
                    file = %path.display(),
                    manifest = %named.name,
                    "Consumed file matches manifest"
                );
                files.push(ConsumedFile {
                    path: path.clone(),
                    sha256,
                    size,
                    manifest: Some(named.name.clone()),
                    manifest_entry: Some(entry.filename.clone()),
                });
            }
            None => {
                if let Some((_, entry)) = by_name.first() {
                    return Err(PipelineError::Integrity {
                        file: path.clone(),
                        expected: normalize_digest(&entry.sha256)
                            .unwrap_or_else(|_| entry.sha256.clone()),
                        actual: sha256,
                    });
                }
                if strict {
                    return Err(PipelineError::MissingManifestEntry {
                        file: path.clone(),
                        sha256,
                    });
                }
                warn!(file = %path.display(), "Consumed file is not listed in any manifest");
                warnings.push(RunWarning::new(
                    WarningKind::UnmanifestedFile,
                    Stage::Manifest,
                    format!(
                        "{} (sha256 {}) is not listed in any manifest",
                        path.display(),
                        sha256
                    ),
                ));
                files.push(ConsumedFile {
                    path: path.clone(),
                    sha256,
                    size,
                    manifest: None,
                    manifest_entry: None,
                });
            }
        }
    }
    Ok((files, warnings))
}

/// Hash every regular file under `dir` into a new manifest.
///
/// Hidden files and `exclude` (typically the manifest being written) are skipped.
pub fn generate(dir: &Path, exclude: Option<&Path>) -> Result<Manifest> {
    let mut paths = Vec::new();
    collect_files(dir, &mut paths)?;
    paths.sort();

    let exclude = exclude.and_then(|p| p.canonicalize().ok());
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        if let (Some(ex), Ok(canon)) = (&exclude, path.canonicalize()) {
            if *ex == canon {
                continue;
            }
        }
        let (sha256, size) = sha256_file(&path)?;
        let relative = path
            .strip_prefix(dir)
            .map_err(|_| anyhow!("{} is outside {}", path.display(), dir.display()))?;
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        files.push(ManifestEntry {
            filename: path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string(),
            path: relative.to_string_lossy().replace('\\', "/"),
            size,
            sha256,
            timestamp: modified,
        });
    }

    Ok(Manifest {
        generated: Utc::now().to_rfc3339(),
        hash_algorithm: HASH_ALGORITHM.to_string(),
        files,
    })
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|s| s.starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use comb_types::encoding::sha256_hex;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn manifest_for(entries: &[(&str, &[u8])]) -> Manifest {
        Manifest {
            generated: "2025-01-01T00:00:00Z".into(),
            hash_algorithm: "SHA-256".into(),
            files: entries
                .iter()
                .map(|(name, contents)| ManifestEntry {
                    filename: name.to_string(),
                    path: name.to_string(),
                    size: contents.len() as u64,
                    sha256: sha256_hex(contents),
                    timestamp: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_matching_manifest_validates() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.txt", b"2 1.0\n3 2.0\n");
        write(temp_dir.path(), "b.txt", b"2 5.0\n");
        let manifest = manifest_for(&[("a.txt", b"2 1.0\n3 2.0\n"), ("b.txt", b"2 5.0\n")]);

        let report = validate(&manifest, temp_dir.path()).unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.files[0].sha256, sha256_hex(b"2 1.0\n3 2.0\n"));
    }

    #[test]
    fn test_mismatch_names_file() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a.txt", b"2 1.0\n");
        write(temp_dir.path(), "b.txt", b"tampered\n");
        let manifest = manifest_for(&[("a.txt", b"2 1.0\n"), ("b.txt", b"2 5.0\n")]);

        match validate(&manifest, temp_dir.path()) {
            Err(PipelineError::Integrity {
                file,
                expected,
                actual,
            }) => {
                assert!(file.ends_with("b.txt"));
                assert_eq!(expected, sha256_hex(b"2 5.0\n"));
                assert_eq!(actual, sha256_hex(b"tampered\n"));
            }
            other => panic!("expected IntegrityError, got {:?}", other),
        }
    }

    #[test]
    fn test_html_page_is_download_failure() {
        let temp_dir = TempDir::new().unwrap();
        let page = b"  <!DOCTYPE html><html><body>404</body></html>";
        write(temp_dir.path(), "a.txt", page);
        // Even with a matching hash an error page is never accepted as data.
        let manifest = manifest_for(&[("a.txt", page)]);

        match validate(&manifest, temp_dir.path()) {
            Err(PipelineError::DownloadFailure { signature, .. }) => {
                assert_eq!(signature, "<!doctype")
            }
            other => panic!("expected DownloadFailureError, got {:?}", other),
        }
    }

    #[test]
    fn test_detect_error_page_bytes() {
        assert_eq!(detect_error_page_bytes(b"<HTML>"), Some("<html"));
        assert_eq!(
            detect_error_page_bytes(b"\xEF\xBB\xBF\n<?xml version"),
            Some("<?xml")
        );
        assert_eq!(detect_error_page_bytes(b"# D_ell\n2 1.0"), None);
        assert_eq!(detect_error_page_bytes(b""), None);
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = manifest_for(&[("gone.txt", b"x")]);
        assert!(matches!(
            validate(&manifest, temp_dir.path()),
            Err(PipelineError::MissingFile { .. })
        ));
    }

    #[test]
    fn test_verify_consumed_strict_and_lenient() {
        let temp_dir = TempDir::new().unwrap();
        let listed = write(temp_dir.path(), "a.txt", b"2 1.0\n");
        let unlisted = write(temp_dir.path(), "c.txt", b"2 9.0\n");
        let mut set = ManifestSet::new();
        set.insert("release", temp_dir.path(), manifest_for(&[("a.txt", b"2 1.0\n")]));

        let (files, warnings) = verify_consumed(&[listed.clone()], &set, true).unwrap();
        assert_eq!(files[0].manifest.as_deref(), Some("release"));
        assert!(warnings.is_empty());

        assert!(matches!(
            verify_consumed(&[unlisted.clone()], &set, true),
            Err(PipelineError::MissingManifestEntry { .. })
        ));

        let (files, warnings) = verify_consumed(&[unlisted], &set, false).unwrap();
        assert!(files[0].manifest.is_none());
        assert_eq!(warnings[0].kind, WarningKind::UnmanifestedFile);
    }

    #[test]
    fn test_verify_consumed_same_name_different_hash() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(temp_dir.path(), "a.txt", b"changed\n");
        let mut set = ManifestSet::new();
        set.insert("release", temp_dir.path(), manifest_for(&[("a.txt", b"2 1.0\n")]));

        assert!(matches!(
            verify_consumed(&[path], &set, false),
            Err(PipelineError::Integrity { .. })
        ));
    }

    #[test]
    fn test_generate_then_validate() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir(temp_dir.path().join("sub"))?;
        write(temp_dir.path(), "a.txt", b"2 1.0\n");
        write(&temp_dir.path().join("sub"), "b.txt", b"2 2.0\n");
        write(temp_dir.path(), ".hidden", b"skip");

        let manifest = generate(temp_dir.path(), None)?;
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[1].path, "sub/b.txt");
        validate(&manifest, temp_dir.path())?;
        Ok(())
    }

    #[test]
    fn test_rejects_other_hash_algorithm() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(
            temp_dir.path(),
            "m.json",
            br#"{"generated":"x","hash_algorithm":"MD5","files":[]}"#,
        );
        assert!(matches!(Manifest::load(&path), Err(PipelineError::Parse { .. })));
    }
}
