//! SHA-256 helpers shared by the manifest validator, the config hash and the
//! Monte Carlo ensemble digest.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Raw SHA-256 digest of a byte slice.
pub fn sha256_32(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256_32(bytes))
}

/// Streamed SHA-256 of a file, with its size in bytes.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// SHA-256 over a sequence of f64 values, little-endian, in order.
pub fn sha256_f64s(values: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Normalize a hex digest for comparison (trim, lowercase, optional `sha256:` prefix).
pub fn normalize_digest(digest: &str) -> Result<String> {
    let trimmed = digest.trim();
    let trimmed = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    let lower = trimmed.to_ascii_lowercase();
    if lower.len() != 64 || !lower.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid SHA-256 digest '{}'", digest));
    }
    Ok(lower)
}
