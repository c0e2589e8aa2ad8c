//! Tool home and environment defaults
//!
//! The ledger lives under `$COMB_FORENSICS_HOME/ledger` (default
//! `~/.comb-forensics/ledger`) unless `--ledger-dir` names another root.

use std::path::PathBuf;

use comb_types::env_utils::env_bool_or;

pub const HOME_ENV: &str = "COMB_FORENSICS_HOME";
pub const STRICT_ENV: &str = "COMB_FORENSICS_STRICT";

pub fn forensics_home() -> PathBuf {
    std::env::var(HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".comb-forensics")
        })
}

/// `--ledger-dir` if given, otherwise `<home>/ledger`.
pub fn ledger_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| forensics_home().join("ledger"))
}

/// Strict-mode default for configs built from flags.
pub fn default_strict() -> bool {
    env_bool_or(STRICT_ENV, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_root_prefers_explicit_dir() {
        let explicit = PathBuf::from("/tmp/elsewhere");
        assert_eq!(ledger_root(Some(explicit.clone())), explicit);

        std::env::set_var(HOME_ENV, "/srv/forensics");
        assert_eq!(ledger_root(None), PathBuf::from("/srv/forensics/ledger"));
        std::env::remove_var(HOME_ENV);
    }
}
