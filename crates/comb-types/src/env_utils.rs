//! Environment variable parsing utilities.
//!
//! ```
//! use comb_types::env_utils::env_bool_or;
//!
//! let strict = env_bool_or("COMB_FORENSICS_STRICT", true);
//! # let _ = strict;
//! ```

/// Read a boolean flag, falling back to `default` when unset.
///
/// "1", "true", "yes" and "on" are truthy; "0", "false", "no" and "off" are
/// falsy; anything else keeps the default.
pub fn env_bool_or(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|v| v.to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_or() {
        std::env::set_var("COMB_TEST_BOOL_OFF", "off");
        std::env::set_var("COMB_TEST_BOOL_YES", "YES");
        std::env::set_var("COMB_TEST_BOOL_JUNK", "maybe");

        assert!(!env_bool_or("COMB_TEST_BOOL_OFF", true));
        assert!(env_bool_or("COMB_TEST_BOOL_YES", false));
        assert!(env_bool_or("COMB_TEST_BOOL_JUNK", true));
        assert!(env_bool_or("COMB_NONEXISTENT_VAR_2", true));

        std::env::remove_var("COMB_TEST_BOOL_OFF");
        std::env::remove_var("COMB_TEST_BOOL_YES");
        std::env::remove_var("COMB_TEST_BOOL_JUNK");
    }

    #[test]
    fn test_empty_value_keeps_default() {
        std::env::set_var("COMB_TEST_BOOL_EMPTY", "");
        assert!(env_bool_or("COMB_TEST_BOOL_EMPTY", true));
        assert!(!env_bool_or("COMB_TEST_BOOL_EMPTY", false));
        std::env::remove_var("COMB_TEST_BOOL_EMPTY");
    }
}
