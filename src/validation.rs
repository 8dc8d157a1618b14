//! Name-safety validation.
//!
//! Every human-supplied entity name (bio-rep, condition, timepoint, FOV,
//! channel) becomes a directory name inside the array trees, so it is checked
//! here before it reaches SQL or the filesystem.
//!
//! Accepted grammar: an ASCII alphanumeric first character followed by up to
//! 254 characters from `[A-Za-z0-9._-]`, with no `..` sequence anywhere.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// Maximum accepted name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]{0,254}$").expect("static name pattern compiles")
});

/// Validates a name for use as a path segment.
///
/// Returns the name unchanged on success so it can be used inline:
///
/// ```
/// use cytostore::validation::validate_name;
///
/// assert_eq!(validate_name("FOV_1").unwrap(), "FOV_1");
/// assert!(validate_name("../etc").is_err());
/// ```
pub fn validate_name(name: &str) -> StoreResult<&str> {
    let reject = |reason: &'static str| StoreError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(reject("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(reject("name exceeds 255 characters"));
    }
    if name.contains('\0') {
        return Err(reject("name cannot contain null bytes"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(reject("name cannot contain path separators"));
    }
    if name.contains("..") {
        return Err(reject("name cannot contain '..'"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(reject("name must start with a letter or digit"));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(reject(
            "name may only contain letters, digits, '.', '_' and '-'",
        ));
    }
    Ok(name)
}

/// Validates an optional name, passing `None` through.
pub fn validate_optional_name(name: Option<&str>) -> StoreResult<Option<&str>> {
    name.map(validate_name).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_grammar_conforming_names() {
        for name in ["N1", "control", "FOV_1", "t0.5", "a-b_c.d", "9", "DAPI"] {
            assert_eq!(validate_name(name).unwrap(), name);
        }
        let longest = format!("a{}", "b".repeat(254));
        assert_eq!(validate_name(&longest).unwrap(), longest);
    }

    #[test]
    fn rejects_unsafe_names() {
        let too_long = "a".repeat(256);
        for name in [
            "",
            ".hidden",
            "-flag",
            "..",
            "a..b",
            "a/b",
            "a\\b",
            "nul\0byte",
            "with space",
            "tab\tname",
            "ümlaut",
            too_long.as_str(),
        ] {
            let err = validate_name(name).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidName { .. }),
                "expected InvalidName for {name:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn optional_names_pass_none_through() {
        assert_eq!(validate_optional_name(None).unwrap(), None);
        assert_eq!(validate_optional_name(Some("t1")).unwrap(), Some("t1"));
        assert!(validate_optional_name(Some("../t1")).is_err());
    }
}
