//! Namespace containment rules.
//!
//! Namespaces are slash-delimited hierarchical names. A token scoped to
//! `/org/team` may operate on `/org/team` and anything below it;
//! prefix containment defines capability scope.

use crate::error::{Error, Result};

/// Whether `child` falls inside `parent`'s scope.
///
/// True iff `parent` is a prefix of `child` (or equal).
pub fn contains(parent: &str, child: &str) -> bool {
    child.starts_with(parent)
}

/// Validate a namespace string: non-empty, no whitespace, no empty
/// interior segments.
pub fn validate(ns: &str) -> Result<()> {
    if ns.is_empty() {
        return Err(Error::InvalidNamespace("empty namespace".to_string()));
    }
    if ns.chars().any(char::is_whitespace) {
        return Err(Error::InvalidNamespace(ns.to_string()));
    }
    if ns.contains("//") {
        return Err(Error::InvalidNamespace(ns.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_containment() {
        assert!(contains("/org/team", "/org/team"));
        assert!(contains("/org/team", "/org/team/sub"));
        assert!(!contains("/org/team", "/other/team"));
        assert!(!contains("/org/team/sub", "/org/team"));
    }

    #[test]
    fn validation() {
        assert!(validate("/org/team").is_ok());
        assert!(validate("").is_err());
        assert!(validate("/org//team").is_err());
        assert!(validate("/org team").is_err());
    }
}
