//! Labels and their canonical flattened form.
//!
//! A label is a single `name=value` tag. A label set is an
//! order-independent collection of labels. Sets are flattened into a
//! canonical string (sorted, comma-delimited) so that equality tests and
//! unique indexes operate on a single column.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `name=value` tag.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Create a label from name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse from `name=value` form. A bare `name` is a value-less label.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.starts_with('=') {
            return Err(Error::InvalidLabel(s.to_string()));
        }
        match s.split_once('=') {
            Some((name, value)) => Ok(Self::new(name, value)),
            None => Ok(Self::new(s, "")),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}={}", self.name, self.value)
        }
    }
}

/// An order-independent set of labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    /// Build a set from labels. Duplicates are collapsed, order discarded.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup();
        Self { labels }
    }

    /// Parse each element as `name=value`.
    pub fn parse(parts: &[&str]) -> Result<Self> {
        let labels = parts
            .iter()
            .map(|p| Label::parse(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(labels))
    }

    /// Parse the canonical flattened form produced by [`LabelSet::flatten`].
    pub fn parse_flat(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        Self::parse(&s.split(',').collect::<Vec<_>>())
    }

    /// The canonical flattened form: labels sorted, comma-delimited.
    ///
    /// Two sets are equal iff their flattened forms are byte-equal.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        for (i, l) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&l.to_string());
        }
        out
    }

    /// Whether every label in `other` is present in this set.
    pub fn contains_all(&self, other: &LabelSet) -> bool {
        other.labels.iter().all(|l| self.labels.contains(l))
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    /// The labels in canonical order, rendered as `name=value` strings.
    pub fn as_strings(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.to_string()).collect()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_is_order_independent() {
        let a = LabelSet::parse(&["env=prod", "service=www"]).unwrap();
        let b = LabelSet::parse(&["service=www", "env=prod"]).unwrap();
        assert_eq!(a.flatten(), b.flatten());
        assert_eq!(a.flatten(), "env=prod,service=www");
    }

    #[test]
    fn flatten_collapses_duplicates() {
        let a = LabelSet::parse(&["env=prod", "env=prod"]).unwrap();
        assert_eq!(a.flatten(), "env=prod");
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn flatten_round_trips() {
        let a = LabelSet::parse(&["host=foo.example", "env=prod"]).unwrap();
        let b = LabelSet::parse_flat(&a.flatten()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn value_less_labels() {
        let l = Label::parse(":deployment").unwrap();
        assert_eq!(l.name, ":deployment");
        assert_eq!(l.to_string(), ":deployment");
    }

    #[test]
    fn rejects_empty_and_nameless() {
        assert!(Label::parse("").is_err());
        assert!(Label::parse("=value").is_err());
    }

    #[test]
    fn contains_all_subset() {
        let services = LabelSet::parse(&["env=prod", "service=www", "region=eu"]).unwrap();
        let target = LabelSet::parse(&["env=prod", "service=www"]).unwrap();
        assert!(services.contains_all(&target));
        assert!(!target.contains_all(&services));
    }

    #[test]
    fn empty_set_flattens_empty() {
        let s = LabelSet::default();
        assert_eq!(s.flatten(), "");
        assert_eq!(LabelSet::parse_flat("").unwrap(), s);
    }
}
