//! Shared domain types for the Trellis control plane.
//!
//! This crate provides:
//! - Labels and their canonical flattened form
//! - Namespace containment rules
//! - Configuration types shared across crates

pub mod config;
pub mod error;
pub mod labels;
pub mod namespace;

pub use error::{Error, Result};
pub use labels::{Label, LabelSet};
