//! Error types for the experiment store and workflow engine.
//!
//! This module defines `StoreError`, the single error type returned by every
//! store and workflow operation. Built on `thiserror`, it groups failures into
//! categories that callers can branch on without inspecting message text:
//!
//! - **Validation** (`InvalidName`, `InvalidArray`, `ShapeMismatch`,
//!   `DtypeMismatch`, `PathEscape`, `InvalidParameters`,
//!   `MissingFilterDependency`): the request was
//!   malformed. Always raised before any persistent mutation.
//! - **NotFound** (`BioRepNotFound`, `ConditionNotFound`, ...): a named lookup had
//!   zero matches. Scoped per entity kind.
//! - **Ambiguous** (`AmbiguousSelection`): an omitted coordinate had more than
//!   one candidate. Distinct from NotFound so callers can offer a choice.
//! - **Duplicate**: a unique constraint rejected an insert.
//! - **Workflow** (`DagValidation`, `UnknownStep`, `UnknownStepKind`): graph
//!   definition problems.
//! - **Schema** (`SchemaVersion`): the on-disk format does not match this build.
//! - **Internal** (`Sqlite`, `Io`, `Zarr`, ...): storage-layer failures.

use std::fmt;

use thiserror::Error;

use crate::workflow::dag::DagIssue;

/// Convenience alias for results using the store error type.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input, rejected before touching storage.
    Validation,
    /// A named entity does not exist.
    NotFound,
    /// An omitted coordinate matched more than one entity.
    Ambiguous,
    /// A unique constraint was violated.
    Duplicate,
    /// Workflow graph definition problem.
    Workflow,
    /// Stored format version is incompatible.
    Schema,
    /// Storage engine, filesystem or serialization failure.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Ambiguous => write!(f, "ambiguous"),
            ErrorCategory::Duplicate => write!(f, "duplicate"),
            ErrorCategory::Workflow => write!(f, "workflow"),
            ErrorCategory::Schema => write!(f, "schema"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Errors returned by store and workflow operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Invalid array: {0}")]
    InvalidArray(String),

    #[error("Shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<u64>,
        actual: Vec<u64>,
    },

    #[error("Data type mismatch for {context}: stored {stored}, requested {requested}")]
    DtypeMismatch {
        context: String,
        stored: String,
        requested: String,
    },

    #[error("Resolved path {path} escapes the store root")]
    PathEscape { path: String },

    #[error("Invalid parameters for {context}: {reason}")]
    InvalidParameters { context: String, reason: String },

    #[error("Filter '{filter}' requires '{requires}' to be specified")]
    MissingFilterDependency {
        filter: &'static str,
        requires: &'static str,
    },

    #[error("Bio-rep not found: {}", .0.as_deref().unwrap_or("no bio-reps exist to select from"))]
    BioRepNotFound(Option<String>),

    #[error("Condition not found: {0}")]
    ConditionNotFound(String),

    #[error("Timepoint not found: {0}")]
    TimepointNotFound(String),

    #[error("FOV not found: {0}")]
    FovNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Cell not found: id {0}")]
    CellNotFound(i64),

    #[error("Segmentation run not found: id {0}")]
    SegmentationRunNotFound(i64),

    #[error("Threshold run not found: id {0}")]
    ThresholdRunNotFound(i64),

    #[error("No analysis plugin registered as '{0}'")]
    UnknownPlugin(String),

    #[error("No {kind} array stored at {path}")]
    ArrayNotFound { kind: &'static str, path: String },

    #[error("Ambiguous {entity}: specify one of [{}]", .candidates.join(", "))]
    AmbiguousSelection {
        entity: &'static str,
        candidates: Vec<String>,
    },

    #[error("Duplicate {entity}: {detail}")]
    Duplicate { entity: &'static str, detail: String },

    #[error("Workflow graph is invalid: {}", format_issues(.0))]
    DagValidation(Vec<DagIssue>),

    #[error("Workflow step not found: {0}")]
    UnknownStep(String),

    #[error("No step implementation registered for kind '{0}'")]
    UnknownStepKind(String),

    #[error("Incompatible store format version {found} (this build expects {expected})")]
    SchemaVersion { found: String, expected: String },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zarr storage error: {0}")]
    Zarr(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),
}

impl From<figment::Error> for StoreError {
    fn from(err: figment::Error) -> Self {
        StoreError::Config(Box::new(err))
    }
}

fn format_issues(issues: &[DagIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::InvalidName { .. }
            | StoreError::InvalidArray(_)
            | StoreError::ShapeMismatch { .. }
            | StoreError::DtypeMismatch { .. }
            | StoreError::PathEscape { .. }
            | StoreError::InvalidParameters { .. }
            | StoreError::MissingFilterDependency { .. } => ErrorCategory::Validation,
            StoreError::BioRepNotFound(_)
            | StoreError::ConditionNotFound(_)
            | StoreError::TimepointNotFound(_)
            | StoreError::FovNotFound(_)
            | StoreError::ChannelNotFound(_)
            | StoreError::CellNotFound(_)
            | StoreError::SegmentationRunNotFound(_)
            | StoreError::ThresholdRunNotFound(_)
            | StoreError::UnknownPlugin(_)
            | StoreError::ArrayNotFound { .. } => ErrorCategory::NotFound,
            StoreError::AmbiguousSelection { .. } => ErrorCategory::Ambiguous,
            StoreError::Duplicate { .. } => ErrorCategory::Duplicate,
            StoreError::DagValidation(_)
            | StoreError::UnknownStep(_)
            | StoreError::UnknownStepKind(_) => ErrorCategory::Workflow,
            StoreError::SchemaVersion { .. } => ErrorCategory::Schema,
            StoreError::Sqlite(_)
            | StoreError::Io(_)
            | StoreError::Zarr(_)
            | StoreError::Json(_)
            | StoreError::TomlDe(_)
            | StoreError::TomlSer(_)
            | StoreError::Config(_) => ErrorCategory::Internal,
        }
    }

    /// Wrap a zarrs error, which comes in several unrelated types.
    pub(crate) fn zarr(context: &str, err: impl fmt::Display) -> Self {
        StoreError::Zarr(format!("{context}: {err}"))
    }

    /// Map a rusqlite failure raised by an insert into the store taxonomy.
    ///
    /// Unique and primary-key violations become `Duplicate`; everything else is
    /// passed through as `Sqlite`.
    pub(crate) fn from_insert(entity: &'static str, err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::Duplicate {
                    entity,
                    detail: message
                        .clone()
                        .unwrap_or_else(|| "unique constraint violated".to_string()),
                }
            }
            _ => StoreError::Sqlite(err),
        }
    }

    /// True if this is a constraint failure from a foreign key.
    pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_selection_lists_candidates() {
        let err = StoreError::AmbiguousSelection {
            entity: "bio-rep",
            candidates: vec!["N1".to_string(), "N2".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("N1"));
        assert!(message.contains("N2"));
        assert_eq!(err.category(), ErrorCategory::Ambiguous);
    }

    #[test]
    fn empty_bio_rep_set_has_distinct_message() {
        let err = StoreError::BioRepNotFound(None);
        assert!(err.to_string().contains("no bio-reps exist"));
        assert_eq!(err.category(), ErrorCategory::NotFound);

        let named = StoreError::BioRepNotFound(Some("N9".to_string()));
        assert!(named.to_string().contains("N9"));
    }

    #[test]
    fn storage_failures_are_internal() {
        let err = StoreError::from(std::io::Error::other("disk full"));
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert_eq!(
            StoreError::zarr("open", "bad metadata").category(),
            ErrorCategory::Internal
        );
    }
}
