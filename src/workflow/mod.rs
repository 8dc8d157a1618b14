//! Dependency-ordered, re-entrant processing workflows.
//!
//! - [`dag`]: the step graph, validation and scheduling order.
//! - [`step`]: the [`Step`] trait and the static [`StepRegistry`].
//! - [`state`]: append-only execution history in the store's database.
//! - [`engine`]: runs a graph, skipping steps that already completed.
//! - [`serializer`]: TOML/JSON workflow documents.

pub mod dag;
pub mod engine;
pub mod serializer;
pub mod state;
pub mod step;

pub use dag::{DagIssue, Edge, StepDefinition, WorkflowDag};
pub use engine::{RunReport, StepOutcome, StepReport, StepStatus, WorkflowEngine};
pub use serializer::{DocumentFormat, WorkflowSerializer};
pub use state::{params_hash, ExecutionStatus, FailureKind, StepExecution, WorkflowState};
pub use step::{FnStep, Step, StepContext, StepRegistry};
