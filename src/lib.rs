//! # cytostore
//!
//! A per-experiment data store for microscopy analysis, plus a workflow engine
//! that drives processing steps against it.
//!
//! ## Crate Structure
//!
//! - **`store`**: [`store::ExperimentStore`], the facade over one experiment
//!   root. Owns the SQLite database (hierarchy, cells, measurements, run
//!   provenance) and the image/label/mask array trees, and resolves every
//!   coordinate the same way for reads and writes.
//! - **`zarr`**: chunked multiresolution array storage. Path building,
//!   OME-NGFF style group metadata and pyramid writing.
//! - **`workflow`**: step graphs, their validation and ordering, the engine
//!   that runs them with skip-if-done semantics, and the persisted execution
//!   history.
//! - **`analysis`**: statically registered analysis plugins and their
//!   workflow adapter.
//! - **`config`**: layered settings (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`validation`**: the name safety grammar shared by every path component.
//! - **`error`**: [`StoreError`], the single error type with coarse categories.

pub mod analysis;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod validation;
pub mod workflow;
pub mod zarr;

pub use error::{ErrorCategory, StoreError, StoreResult};
pub use store::ExperimentStore;
