//! Relational schema and connection setup.
//!
//! The database lives at `<root>/experiment.db` in WAL mode. A single
//! `store_meta` row records the format version; opening a database written by
//! a different format version fails with [`StoreError::SchemaVersion`] instead
//! of running queries against a mismatched layout.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::config::SqliteSettings;
use crate::error::{StoreError, StoreResult};

/// Database file name inside an experiment root.
pub const DATABASE_FILE: &str = "experiment.db";

/// Format version written by this build.
pub const SCHEMA_VERSION: &str = "3";

const SCHEMA_SQL: &str = r#"
CREATE TABLE bio_reps (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE conditions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE timepoints (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE fovs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    bio_rep_id INTEGER NOT NULL REFERENCES bio_reps(id),
    condition_id INTEGER NOT NULL REFERENCES conditions(id),
    timepoint_id INTEGER REFERENCES timepoints(id),
    width INTEGER,
    height INTEGER,
    pixel_size_um REAL,
    created_at TEXT NOT NULL
);

-- NULL timepoints compare equal here, so (FOV_1, N1, control, no timepoint)
-- can exist only once.
CREATE UNIQUE INDEX fovs_identity
    ON fovs (name, bio_rep_id, condition_id, COALESCE(timepoint_id, -1));

CREATE TABLE channels (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    role TEXT,
    is_segmentation INTEGER NOT NULL DEFAULT 0,
    color TEXT,
    display_order INTEGER NOT NULL
);

CREATE TABLE segmentation_runs (
    id INTEGER PRIMARY KEY,
    fov_id INTEGER NOT NULL REFERENCES fovs(id),
    channel_id INTEGER NOT NULL REFERENCES channels(id),
    model TEXT NOT NULL,
    parameters TEXT NOT NULL,
    cell_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE cells (
    id INTEGER PRIMARY KEY,
    fov_id INTEGER NOT NULL REFERENCES fovs(id),
    segmentation_id INTEGER NOT NULL REFERENCES segmentation_runs(id),
    label_value INTEGER NOT NULL,
    bbox_min_row INTEGER NOT NULL,
    bbox_min_col INTEGER NOT NULL,
    bbox_max_row INTEGER NOT NULL,
    bbox_max_col INTEGER NOT NULL,
    centroid_row REAL NOT NULL,
    centroid_col REAL NOT NULL,
    area INTEGER NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    UNIQUE (segmentation_id, label_value)
);

CREATE INDEX cells_by_fov ON cells (fov_id, is_valid);

CREATE TABLE threshold_runs (
    id INTEGER PRIMARY KEY,
    fov_id INTEGER NOT NULL REFERENCES fovs(id),
    channel_id INTEGER NOT NULL REFERENCES channels(id),
    method TEXT NOT NULL,
    threshold_value REAL NOT NULL,
    parameters TEXT NOT NULL,
    positive_pixels INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE measurements (
    id INTEGER PRIMARY KEY,
    cell_id INTEGER NOT NULL REFERENCES cells(id),
    channel_id INTEGER NOT NULL REFERENCES channels(id),
    metric TEXT NOT NULL,
    scope TEXT NOT NULL,
    value REAL NOT NULL,
    threshold_run_id INTEGER REFERENCES threshold_runs(id),
    UNIQUE (cell_id, channel_id, metric, scope)
);

CREATE TABLE analysis_runs (
    id INTEGER PRIMARY KEY,
    plugin TEXT NOT NULL,
    fov_id INTEGER REFERENCES fovs(id),
    parameters TEXT NOT NULL,
    result TEXT NOT NULL,
    cell_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE workflow_executions (
    id INTEGER PRIMARY KEY,
    run_id TEXT NOT NULL,
    workflow TEXT NOT NULL,
    step_name TEXT NOT NULL,
    parameters TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    failure_kind TEXT,
    message TEXT,
    detail TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    elapsed_ms INTEGER NOT NULL
);

CREATE INDEX workflow_executions_by_step ON workflow_executions (step_name, id);
"#;

/// Opens experiment databases and keeps their schema in step with this build.
pub struct SchemaManager;

impl SchemaManager {
    /// Create a fresh database at `path`.
    pub fn create(path: &Path, settings: &SqliteSettings) -> StoreResult<Connection> {
        let mut connection = Connection::open(path)?;
        apply_pragmas(&connection, settings)?;

        let tx = connection.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        if read_version(&tx)?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "experiment",
                detail: format!("{} already holds a store", path.display()),
            });
        }
        tx.execute_batch(SCHEMA_SQL)?;
        tx.execute(
            "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;
        tx.commit()?;

        info!(path = %path.display(), version = SCHEMA_VERSION, "Created experiment database");
        Ok(connection)
    }

    /// Open an existing database and check its format version.
    pub fn open(path: &Path, settings: &SqliteSettings) -> StoreResult<Connection> {
        if !path.is_file() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no experiment database at {}", path.display()),
            )));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        apply_pragmas(&connection, settings)?;

        let found = Self::stored_version(&connection)?;
        check_version(found.as_deref())?;

        debug!(path = %path.display(), "Opened experiment database");
        Ok(connection)
    }

    /// Format version recorded in an open database, if any.
    pub fn stored_version(connection: &Connection) -> StoreResult<Option<String>> {
        let has_meta: bool = connection.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'store_meta')",
            [],
            |row| row.get(0),
        )?;
        if !has_meta {
            return Ok(None);
        }
        read_version(connection)
    }
}

fn read_version(connection: &Connection) -> StoreResult<Option<String>> {
    Ok(connection
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn check_version(found: Option<&str>) -> StoreResult<()> {
    match found {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(version) => Err(StoreError::SchemaVersion {
            found: version.to_string(),
            expected: SCHEMA_VERSION.to_string(),
        }),
        None => Err(StoreError::SchemaVersion {
            found: "none".to_string(),
            expected: SCHEMA_VERSION.to_string(),
        }),
    }
}

fn apply_pragmas(connection: &Connection, settings: &SqliteSettings) -> StoreResult<()> {
    connection.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    // journal_mode reports the resulting mode as a row
    let mode: String = connection.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    connection.execute_batch(&format!(
        "PRAGMA synchronous = {};",
        settings.synchronous.pragma_value()
    ))?;
    // Negative cache_size is interpreted as KiB
    connection.execute_batch(&format!(
        "PRAGMA cache_size = -{};",
        settings.cache_size_kib
    ))?;
    debug!(journal_mode = %mode, synchronous = settings.synchronous.pragma_value(), "Applied pragmas");
    Ok(())
}
