//! All-or-nothing batch writes.
//!
//! Each batch runs in one transaction with one prepared statement. Any failure
//! drops the transaction, which rolls it back, so callers never see a partial
//! batch and the connection is clean for the next call.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::models::{NewCell, ResolvedMeasurement};
use super::queries::{existing_ids, segmentation_run_fov, IdTable};
use crate::error::{StoreError, StoreResult};

/// Batch writer over the store's connection.
pub struct TransactionalWriter<'a> {
    connection: &'a mut Connection,
}

impl<'a> TransactionalWriter<'a> {
    /// Writer over an open connection.
    pub fn new(connection: &'a mut Connection) -> Self {
        Self { connection }
    }

    /// Insert the cells of one segmentation run.
    ///
    /// In the same transaction, valid cells of the FOV from earlier runs are
    /// marked superseded and the run's `cell_count` is updated. An empty batch
    /// returns 0 without issuing any statement. A label value repeated within
    /// the batch, or already stored for this run, is [`StoreError::Duplicate`]
    /// and nothing is persisted.
    pub fn insert_cells(
        &mut self,
        fov_id: i64,
        segmentation_id: i64,
        cells: &[NewCell],
    ) -> StoreResult<usize> {
        if cells.is_empty() {
            debug!(fov_id, segmentation_id, "Empty cell batch, nothing written");
            return Ok(0);
        }

        let tx = self.connection.transaction()?;

        match segmentation_run_fov(&tx, segmentation_id)? {
            Some(run_fov) if run_fov == fov_id => {}
            _ => return Err(StoreError::SegmentationRunNotFound(segmentation_id)),
        }

        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO cells (fov_id, segmentation_id, label_value,
                     bbox_min_row, bbox_min_col, bbox_max_row, bbox_max_col,
                     centroid_row, centroid_col, area)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for cell in cells {
                insert
                    .execute(params![
                        fov_id,
                        segmentation_id,
                        cell.label_value,
                        cell.bbox.min_row,
                        cell.bbox.min_col,
                        cell.bbox.max_row,
                        cell.bbox.max_col,
                        cell.centroid.0,
                        cell.centroid.1,
                        cell.area,
                    ])
                    .map_err(|err| StoreError::from_insert("cell", err))?;
            }
        }

        let superseded = tx.execute(
            "UPDATE cells SET is_valid = 0
             WHERE fov_id = ?1 AND segmentation_id != ?2 AND is_valid = 1",
            params![fov_id, segmentation_id],
        )?;
        tx.execute(
            "UPDATE segmentation_runs
             SET cell_count = (SELECT COUNT(*) FROM cells WHERE segmentation_id = ?1)
             WHERE id = ?1",
            params![segmentation_id],
        )?;
        tx.commit()?;

        info!(
            fov_id,
            segmentation_id,
            inserted = cells.len(),
            superseded,
            "Committed cell batch"
        );
        Ok(cells.len())
    }

    /// Insert or replace measurements.
    ///
    /// Every referenced cell (and threshold run) must exist; a key
    /// `(cell, channel, metric, scope)` repeated within the batch is a
    /// [`StoreError::Duplicate`]. Both checks run before the first row is
    /// written. An existing value for the same key is replaced.
    pub(crate) fn insert_measurements(
        &mut self,
        records: &[ResolvedMeasurement],
    ) -> StoreResult<usize> {
        if records.is_empty() {
            debug!("Empty measurement batch, nothing written");
            return Ok(0);
        }

        let mut keys = HashSet::with_capacity(records.len());
        for record in records {
            let key = (record.cell_id, record.channel_id, &record.metric, record.scope);
            if !keys.insert(key) {
                return Err(StoreError::Duplicate {
                    entity: "measurement",
                    detail: format!(
                        "cell {} channel {} metric '{}' scope {} appears twice in one batch",
                        record.cell_id, record.channel_id, record.metric, record.scope
                    ),
                });
            }
        }

        let tx = self.connection.transaction()?;

        let cell_ids: Vec<i64> = unique(records.iter().map(|r| r.cell_id));
        let found = existing_ids(&tx, IdTable::Cells, &cell_ids)?;
        if let Some(missing) = cell_ids.iter().find(|id| !found.contains(id)) {
            return Err(StoreError::CellNotFound(*missing));
        }

        let threshold_ids: Vec<i64> = unique(records.iter().filter_map(|r| r.threshold_run_id));
        let found = existing_ids(&tx, IdTable::ThresholdRuns, &threshold_ids)?;
        if let Some(missing) = threshold_ids.iter().find(|id| !found.contains(id)) {
            return Err(StoreError::ThresholdRunNotFound(*missing));
        }

        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO measurements
                     (cell_id, channel_id, metric, scope, value, threshold_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (cell_id, channel_id, metric, scope)
                 DO UPDATE SET value = excluded.value,
                               threshold_run_id = excluded.threshold_run_id",
            )?;
            for record in records {
                upsert
                    .execute(params![
                        record.cell_id,
                        record.channel_id,
                        record.metric,
                        record.scope,
                        record.value,
                        record.threshold_run_id,
                    ])
                    .map_err(|err| {
                        if StoreError::is_foreign_key_violation(&err) {
                            StoreError::CellNotFound(record.cell_id)
                        } else {
                            StoreError::from_insert("measurement", err)
                        }
                    })?;
            }
        }
        tx.commit()?;

        info!(count = records.len(), "Committed measurement batch");
        Ok(records.len())
    }
}

fn unique(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteSettings;
    use crate::store::models::{BoundingBox, MeasurementScope};
    use crate::store::schema::{SchemaManager, DATABASE_FILE};
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn cell(label_value: i64) -> NewCell {
        NewCell {
            label_value,
            bbox: BoundingBox {
                min_row: 0,
                min_col: 0,
                max_row: 4,
                max_col: 4,
            },
            centroid: (2.0, 2.0),
            area: 16,
        }
    }

    fn seeded() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let connection =
            SchemaManager::create(&dir.path().join(DATABASE_FILE), &SqliteSettings::default())
                .unwrap();
        connection
            .execute_batch(
                "INSERT INTO bio_reps (id, name, created_at) VALUES (1, 'N1', '2024-01-01T00:00:00Z');
                 INSERT INTO conditions (id, name, created_at) VALUES (1, 'control', '2024-01-01T00:00:00Z');
                 INSERT INTO fovs (id, name, bio_rep_id, condition_id, created_at)
                     VALUES (1, 'FOV_1', 1, 1, '2024-01-01T00:00:00Z');
                 INSERT INTO channels (id, name, display_order) VALUES (1, 'DAPI', 0);
                 INSERT INTO segmentation_runs (id, fov_id, channel_id, model, parameters, created_at)
                     VALUES (1, 1, 1, 'cellpose', '{}', '2024-01-01T00:00:00Z'),
                            (2, 1, 1, 'cellpose', '{}', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        (dir, connection)
    }

    fn count(connection: &Connection, sql: &str) -> i64 {
        connection.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    #[traced_test]
    fn empty_batch_issues_no_statement() {
        let (_dir, mut connection) = seeded();
        let before = count(&connection, "SELECT total_changes()");
        let written = TransactionalWriter::new(&mut connection)
            .insert_cells(1, 1, &[])
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(count(&connection, "SELECT total_changes()"), before);
        assert!(logs_contain("Empty cell batch"));

        let written = TransactionalWriter::new(&mut connection)
            .insert_measurements(&[])
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(count(&connection, "SELECT total_changes()"), before);
    }

    #[test]
    fn duplicate_label_rolls_back_whole_batch() {
        let (_dir, mut connection) = seeded();
        let err = TransactionalWriter::new(&mut connection)
            .insert_cells(1, 1, &[cell(1), cell(2), cell(1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "cell", .. }));
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM cells"), 0);
        assert_eq!(
            count(&connection, "SELECT cell_count FROM segmentation_runs WHERE id = 1"),
            0
        );

        // The connection is usable again after the rollback
        let written = TransactionalWriter::new(&mut connection)
            .insert_cells(1, 1, &[cell(1), cell(2)])
            .unwrap();
        assert_eq!(written, 2);
    }

    #[test]
    fn new_run_supersedes_previous_cells() {
        let (_dir, mut connection) = seeded();
        let mut writer = TransactionalWriter::new(&mut connection);
        writer.insert_cells(1, 1, &[cell(1), cell(2)]).unwrap();
        writer.insert_cells(1, 2, &[cell(1)]).unwrap();

        assert_eq!(count(&connection, "SELECT COUNT(*) FROM cells"), 3);
        assert_eq!(
            count(&connection, "SELECT COUNT(*) FROM cells WHERE is_valid = 1"),
            1
        );
        assert_eq!(
            count(&connection, "SELECT cell_count FROM segmentation_runs WHERE id = 2"),
            1
        );
    }

    #[test]
    fn run_from_another_fov_is_rejected() {
        let (_dir, mut connection) = seeded();
        let err = TransactionalWriter::new(&mut connection)
            .insert_cells(1, 99, &[cell(1)])
            .unwrap_err();
        assert!(matches!(err, StoreError::SegmentationRunNotFound(99)));
    }

    fn measurement(cell_id: i64, value: f64) -> ResolvedMeasurement {
        ResolvedMeasurement {
            cell_id,
            channel_id: 1,
            metric: "mean_intensity".to_string(),
            scope: MeasurementScope::WholeCell,
            value,
            threshold_run_id: None,
        }
    }

    #[test]
    fn measurements_for_missing_cells_write_nothing() {
        let (_dir, mut connection) = seeded();
        let mut writer = TransactionalWriter::new(&mut connection);
        writer.insert_cells(1, 1, &[cell(1)]).unwrap();

        let err = writer
            .insert_measurements(&[measurement(1, 1.0), measurement(42, 2.0)])
            .unwrap_err();
        assert!(matches!(err, StoreError::CellNotFound(42)));
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM measurements"), 0);
    }

    #[test]
    fn measurement_batch_beyond_sqlite_variable_limit() {
        let (_dir, mut connection) = seeded();
        let mut writer = TransactionalWriter::new(&mut connection);
        let cells: Vec<NewCell> = (1..=33_000).map(cell).collect();
        writer.insert_cells(1, 1, &cells).unwrap();

        let records: Vec<ResolvedMeasurement> =
            (1..=33_000).map(|id| measurement(id, id as f64)).collect();
        assert_eq!(writer.insert_measurements(&records).unwrap(), 33_000);
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM measurements"), 33_000);
    }

    #[test]
    fn repeated_key_in_batch_is_duplicate_and_remeasure_replaces() {
        let (_dir, mut connection) = seeded();
        let mut writer = TransactionalWriter::new(&mut connection);
        writer.insert_cells(1, 1, &[cell(1)]).unwrap();

        let err = writer
            .insert_measurements(&[measurement(1, 1.0), measurement(1, 2.0)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        writer.insert_measurements(&[measurement(1, 1.0)]).unwrap();
        writer.insert_measurements(&[measurement(1, 5.0)]).unwrap();
        assert_eq!(count(&connection, "SELECT COUNT(*) FROM measurements"), 1);
        let value: f64 = connection
            .query_row("SELECT value FROM measurements", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 5.0);
    }
}
