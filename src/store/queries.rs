//! Relational read layer.
//!
//! Every query that filters by an id collection returns early on an empty
//! collection instead of building an `IN ()` clause.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::debug;

use super::models::{
    AnalysisRun, BioRep, BoundingBox, Cell, Channel, Condition, DataProduct, MeasurementPivot,
    MeasurementScope, PivotRow, ResolvedFov, ScopeFilter, SegmentationRun, ThresholdRun,
    Timepoint,
};
use super::resolver::EntityResolver;
use crate::error::{StoreError, StoreResult};

/// A [`ScopeFilter`] with names resolved to ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ScopeIds {
    pub bio_rep_id: Option<i64>,
    pub condition_id: Option<i64>,
    pub timepoint_id: Option<i64>,
    pub fov_name: Option<String>,
}

impl ScopeIds {
    /// Resolve a scope filter. A FOV name without a condition is rejected,
    /// since FOV names are only unique within a condition.
    pub fn resolve(resolver: &EntityResolver<'_>, scope: &ScopeFilter) -> StoreResult<Self> {
        if scope.fov.is_some() && scope.condition.is_none() {
            return Err(StoreError::MissingFilterDependency {
                filter: "fov",
                requires: "condition",
            });
        }
        Ok(Self {
            bio_rep_id: match scope.bio_rep.as_deref() {
                Some(name) => Some(resolver.bio_rep(Some(name))?.0),
                None => None,
            },
            condition_id: scope
                .condition
                .as_deref()
                .map(|name| resolver.condition(name))
                .transpose()?,
            timepoint_id: resolver.optional_timepoint(scope.timepoint.as_deref())?,
            fov_name: scope.fov.clone(),
        })
    }

    fn push_into(&self, clause: &mut WhereClause) {
        if let Some(id) = self.bio_rep_id {
            clause.push("f.bio_rep_id = ?", SqlValue::Integer(id));
        }
        if let Some(id) = self.condition_id {
            clause.push("f.condition_id = ?", SqlValue::Integer(id));
        }
        if let Some(id) = self.timepoint_id {
            clause.push("f.timepoint_id = ?", SqlValue::Integer(id));
        }
        if let Some(name) = &self.fov_name {
            clause.push("f.name = ?", SqlValue::Text(name.clone()));
        }
    }
}

#[derive(Default)]
struct WhereClause {
    conditions: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl WhereClause {
    fn push(&mut self, condition: &'static str, value: SqlValue) {
        self.conditions.push(condition);
        self.values.push(value);
    }

    fn push_bare(&mut self, condition: &'static str) {
        self.conditions.push(condition);
    }

    fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

pub(crate) fn list_bio_reps(connection: &Connection) -> StoreResult<Vec<BioRep>> {
    let mut statement = connection.prepare_cached("SELECT id, name FROM bio_reps ORDER BY name")?;
    let rows = statement.query_map([], |row| {
        Ok(BioRep {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn list_conditions(connection: &Connection) -> StoreResult<Vec<Condition>> {
    let mut statement =
        connection.prepare_cached("SELECT id, name, description FROM conditions ORDER BY name")?;
    let rows = statement.query_map([], |row| {
        Ok(Condition {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn list_timepoints(connection: &Connection) -> StoreResult<Vec<Timepoint>> {
    let mut statement = connection.prepare_cached("SELECT id, name FROM timepoints ORDER BY name")?;
    let rows = statement.query_map([], |row| {
        Ok(Timepoint {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn list_channels(connection: &Connection) -> StoreResult<Vec<Channel>> {
    let mut statement = connection.prepare_cached(
        "SELECT id, name, role, is_segmentation, color, display_order
         FROM channels ORDER BY display_order",
    )?;
    let rows = statement.query_map([], |row| {
        Ok(Channel {
            id: row.get(0)?,
            name: row.get(1)?,
            role: row.get(2)?,
            is_segmentation: row.get(3)?,
            color: row.get(4)?,
            display_order: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

const FOV_COLUMNS: &str = "f.id, f.name, f.bio_rep_id, b.name, f.condition_id, c.name,
     f.timepoint_id, t.name, f.width, f.height, f.pixel_size_um
     FROM fovs f
     JOIN bio_reps b ON b.id = f.bio_rep_id
     JOIN conditions c ON c.id = f.condition_id
     LEFT JOIN timepoints t ON t.id = f.timepoint_id";

fn fov_from_row(row: &Row<'_>) -> rusqlite::Result<ResolvedFov> {
    Ok(ResolvedFov {
        fov_id: row.get(0)?,
        fov: row.get(1)?,
        bio_rep_id: row.get(2)?,
        bio_rep: row.get(3)?,
        condition_id: row.get(4)?,
        condition: row.get(5)?,
        timepoint_id: row.get(6)?,
        timepoint: row.get(7)?,
        width: row.get(8)?,
        height: row.get(9)?,
        pixel_size_um: row.get(10)?,
    })
}

pub(crate) fn list_fovs(connection: &Connection, scope: &ScopeIds) -> StoreResult<Vec<ResolvedFov>> {
    let mut clause = WhereClause::default();
    scope.push_into(&mut clause);
    let sql = format!(
        "SELECT {FOV_COLUMNS}{} ORDER BY b.name, c.name, t.name, f.name",
        clause.sql()
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(clause.values.iter()), fov_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn cell_clause(scope: &ScopeIds, include_superseded: bool) -> WhereClause {
    let mut clause = WhereClause::default();
    scope.push_into(&mut clause);
    if !include_superseded {
        clause.push_bare("cl.is_valid = 1");
    }
    clause
}

pub(crate) fn count_cells(
    connection: &Connection,
    scope: &ScopeIds,
    include_superseded: bool,
) -> StoreResult<u64> {
    let clause = cell_clause(scope, include_superseded);
    let sql = format!(
        "SELECT COUNT(*) FROM cells cl JOIN fovs f ON f.id = cl.fov_id{}",
        clause.sql()
    );
    let count: i64 =
        connection.query_row(&sql, params_from_iter(clause.values.iter()), |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

pub(crate) fn get_cells(
    connection: &Connection,
    scope: &ScopeIds,
    include_superseded: bool,
) -> StoreResult<Vec<Cell>> {
    let clause = cell_clause(scope, include_superseded);
    let sql = format!(
        "SELECT cl.id, cl.fov_id, cl.segmentation_id, cl.label_value,
                cl.bbox_min_row, cl.bbox_min_col, cl.bbox_max_row, cl.bbox_max_col,
                cl.centroid_row, cl.centroid_col, cl.area, cl.is_valid
         FROM cells cl JOIN fovs f ON f.id = cl.fov_id{} ORDER BY cl.id",
        clause.sql()
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(clause.values.iter()), |row| {
        Ok(Cell {
            id: row.get(0)?,
            fov_id: row.get(1)?,
            segmentation_id: row.get(2)?,
            label_value: row.get(3)?,
            bbox: BoundingBox {
                min_row: row.get(4)?,
                min_col: row.get(5)?,
                max_row: row.get(6)?,
                max_col: row.get(7)?,
            },
            centroid: (row.get(8)?, row.get(9)?),
            area: row.get(10)?,
            is_valid: row.get(11)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Ids bound per `IN (...)` lookup, well under SQLite's variable limit.
pub(crate) const ID_CHUNK: usize = 500;

/// The subset of `ids` that exist as rows of `table`.
///
/// Looked up [`ID_CHUNK`] ids at a time, so any number of ids is accepted.
pub(crate) fn existing_ids(
    connection: &Connection,
    table: IdTable,
    ids: &[i64],
) -> StoreResult<HashSet<i64>> {
    if ids.is_empty() {
        debug!(table = table.name(), "Empty id list, no query issued");
        return Ok(HashSet::new());
    }
    let mut found = HashSet::with_capacity(ids.len());
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT id FROM {} WHERE id IN ({placeholders})",
            table.name()
        );
        let mut statement = connection.prepare_cached(&sql)?;
        let rows =
            statement.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?;
        for id in rows {
            found.insert(id?);
        }
    }
    Ok(found)
}

/// Tables addressable through [`existing_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdTable {
    Cells,
    ThresholdRuns,
}

impl IdTable {
    const fn name(self) -> &'static str {
        match self {
            IdTable::Cells => "cells",
            IdTable::ThresholdRuns => "threshold_runs",
        }
    }
}

/// Optional narrowing of the measurement pivot beyond the hierarchy scope.
#[derive(Debug, Clone, Default)]
pub(crate) struct PivotSelection {
    pub channel_id: Option<i64>,
    pub metric: Option<String>,
    pub scope: Option<MeasurementScope>,
}

pub(crate) fn measurement_pivot(
    connection: &Connection,
    scope: &ScopeIds,
    selection: &PivotSelection,
) -> StoreResult<MeasurementPivot> {
    let mut clause = cell_clause(scope, false);
    if let Some(id) = selection.channel_id {
        clause.push("m.channel_id = ?", SqlValue::Integer(id));
    }
    if let Some(metric) = &selection.metric {
        clause.push("m.metric = ?", SqlValue::Text(metric.clone()));
    }
    if let Some(measurement_scope) = selection.scope {
        clause.push("m.scope = ?", SqlValue::Text(measurement_scope.to_string()));
    }

    let sql = format!(
        "SELECT cl.id, cl.label_value, b.name, c.name, t.name, f.name,
                ch.name, m.metric, m.scope, m.value
         FROM measurements m
         JOIN cells cl ON cl.id = m.cell_id
         JOIN fovs f ON f.id = cl.fov_id
         JOIN bio_reps b ON b.id = f.bio_rep_id
         JOIN conditions c ON c.id = f.condition_id
         LEFT JOIN timepoints t ON t.id = f.timepoint_id
         JOIN channels ch ON ch.id = m.channel_id{}
         ORDER BY cl.id",
        clause.sql()
    );
    let mut statement = connection.prepare(&sql)?;
    let rows = statement.query_map(params_from_iter(clause.values.iter()), |row| {
        let channel: String = row.get(6)?;
        let metric: String = row.get(7)?;
        let scope: MeasurementScope = row.get(8)?;
        Ok((
            PivotRow {
                cell_id: row.get(0)?,
                label_value: row.get(1)?,
                bio_rep: row.get(2)?,
                condition: row.get(3)?,
                timepoint: row.get(4)?,
                fov: row.get(5)?,
                values: Vec::new(),
            },
            (channel, metric, scope),
            row.get::<_, f64>(9)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (pivot_row, (channel, metric, scope), value) = row?;
        let column = MeasurementPivot::column_name(&channel, &metric, scope);
        entries.push((pivot_row, column, value));
    }
    Ok(MeasurementPivot::from_long(entries))
}

pub(crate) fn list_segmentation_runs(
    connection: &Connection,
    fov_id: i64,
) -> StoreResult<Vec<SegmentationRun>> {
    let mut statement = connection.prepare_cached(
        "SELECT id, fov_id, channel_id, model, parameters, cell_count, created_at
         FROM segmentation_runs WHERE fov_id = ?1 ORDER BY id",
    )?;
    let rows = statement.query_map(params![fov_id], |row| {
        Ok(SegmentationRun {
            id: row.get(0)?,
            fov_id: row.get(1)?,
            channel_id: row.get(2)?,
            model: row.get(3)?,
            parameters: row.get(4)?,
            cell_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn segmentation_run_fov(
    connection: &Connection,
    segmentation_id: i64,
) -> StoreResult<Option<i64>> {
    use rusqlite::OptionalExtension;
    Ok(connection
        .prepare_cached("SELECT fov_id FROM segmentation_runs WHERE id = ?1")?
        .query_row(params![segmentation_id], |row| row.get(0))
        .optional()?)
}

pub(crate) fn list_threshold_runs(
    connection: &Connection,
    fov_id: i64,
) -> StoreResult<Vec<ThresholdRun>> {
    let mut statement = connection.prepare_cached(
        "SELECT id, fov_id, channel_id, method, threshold_value, parameters,
                positive_pixels, created_at
         FROM threshold_runs WHERE fov_id = ?1 ORDER BY id",
    )?;
    let rows = statement.query_map(params![fov_id], |row| {
        Ok(ThresholdRun {
            id: row.get(0)?,
            fov_id: row.get(1)?,
            channel_id: row.get(2)?,
            method: row.get(3)?,
            threshold_value: row.get(4)?,
            parameters: row.get(5)?,
            positive_pixels: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub(crate) fn list_analysis_runs(
    connection: &Connection,
    plugin: Option<&str>,
) -> StoreResult<Vec<AnalysisRun>> {
    let mut statement = connection.prepare_cached(
        "SELECT id, plugin, fov_id, parameters, result, cell_count, created_at
         FROM analysis_runs WHERE ?1 IS NULL OR plugin = ?1 ORDER BY id",
    )?;
    let rows = statement.query_map(params![plugin], |row| {
        Ok(AnalysisRun {
            id: row.get(0)?,
            plugin: row.get(1)?,
            fov_id: row.get(2)?,
            parameters: row.get(3)?,
            result: row.get(4)?,
            cell_count: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Products backed by relational rows that currently hold data.
pub(crate) fn relational_products(connection: &Connection) -> StoreResult<Vec<DataProduct>> {
    const CHECKS: [(DataProduct, &str); 6] = [
        (DataProduct::Fovs, "SELECT EXISTS (SELECT 1 FROM fovs)"),
        (
            DataProduct::Cells,
            "SELECT EXISTS (SELECT 1 FROM cells WHERE is_valid = 1)",
        ),
        (
            DataProduct::Measurements,
            "SELECT EXISTS (SELECT 1 FROM measurements)",
        ),
        (
            DataProduct::SegmentationRuns,
            "SELECT EXISTS (SELECT 1 FROM segmentation_runs)",
        ),
        (
            DataProduct::ThresholdRuns,
            "SELECT EXISTS (SELECT 1 FROM threshold_runs)",
        ),
        (
            DataProduct::AnalysisRuns,
            "SELECT EXISTS (SELECT 1 FROM analysis_runs)",
        ),
    ];

    let mut present = Vec::new();
    for (product, sql) in CHECKS {
        let exists: bool = connection.prepare_cached(sql)?.query_row([], |row| row.get(0))?;
        if exists {
            present.push(product);
        }
    }
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_list_short_circuits_without_tables() {
        // No schema at all: any issued statement would fail.
        let connection = Connection::open_in_memory().unwrap();
        assert!(existing_ids(&connection, IdTable::Cells, &[])
            .unwrap()
            .is_empty());
        assert!(existing_ids(&connection, IdTable::Cells, &[1]).is_err());
    }

    #[test]
    fn id_lookup_spans_many_chunks() {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "CREATE TABLE cells (id INTEGER PRIMARY KEY);
                 WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000)
                 INSERT INTO cells (id) SELECT i FROM n;",
            )
            .unwrap();
        let ids: Vec<i64> = (1..=40_000).collect();
        let found = existing_ids(&connection, IdTable::Cells, &ids).unwrap();
        assert_eq!(found.len(), 1000);
        assert!(found.contains(&1) && found.contains(&1000));
        assert!(!found.contains(&1001));
    }

    #[test]
    fn where_clause_joins_conditions() {
        let mut clause = WhereClause::default();
        assert_eq!(clause.sql(), "");
        clause.push("f.bio_rep_id = ?", SqlValue::Integer(1));
        clause.push_bare("cl.is_valid = 1");
        assert_eq!(clause.sql(), " WHERE f.bio_rep_id = ? AND cl.is_valid = 1");
        assert_eq!(clause.values.len(), 1);
    }
}
