//! Row types, insert records and typed filters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A biological replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BioRep {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
}

/// An experimental condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Free-text description
    pub description: Option<String>,
}

/// An optional temporal sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timepoint {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
}

/// An imaging channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Row id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Free-text role, e.g. `nuclear`
    pub role: Option<String>,
    /// Whether label images are produced from this channel
    pub is_segmentation: bool,
    /// Display colour as hex RGB
    pub color: Option<String>,
    /// Position in declaration order
    pub display_order: i64,
}

/// Declaration of a new channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel name
    pub name: String,
    /// Free-text role
    pub role: Option<String>,
    /// Segmentation flag
    pub is_segmentation: bool,
    /// Display colour as hex RGB
    pub color: Option<String>,
}

impl ChannelSpec {
    /// A plain channel with no role or colour.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the role.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Mark the channel as a segmentation source.
    pub fn segmentation(mut self, is_segmentation: bool) -> Self {
        self.is_segmentation = is_segmentation;
        self
    }

    /// Set the display colour.
    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// A human-readable FOV coordinate.
///
/// Condition and FOV name are always required. An omitted bio-rep is
/// auto-resolved when exactly one exists; an omitted timepoint means the FOV
/// has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FovCoord {
    /// Bio-rep name, auto-resolved when `None`
    pub bio_rep: Option<String>,
    /// Condition name
    pub condition: String,
    /// Timepoint name, `None` for FOVs without one
    pub timepoint: Option<String>,
    /// FOV name, unique within (bio-rep, condition, timepoint)
    pub fov: String,
}

impl FovCoord {
    /// Coordinate with bio-rep and timepoint omitted.
    pub fn new(condition: impl Into<String>, fov: impl Into<String>) -> Self {
        Self {
            bio_rep: None,
            condition: condition.into(),
            timepoint: None,
            fov: fov.into(),
        }
    }

    /// Set the bio-rep.
    pub fn bio_rep(mut self, bio_rep: impl Into<String>) -> Self {
        self.bio_rep = Some(bio_rep.into());
        self
    }

    /// Set the timepoint.
    pub fn timepoint(mut self, timepoint: impl Into<String>) -> Self {
        self.timepoint = Some(timepoint.into());
        self
    }
}

impl fmt::Display for FovCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/",
            self.bio_rep.as_deref().unwrap_or("<auto>"),
            self.condition
        )?;
        if let Some(timepoint) = &self.timepoint {
            write!(f, "{timepoint}/")?;
        }
        f.write_str(&self.fov)
    }
}

/// A FOV with every coordinate resolved to ids and names.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFov {
    /// FOV row id
    pub fov_id: i64,
    /// FOV name
    pub fov: String,
    /// Bio-rep id
    pub bio_rep_id: i64,
    /// Bio-rep name
    pub bio_rep: String,
    /// Condition id
    pub condition_id: i64,
    /// Condition name
    pub condition: String,
    /// Timepoint id
    pub timepoint_id: Option<i64>,
    /// Timepoint name
    pub timepoint: Option<String>,
    /// Recorded image width, set by the first pixel write
    pub width: Option<u64>,
    /// Recorded image height, set by the first pixel write
    pub height: Option<u64>,
    /// Physical pixel size
    pub pixel_size_um: Option<f64>,
}

impl ResolvedFov {
    /// Recorded spatial shape as `[height, width]`.
    pub fn shape(&self) -> Option<[u64; 2]> {
        Some([self.height?, self.width?])
    }
}

/// Axis-aligned bounding box in pixel coordinates, max exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// First row
    pub min_row: i64,
    /// First column
    pub min_col: i64,
    /// One past the last row
    pub max_row: i64,
    /// One past the last column
    pub max_col: i64,
}

/// A cell to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCell {
    /// Value of the cell in the label image
    pub label_value: i64,
    /// Bounding box
    pub bbox: BoundingBox,
    /// Centroid as `(row, col)`
    pub centroid: (f64, f64),
    /// Area in pixels
    pub area: u64,
}

/// A stored cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Row id
    pub id: i64,
    /// Owning FOV
    pub fov_id: i64,
    /// Segmentation run that produced this cell
    pub segmentation_id: i64,
    /// Value of the cell in the label image
    pub label_value: i64,
    /// Bounding box
    pub bbox: BoundingBox,
    /// Centroid as `(row, col)`
    pub centroid: (f64, f64),
    /// Area in pixels
    pub area: u64,
    /// False once a later segmentation of the same FOV superseded it
    pub is_valid: bool,
}

/// Which pixels of a cell a measurement covers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementScope {
    /// Every pixel of the cell
    #[default]
    WholeCell,
    /// Cell pixels inside a threshold mask
    MaskInside,
    /// Cell pixels outside a threshold mask
    MaskOutside,
}

impl MeasurementScope {
    /// Stored name.
    pub const fn as_str(self) -> &'static str {
        match self {
            MeasurementScope::WholeCell => "whole_cell",
            MeasurementScope::MaskInside => "mask_inside",
            MeasurementScope::MaskOutside => "mask_outside",
        }
    }

    /// Parse a stored name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "whole_cell" => Some(MeasurementScope::WholeCell),
            "mask_inside" => Some(MeasurementScope::MaskInside),
            "mask_outside" => Some(MeasurementScope::MaskOutside),
            _ => None,
        }
    }

    /// Suffix appended to pivot column names; empty for whole-cell values.
    pub const fn column_suffix(self) -> &'static str {
        match self {
            MeasurementScope::WholeCell => "",
            MeasurementScope::MaskInside => "_mask_inside",
            MeasurementScope::MaskOutside => "_mask_outside",
        }
    }
}

impl ToSql for MeasurementScope {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MeasurementScope {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let name = value.as_str()?;
        Self::parse(name)
            .ok_or_else(|| FromSqlError::Other(format!("unknown measurement scope '{name}'").into()))
    }
}

impl fmt::Display for MeasurementScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scalar value to record for a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Measured cell
    pub cell_id: i64,
    /// Channel name
    pub channel: String,
    /// Metric name, e.g. `mean_intensity`
    pub metric: String,
    /// Measured value
    pub value: f64,
    /// Pixel scope
    pub scope: MeasurementScope,
    /// Threshold run that produced the mask, for masked scopes
    pub threshold_run_id: Option<i64>,
}

impl MeasurementRecord {
    /// Whole-cell measurement.
    pub fn new(
        cell_id: i64,
        channel: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            cell_id,
            channel: channel.into(),
            metric: metric.into(),
            value,
            scope: MeasurementScope::WholeCell,
            threshold_run_id: None,
        }
    }

    /// Set the scope.
    pub fn scope(mut self, scope: MeasurementScope) -> Self {
        self.scope = scope;
        self
    }

    /// Reference the threshold run whose mask was used.
    pub fn threshold_run(mut self, threshold_run_id: i64) -> Self {
        self.threshold_run_id = Some(threshold_run_id);
        self
    }
}

/// Measurement with names resolved to ids, as written by the transactional writer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedMeasurement {
    pub cell_id: i64,
    pub channel_id: i64,
    pub metric: String,
    pub scope: MeasurementScope,
    pub value: f64,
    pub threshold_run_id: Option<i64>,
}

/// Provenance of one segmentation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationRun {
    /// Row id
    pub id: i64,
    /// Segmented FOV
    pub fov_id: i64,
    /// Source channel
    pub channel_id: i64,
    /// Model or method name
    pub model: String,
    /// Parameters used
    pub parameters: Value,
    /// Cells written by this run
    pub cell_count: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A threshold pass to record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThresholdRun {
    /// Method name, e.g. `otsu`
    pub method: String,
    /// Threshold applied
    pub threshold_value: f64,
    /// Parameters used
    pub parameters: Value,
    /// Pixels above threshold
    pub positive_pixels: u64,
}

/// A stored threshold pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRun {
    /// Row id
    pub id: i64,
    /// Thresholded FOV
    pub fov_id: i64,
    /// Source channel
    pub channel_id: i64,
    /// Method name
    pub method: String,
    /// Threshold applied
    pub threshold_value: f64,
    /// Parameters used
    pub parameters: Value,
    /// Pixels above threshold
    pub positive_pixels: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A stored analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    /// Row id
    pub id: i64,
    /// Plugin name
    pub plugin: String,
    /// FOV the analysis was restricted to, if any
    pub fov_id: Option<i64>,
    /// Parameters used
    pub parameters: Value,
    /// Structured result
    pub result: Value,
    /// Cells covered
    pub cell_count: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Hierarchy scope shared by the typed filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Restrict to one bio-rep
    pub bio_rep: Option<String>,
    /// Restrict to one condition
    pub condition: Option<String>,
    /// Restrict to one timepoint
    pub timepoint: Option<String>,
    /// Restrict to one FOV name; requires `condition`
    pub fov: Option<String>,
}

macro_rules! scope_builders {
    ($filter:ty) => {
        impl $filter {
            /// Restrict to one bio-rep.
            pub fn bio_rep(mut self, name: impl Into<String>) -> Self {
                self.scope.bio_rep = Some(name.into());
                self
            }

            /// Restrict to one condition.
            pub fn condition(mut self, name: impl Into<String>) -> Self {
                self.scope.condition = Some(name.into());
                self
            }

            /// Restrict to one timepoint.
            pub fn timepoint(mut self, name: impl Into<String>) -> Self {
                self.scope.timepoint = Some(name.into());
                self
            }
        }
    };
}

/// Filter for FOV listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FovFilter {
    /// Hierarchy scope; `fov` is ignored here
    pub scope: ScopeFilter,
}

scope_builders!(FovFilter);

/// Filter for cell queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellFilter {
    /// Hierarchy scope
    pub scope: ScopeFilter,
    /// Include cells superseded by a later segmentation
    pub include_superseded: bool,
}

scope_builders!(CellFilter);

impl CellFilter {
    /// Restrict to one FOV name. Requires a condition.
    pub fn fov(mut self, name: impl Into<String>) -> Self {
        self.scope.fov = Some(name.into());
        self
    }

    /// Include superseded cells.
    pub fn include_superseded(mut self) -> Self {
        self.include_superseded = true;
        self
    }
}

/// Filter for the measurement pivot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementFilter {
    /// Hierarchy scope
    pub scope: ScopeFilter,
    /// Restrict to one channel
    pub channel: Option<String>,
    /// Restrict to one metric
    pub metric: Option<String>,
    /// Restrict to one pixel scope
    pub measurement_scope: Option<MeasurementScope>,
}

scope_builders!(MeasurementFilter);

impl MeasurementFilter {
    /// Restrict to one FOV name. Requires a condition.
    pub fn fov(mut self, name: impl Into<String>) -> Self {
        self.scope.fov = Some(name.into());
        self
    }

    /// Restrict to one channel.
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }

    /// Restrict to one metric.
    pub fn metric(mut self, name: impl Into<String>) -> Self {
        self.metric = Some(name.into());
        self
    }

    /// Restrict to one pixel scope.
    pub fn measurement_scope(mut self, scope: MeasurementScope) -> Self {
        self.measurement_scope = Some(scope);
        self
    }
}

/// One row of the measurement pivot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotRow {
    /// Cell id
    pub cell_id: i64,
    /// Label value of the cell
    pub label_value: i64,
    /// Bio-rep name
    pub bio_rep: String,
    /// Condition name
    pub condition: String,
    /// Timepoint name
    pub timepoint: Option<String>,
    /// FOV name
    pub fov: String,
    /// One value per pivot column
    pub values: Vec<Option<f64>>,
}

/// Cells as rows, `channel_metric[_scope]` as columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementPivot {
    /// Column names, sorted
    pub columns: Vec<String>,
    /// Rows ordered by cell id
    pub rows: Vec<PivotRow>,
}

impl MeasurementPivot {
    /// Value for one cell and column, if measured.
    pub fn value(&self, cell_id: i64, column: &str) -> Option<f64> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|row| row.cell_id == cell_id)
            .and_then(|row| row.values[index])
    }

    /// Pivot column name for a measurement key.
    pub fn column_name(channel: &str, metric: &str, scope: MeasurementScope) -> String {
        format!("{channel}_{metric}{}", scope.column_suffix())
    }

    /// Build from long-format `(row, column, value)` triples.
    pub(crate) fn from_long(entries: Vec<(PivotRow, String, f64)>) -> Self {
        let mut columns: Vec<String> = entries.iter().map(|(_, c, _)| c.clone()).collect();
        columns.sort();
        columns.dedup();

        let mut rows: BTreeMap<i64, PivotRow> = BTreeMap::new();
        for (row, column, value) in entries {
            let index = columns.iter().position(|c| *c == column).unwrap_or(0);
            let entry = rows.entry(row.cell_id).or_insert_with(|| PivotRow {
                values: vec![None; columns.len()],
                ..row
            });
            entry.values[index] = Some(value);
        }

        Self {
            columns,
            rows: rows.into_values().collect(),
        }
    }
}

/// Data products the store can hold, used as workflow step inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataProduct {
    /// At least one FOV exists
    Fovs,
    /// Image arrays
    Images,
    /// Label arrays
    Labels,
    /// Mask arrays
    Masks,
    /// Valid cells
    Cells,
    /// Measurements
    Measurements,
    /// Segmentation provenance
    SegmentationRuns,
    /// Threshold provenance
    ThresholdRuns,
    /// Analysis results
    AnalysisRuns,
}

impl DataProduct {
    /// Every product, in reporting order.
    pub const ALL: [DataProduct; 9] = [
        DataProduct::Fovs,
        DataProduct::Images,
        DataProduct::Labels,
        DataProduct::Masks,
        DataProduct::Cells,
        DataProduct::Measurements,
        DataProduct::SegmentationRuns,
        DataProduct::ThresholdRuns,
        DataProduct::AnalysisRuns,
    ];

    /// Product name used in workflow documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            DataProduct::Fovs => "fovs",
            DataProduct::Images => "images",
            DataProduct::Labels => "labels",
            DataProduct::Masks => "masks",
            DataProduct::Cells => "cells",
            DataProduct::Measurements => "measurements",
            DataProduct::SegmentationRuns => "segmentation_runs",
            DataProduct::ThresholdRuns => "threshold_runs",
            DataProduct::AnalysisRuns => "analysis_runs",
        }
    }
}

impl fmt::Display for DataProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
