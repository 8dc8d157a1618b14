//! The experiment store facade.
//!
//! [`ExperimentStore`] owns the relational connection and the array trees of
//! one experiment root. Every other subsystem goes through it. Reads and
//! writes of pixel data resolve their FOV and channel the same way, so a bad
//! coordinate is a typed not-found error in both directions.
//!
//! ```no_run
//! use cytostore::config::Settings;
//! use cytostore::store::{ChannelSpec, ExperimentStore, FovCoord};
//! use ndarray::Array2;
//!
//! let mut store = ExperimentStore::create("experiment", &Settings::default())?;
//! store.add_bio_rep("N1")?;
//! store.add_channel(&ChannelSpec::new("DAPI").segmentation(true))?;
//! let fov = FovCoord::new("control", "FOV_1").bio_rep("N1");
//! store.add_fov(&fov, Some(0.65))?;
//!
//! store.write_image(&fov, "DAPI", &Array2::<u16>::zeros((512, 512)))?;
//! let image = store.read_image::<u16>(&fov, "DAPI")?;
//! assert_eq!(image.dim(), (512, 512));
//! # Ok::<(), cytostore::StoreError>(())
//! ```

pub mod models;
pub mod queries;
pub mod resolver;
pub mod schema;
pub mod writer;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ndarray::{Array2, ArrayBase, Data, Dimension};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use models::{
    AnalysisRun, BioRep, BoundingBox, Cell, CellFilter, Channel, ChannelSpec, Condition,
    DataProduct, FovCoord, FovFilter, MeasurementFilter, MeasurementPivot, MeasurementRecord,
    MeasurementScope, NewCell, NewThresholdRun, PivotRow, ResolvedFov, ScopeFilter,
    SegmentationRun, ThresholdRun, Timepoint,
};
pub use resolver::{EntityResolver, IdCache};
pub use schema::{SchemaManager, DATABASE_FILE, SCHEMA_VERSION};
pub use writer::TransactionalWriter;

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::validation::{validate_name, validate_optional_name};
use crate::zarr::{
    as_spatial, ArrayGroupPath, ArrayInfo, ArrayKind, ArrayStore, GroupCoordinate, GroupDisplay,
    LabelPixel, Pixel,
};
use models::ResolvedMeasurement;
use queries::{PivotSelection, ScopeIds};

/// One experiment: a database plus image, label and mask trees.
#[derive(Debug)]
pub struct ExperimentStore {
    root: PathBuf,
    settings: Settings,
    connection: Connection,
    arrays: ArrayStore,
    cache: IdCache,
}

impl ExperimentStore {
    /// Create a new experiment at `root`, creating the directory if needed.
    ///
    /// Fails with [`StoreError::Duplicate`] if `root` already holds a store.
    pub fn create(root: impl AsRef<Path>, settings: &Settings) -> StoreResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let connection = SchemaManager::create(&root.join(DATABASE_FILE), &settings.sqlite)?;
        let store = Self::assemble(root, settings, connection)?;
        info!(root = %store.root.display(), "Created experiment store");
        Ok(store)
    }

    /// Open an existing experiment, checking its format version.
    pub fn open(root: impl AsRef<Path>, settings: &Settings) -> StoreResult<Self> {
        let root = root.as_ref();
        let connection = SchemaManager::open(&root.join(DATABASE_FILE), &settings.sqlite)?;
        let store = Self::assemble(root, settings, connection)?;
        info!(root = %store.root.display(), "Opened experiment store");
        Ok(store)
    }

    /// Open the experiment at `root`, creating it if it does not exist yet.
    pub fn open_or_create(root: impl AsRef<Path>, settings: &Settings) -> StoreResult<Self> {
        let root = root.as_ref();
        if root.join(DATABASE_FILE).is_file() {
            Self::open(root, settings)
        } else {
            Self::create(root, settings)
        }
    }

    fn assemble(root: &Path, settings: &Settings, connection: Connection) -> StoreResult<Self> {
        let arrays = ArrayStore::open(root, &settings.store)?;
        Ok(Self {
            root: arrays.paths().root().to_path_buf(),
            settings: settings.clone(),
            connection,
            arrays,
            cache: IdCache::new(settings.store.resolver_cache_capacity),
        })
    }

    /// Canonical experiment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Settings this store was opened with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Rows changed through this store's connection since it was opened.
    pub fn total_changes(&self) -> StoreResult<u64> {
        let changes: i64 = self
            .connection
            .query_row("SELECT total_changes()", [], |row| row.get(0))?;
        Ok(u64::try_from(changes).unwrap_or(0))
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    fn resolver(&self) -> EntityResolver<'_> {
        EntityResolver::new(&self.connection, &self.cache)
    }

    // ---------------------------------------------------------------------
    // Hierarchy
    // ---------------------------------------------------------------------

    /// Add a bio-rep. Fails with [`StoreError::Duplicate`] if it exists.
    pub fn add_bio_rep(&mut self, name: &str) -> StoreResult<i64> {
        validate_name(name)?;
        self.connection
            .execute(
                "INSERT INTO bio_reps (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            )
            .map_err(|err| StoreError::from_insert("bio-rep", err))?;
        let id = self.connection.last_insert_rowid();
        self.resolver().remember_bio_rep(name, id);
        info!(bio_rep = name, id, "Added bio-rep");
        Ok(id)
    }

    /// Add a condition. Fails with [`StoreError::Duplicate`] if it exists.
    pub fn add_condition(&mut self, name: &str, description: Option<&str>) -> StoreResult<i64> {
        validate_name(name)?;
        self.connection
            .execute(
                "INSERT INTO conditions (name, description, created_at) VALUES (?1, ?2, ?3)",
                params![name, description, Utc::now()],
            )
            .map_err(|err| StoreError::from_insert("condition", err))?;
        let id = self.connection.last_insert_rowid();
        self.resolver().remember_condition(name, id);
        info!(condition = name, id, "Added condition");
        Ok(id)
    }

    /// Add a timepoint. Fails with [`StoreError::Duplicate`] if it exists.
    pub fn add_timepoint(&mut self, name: &str) -> StoreResult<i64> {
        validate_name(name)?;
        self.connection
            .execute(
                "INSERT INTO timepoints (name, created_at) VALUES (?1, ?2)",
                params![name, Utc::now()],
            )
            .map_err(|err| StoreError::from_insert("timepoint", err))?;
        let id = self.connection.last_insert_rowid();
        self.resolver().remember_timepoint(name, id);
        info!(timepoint = name, id, "Added timepoint");
        Ok(id)
    }

    /// Declare a channel. Channels keep their declaration order.
    pub fn add_channel(&mut self, spec: &ChannelSpec) -> StoreResult<i64> {
        validate_name(&spec.name)?;
        if let Some(color) = &spec.color {
            validate_color(color)?;
        }
        let display_order: i64 = self.connection.query_row(
            "SELECT COALESCE(MAX(display_order) + 1, 0) FROM channels",
            [],
            |row| row.get(0),
        )?;
        self.connection
            .execute(
                "INSERT INTO channels (name, role, is_segmentation, color, display_order)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    spec.name,
                    spec.role,
                    spec.is_segmentation,
                    spec.color,
                    display_order
                ],
            )
            .map_err(|err| StoreError::from_insert("channel", err))?;
        let id = self.connection.last_insert_rowid();
        self.resolver().remember_channel(&spec.name, id);
        info!(channel = %spec.name, id, display_order, "Added channel");
        Ok(id)
    }

    /// Add a FOV under a coordinate.
    ///
    /// A named bio-rep, the condition and the timepoint are created on first
    /// reference. An omitted bio-rep is auto-resolved. The identical
    /// (name, bio-rep, condition, timepoint) tuple can exist only once.
    pub fn add_fov(&mut self, coord: &FovCoord, pixel_size_um: Option<f64>) -> StoreResult<i64> {
        validate_coord(coord)?;
        if let Some(size) = pixel_size_um {
            if !(size > 0.0 && size.is_finite()) {
                return Err(StoreError::InvalidArray(format!(
                    "pixel size must be a positive number, got {size}"
                )));
            }
        }

        let tx = self.connection.transaction()?;
        let bio_rep_id = match coord.bio_rep.as_deref() {
            Some(name) => get_or_create(&tx, "bio_reps", name)?,
            None => EntityResolver::new(&tx, &self.cache).bio_rep(None)?.0,
        };
        let condition_id = get_or_create(&tx, "conditions", &coord.condition)?;
        let timepoint_id = coord
            .timepoint
            .as_deref()
            .map(|name| get_or_create(&tx, "timepoints", name))
            .transpose()?;

        tx.execute(
            "INSERT INTO fovs (name, bio_rep_id, condition_id, timepoint_id, pixel_size_um, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                coord.fov,
                bio_rep_id,
                condition_id,
                timepoint_id,
                pixel_size_um,
                Utc::now()
            ],
        )
        .map_err(|err| StoreError::from_insert("fov", err))?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(fov = %coord, id, "Added FOV");
        Ok(id)
    }

    /// Resolve a FOV coordinate to ids.
    pub fn resolve_fov(&self, coord: &FovCoord) -> StoreResult<ResolvedFov> {
        validate_coord(coord)?;
        self.resolver().fov(coord)
    }

    /// All bio-reps, by name.
    pub fn list_bio_reps(&self) -> StoreResult<Vec<BioRep>> {
        queries::list_bio_reps(&self.connection)
    }

    /// All conditions, by name.
    pub fn list_conditions(&self) -> StoreResult<Vec<Condition>> {
        queries::list_conditions(&self.connection)
    }

    /// All timepoints, by name.
    pub fn list_timepoints(&self) -> StoreResult<Vec<Timepoint>> {
        queries::list_timepoints(&self.connection)
    }

    /// All channels, in declaration order.
    pub fn list_channels(&self) -> StoreResult<Vec<Channel>> {
        queries::list_channels(&self.connection)
    }

    /// FOVs matching a filter.
    pub fn list_fovs(&self, filter: &FovFilter) -> StoreResult<Vec<ResolvedFov>> {
        let scope = ScopeIds::resolve(&self.resolver(), &filter.scope)?;
        queries::list_fovs(&self.connection, &scope)
    }

    // ---------------------------------------------------------------------
    // Pixel data
    // ---------------------------------------------------------------------

    /// Write a 2D image for one channel of a FOV.
    pub fn write_image<T, S, D>(
        &mut self,
        coord: &FovCoord,
        channel: &str,
        data: &ArrayBase<S, D>,
    ) -> StoreResult<ArrayInfo>
    where
        T: Pixel,
        S: Data<Elem = T>,
        D: Dimension,
    {
        self.write_array(ArrayKind::Image, coord, channel, data)
    }

    /// Read the full-resolution image of one channel.
    pub fn read_image<T: Pixel>(&self, coord: &FovCoord, channel: &str) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Image, coord, channel, 0)
    }

    /// Read one pyramid level of an image.
    pub fn read_image_level<T: Pixel>(
        &self,
        coord: &FovCoord,
        channel: &str,
        level: usize,
    ) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Image, coord, channel, level)
    }

    /// Write a label image segmented from one channel.
    pub fn write_labels<T, S, D>(
        &mut self,
        coord: &FovCoord,
        channel: &str,
        data: &ArrayBase<S, D>,
    ) -> StoreResult<ArrayInfo>
    where
        T: LabelPixel,
        S: Data<Elem = T>,
        D: Dimension,
    {
        self.write_array(ArrayKind::Label, coord, channel, data)
    }

    /// Read the full-resolution label image of one channel.
    pub fn read_labels<T: LabelPixel>(
        &self,
        coord: &FovCoord,
        channel: &str,
    ) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Label, coord, channel, 0)
    }

    /// Read one pyramid level of a label image.
    pub fn read_labels_level<T: LabelPixel>(
        &self,
        coord: &FovCoord,
        channel: &str,
        level: usize,
    ) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Label, coord, channel, level)
    }

    /// Write a threshold mask computed on one channel.
    pub fn write_mask<T, S, D>(
        &mut self,
        coord: &FovCoord,
        channel: &str,
        data: &ArrayBase<S, D>,
    ) -> StoreResult<ArrayInfo>
    where
        T: LabelPixel,
        S: Data<Elem = T>,
        D: Dimension,
    {
        self.write_array(ArrayKind::Mask, coord, channel, data)
    }

    /// Read the full-resolution mask of one channel.
    pub fn read_mask<T: LabelPixel>(
        &self,
        coord: &FovCoord,
        channel: &str,
    ) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Mask, coord, channel, 0)
    }

    /// Read one pyramid level of a mask.
    pub fn read_mask_level<T: LabelPixel>(
        &self,
        coord: &FovCoord,
        channel: &str,
        level: usize,
    ) -> StoreResult<Array2<T>> {
        self.read_array_level(ArrayKind::Mask, coord, channel, level)
    }

    /// Shape, dtype and pyramid depth of a stored array.
    pub fn array_info(
        &self,
        kind: ArrayKind,
        coord: &FovCoord,
        channel: &str,
    ) -> StoreResult<ArrayInfo> {
        let (_, group) = self.locate(kind, coord, channel)?;
        self.arrays.info(&group)
    }

    fn locate(
        &self,
        kind: ArrayKind,
        coord: &FovCoord,
        channel: &str,
    ) -> StoreResult<(ResolvedFov, ArrayGroupPath)> {
        validate_coord(coord)?;
        validate_name(channel)?;
        let resolver = self.resolver();
        let fov = resolver.fov(coord)?;
        resolver.channel(channel)?;

        let group = self.arrays.paths().group_path(
            kind,
            &GroupCoordinate {
                bio_rep: &fov.bio_rep,
                condition: &fov.condition,
                timepoint: fov.timepoint.as_deref(),
                fov: &fov.fov,
                channel,
            },
        )?;
        Ok((fov, group))
    }

    fn write_array<T, S, D>(
        &mut self,
        kind: ArrayKind,
        coord: &FovCoord,
        channel: &str,
        data: &ArrayBase<S, D>,
    ) -> StoreResult<ArrayInfo>
    where
        T: Pixel,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let view = as_spatial(data)?;
        let (fov, group) = self.locate(kind, coord, channel)?;

        let (rows, cols) = view.dim();
        let shape = [rows as u64, cols as u64];
        if let Some(recorded) = fov.shape() {
            if recorded != shape {
                return Err(StoreError::ShapeMismatch {
                    context: format!("{} of FOV {}", kind, coord),
                    expected: recorded.to_vec(),
                    actual: shape.to_vec(),
                });
            }
        }

        let color = self
            .list_channels()?
            .into_iter()
            .find(|c| c.name == channel)
            .and_then(|c| c.color);
        let display = GroupDisplay {
            name: channel.to_string(),
            pixel_size_um: fov
                .pixel_size_um
                .unwrap_or(self.settings.store.default_pixel_size_um),
            color,
        };
        // The shape is recorded in a transaction that commits only once the
        // pyramid is on disk; a failed write leaves the FOV unshaped.
        let tx = self.connection.transaction()?;
        if fov.shape().is_none() {
            tx.execute(
                "UPDATE fovs SET width = ?1, height = ?2 WHERE id = ?3",
                params![shape[1], shape[0], fov.fov_id],
            )?;
        }
        let info = self.arrays.write_pyramid(&group, view, &display)?;
        if let Err(err) = tx.commit() {
            warn!(
                fov_id = fov.fov_id,
                coord = %coord,
                kind = %kind,
                channel,
                error = %err,
                "Arrays written but FOV shape not recorded"
            );
            return Err(err.into());
        }
        if fov.shape().is_none() {
            debug!(fov_id = fov.fov_id, rows, cols, "Recorded FOV shape");
        }
        Ok(info)
    }

    fn read_array_level<T: Pixel>(
        &self,
        kind: ArrayKind,
        coord: &FovCoord,
        channel: &str,
        level: usize,
    ) -> StoreResult<Array2<T>> {
        let (_, group) = self.locate(kind, coord, channel)?;
        self.arrays.read_level(&group, level)
    }

    // ---------------------------------------------------------------------
    // Cells and measurements
    // ---------------------------------------------------------------------

    /// Record a segmentation pass over one channel of a FOV.
    pub fn add_segmentation_run(
        &mut self,
        coord: &FovCoord,
        channel: &str,
        model: &str,
        parameters: &Value,
    ) -> StoreResult<i64> {
        let fov = self.resolve_fov(coord)?;
        let channel_id = self.resolver().channel(channel)?;
        self.connection.execute(
            "INSERT INTO segmentation_runs (fov_id, channel_id, model, parameters, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![fov.fov_id, channel_id, model, parameters, Utc::now()],
        )?;
        let id = self.connection.last_insert_rowid();
        info!(fov = %coord, channel, model, id, "Recorded segmentation run");
        Ok(id)
    }

    /// Segmentation runs of one FOV, oldest first.
    pub fn list_segmentation_runs(&self, coord: &FovCoord) -> StoreResult<Vec<SegmentationRun>> {
        let fov = self.resolve_fov(coord)?;
        queries::list_segmentation_runs(&self.connection, fov.fov_id)
    }

    /// Insert the cells found by one segmentation run, atomically.
    pub fn add_cells(
        &mut self,
        coord: &FovCoord,
        segmentation_id: i64,
        cells: &[NewCell],
    ) -> StoreResult<usize> {
        let fov = self.resolve_fov(coord)?;
        TransactionalWriter::new(&mut self.connection).insert_cells(
            fov.fov_id,
            segmentation_id,
            cells,
        )
    }

    /// Cells matching a filter, by id.
    pub fn get_cells(&self, filter: &CellFilter) -> StoreResult<Vec<Cell>> {
        let scope = ScopeIds::resolve(&self.resolver(), &filter.scope)?;
        queries::get_cells(&self.connection, &scope, filter.include_superseded)
    }

    /// Number of cells matching a filter.
    pub fn count_cells(&self, filter: &CellFilter) -> StoreResult<u64> {
        let scope = ScopeIds::resolve(&self.resolver(), &filter.scope)?;
        queries::count_cells(&self.connection, &scope, filter.include_superseded)
    }

    /// Record a threshold pass over one channel of a FOV.
    pub fn add_threshold_run(
        &mut self,
        coord: &FovCoord,
        channel: &str,
        run: &NewThresholdRun,
    ) -> StoreResult<i64> {
        let fov = self.resolve_fov(coord)?;
        let channel_id = self.resolver().channel(channel)?;
        self.connection.execute(
            "INSERT INTO threshold_runs
                 (fov_id, channel_id, method, threshold_value, parameters, positive_pixels, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fov.fov_id,
                channel_id,
                run.method,
                run.threshold_value,
                run.parameters,
                run.positive_pixels,
                Utc::now()
            ],
        )?;
        let id = self.connection.last_insert_rowid();
        info!(fov = %coord, channel, method = %run.method, id, "Recorded threshold run");
        Ok(id)
    }

    /// Threshold runs of one FOV, oldest first.
    pub fn list_threshold_runs(&self, coord: &FovCoord) -> StoreResult<Vec<ThresholdRun>> {
        let fov = self.resolve_fov(coord)?;
        queries::list_threshold_runs(&self.connection, fov.fov_id)
    }

    /// Insert or replace measurements, atomically.
    pub fn add_measurements(&mut self, records: &[MeasurementRecord]) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let resolved = {
            let resolver = self.resolver();
            records
                .iter()
                .map(|record| {
                    if record.metric.is_empty() {
                        return Err(StoreError::InvalidName {
                            name: record.metric.clone(),
                            reason: "metric name cannot be empty",
                        });
                    }
                    Ok(ResolvedMeasurement {
                        cell_id: record.cell_id,
                        channel_id: resolver.channel(&record.channel)?,
                        metric: record.metric.clone(),
                        scope: record.scope,
                        value: record.value,
                        threshold_run_id: record.threshold_run_id,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?
        };
        TransactionalWriter::new(&mut self.connection).insert_measurements(&resolved)
    }

    /// Measurements as a cell-by-column matrix.
    pub fn get_measurement_pivot(&self, filter: &MeasurementFilter) -> StoreResult<MeasurementPivot> {
        let resolver = self.resolver();
        let scope = ScopeIds::resolve(&resolver, &filter.scope)?;
        let selection = PivotSelection {
            channel_id: filter
                .channel
                .as_deref()
                .map(|name| resolver.channel(name))
                .transpose()?,
            metric: filter.metric.clone(),
            scope: filter.measurement_scope,
        };
        queries::measurement_pivot(&self.connection, &scope, &selection)
    }

    /// Record the result of an analysis plugin.
    pub fn add_analysis_run(
        &mut self,
        plugin: &str,
        coord: Option<&FovCoord>,
        parameters: &Value,
        result: &Value,
        cell_count: u64,
    ) -> StoreResult<i64> {
        let fov_id = coord
            .map(|coord| self.resolve_fov(coord).map(|fov| fov.fov_id))
            .transpose()?;
        self.connection.execute(
            "INSERT INTO analysis_runs (plugin, fov_id, parameters, result, cell_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![plugin, fov_id, parameters, result, cell_count, Utc::now()],
        )?;
        let id = self.connection.last_insert_rowid();
        info!(plugin, id, cell_count, "Recorded analysis run");
        Ok(id)
    }

    /// Analysis runs, optionally for one plugin, oldest first.
    pub fn list_analysis_runs(&self, plugin: Option<&str>) -> StoreResult<Vec<AnalysisRun>> {
        queries::list_analysis_runs(&self.connection, plugin)
    }

    /// Data products currently held by this store.
    pub fn available_products(&self) -> StoreResult<BTreeSet<String>> {
        let mut products: BTreeSet<String> = queries::relational_products(&self.connection)?
            .into_iter()
            .map(|product| product.as_str().to_string())
            .collect();
        for (kind, product) in [
            (ArrayKind::Image, DataProduct::Images),
            (ArrayKind::Label, DataProduct::Labels),
            (ArrayKind::Mask, DataProduct::Masks),
        ] {
            if self.arrays.contains_any(kind)? {
                products.insert(product.as_str().to_string());
            }
        }
        Ok(products)
    }
}

fn validate_coord(coord: &FovCoord) -> StoreResult<()> {
    validate_optional_name(coord.bio_rep.as_deref())?;
    validate_name(&coord.condition)?;
    validate_optional_name(coord.timepoint.as_deref())?;
    validate_name(&coord.fov)?;
    Ok(())
}

fn validate_color(color: &str) -> StoreResult<()> {
    let hex = color.trim_start_matches('#');
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            name: color.to_string(),
            reason: "colour must be six hex digits",
        })
    }
}

/// Id of the named row in a name-keyed hierarchy table, inserting it if absent.
fn get_or_create(connection: &Connection, table: &'static str, name: &str) -> StoreResult<i64> {
    connection.execute(
        &format!("INSERT OR IGNORE INTO {table} (name, created_at) VALUES (?1, ?2)"),
        params![name, Utc::now()],
    )?;
    let id = connection.query_row(
        &format!("SELECT id FROM {table} WHERE name = ?1"),
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn store() -> (TempDir, ExperimentStore) {
        let dir = TempDir::new().unwrap();
        let store = ExperimentStore::create(dir.path().join("exp"), &Settings::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn failed_pyramid_write_leaves_fov_shape_unrecorded() {
        let (_dir, mut store) = store();
        let coord = FovCoord::new("control", "FOV_1").bio_rep("N1");
        store.add_fov(&coord, None).unwrap();
        store.add_channel(&ChannelSpec::new("DAPI")).unwrap();

        // A plain file where the group directory belongs makes the write fail
        let (_, group) = store.locate(ArrayKind::Image, &coord, "DAPI").unwrap();
        std::fs::create_dir_all(group.dir.parent().unwrap()).unwrap();
        std::fs::write(&group.dir, b"").unwrap();

        assert!(store
            .write_image(&coord, "DAPI", &Array2::<u16>::zeros((64, 64)))
            .is_err());
        assert_eq!(store.resolve_fov(&coord).unwrap().shape(), None);

        std::fs::remove_file(&group.dir).unwrap();
        store
            .write_image(&coord, "DAPI", &Array2::<u16>::zeros((32, 48)))
            .unwrap();
        assert_eq!(store.resolve_fov(&coord).unwrap().shape(), Some([32, 48]));
    }

    #[test]
    fn unsafe_names_are_rejected_before_any_write() {
        let (_dir, mut store) = store();
        let before = store.total_changes().unwrap();
        assert!(matches!(
            store.add_bio_rep("../N1"),
            Err(StoreError::InvalidName { .. })
        ));
        assert!(matches!(
            store.add_fov(&FovCoord::new("control", ".hidden").bio_rep("N1"), None),
            Err(StoreError::InvalidName { .. })
        ));
        assert_eq!(store.total_changes().unwrap(), before);
    }

    #[test]
    fn add_fov_creates_hierarchy_on_first_reference() {
        let (_dir, mut store) = store();
        store
            .add_fov(&FovCoord::new("control", "FOV_1").bio_rep("N1").timepoint("t0"), None)
            .unwrap();
        assert_eq!(store.list_bio_reps().unwrap()[0].name, "N1");
        assert_eq!(store.list_conditions().unwrap()[0].name, "control");
        assert_eq!(store.list_timepoints().unwrap()[0].name, "t0");
    }

    #[test]
    fn identical_fov_tuples_are_duplicates() {
        let (_dir, mut store) = store();
        let coord = FovCoord::new("control", "FOV_1").bio_rep("N1");
        store.add_fov(&coord, None).unwrap();
        assert!(matches!(
            store.add_fov(&coord, None),
            Err(StoreError::Duplicate { entity: "fov", .. })
        ));
        store.add_fov(&coord.clone().timepoint("t0"), None).unwrap();
    }

    #[test]
    fn channels_keep_declaration_order() {
        let (_dir, mut store) = store();
        for name in ["GFP", "DAPI", "Actin"] {
            store.add_channel(&ChannelSpec::new(name)).unwrap();
        }
        let names: Vec<String> = store
            .list_channels()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["GFP", "DAPI", "Actin"]);
        assert!(matches!(
            store.add_channel(&ChannelSpec::new("X").color("blue")),
            Err(StoreError::InvalidName { .. })
        ));
    }

    #[test]
    fn pixel_writes_must_match_recorded_fov_shape() {
        let (_dir, mut store) = store();
        let coord = FovCoord::new("control", "FOV_1").bio_rep("N1");
        store.add_fov(&coord, None).unwrap();
        store.add_channel(&ChannelSpec::new("DAPI")).unwrap();
        store.add_channel(&ChannelSpec::new("GFP")).unwrap();

        store
            .write_image(&coord, "DAPI", &Array2::<u16>::zeros((32, 48)))
            .unwrap();
        let resolved = store.resolve_fov(&coord).unwrap();
        assert_eq!(resolved.shape(), Some([32, 48]));

        let err = store
            .write_image(&coord, "GFP", &Array2::<u16>::zeros((48, 32)))
            .unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
        assert!(matches!(
            store.read_image::<u16>(&coord, "GFP"),
            Err(StoreError::ArrayNotFound { .. })
        ));
    }

    #[test]
    fn reads_and_writes_resolve_the_same_way() {
        let (_dir, mut store) = store();
        store.add_channel(&ChannelSpec::new("DAPI")).unwrap();
        let missing = FovCoord::new("control", "FOV_9").bio_rep("N1");
        store
            .add_fov(&FovCoord::new("control", "FOV_1").bio_rep("N1"), None)
            .unwrap();

        assert!(matches!(
            store.write_image(&missing, "DAPI", &Array2::<u16>::zeros((4, 4))),
            Err(StoreError::FovNotFound(_))
        ));
        assert!(matches!(
            store.read_image::<u16>(&missing, "DAPI"),
            Err(StoreError::FovNotFound(_))
        ));
        let fov = FovCoord::new("control", "FOV_1");
        assert!(matches!(
            store.read_image::<u16>(&fov, "Cy5"),
            Err(StoreError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn three_dimensional_input_is_rejected() {
        let (_dir, mut store) = store();
        store.add_channel(&ChannelSpec::new("DAPI")).unwrap();
        let coord = FovCoord::new("control", "FOV_1").bio_rep("N1");
        store.add_fov(&coord, None).unwrap();
        assert!(matches!(
            store.write_image(&coord, "DAPI", &Array3::<u16>::zeros((2, 4, 4))),
            Err(StoreError::InvalidArray(_))
        ));
        assert!(!store.available_products().unwrap().contains("images"));
    }

    #[test]
    fn fov_filter_without_condition_fails_fast() {
        let (_dir, store) = store();
        assert!(matches!(
            store.count_cells(&CellFilter::default().fov("FOV_1")),
            Err(StoreError::MissingFilterDependency {
                filter: "fov",
                requires: "condition"
            })
        ));
        assert!(matches!(
            store.get_measurement_pivot(&MeasurementFilter::default().fov("FOV_1")),
            Err(StoreError::MissingFilterDependency { .. })
        ));
    }

    #[test]
    fn open_missing_root_is_not_found_and_reopen_works() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ExperimentStore::open(dir.path().join("nowhere"), &Settings::default()),
            Err(StoreError::Io(_))
        ));

        let root = dir.path().join("exp");
        {
            let mut store = ExperimentStore::open_or_create(&root, &Settings::default()).unwrap();
            store.add_bio_rep("N1").unwrap();
        }
        let store = ExperimentStore::open_or_create(&root, &Settings::default()).unwrap();
        assert_eq!(store.list_bio_reps().unwrap().len(), 1);
        assert!(matches!(
            ExperimentStore::create(&root, &Settings::default()),
            Err(StoreError::Duplicate { .. })
        ));
    }
}
