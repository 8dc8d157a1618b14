//! Chunked array trees: pyramid writes, level reads and shape checks.
//!
//! One Zarr V3 filesystem store per [`ArrayKind`]. A write stores the input as
//! level 0 and derives lower levels by stride-2 sampling, which keeps label
//! values intact and works for every pixel type. All checks (dimensionality,
//! shape against the existing pyramid) run before the first byte is written.

use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, ArrayBase, ArrayView2, Data, Dimension, Ix2};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use zarrs::array::{Array, ArrayBuilder};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

use super::ngff::OmeAttributes;
use super::paths::{ArrayGroupPath, ArrayKind, ArrayPathBuilder};
use super::pixel::{Pixel, PixelType};
use crate::config::StoreSettings;
use crate::error::{StoreError, StoreResult};

/// Array attribute recording the pixel dtype.
const DTYPE_ATTR: &str = "dtype";

/// Shape, dtype and pyramid depth of a stored array group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayInfo {
    /// Which tree the group lives in
    pub kind: ArrayKind,
    /// Full-resolution shape as `[rows, cols]`
    pub shape: [u64; 2],
    /// Stored pixel type
    pub dtype: PixelType,
    /// Number of pyramid levels
    pub levels: usize,
}

/// Descriptive metadata written with a pyramid.
#[derive(Debug, Clone)]
pub struct GroupDisplay {
    /// Display name, normally the channel name
    pub name: String,
    /// Physical pixel size at level 0
    pub pixel_size_um: f64,
    /// Hex colour for image channels
    pub color: Option<String>,
}

struct ArrayTree {
    store: ReadableWritableListableStorage,
}

impl std::fmt::Debug for ArrayTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayTree").finish_non_exhaustive()
    }
}

/// The three array trees of one experiment.
#[derive(Debug)]
pub struct ArrayStore {
    paths: ArrayPathBuilder,
    images: ArrayTree,
    labels: ArrayTree,
    masks: ArrayTree,
    chunk_size: u64,
    max_levels: usize,
    min_level_size: u64,
}

impl ArrayStore {
    /// Open (creating if needed) the array trees below an experiment root.
    pub fn open(root: &Path, settings: &StoreSettings) -> StoreResult<Self> {
        let paths = ArrayPathBuilder::new(root)?;
        let images = open_tree(&paths, ArrayKind::Image)?;
        let labels = open_tree(&paths, ArrayKind::Label)?;
        let masks = open_tree(&paths, ArrayKind::Mask)?;

        Ok(Self {
            paths,
            images,
            labels,
            masks,
            chunk_size: settings.chunk_size.max(1),
            max_levels: usize::from(settings.max_pyramid_levels.max(1)),
            min_level_size: settings.min_level_size,
        })
    }

    /// Path builder anchored at this experiment's root.
    pub fn paths(&self) -> &ArrayPathBuilder {
        &self.paths
    }

    fn tree(&self, kind: ArrayKind) -> &ArrayTree {
        match kind {
            ArrayKind::Image => &self.images,
            ArrayKind::Label => &self.labels,
            ArrayKind::Mask => &self.masks,
        }
    }

    /// Number of pyramid levels a full-resolution shape gets.
    pub fn planned_levels(&self, shape: [u64; 2]) -> usize {
        let mut levels = 1;
        let [mut rows, mut cols] = shape;
        while levels < self.max_levels {
            let (next_rows, next_cols) = (rows.div_ceil(2), cols.div_ceil(2));
            if next_rows.min(next_cols) < self.min_level_size {
                break;
            }
            rows = next_rows;
            cols = next_cols;
            levels += 1;
        }
        levels
    }

    fn stored_level_shape(
        &self,
        group: &ArrayGroupPath,
        level: usize,
    ) -> StoreResult<Option<[u64; 2]>> {
        if !group.level_dir(level).join("zarr.json").is_file() {
            return Ok(None);
        }
        let array = self.open_level(group, level)?;
        spatial_shape(array.shape(), &group.level_node(level)).map(Some)
    }

    /// Write `data` as a full pyramid at `group`.
    ///
    /// Rewriting an existing group is allowed only with the same spatial shape
    /// at every level that already exists; a mismatch is reported before any
    /// level is touched.
    pub fn write_pyramid<T: Pixel>(
        &self,
        group: &ArrayGroupPath,
        data: ArrayView2<'_, T>,
        display: &GroupDisplay,
    ) -> StoreResult<ArrayInfo> {
        let (rows, cols) = data.dim();
        let shape = [rows as u64, cols as u64];

        let mut levels: Vec<Array2<T>> = Vec::new();
        let level_count = self.planned_levels(shape);
        for _ in 1..level_count {
            let previous = levels
                .last()
                .map(|array| array.view())
                .unwrap_or_else(|| data.view());
            let next = previous.slice(s![..;2, ..;2]).to_owned();
            levels.push(next);
        }

        let planned_shapes: Vec<[u64; 2]> = std::iter::once(shape)
            .chain(levels.iter().map(|array| {
                let (r, c) = array.dim();
                [r as u64, c as u64]
            }))
            .collect();

        for (level, planned) in planned_shapes.iter().enumerate() {
            if let Some(existing) = self.stored_level_shape(group, level)? {
                if existing != *planned {
                    return Err(StoreError::ShapeMismatch {
                        context: format!("{} level {}", group.node, level),
                        expected: existing.to_vec(),
                        actual: planned.to_vec(),
                    });
                }
            }
        }

        let mut ome =
            OmeAttributes::pyramid(&display.name, level_count, display.pixel_size_um);
        match group.kind {
            ArrayKind::Image => {
                let color = display.color.as_deref().unwrap_or("FFFFFF");
                ome = ome.with_channel_display(&display.name, color, T::display_max());
            }
            ArrayKind::Label => {
                ome = ome.with_label_source(group.relative_to_sibling_tree(ArrayKind::Image));
            }
            ArrayKind::Mask => {}
        }

        let previous_levels = self.group_levels(group)?;
        self.ensure_ancestors(group)?;
        self.store_group(group.kind, &group.node, ome.to_attributes()?)?;

        self.write_level(group, 0, data)?;
        for (index, level) in levels.iter().enumerate() {
            self.write_level(group, index + 1, level.view())?;
        }

        // A pyramid built with a deeper level limit leaves extra levels behind
        for stale in level_count..previous_levels {
            let dir = group.level_dir(stale);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }

        info!(
            kind = %group.kind,
            node = %group.node,
            rows,
            cols,
            dtype = %T::DTYPE,
            levels = level_count,
            "Wrote array pyramid"
        );

        Ok(ArrayInfo {
            kind: group.kind,
            shape,
            dtype: T::DTYPE,
            levels: level_count,
        })
    }

    /// Read one pyramid level as a 2D array.
    pub fn read_level<T: Pixel>(
        &self,
        group: &ArrayGroupPath,
        level: usize,
    ) -> StoreResult<Array2<T>> {
        if !group.level_dir(level).join("zarr.json").is_file() {
            return Err(StoreError::ArrayNotFound {
                kind: group.kind.noun(),
                path: group.level_node(level),
            });
        }

        let array = self.open_level(group, level)?;
        let stored = stored_dtype(array.attributes(), &group.level_node(level))?;
        if stored != T::DTYPE {
            return Err(StoreError::DtypeMismatch {
                context: group.level_node(level),
                stored: stored.to_string(),
                requested: T::DTYPE.to_string(),
            });
        }

        let [rows, cols] = spatial_shape(array.shape(), &group.level_node(level))?;
        let subset = ArraySubset::new_with_shape(vec![rows, cols]);
        let elements = array
            .retrieve_array_subset_elements::<T>(&subset)
            .map_err(|e| StoreError::zarr("Failed to read array", e))?;

        debug!(node = %group.level_node(level), rows, cols, "Read array level");
        Array2::from_shape_vec((rows as usize, cols as usize), elements)
            .map_err(|e| StoreError::InvalidArray(e.to_string()))
    }

    /// Shape, dtype and level count of a stored group.
    pub fn info(&self, group: &ArrayGroupPath) -> StoreResult<ArrayInfo> {
        if !group.exists() {
            return Err(StoreError::ArrayNotFound {
                kind: group.kind.noun(),
                path: group.node.clone(),
            });
        }
        let levels = self.group_levels(group)?;
        let array = self.open_level(group, 0)?;
        Ok(ArrayInfo {
            kind: group.kind,
            shape: spatial_shape(array.shape(), &group.level_node(0))?,
            dtype: stored_dtype(array.attributes(), &group.level_node(0))?,
            levels,
        })
    }

    /// True if any array group has been written to the tree of `kind`.
    pub fn contains_any(&self, kind: ArrayKind) -> StoreResult<bool> {
        contains_level_array(&self.paths.tree_dir(kind), 0)
    }

    fn group_levels(&self, group: &ArrayGroupPath) -> StoreResult<usize> {
        if !group.exists() {
            return Ok(0);
        }
        let tree = self.tree(group.kind);
        let existing = Group::open(tree.store.clone(), &group.node)
            .map_err(|e| StoreError::zarr("Failed to open group", e))?;
        Ok(OmeAttributes::from_attributes(existing.attributes())?.level_count())
    }

    fn open_level(
        &self,
        group: &ArrayGroupPath,
        level: usize,
    ) -> StoreResult<Array<dyn ReadableWritableListableStorageTraits>> {
        let tree = self.tree(group.kind);
        Array::open(tree.store.clone(), &group.level_node(level))
            .map_err(|e| StoreError::zarr("Failed to open array", e))
    }

    fn ensure_ancestors(&self, group: &ArrayGroupPath) -> StoreResult<()> {
        let tree_dir = self.paths.tree_dir(group.kind);
        for node in group.ancestor_nodes() {
            let dir = tree_dir.join(node.trim_start_matches('/'));
            if !dir.join("zarr.json").is_file() {
                self.store_group(group.kind, &node, Map::new())?;
            }
        }
        Ok(())
    }

    fn store_group(
        &self,
        kind: ArrayKind,
        node: &str,
        attributes: Map<String, Value>,
    ) -> StoreResult<()> {
        let tree = self.tree(kind);
        let group = GroupBuilder::new()
            .attributes(attributes)
            .build(tree.store.clone(), node)
            .map_err(|e| StoreError::zarr("Failed to create group", e))?;
        group
            .store_metadata()
            .map_err(|e| StoreError::zarr("Failed to store group metadata", e))
    }

    fn write_level<T: Pixel>(
        &self,
        group: &ArrayGroupPath,
        level: usize,
        data: ArrayView2<'_, T>,
    ) -> StoreResult<()> {
        let tree = self.tree(group.kind);
        let (rows, cols) = data.dim();
        let shape = vec![rows as u64, cols as u64];
        let chunks = vec![
            self.chunk_size.min(rows as u64),
            self.chunk_size.min(cols as u64),
        ];
        let node = group.level_node(level);

        let mut attributes = Map::new();
        attributes.insert(DTYPE_ATTR.to_string(), json!(T::DTYPE.as_str()));

        let mut builder = ArrayBuilder::new(shape.clone(), chunks, T::data_type(), T::fill_value());
        builder.attributes(attributes);
        builder.dimension_names(Some(vec![Some("y".to_string()), Some("x".to_string())]));

        let array = builder
            .build(tree.store.clone(), &node)
            .map_err(|e| StoreError::zarr(&format!("Failed to create array '{node}'"), e))?;
        array
            .store_metadata()
            .map_err(|e| StoreError::zarr("Failed to store array metadata", e))?;

        // Row-major element order regardless of the view's memory layout
        let elements: Vec<T> = data.iter().copied().collect();
        array
            .store_array_subset_elements(&ArraySubset::new_with_shape(shape), &elements)
            .map_err(|e| StoreError::zarr("Failed to write array", e))
    }
}

/// Check that `data` is a non-empty 2D array and view it as such.
pub fn as_spatial<S, T, D>(data: &ArrayBase<S, D>) -> StoreResult<ArrayView2<'_, T>>
where
    S: Data<Elem = T>,
    D: Dimension,
{
    if data.ndim() != 2 {
        return Err(StoreError::InvalidArray(format!(
            "expected exactly 2 spatial dimensions, got {} (shape {:?})",
            data.ndim(),
            data.shape()
        )));
    }
    if data.is_empty() {
        return Err(StoreError::InvalidArray(format!(
            "array has an empty dimension (shape {:?})",
            data.shape()
        )));
    }
    data.view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| StoreError::InvalidArray(e.to_string()))
}

fn open_tree(paths: &ArrayPathBuilder, kind: ArrayKind) -> StoreResult<ArrayTree> {
    let dir = paths.tree_dir(kind);
    std::fs::create_dir_all(&dir)?;

    let store = FilesystemStore::new(&dir)
        .map_err(|e| StoreError::zarr("Failed to create Zarr store", e))?;
    let store: ReadableWritableListableStorage = Arc::new(store);

    if !dir.join("zarr.json").is_file() {
        let group = GroupBuilder::new()
            .build(store.clone(), "/")
            .map_err(|e| StoreError::zarr("Failed to create root group", e))?;
        group
            .store_metadata()
            .map_err(|e| StoreError::zarr("Failed to store root group metadata", e))?;
        debug!(tree = %kind.tree_dir(), "Created array tree");
    }

    Ok(ArrayTree { store })
}

fn spatial_shape(shape: &[u64], node: &str) -> StoreResult<[u64; 2]> {
    match shape {
        [rows, cols] => Ok([*rows, *cols]),
        other => Err(StoreError::InvalidArray(format!(
            "stored array {node} has {} dimensions, expected 2",
            other.len()
        ))),
    }
}

fn stored_dtype(attributes: &Map<String, Value>, node: &str) -> StoreResult<PixelType> {
    attributes
        .get(DTYPE_ATTR)
        .and_then(Value::as_str)
        .and_then(PixelType::parse)
        .ok_or_else(|| StoreError::Zarr(format!("array {node} carries no recognised dtype")))
}

fn is_array_node(dir: &Path) -> StoreResult<bool> {
    let metadata = dir.join("zarr.json");
    if !metadata.is_file() {
        return Ok(false);
    }
    let document: Value = serde_json::from_str(&std::fs::read_to_string(metadata)?)?;
    Ok(document.get("node_type").and_then(Value::as_str) == Some("array"))
}

/// Depth-first search for a written level-0 array below `dir`.
fn contains_level_array(dir: &Path, depth: usize) -> StoreResult<bool> {
    // bio_rep/condition/timepoint/fov/channel/level
    const MAX_DEPTH: usize = 6;
    if depth > MAX_DEPTH || !dir.is_dir() {
        return Ok(false);
    }
    if dir.file_name().is_some_and(|name| name == "0") && is_array_node(dir)? {
        return Ok(true);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() && contains_level_array(&entry.path(), depth + 1)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zarr::paths::GroupCoordinate;
    use ndarray::{Array, Array3};
    use tempfile::TempDir;

    fn settings(max_levels: u8) -> StoreSettings {
        StoreSettings {
            chunk_size: 32,
            max_pyramid_levels: max_levels,
            min_level_size: 16,
            ..StoreSettings::default()
        }
    }

    fn group(store: &ArrayStore, kind: ArrayKind) -> ArrayGroupPath {
        store
            .paths()
            .group_path(
                kind,
                &GroupCoordinate {
                    bio_rep: "N1",
                    condition: "control",
                    timepoint: None,
                    fov: "FOV_1",
                    channel: "DAPI",
                },
            )
            .unwrap()
    }

    fn display() -> GroupDisplay {
        GroupDisplay {
            name: "DAPI".to_string(),
            pixel_size_um: 0.65,
            color: Some("0000FF".to_string()),
        }
    }

    #[test]
    fn level_planning_respects_limits() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(4)).unwrap();
        assert_eq!(store.planned_levels([512, 512]), 4);
        assert_eq!(store.planned_levels([40, 40]), 2);
        assert_eq!(store.planned_levels([20, 500]), 1);
    }

    #[test]
    fn pyramid_round_trip_preserves_values() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(3)).unwrap();
        let image = Array::from_shape_fn((70, 50), |(r, c)| (r * 100 + c) as u16);
        let path = group(&store, ArrayKind::Image);

        let info = store.write_pyramid(&path, image.view(), &display()).unwrap();
        assert_eq!(info.shape, [70, 50]);
        assert_eq!(info.levels, 2);

        let full: Array2<u16> = store.read_level(&path, 0).unwrap();
        assert_eq!(full, image);

        let half: Array2<u16> = store.read_level(&path, 1).unwrap();
        assert_eq!(half.dim(), (35, 25));
        assert_eq!(half[[1, 1]], image[[2, 2]]);

        assert_eq!(store.info(&path).unwrap(), info);
        assert!(store.contains_any(ArrayKind::Image).unwrap());
        assert!(!store.contains_any(ArrayKind::Mask).unwrap());
    }

    #[test]
    fn rewriting_with_different_shape_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(2)).unwrap();
        let path = group(&store, ArrayKind::Mask);

        let mask = Array2::<u8>::ones((64, 64));
        store.write_pyramid(&path, mask.view(), &display()).unwrap();

        let bigger = Array2::<u8>::zeros((64, 65));
        let err = store
            .write_pyramid(&path, bigger.view(), &display())
            .unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));

        let kept: Array2<u8> = store.read_level(&path, 0).unwrap();
        assert_eq!(kept, mask);
    }

    #[test]
    fn wrong_dtype_on_read_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(1)).unwrap();
        let path = group(&store, ArrayKind::Image);
        store
            .write_pyramid(&path, Array2::<u16>::zeros((8, 8)).view(), &display())
            .unwrap();

        let err = store.read_level::<f32>(&path, 0).unwrap_err();
        assert!(matches!(err, StoreError::DtypeMismatch { .. }));
    }

    #[test]
    fn label_groups_reference_their_image() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(1)).unwrap();
        let path = group(&store, ArrayKind::Label);
        store
            .write_pyramid(&path, Array2::<u32>::zeros((8, 8)).view(), &display())
            .unwrap();

        let metadata: Value =
            serde_json::from_str(&std::fs::read_to_string(path.dir.join("zarr.json")).unwrap())
                .unwrap();
        let source = &metadata["attributes"]["ome"]["image-label"]["source"]["image"];
        assert_eq!(source, "../../../../../images.zarr/N1/control/FOV_1/DAPI");
    }

    #[test]
    fn non_spatial_input_is_rejected() {
        let volume = Array3::<u16>::zeros((2, 4, 4));
        assert!(matches!(
            as_spatial(&volume),
            Err(StoreError::InvalidArray(_))
        ));
        let empty = Array2::<u16>::zeros((0, 4));
        assert!(matches!(as_spatial(&empty), Err(StoreError::InvalidArray(_))));
        let plane = Array2::<u16>::zeros((4, 4));
        assert_eq!(as_spatial(&plane).unwrap().dim(), (4, 4));
    }

    #[test]
    fn missing_level_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ArrayStore::open(dir.path(), &settings(1)).unwrap();
        let path = group(&store, ArrayKind::Image);
        assert!(matches!(
            store.read_level::<u16>(&path, 0),
            Err(StoreError::ArrayNotFound { .. })
        ));
    }
}
