//! Deterministic array-group paths.
//!
//! Every pixel array lives at
//! `<root>/<kind>.zarr/<bio_rep>/<condition>/[<timepoint>/]<fov>/<channel>`.
//! The path is recomputed from the resolved coordinate on every access and is
//! never persisted, so there is no stored path that can drift from the
//! relational rows. Only names appear in the path (no numeric ids), which keeps
//! the tree browsable by hand.
//!
//! ```text
//! experiment/
//! +-- experiment.db
//! +-- images.zarr/
//! |   +-- zarr.json
//! |   +-- N1/control/FOV_1/DAPI/
//! |       +-- zarr.json      (group: multiscales metadata)
//! |       +-- 0/zarr.json    (level 0, full resolution)
//! |       +-- 1/zarr.json    (level 1, 2x downsampled)
//! +-- labels.zarr/ ...
//! +-- masks.zarr/ ...
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::validation::validate_name;

/// Which array tree an array belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Raw intensity images
    Image,
    /// Segmentation label maps
    Label,
    /// Threshold masks
    Mask,
}

impl ArrayKind {
    /// Directory name of this kind's tree under the experiment root.
    pub const fn tree_dir(self) -> &'static str {
        match self {
            ArrayKind::Image => "images.zarr",
            ArrayKind::Label => "labels.zarr",
            ArrayKind::Mask => "masks.zarr",
        }
    }

    /// Singular noun used in messages.
    pub const fn noun(self) -> &'static str {
        match self {
            ArrayKind::Image => "image",
            ArrayKind::Label => "label",
            ArrayKind::Mask => "mask",
        }
    }

    /// All kinds, in tree order.
    pub const ALL: [ArrayKind; 3] = [ArrayKind::Image, ArrayKind::Label, ArrayKind::Mask];
}

impl fmt::Display for ArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.noun())
    }
}

/// Names identifying one array group, in path order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCoordinate<'a> {
    /// Bio-rep name
    pub bio_rep: &'a str,
    /// Condition name
    pub condition: &'a str,
    /// Optional timepoint name
    pub timepoint: Option<&'a str>,
    /// FOV name
    pub fov: &'a str,
    /// Channel name
    pub channel: &'a str,
}

impl GroupCoordinate<'_> {
    fn segments(&self) -> Vec<&str> {
        let mut segments = vec![self.bio_rep, self.condition];
        if let Some(timepoint) = self.timepoint {
            segments.push(timepoint);
        }
        segments.push(self.fov);
        segments.push(self.channel);
        segments
    }
}

/// A fully built, validated location of one array group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayGroupPath {
    /// Tree this group lives in
    pub kind: ArrayKind,
    /// Zarr node path inside the tree, e.g. `/N1/control/FOV_1/DAPI`
    pub node: String,
    /// Filesystem directory of the group
    pub dir: PathBuf,
    segments: Vec<String>,
}

impl ArrayGroupPath {
    /// Node path of one pyramid level array.
    pub fn level_node(&self, level: usize) -> String {
        format!("{}/{}", self.node, level)
    }

    /// Filesystem directory of one pyramid level array.
    pub fn level_dir(&self, level: usize) -> PathBuf {
        self.dir.join(level.to_string())
    }

    /// True if the group metadata document exists on disk.
    pub fn exists(&self) -> bool {
        self.dir.join("zarr.json").is_file()
    }

    /// Node paths of every ancestor group below the tree root, outermost first.
    pub fn ancestor_nodes(&self) -> Vec<String> {
        (1..self.segments.len())
            .map(|depth| format!("/{}", self.segments[..depth].join("/")))
            .collect()
    }

    /// Relative path from this group to the same coordinate in another tree.
    ///
    /// Used for the label-to-image back-reference.
    pub fn relative_to_sibling_tree(&self, other: ArrayKind) -> String {
        let mut parts = vec![".."; self.segments.len() + 1];
        parts.push(other.tree_dir());
        parts.extend(self.segments.iter().map(String::as_str));
        parts.join("/")
    }
}

/// Builds array-group paths from resolved names.
#[derive(Debug, Clone)]
pub struct ArrayPathBuilder {
    root: PathBuf,
}

impl ArrayPathBuilder {
    /// Create a builder anchored at an existing experiment root directory.
    pub fn new(root: &Path) -> StoreResult<Self> {
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    /// Canonical experiment root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem directory of one array tree.
    pub fn tree_dir(&self, kind: ArrayKind) -> PathBuf {
        self.root.join(kind.tree_dir())
    }

    /// Build the group path for a coordinate.
    ///
    /// Each segment is re-validated and the result must stay below the root,
    /// also after resolving any symlinks along the existing part of the path.
    pub fn group_path(
        &self,
        kind: ArrayKind,
        coord: &GroupCoordinate<'_>,
    ) -> StoreResult<ArrayGroupPath> {
        let segments = coord.segments();
        for segment in &segments {
            validate_name(segment)?;
        }

        let mut dir = self.tree_dir(kind);
        for segment in &segments {
            dir.push(segment);
        }
        self.ensure_contained(&dir)?;

        Ok(ArrayGroupPath {
            kind,
            node: format!("/{}", segments.join("/")),
            dir,
            segments: segments.into_iter().map(str::to_string).collect(),
        })
    }

    fn ensure_contained(&self, path: &Path) -> StoreResult<()> {
        let escape = || StoreError::PathEscape {
            path: path.display().to_string(),
        };

        let lexically_safe = path
            .strip_prefix(&self.root)
            .map(|rest| rest.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false);
        if !lexically_safe {
            return Err(escape());
        }

        // The deepest existing ancestor decides where symlinks actually lead.
        let existing = path.ancestors().find(|candidate| candidate.exists());
        if let Some(existing) = existing {
            if !existing.canonicalize()?.starts_with(&self.root) {
                return Err(escape());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coord<'a>(timepoint: Option<&'a str>) -> GroupCoordinate<'a> {
        GroupCoordinate {
            bio_rep: "N1",
            condition: "control",
            timepoint,
            fov: "FOV_1",
            channel: "DAPI",
        }
    }

    #[test]
    fn path_is_deterministic_and_name_based() {
        let dir = TempDir::new().unwrap();
        let builder = ArrayPathBuilder::new(dir.path()).unwrap();

        let first = builder.group_path(ArrayKind::Image, &coord(None)).unwrap();
        let second = builder.group_path(ArrayKind::Image, &coord(None)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.node, "/N1/control/FOV_1/DAPI");
        assert!(first.dir.ends_with("images.zarr/N1/control/FOV_1/DAPI"));
        assert_eq!(first.level_node(1), "/N1/control/FOV_1/DAPI/1");
    }

    #[test]
    fn timepoint_is_inserted_before_fov() {
        let dir = TempDir::new().unwrap();
        let builder = ArrayPathBuilder::new(dir.path()).unwrap();
        let path = builder.group_path(ArrayKind::Mask, &coord(Some("t0"))).unwrap();
        assert_eq!(path.node, "/N1/control/t0/FOV_1/DAPI");
        assert_eq!(
            path.ancestor_nodes(),
            vec!["/N1", "/N1/control", "/N1/control/t0", "/N1/control/t0/FOV_1"]
        );
    }

    #[test]
    fn label_back_reference_points_into_image_tree() {
        let dir = TempDir::new().unwrap();
        let builder = ArrayPathBuilder::new(dir.path()).unwrap();
        let path = builder.group_path(ArrayKind::Label, &coord(None)).unwrap();
        assert_eq!(
            path.relative_to_sibling_tree(ArrayKind::Image),
            "../../../../../images.zarr/N1/control/FOV_1/DAPI"
        );
    }

    #[test]
    fn unsafe_segments_are_rejected() {
        let dir = TempDir::new().unwrap();
        let builder = ArrayPathBuilder::new(dir.path()).unwrap();
        let mut bad = coord(None);
        bad.fov = "..";
        assert!(matches!(
            builder.group_path(ArrayKind::Image, &bad),
            Err(StoreError::InvalidName { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let tree = root.path().join("images.zarr");
        std::fs::create_dir_all(&tree).unwrap();
        std::os::unix::fs::symlink(outside.path(), tree.join("N1")).unwrap();

        let builder = ArrayPathBuilder::new(root.path()).unwrap();
        assert!(matches!(
            builder.group_path(ArrayKind::Image, &coord(None)),
            Err(StoreError::PathEscape { .. })
        ));
    }
}
