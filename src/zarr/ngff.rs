//! Multiscale metadata documents.
//!
//! Array groups carry an `ome` attribute block following the OME-NGFF 0.5
//! layout so community viewers (napari, vizarr) can open the trees directly:
//!
//! ```json
//! {
//!   "ome": {
//!     "version": "0.5",
//!     "multiscales": [{
//!       "name": "DAPI",
//!       "axes": [{"name": "y", "type": "space", "unit": "micrometer"}, ...],
//!       "datasets": [
//!         {"path": "0", "coordinateTransformations": [{"type": "scale", "scale": [0.65, 0.65]}]},
//!         {"path": "1", "coordinateTransformations": [{"type": "scale", "scale": [1.3, 1.3]}]}
//!       ]
//!     }],
//!     "omero": {...},                           // images only
//!     "image-label": {"source": {"image": ...}} // labels only
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// NGFF version written by this crate.
pub const NGFF_VERSION: &str = "0.5";

/// Attribute key holding the NGFF block.
pub const OME_KEY: &str = "ome";

/// One spatial axis declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Axis name (`y` or `x`)
    pub name: String,
    /// Axis type, always `space` here
    #[serde(rename = "type")]
    pub axis_type: String,
    /// Physical unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A coordinate transformation applied to one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinateTransformation {
    /// Per-axis scale factors
    Scale {
        /// Physical size of one pixel along each axis
        scale: Vec<f64>,
    },
}

/// One resolution level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Array path relative to the group
    pub path: String,
    /// Transformations from array indices to physical space
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

/// A multiscale pyramid description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Axis declarations, slowest varying first
    pub axes: Vec<Axis>,
    /// Resolution levels, full resolution first
    pub datasets: Vec<Dataset>,
}

/// Display window for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Minimum representable value
    pub min: f64,
    /// Maximum representable value
    pub max: f64,
    /// Display range start
    pub start: f64,
    /// Display range end
    pub end: f64,
}

/// Display settings for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeroChannel {
    /// Channel label
    pub label: String,
    /// Hex RGB colour without `#`
    pub color: String,
    /// Display window
    pub window: Window,
    /// Whether the channel is shown by default
    pub active: bool,
}

/// Channel display block for image groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Omero {
    /// One entry per channel in the group
    pub channels: Vec<OmeroChannel>,
}

/// Reference from a label group back to its source image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSource {
    /// Relative path to the source image group
    pub image: String,
}

/// Label-specific block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabel {
    /// NGFF version
    pub version: String,
    /// Source image reference
    pub source: LabelSource,
}

/// The full `ome` attribute block of one array group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeAttributes {
    /// NGFF version
    pub version: String,
    /// Pyramid descriptions (this crate always writes exactly one)
    pub multiscales: Vec<Multiscale>,
    /// Channel display settings (images only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omero: Option<Omero>,
    /// Source reference (labels only)
    #[serde(rename = "image-label", default, skip_serializing_if = "Option::is_none")]
    pub image_label: Option<ImageLabel>,
}

impl OmeAttributes {
    /// Pyramid metadata for `levels` levels, each halving the previous one.
    pub fn pyramid(name: &str, levels: usize, pixel_size_um: f64) -> Self {
        let axes = ["y", "x"]
            .into_iter()
            .map(|name| Axis {
                name: name.to_string(),
                axis_type: "space".to_string(),
                unit: Some("micrometer".to_string()),
            })
            .collect();

        let datasets = (0..levels)
            .map(|level| {
                let factor = pixel_size_um * f64::from(1u32 << level.min(31));
                Dataset {
                    path: level.to_string(),
                    coordinate_transformations: vec![CoordinateTransformation::Scale {
                        scale: vec![factor, factor],
                    }],
                }
            })
            .collect();

        Self {
            version: NGFF_VERSION.to_string(),
            multiscales: vec![Multiscale {
                name: Some(name.to_string()),
                axes,
                datasets,
            }],
            omero: None,
            image_label: None,
        }
    }

    /// Attach channel display settings.
    pub fn with_channel_display(mut self, label: &str, color: &str, max_value: f64) -> Self {
        self.omero = Some(Omero {
            channels: vec![OmeroChannel {
                label: label.to_string(),
                color: color.trim_start_matches('#').to_uppercase(),
                window: Window {
                    min: 0.0,
                    max: max_value,
                    start: 0.0,
                    end: max_value,
                },
                active: true,
            }],
        });
        self
    }

    /// Attach the back-reference to the source image group.
    pub fn with_label_source(mut self, image_path: String) -> Self {
        self.image_label = Some(ImageLabel {
            version: NGFF_VERSION.to_string(),
            source: LabelSource { image: image_path },
        });
        self
    }

    /// Number of pyramid levels described.
    pub fn level_count(&self) -> usize {
        self.multiscales
            .first()
            .map(|multiscale| multiscale.datasets.len())
            .unwrap_or(0)
    }

    /// Group attribute map containing this block under `ome`.
    pub fn to_attributes(&self) -> StoreResult<Map<String, Value>> {
        let mut attributes = Map::new();
        attributes.insert(OME_KEY.to_string(), serde_json::to_value(self)?);
        Ok(attributes)
    }

    /// Parse the block back out of group attributes.
    pub fn from_attributes(attributes: &Map<String, Value>) -> StoreResult<Self> {
        let block = attributes.get(OME_KEY).ok_or_else(|| {
            StoreError::Zarr("group attributes carry no 'ome' block".to_string())
        })?;
        Ok(serde_json::from_value(block.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pyramid_scales_double_per_level() {
        let ome = OmeAttributes::pyramid("DAPI", 3, 0.5);
        assert_eq!(ome.level_count(), 3);
        let scales: Vec<Vec<f64>> = ome.multiscales[0]
            .datasets
            .iter()
            .map(|dataset| match &dataset.coordinate_transformations[0] {
                CoordinateTransformation::Scale { scale } => scale.clone(),
            })
            .collect();
        assert_eq!(scales, vec![vec![0.5, 0.5], vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn serialized_layout_matches_ngff() {
        let ome = OmeAttributes::pyramid("DAPI", 1, 1.0)
            .with_channel_display("DAPI", "#0000ff", 65535.0);
        let value = serde_json::to_value(&ome).unwrap();

        assert_eq!(value["version"], json!("0.5"));
        assert_eq!(
            value["multiscales"][0]["axes"][0],
            json!({"name": "y", "type": "space", "unit": "micrometer"})
        );
        assert_eq!(
            value["multiscales"][0]["datasets"][0]["coordinateTransformations"][0],
            json!({"type": "scale", "scale": [1.0, 1.0]})
        );
        assert_eq!(value["omero"]["channels"][0]["color"], json!("0000FF"));
        assert!(value.get("image-label").is_none());
    }

    #[test]
    fn label_block_round_trips_through_attributes() {
        let ome = OmeAttributes::pyramid("DAPI", 2, 1.0)
            .with_label_source("../../images.zarr/N1/control/FOV_1/DAPI".to_string());
        let attributes = ome.to_attributes().unwrap();
        assert_eq!(
            attributes["ome"]["image-label"]["source"]["image"],
            json!("../../images.zarr/N1/control/FOV_1/DAPI")
        );
        let parsed = OmeAttributes::from_attributes(&attributes).unwrap();
        assert_eq!(parsed, ome);
    }
}
