//! Pixel data storage in Zarr V3 array trees.
//!
//! - [`paths`]: deterministic, contained group paths per coordinate
//! - [`pixel`]: supported element types
//! - [`ngff`]: multiscale metadata written on each group
//! - [`arrays`]: pyramid writes and level reads

pub mod arrays;
pub mod ngff;
pub mod paths;
pub mod pixel;

pub use arrays::{as_spatial, ArrayInfo, ArrayStore, GroupDisplay};
pub use paths::{ArrayGroupPath, ArrayKind, ArrayPathBuilder, GroupCoordinate};
pub use pixel::{LabelPixel, Pixel, PixelType};
