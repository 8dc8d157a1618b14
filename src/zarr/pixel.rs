//! Pixel element types and their Zarr data types.

use std::fmt;

use zarrs::array::{DataType, Element, ElementOwned, FillValue};

/// A scalar type that can be stored as a pixel in an array tree.
///
/// `DTYPE` is recorded on every written array and checked on read, so an
/// array written as `u16` can only be read back as `u16`.
pub trait Pixel:
    Element + ElementOwned + Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Dtype tag recorded in array attributes.
    const DTYPE: PixelType;

    /// Zarr data type for this element.
    fn data_type() -> DataType;

    /// Fill value used for chunks that were never written.
    fn fill_value() -> FillValue;

    /// Upper end of the default display window.
    fn display_max() -> f64;
}

/// Marker for integer types allowed in label arrays.
pub trait LabelPixel: Pixel {}

/// Runtime dtype tag, as stored in array attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    /// 8-bit unsigned
    UInt8,
    /// 16-bit unsigned
    UInt16,
    /// 32-bit unsigned
    UInt32,
    /// 32-bit signed
    Int32,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
}

impl PixelType {
    /// Numpy-style dtype name.
    pub const fn as_str(self) -> &'static str {
        match self {
            PixelType::UInt8 => "uint8",
            PixelType::UInt16 => "uint16",
            PixelType::UInt32 => "uint32",
            PixelType::Int32 => "int32",
            PixelType::Float32 => "float32",
            PixelType::Float64 => "float64",
        }
    }

    /// Parse a dtype name written by [`PixelType::as_str`].
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(PixelType::UInt8),
            "uint16" => Some(PixelType::UInt16),
            "uint32" => Some(PixelType::UInt32),
            "int32" => Some(PixelType::Int32),
            "float32" => Some(PixelType::Float32),
            "float64" => Some(PixelType::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! impl_pixel {
    ($ty:ty, $tag:ident, $max:expr) => {
        impl Pixel for $ty {
            const DTYPE: PixelType = PixelType::$tag;

            fn data_type() -> DataType {
                DataType::$tag
            }

            fn fill_value() -> FillValue {
                FillValue::from(<$ty>::default())
            }

            fn display_max() -> f64 {
                $max
            }
        }
    };
}

impl_pixel!(u8, UInt8, f64::from(u8::MAX));
impl_pixel!(u16, UInt16, f64::from(u16::MAX));
impl_pixel!(u32, UInt32, f64::from(u32::MAX));
impl_pixel!(i32, Int32, f64::from(i32::MAX));
// Floating point images are assumed normalised
impl_pixel!(f32, Float32, 1.0);
impl_pixel!(f64, Float64, 1.0);

impl LabelPixel for u8 {}
impl LabelPixel for u16 {}
impl LabelPixel for u32 {}
impl LabelPixel for i32 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_names_round_trip() {
        for tag in [
            PixelType::UInt8,
            PixelType::UInt16,
            PixelType::UInt32,
            PixelType::Int32,
            PixelType::Float32,
            PixelType::Float64,
        ] {
            assert_eq!(PixelType::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(PixelType::parse("complex64"), None);
    }

    #[test]
    fn rust_types_map_to_tags() {
        assert_eq!(<u16 as Pixel>::DTYPE, PixelType::UInt16);
        assert_eq!(<f32 as Pixel>::DTYPE.to_string(), "float32");
    }
}
