//! Element type tags and their fixed mapping to native Rust types.

use std::fmt;
use std::str::FromStr;

use bytemuck::Pod;

use crate::error::TensorError;

/// Supported tensor element types.
///
/// The discriminant is the wire tag used at the caller boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Float32 = 1,
    Float64 = 2,
    Int8 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Uint8 = 7,
    Uint32 = 8,
    Uint64 = 9,
}

impl ElementType {
    /// Every supported element type, in tag order.
    pub const ALL: [ElementType; 9] = [
        ElementType::Float32,
        ElementType::Float64,
        ElementType::Int8,
        ElementType::Int16,
        ElementType::Int32,
        ElementType::Int64,
        ElementType::Uint8,
        ElementType::Uint32,
        ElementType::Uint64,
    ];

    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::Uint8 => 1,
            ElementType::Int16 => 2,
            ElementType::Float32 | ElementType::Int32 | ElementType::Uint32 => 4,
            ElementType::Float64 | ElementType::Int64 | ElementType::Uint64 => 8,
        }
    }

    /// Canonical lowercase name, e.g. `"float32"`.
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Uint8 => "uint8",
            ElementType::Uint32 => "uint32",
            ElementType::Uint64 => "uint64",
        }
    }

    /// Wire tag.
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for ElementType {
    type Error = TensorError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        ElementType::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| TensorError::UnsupportedType(format!("tag {}", tag)))
    }
}

impl FromStr for ElementType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ElementType::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .ok_or_else(|| TensorError::UnsupportedType(s.to_string()))
    }
}

/// A native type with a fixed [`ElementType`] tag.
///
/// Payloads hold elements in native byte order. Every mapped type is
/// [`bytemuck::Pod`], so payloads and typed slices convert without per-element
/// code.
pub trait Element: Pod + Send + Sync {
    /// Tag of this native type.
    const TYPE: ElementType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$tag;
            }
        )*
    };
}

impl_element! {
    f32 => Float32,
    f64 => Float64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u32 => Uint32,
    u64 => Uint64,
}

/// Copy native values into a payload of exactly their byte length.
pub(crate) fn encode<T: Element>(values: &[T], out: &mut [u8]) {
    out.copy_from_slice(bytemuck::cast_slice::<T, u8>(values));
}

/// Copy a payload out as native values.
///
/// The payload may be unaligned for `T`; values are copied, not cast in place.
pub(crate) fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec::<u8, T>(bytes)
}
