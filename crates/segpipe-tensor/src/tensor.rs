//! Tensor envelopes and tensor sets.

use ndarray::{ArrayD, IxDyn};

use crate::allocator::{Allocator, Buffer};
use crate::dtype::{self, Element, ElementType};
use crate::error::TensorError;
use crate::Result;

/// Declared name and type of a tensor a stage consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: ElementType,
    /// Exact payload size in bytes, when the stage requires one.
    pub byte_length: Option<usize>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: ElementType) -> Self {
        Self {
            name: name.into(),
            dtype,
            byte_length: None,
        }
    }

    /// Require an exact element count.
    ///
    /// A count too large to address saturates, so no real tensor matches it.
    pub fn with_elements(mut self, count: usize) -> Self {
        self.byte_length = Some(count.saturating_mul(self.dtype.size()));
        self
    }

    /// Check an envelope against this spec.
    pub fn check(&self, tensor: &TensorEnvelope) -> Result<()> {
        if tensor.dtype() != self.dtype {
            return Err(TensorError::TypeMismatch {
                name: self.name.clone(),
                expected: self.dtype,
                actual: tensor.dtype(),
            });
        }
        if let Some(expected) = self.byte_length {
            if tensor.byte_length() != expected {
                return Err(TensorError::SizeMismatch {
                    name: self.name.clone(),
                    expected,
                    actual: tensor.byte_length(),
                });
            }
        }
        Ok(())
    }
}

/// A named, typed, owned payload: the unit moved between stages.
#[derive(Debug, PartialEq, Eq)]
pub struct TensorEnvelope {
    name: String,
    dtype: ElementType,
    buffer: Buffer,
}

impl TensorEnvelope {
    /// Wrap a buffer. Its length must be a whole number of elements.
    pub fn new(name: impl Into<String>, dtype: ElementType, buffer: Buffer) -> Result<Self> {
        let name = name.into();
        if buffer.len() % dtype.size() != 0 {
            return Err(TensorError::Misaligned {
                name,
                byte_length: buffer.len(),
                element_size: dtype.size(),
            });
        }
        Ok(Self {
            name,
            dtype,
            buffer,
        })
    }

    /// Allocate a zeroed tensor of `elements` elements.
    pub fn zeroed(
        name: impl Into<String>,
        dtype: ElementType,
        elements: usize,
        allocator: &dyn Allocator,
    ) -> Result<Self> {
        let size = elements.checked_mul(dtype.size()).ok_or_else(|| {
            TensorError::allocation(
                usize::MAX,
                format!("{} {} elements overflow the address space", elements, dtype),
            )
        })?;
        let buffer = allocator.alloc(size)?;
        Self::new(name, dtype, buffer)
    }

    /// Copy native values into a freshly allocated tensor.
    pub fn from_slice<T: Element>(
        name: impl Into<String>,
        values: &[T],
        allocator: &dyn Allocator,
    ) -> Result<Self> {
        let mut tensor = Self::zeroed(name, T::TYPE, values.len(), allocator)?;
        dtype::encode(values, tensor.bytes_mut());
        Ok(tensor)
    }

    /// Copy an array into a freshly allocated tensor, in logical order.
    pub fn from_array<T: Element>(
        name: impl Into<String>,
        array: &ArrayD<T>,
        allocator: &dyn Allocator,
    ) -> Result<Self> {
        let values: Vec<T> = array.iter().copied().collect();
        Self::from_slice(name, &values, allocator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn byte_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn element_count(&self) -> usize {
        self.buffer.len() / self.dtype.size()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buffer.as_bytes_mut()
    }

    /// Decode the payload as native values of type `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.expect_type(T::TYPE)?;
        Ok(dtype::decode(self.bytes()))
    }

    /// Decode the payload into an array of the given shape.
    pub fn to_array<T: Element>(&self, shape: &[usize]) -> Result<ArrayD<T>> {
        let values = self.to_vec::<T>()?;
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| TensorError::Shape(format!("'{}': {}", self.name, e)))
    }

    /// Overwrite the payload with native values. Lengths must match.
    pub fn write<T: Element>(&mut self, values: &[T]) -> Result<()> {
        self.expect_type(T::TYPE)?;
        if values.len() != self.element_count() {
            return Err(TensorError::SizeMismatch {
                name: self.name.clone(),
                expected: self.byte_length(),
                actual: values.len() * T::TYPE.size(),
            });
        }
        dtype::encode(values, self.buffer.as_bytes_mut());
        Ok(())
    }

    /// Split into name, type and buffer.
    pub fn into_parts(self) -> (String, ElementType, Buffer) {
        (self.name, self.dtype, self.buffer)
    }

    /// Hand the buffer back to `allocator`.
    pub fn free(self, allocator: &dyn Allocator) -> Option<Vec<u8>> {
        allocator.free(self.buffer)
    }

    fn expect_type(&self, dtype: ElementType) -> Result<()> {
        if self.dtype != dtype {
            return Err(TensorError::TypeMismatch {
                name: self.name.clone(),
                expected: dtype,
                actual: self.dtype,
            });
        }
        Ok(())
    }
}

/// The ordered envelopes of one request or one response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TensorSet {
    tensors: Vec<TensorEnvelope>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate names.
    pub fn from_tensors(tensors: Vec<TensorEnvelope>) -> Result<Self> {
        let mut set = Self::with_capacity(tensors.len());
        for tensor in tensors {
            set.insert(tensor)?;
        }
        Ok(set)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tensors: Vec::with_capacity(capacity),
        }
    }

    /// Append a tensor; names are unique within a set.
    pub fn insert(&mut self, tensor: TensorEnvelope) -> Result<()> {
        self.try_insert(tensor)
            .map_err(|rejected| TensorError::DuplicateTensor(rejected.name().to_string()))
    }

    /// Append a tensor, handing it back if the name is taken.
    pub fn try_insert(&mut self, tensor: TensorEnvelope) -> std::result::Result<(), TensorEnvelope> {
        if self.contains(tensor.name()) {
            return Err(tensor);
        }
        self.tensors.push(tensor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TensorEnvelope> {
        self.tensors.iter().find(|t| t.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TensorEnvelope> {
        self.tensors.iter_mut().find(|t| t.name() == name)
    }

    /// Look up a tensor that must be present.
    pub fn require(&self, name: &str) -> Result<&TensorEnvelope> {
        self.get(name)
            .ok_or_else(|| TensorError::MissingTensor(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorEnvelope> {
        let index = self.tensors.iter().position(|t| t.name() == name)?;
        Some(self.tensors.remove(index))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorEnvelope> {
        self.tensors.iter()
    }

    /// Total payload bytes across the set.
    pub fn byte_length(&self) -> usize {
        self.tensors.iter().map(|t| t.byte_length()).sum()
    }

    /// Split into tensors matching `keep` and the rest, preserving order.
    pub fn partition(self, mut keep: impl FnMut(&TensorEnvelope) -> bool) -> (Self, Self) {
        let (kept, rest): (Vec<_>, Vec<_>) = self.tensors.into_iter().partition(|t| keep(t));
        (Self { tensors: kept }, Self { tensors: rest })
    }

    /// Hand every buffer back to `allocator`.
    pub fn free(self, allocator: &dyn Allocator) {
        for tensor in self.tensors {
            tensor.free(allocator);
        }
    }
}

impl IntoIterator for TensorSet {
    type Item = TensorEnvelope;
    type IntoIter = std::vec::IntoIter<TensorEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl<'a> IntoIterator for &'a TensorSet {
    type Item = &'a TensorEnvelope;
    type IntoIter = std::slice::Iter<'a, TensorEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{HeapAllocator, TrackingAllocator};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_slice_roundtrips_values() {
        let alloc = HeapAllocator::new();
        let tensor = TensorEnvelope::from_slice("input", &[1.0f32, 2.0, 3.0, 4.0], &alloc).unwrap();

        assert_eq!(tensor.name(), "input");
        assert_eq!(tensor.dtype(), ElementType::Float32);
        assert_eq!(tensor.byte_length(), 16);
        assert_eq!(tensor.element_count(), 4);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_to_vec_rejects_wrong_type() {
        let alloc = HeapAllocator::new();
        let tensor = TensorEnvelope::from_slice("x", &[1u8, 2], &alloc).unwrap();
        assert!(matches!(
            tensor.to_vec::<f32>(),
            Err(TensorError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_misaligned_buffer_is_rejected() {
        let err = TensorEnvelope::new("x", ElementType::Int32, Buffer::detached(vec![0; 6]))
            .unwrap_err();
        assert!(matches!(err, TensorError::Misaligned { element_size: 4, .. }));
    }

    #[test]
    fn test_array_views() {
        let alloc = HeapAllocator::new();
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1i64, 2, 3, 4, 5, 6]).unwrap();
        let tensor = TensorEnvelope::from_array("grid", &array, &alloc).unwrap();

        assert_eq!(tensor.to_array::<i64>(&[2, 3]).unwrap(), array);
        assert!(matches!(
            tensor.to_array::<i64>(&[4, 4]),
            Err(TensorError::Shape(_))
        ));
    }

    #[test]
    fn test_write_checks_length() {
        let alloc = HeapAllocator::new();
        let mut tensor = TensorEnvelope::zeroed("x", ElementType::Uint32, 2, &alloc).unwrap();
        tensor.write(&[7u32, 9]).unwrap();
        assert_eq!(tensor.to_vec::<u32>().unwrap(), vec![7, 9]);
        assert!(tensor.write(&[1u32]).is_err());
    }

    #[test]
    fn test_oversized_element_count_is_an_allocation_error() {
        let alloc = TrackingAllocator::new();
        let err = TensorEnvelope::zeroed("x", ElementType::Float32, usize::MAX / 4 + 1, &alloc)
            .unwrap_err();
        assert!(err.is_allocation());
        assert_eq!(alloc.report().allocations, 0);

        let spec = TensorSpec::new("x", ElementType::Float64).with_elements(usize::MAX);
        assert_eq!(spec.byte_length, Some(usize::MAX));
    }

    #[test]
    fn test_spec_check() {
        let alloc = HeapAllocator::new();
        let tensor = TensorEnvelope::from_slice("x", &[1.0f64, 2.0], &alloc).unwrap();

        assert!(TensorSpec::new("x", ElementType::Float64).check(&tensor).is_ok());
        assert!(TensorSpec::new("x", ElementType::Float64)
            .with_elements(2)
            .check(&tensor)
            .is_ok());
        assert!(matches!(
            TensorSpec::new("x", ElementType::Float64)
                .with_elements(3)
                .check(&tensor),
            Err(TensorError::SizeMismatch { expected: 24, actual: 16, .. })
        ));
        assert!(matches!(
            TensorSpec::new("x", ElementType::Int8).check(&tensor),
            Err(TensorError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_set_rejects_duplicates_and_keeps_order() {
        let alloc = HeapAllocator::new();
        let mut set = TensorSet::new();
        set.insert(TensorEnvelope::from_slice("b", &[1u8], &alloc).unwrap())
            .unwrap();
        set.insert(TensorEnvelope::from_slice("a", &[2u8], &alloc).unwrap())
            .unwrap();

        let dup = TensorEnvelope::from_slice("a", &[3u8], &alloc).unwrap();
        assert!(matches!(set.insert(dup), Err(TensorError::DuplicateTensor(_))));

        assert_eq!(set.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(set.require("c").is_err());
    }

    #[test]
    fn test_partition_and_free_balance_allocator() {
        let alloc = TrackingAllocator::new();
        let set = TensorSet::from_tensors(vec![
            TensorEnvelope::from_slice("keep", &[1i32], &alloc).unwrap(),
            TensorEnvelope::from_slice("drop", &[2i32], &alloc).unwrap(),
        ])
        .unwrap();

        let (kept, dropped) = set.partition(|t| t.name() == "keep");
        assert_eq!(kept.names().collect::<Vec<_>>(), vec!["keep"]);
        assert_eq!(dropped.names().collect::<Vec<_>>(), vec!["drop"]);

        dropped.free(&alloc);
        assert_eq!(alloc.report().live_buffers, 1);
        kept.free(&alloc);
        assert!(alloc.is_balanced());
    }
}
