//! Stage executor implementations.

#[cfg(feature = "onnx")]
pub mod ort;

use ndarray::ArrayD;

use crate::allocator::Allocator;
use crate::dtype::Element;
use crate::{ElementType, Result, TensorEnvelope, TensorSet, TensorSpec};

/// Trait for the opaque model execution behind one pipeline stage.
///
/// This is where on-device inference happens; the pipeline only moves
/// tensors in and out of it. Several stages may share one executor.
pub trait StageExecutor: Send + Sync {
    /// Tensors this stage reads.
    fn input_specs(&self) -> &[TensorSpec];

    /// Tensors this stage writes.
    fn output_specs(&self) -> &[TensorSpec];

    /// Run the stage on `inputs`, writing every output through `outputs`.
    ///
    /// `inputs` may carry extra tensors destined for later stages.
    fn invoke(&self, inputs: &TensorSet, outputs: &mut OutputSink<'_>) -> Result<()>;
}

/// Collects the outputs of one executor invocation.
///
/// Buffers come from the allocator the pipeline assigns to the stage. If the
/// invocation fails the owner calls [`OutputSink::discard`] so partially
/// written outputs are freed.
pub struct OutputSink<'a> {
    allocator: &'a dyn Allocator,
    produced: TensorSet,
}

impl<'a> OutputSink<'a> {
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self {
            allocator,
            produced: TensorSet::new(),
        }
    }

    /// Allocate a zeroed output and return it for filling.
    pub fn allocate(
        &mut self,
        name: &str,
        dtype: ElementType,
        elements: usize,
    ) -> Result<&mut TensorEnvelope> {
        let tensor = TensorEnvelope::zeroed(name, dtype, elements, self.allocator)?;
        self.insert(tensor)?;
        self.produced
            .get_mut(name)
            .ok_or_else(|| crate::TensorError::MissingTensor(name.to_string()))
    }

    /// Copy native values into a new output.
    pub fn write_slice<T: Element>(&mut self, name: &str, values: &[T]) -> Result<()> {
        let tensor = TensorEnvelope::from_slice(name, values, self.allocator)?;
        self.insert(tensor)
    }

    /// Copy an array into a new output.
    pub fn write_array<T: Element>(&mut self, name: &str, array: &ArrayD<T>) -> Result<()> {
        let tensor = TensorEnvelope::from_array(name, array, self.allocator)?;
        self.insert(tensor)
    }

    /// Outputs written so far.
    pub fn produced(&self) -> &TensorSet {
        &self.produced
    }

    /// Take the outputs.
    pub fn finish(self) -> TensorSet {
        self.produced
    }

    /// Free every output written so far.
    pub fn discard(self) {
        self.produced.free(self.allocator);
    }

    fn insert(&mut self, tensor: TensorEnvelope) -> Result<()> {
        let allocator = self.allocator;
        self.produced.try_insert(tensor).map_err(|rejected| {
            let name = rejected.name().to_string();
            rejected.free(allocator);
            crate::TensorError::DuplicateTensor(name)
        })
    }
}

type InvokeFn = dyn Fn(&TensorSet, &mut OutputSink<'_>) -> Result<()> + Send + Sync;

/// Executor backed by a closure.
///
/// Handy for host-side stages (pre/post-processing) and for tests.
pub struct FnExecutor {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    invoke: Box<InvokeFn>,
}

impl FnExecutor {
    pub fn new<F>(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>, invoke: F) -> Self
    where
        F: Fn(&TensorSet, &mut OutputSink<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            inputs,
            outputs,
            invoke: Box::new(invoke),
        }
    }

    /// Element-wise map from one tensor to another of the same type.
    pub fn map<T, F>(input: &str, output: &str, f: F) -> Self
    where
        T: Element,
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let input_name = input.to_string();
        let output_name = output.to_string();
        Self::new(
            vec![TensorSpec::new(input, T::TYPE)],
            vec![TensorSpec::new(output, T::TYPE)],
            move |inputs, outputs| {
                let values: Vec<T> = inputs.require(&input_name)?.to_vec()?;
                let mapped: Vec<T> = values.into_iter().map(&f).collect();
                outputs.write_slice(&output_name, &mapped)
            },
        )
    }
}

impl StageExecutor for FnExecutor {
    fn input_specs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn output_specs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn invoke(&self, inputs: &TensorSet, outputs: &mut OutputSink<'_>) -> Result<()> {
        (self.invoke)(inputs, outputs)
    }
}
