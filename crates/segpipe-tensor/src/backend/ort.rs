//! ONNX Runtime (ort) stage executor with XNNPACK.

use std::path::Path;
use std::sync::Mutex;

use ort::ep::XNNPACK;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tracing::debug;

use crate::error::TensorError;
use crate::{ElementType, OutputSink, Result, StageExecutor, TensorEnvelope, TensorSet, TensorSpec};

/// A model input together with the shape the session is fed.
#[derive(Debug, Clone)]
pub struct OrtInput {
    pub spec: TensorSpec,
    pub shape: Vec<i64>,
}

/// Runs one ONNX model segment as a pipeline stage.
pub struct OrtExecutor {
    session: Mutex<Session>,
    inputs: Vec<OrtInput>,
    input_specs: Vec<TensorSpec>,
    output_specs: Vec<TensorSpec>,
}

impl OrtExecutor {
    /// Load a model segment from a file path.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        inputs: Vec<OrtInput>,
        outputs: Vec<TensorSpec>,
    ) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading ONNX segment from: {}", path.display());

        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, inputs, outputs)
    }

    /// Load a model segment from bytes.
    pub fn from_bytes(bytes: &[u8], inputs: Vec<OrtInput>, outputs: Vec<TensorSpec>) -> Result<Self> {
        debug!("Loading ONNX segment from {} bytes", bytes.len());

        let session = Session::builder()
            .map_err(|e| TensorError::ModelLoad(e.to_string()))?
            .with_execution_providers([XNNPACK::default().build()])
            .map_err(|e| TensorError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| TensorError::ModelLoad(e.to_string()))?
            .commit_from_memory(bytes)
            .map_err(|e| TensorError::ModelLoad(e.to_string()))?;

        let session_inputs: Vec<String> = session
            .inputs()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        let session_outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        for input in &inputs {
            if !session_inputs.contains(&input.spec.name) {
                return Err(TensorError::ModelLoad(format!(
                    "model has no input '{}' (inputs: {:?})",
                    input.spec.name, session_inputs
                )));
            }
        }
        for output in &outputs {
            if !session_outputs.contains(&output.name) {
                return Err(TensorError::ModelLoad(format!(
                    "model has no output '{}' (outputs: {:?})",
                    output.name, session_outputs
                )));
            }
        }

        let input_specs = inputs.iter().map(|i| i.spec.clone()).collect();

        Ok(Self {
            session: Mutex::new(session),
            inputs,
            input_specs,
            output_specs: outputs,
        })
    }

    fn convert_input(
        &self,
        shape: &[i64],
        tensor: &TensorEnvelope,
    ) -> Result<ort::session::SessionInputValue<'static>> {
        let shape = shape.to_vec();

        macro_rules! convert {
            ($ty:ty) => {{
                let data: Vec<$ty> = tensor.to_vec()?;
                Tensor::from_array((shape, data))
                    .map(Into::into)
                    .map_err(|e| TensorError::execution(e.to_string()))
            }};
        }

        match tensor.dtype() {
            ElementType::Float32 => convert!(f32),
            ElementType::Float64 => convert!(f64),
            ElementType::Int8 => convert!(i8),
            ElementType::Int16 => convert!(i16),
            ElementType::Int32 => convert!(i32),
            ElementType::Int64 => convert!(i64),
            ElementType::Uint8 => convert!(u8),
            ElementType::Uint32 => convert!(u32),
            ElementType::Uint64 => convert!(u64),
        }
    }
}

impl StageExecutor for OrtExecutor {
    fn input_specs(&self) -> &[TensorSpec] {
        &self.input_specs
    }

    fn output_specs(&self) -> &[TensorSpec] {
        &self.output_specs
    }

    fn invoke(&self, inputs: &TensorSet, outputs: &mut OutputSink<'_>) -> Result<()> {
        let ort_inputs: Vec<(&str, ort::session::SessionInputValue<'static>)> = self
            .inputs
            .iter()
            .map(|input| {
                let tensor = inputs.require(&input.spec.name)?;
                let value = self.convert_input(&input.shape, tensor)?;
                Ok((input.spec.name.as_str(), value))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| TensorError::execution(format!("Failed to lock session: {}", e)))?;

        let results = session
            .run(ort_inputs)
            .map_err(|e| TensorError::execution(e.to_string()))?;

        for (name, value) in results.iter() {
            let Some(spec) = self.output_specs.iter().find(|s| s.name == name) else {
                continue;
            };

            macro_rules! extract {
                ($ty:ty) => {{
                    let (_, data) = value
                        .try_extract_tensor::<$ty>()
                        .map_err(|e| TensorError::execution(format!("'{}': {}", name, e)))?;
                    outputs.write_slice::<$ty>(&spec.name, data)?
                }};
            }

            match spec.dtype {
                ElementType::Float32 => extract!(f32),
                ElementType::Float64 => extract!(f64),
                ElementType::Int8 => extract!(i8),
                ElementType::Int16 => extract!(i16),
                ElementType::Int32 => extract!(i32),
                ElementType::Int64 => extract!(i64),
                ElementType::Uint8 => extract!(u8),
                ElementType::Uint32 => extract!(u32),
                ElementType::Uint64 => extract!(u64),
            }
        }

        Ok(())
    }
}
