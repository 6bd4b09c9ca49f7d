//! Segment chain validation and tensor retention.
//!
//! Tensors flow forward through the chain: segment `i` may read any tensor
//! pushed by the caller or produced by an earlier segment. After a segment
//! runs, only the tensors some later segment still reads are carried on; the
//! last segment's outputs are the result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use segpipe_tensor::{ElementType, StageExecutor, TensorSet, TensorSpec};

use crate::error::{PipelineError, Result};

/// What one worker needs to know about its place in the chain.
#[derive(Debug, Clone)]
pub(crate) struct StagePlan {
    pub(crate) index: usize,
    /// Tensors carried past this segment.
    pub(crate) retain: HashSet<String>,
    pub(crate) is_last: bool,
}

/// Validate the chain and compute what each segment carries forward.
pub(crate) fn plan_segments(executors: &[Arc<dyn StageExecutor>]) -> Result<Vec<StagePlan>> {
    let Some(first) = executors.first() else {
        return Err(PipelineError::Config("at least one segment expected".into()));
    };

    let mut available: HashMap<&str, ElementType> = HashMap::new();
    for spec in first.input_specs() {
        if available.insert(spec.name.as_str(), spec.dtype).is_some() {
            return Err(PipelineError::Config(format!(
                "segment 0 declares input '{}' twice",
                spec.name
            )));
        }
    }

    for (index, executor) in executors.iter().enumerate() {
        let missing: Vec<&str> = executor
            .input_specs()
            .iter()
            .filter(|spec| !available.contains_key(spec.name.as_str()))
            .map(|spec| spec.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "segment {} can not get its input tensors (missing: {})",
                index,
                missing.join(", ")
            )));
        }

        for spec in executor.input_specs() {
            let upstream = available[spec.name.as_str()];
            if upstream != spec.dtype {
                return Err(PipelineError::Config(format!(
                    "segment {} reads '{}' as {} but it is {} upstream",
                    index, spec.name, spec.dtype, upstream
                )));
            }
        }

        for spec in executor.output_specs() {
            if available.insert(spec.name.as_str(), spec.dtype).is_some() {
                return Err(PipelineError::Config(format!(
                    "tensor '{}' is produced more than once (segment {})",
                    spec.name, index
                )));
            }
        }
    }

    let last = executors.len() - 1;
    if executors[last].output_specs().is_empty() {
        return Err(PipelineError::Config(format!(
            "last segment {} declares no outputs",
            last
        )));
    }

    let mut plans = Vec::with_capacity(executors.len());
    let mut needed_later: HashSet<String> = HashSet::new();
    for (index, executor) in executors.iter().enumerate().rev() {
        plans.push(StagePlan {
            index,
            retain: needed_later.clone(),
            is_last: index == last,
        });
        needed_later.extend(executor.input_specs().iter().map(|s| s.name.clone()));
    }
    plans.reverse();

    Ok(plans)
}

/// Check a pushed set against the first segment's inputs.
pub(crate) fn validate_inputs(set: &TensorSet, specs: &[TensorSpec]) -> Result<()> {
    if set.len() != specs.len() {
        return Err(PipelineError::InvalidInput(format!(
            "expected {} input tensors, got {}",
            specs.len(),
            set.len()
        )));
    }
    for spec in specs {
        let tensor = set.get(&spec.name).ok_or_else(|| {
            PipelineError::InvalidInput(format!("missing input tensor '{}'", spec.name))
        })?;
        spec.check(tensor)
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    }
    Ok(())
}

/// Check an executor's outputs against its declaration.
pub(crate) fn validate_outputs(set: &TensorSet, specs: &[TensorSpec]) -> std::result::Result<(), String> {
    for spec in specs {
        let tensor = set
            .get(&spec.name)
            .ok_or_else(|| format!("missing output tensor '{}'", spec.name))?;
        spec.check(tensor).map_err(|e| e.to_string())?;
    }
    if set.len() != specs.len() {
        let unexpected: Vec<&str> = set
            .names()
            .filter(|name| !specs.iter().any(|s| s.name == *name))
            .collect();
        return Err(format!("unexpected output tensors: {}", unexpected.join(", ")));
    }
    Ok(())
}
