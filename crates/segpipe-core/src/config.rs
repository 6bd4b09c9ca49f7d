//! Configuration for the pipeline runner.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Runner configuration.
///
/// Unset capacities default to the number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the queue feeding the first segment.
    pub input_queue_capacity: Option<usize>,

    /// Capacity of the queue holding finished results.
    pub output_queue_capacity: Option<usize>,

    /// Capacity of every queue between two segments.
    pub intermediate_queue_capacity: Option<usize>,

    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_queue_capacity: None,
            output_queue_capacity: None,
            intermediate_queue_capacity: None,
            thread_name_prefix: "segment".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject zero capacities.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("input_queue_capacity", self.input_queue_capacity),
            ("output_queue_capacity", self.output_queue_capacity),
            ("intermediate_queue_capacity", self.intermediate_queue_capacity),
        ];
        for (key, value) in capacities {
            if value == Some(0) {
                return Err(PipelineError::Config(format!("{} must be non-zero", key)));
            }
        }
        Ok(())
    }

    /// Effective input capacity for a pipeline of `segments` stages.
    pub fn input_capacity(&self, segments: usize) -> usize {
        self.input_queue_capacity.unwrap_or(segments)
    }

    /// Effective output capacity for a pipeline of `segments` stages.
    pub fn output_capacity(&self, segments: usize) -> usize {
        self.output_queue_capacity.unwrap_or(segments)
    }

    /// Effective intermediate capacity for a pipeline of `segments` stages.
    pub fn intermediate_capacity(&self, segments: usize) -> usize {
        self.intermediate_queue_capacity.unwrap_or(segments)
    }
}
