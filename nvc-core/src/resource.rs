//! Tensor memory limits
//!
//! Limits are checked when reference features are loaded (to decide how
//! finely to split them) and when profiling live tensor memory.

use crate::tensor::{MemoryInfo, Tensor};
use serde::{Deserialize, Serialize};

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = MB * 1024.0;

/// Memory limits configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    /// Largest single tensor handed to the model, in bytes
    pub max_tensor_bytes: usize,
    /// Budget for all live tensors, in bytes
    pub max_buffer_bytes: usize,
    /// Warning threshold (fraction of a limit)
    pub warning_threshold: f32,
}

impl MemoryLimits {
    /// Desktop limits: 1 GiB per tensor, 4 GiB live
    pub fn desktop() -> Self {
        Self {
            max_tensor_bytes: 1024 * 1024 * 1024,
            max_buffer_bytes: 4 * 1024 * 1024 * 1024,
            warning_threshold: 0.85,
        }
    }

    /// Limits for memory constrained hosts
    pub fn constrained() -> Self {
        Self {
            max_tensor_bytes: 64 * 1024 * 1024,
            max_buffer_bytes: 512 * 1024 * 1024,
            warning_threshold: 0.8,
        }
    }

    /// No effective limits (for testing)
    pub fn unlimited() -> Self {
        Self {
            max_tensor_bytes: usize::MAX,
            max_buffer_bytes: usize::MAX,
            warning_threshold: 0.95,
        }
    }

    /// Describe a tensor's size against the per-tensor limit
    pub fn check_tensor_size(&self, name: &str, tensor: &Tensor) -> TensorSizeReport {
        let size_bytes = tensor.size_bytes();
        TensorSizeReport {
            name: name.to_string(),
            shape: tensor.shape().to_vec(),
            elements: tensor.len(),
            size_bytes,
            size_mb: size_bytes as f64 / MB,
            size_gb: size_bytes as f64 / GB,
            exceeds_limit: size_bytes > self.max_tensor_bytes,
        }
    }

    /// Warning for a tensor that exceeds the per-tensor limit
    pub fn tensor_warning(&self, report: &TensorSizeReport) -> Option<MemoryWarning> {
        report.exceeds_limit.then(|| MemoryWarning::TensorTooLarge {
            name: report.name.clone(),
            size_bytes: report.size_bytes,
            limit_bytes: self.max_tensor_bytes,
        })
    }

    /// Warn when live tensor memory approaches the budget
    pub fn check_usage(&self, usage: &MemoryInfo) -> Option<MemoryWarning> {
        if self.max_buffer_bytes == 0 || self.max_buffer_bytes == usize::MAX {
            return None;
        }
        let percentage = usage.num_bytes as f32 / self.max_buffer_bytes as f32;
        if percentage >= self.warning_threshold {
            Some(MemoryWarning::LiveTensorsApproachingLimit {
                current_bytes: usage.num_bytes,
                limit_bytes: self.max_buffer_bytes,
                percentage,
            })
        } else {
            None
        }
    }
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self::desktop()
    }
}

/// Size report for one tensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorSizeReport {
    /// Tensor label
    pub name: String,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Element count
    pub elements: usize,
    /// Size in bytes
    pub size_bytes: usize,
    /// Size in MiB
    pub size_mb: f64,
    /// Size in GiB
    pub size_gb: f64,
    /// Whether the tensor is larger than the per-tensor limit
    pub exceeds_limit: bool,
}

/// Memory warning types
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryWarning {
    /// Live tensor bytes approaching the budget
    LiveTensorsApproachingLimit {
        /// Bytes currently held
        current_bytes: usize,
        /// Budget in bytes
        limit_bytes: usize,
        /// Fraction of the budget in use
        percentage: f32,
    },
    /// A single tensor exceeds the per-tensor limit
    TensorTooLarge {
        /// Tensor label
        name: String,
        /// Tensor size in bytes
        size_bytes: usize,
        /// Per-tensor limit in bytes
        limit_bytes: usize,
    },
}

impl MemoryWarning {
    /// Get severity level of the warning
    pub fn severity(&self) -> WarningSeverity {
        match self {
            MemoryWarning::LiveTensorsApproachingLimit { percentage, .. } => {
                if *percentage >= 0.95 {
                    WarningSeverity::Critical
                } else if *percentage >= 0.9 {
                    WarningSeverity::High
                } else if *percentage >= 0.8 {
                    WarningSeverity::Medium
                } else {
                    WarningSeverity::Low
                }
            }
            MemoryWarning::TensorTooLarge { .. } => WarningSeverity::High,
        }
    }
}

/// Warning severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarningSeverity {
    /// Low severity warning
    Low,
    /// Medium severity warning
    Medium,
    /// High severity warning
    High,
    /// Critical severity warning
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorRegistry;

    #[test]
    fn test_presets() {
        let desktop = MemoryLimits::default();
        assert_eq!(desktop.max_tensor_bytes, 1 << 30);
        assert!(MemoryLimits::constrained().max_tensor_bytes < desktop.max_tensor_bytes);
        assert_eq!(MemoryLimits::unlimited().max_tensor_bytes, usize::MAX);
    }

    #[test]
    fn test_check_tensor_size() {
        let registry = TensorRegistry::new();
        let tensor = registry.zeros(vec![1, 256, 32, 32]);
        let limits = MemoryLimits {
            max_tensor_bytes: 512 * 1024,
            ..MemoryLimits::desktop()
        };

        let report = limits.check_tensor_size("feature_1", &tensor);
        assert_eq!(report.elements, 262_144);
        assert_eq!(report.size_bytes, 1_048_576);
        assert!((report.size_mb - 1.0).abs() < f64::EPSILON);
        assert!(report.exceeds_limit);
        assert_eq!(
            limits.tensor_warning(&report).map(|w| w.severity()),
            Some(WarningSeverity::High)
        );
        assert!(!MemoryLimits::desktop()
            .check_tensor_size("feature_1", &tensor)
            .exceeds_limit);
    }

    #[test]
    fn test_usage_warning_severity() {
        let limits = MemoryLimits {
            max_tensor_bytes: 1024,
            max_buffer_bytes: 1000,
            warning_threshold: 0.8,
        };
        assert!(limits
            .check_usage(&MemoryInfo {
                num_tensors: 1,
                num_bytes: 100
            })
            .is_none());

        let warning = limits
            .check_usage(&MemoryInfo {
                num_tensors: 10,
                num_bytes: 960,
            })
            .unwrap();
        assert_eq!(warning.severity(), WarningSeverity::Critical);
    }
}
