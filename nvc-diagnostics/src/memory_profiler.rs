//! Tensor memory profiling

use nvc_core::{MemoryInfo, MemoryLimits, MemoryWarning, Tensor, TensorRegistry, TensorSizeReport, WarningSeverity};

/// Logs live tensor memory against configured limits
#[derive(Debug, Clone)]
pub struct MemoryProfiler {
    registry: TensorRegistry,
    limits: MemoryLimits,
}

impl MemoryProfiler {
    /// Profiler for `registry`
    pub fn new(registry: TensorRegistry, limits: MemoryLimits) -> Self {
        Self { registry, limits }
    }

    /// Current live tensor usage
    pub fn usage(&self) -> MemoryInfo {
        self.registry.memory()
    }

    /// Log current usage under `label` and return any warning
    pub fn log_memory_usage(&self, label: &str) -> Option<MemoryWarning> {
        let usage = self.registry.memory();
        tracing::debug!(
            label = label,
            num_tensors = usage.num_tensors,
            num_bytes = usage.num_bytes,
            "Tensor memory"
        );

        let warning = self.limits.check_usage(&usage);
        if let Some(warning) = &warning {
            log_warning(label, warning);
        }
        warning
    }

    /// Describe `tensor` against the per-tensor limit
    pub fn check_tensor(&self, name: &str, tensor: &Tensor) -> TensorSizeReport {
        let report = self.limits.check_tensor_size(name, tensor);
        tracing::debug!(
            name = name,
            shape = ?report.shape,
            size_mb = report.size_mb,
            exceeds_limit = report.exceeds_limit,
            "Tensor size"
        );
        if let Some(warning) = self.limits.tensor_warning(&report) {
            log_warning(name, &warning);
        }
        report
    }

    /// Start a scope whose tensors must all be released by its end
    pub fn scope(&self, label: &str) -> MemoryScope {
        MemoryScope {
            label: label.to_string(),
            registry: self.registry.clone(),
            baseline: self.registry.memory(),
        }
    }
}

fn log_warning(label: &str, warning: &MemoryWarning) {
    match warning.severity() {
        WarningSeverity::Critical | WarningSeverity::High => {
            tracing::warn!(label = label, "{:?}", warning)
        }
        _ => tracing::info!(label = label, "{:?}", warning),
    }
}

/// Live tensor baseline taken at the start of a scope
#[derive(Debug)]
pub struct MemoryScope {
    label: String,
    registry: TensorRegistry,
    baseline: MemoryInfo,
}

impl MemoryScope {
    /// Tensor count when the scope started
    pub fn baseline(&self) -> MemoryInfo {
        self.baseline
    }

    /// Tensors alive now that were not at the start
    pub fn leaked(&self) -> isize {
        self.registry.memory().num_tensors as isize - self.baseline.num_tensors as isize
    }

    /// End the scope, logging and returning the difference in live tensors
    pub fn finish(self) -> isize {
        let leaked = self.leaked();
        if leaked > 0 {
            tracing::warn!(label = %self.label, leaked = leaked, "Tensors outlived scope");
        } else {
            tracing::trace!(label = %self.label, "Scope released its tensors");
        }
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_baseline() {
        let registry = TensorRegistry::new();
        let profiler = MemoryProfiler::new(registry.clone(), MemoryLimits::unlimited());
        let kept = registry.zeros(vec![4]);

        let scope = profiler.scope("decode");
        {
            let _a = registry.zeros(vec![2, 2]);
            let _b = registry.zeros(vec![8]);
            assert_eq!(scope.leaked(), 2);
        }
        assert_eq!(scope.baseline().num_tensors, 1);
        assert_eq!(scope.finish(), 0);
        drop(kept);
    }

    #[test]
    fn test_usage_warning() {
        let registry = TensorRegistry::new();
        let limits = MemoryLimits {
            max_tensor_bytes: 16,
            max_buffer_bytes: 64,
            warning_threshold: 0.5,
        };
        let profiler = MemoryProfiler::new(registry.clone(), limits);

        let small = registry.zeros(vec![2]);
        assert!(profiler.log_memory_usage("idle").is_none());

        let large = registry.zeros(vec![10]);
        assert!(profiler.check_tensor("large", &large).exceeds_limit);
        assert!(!profiler.check_tensor("small", &small).exceeds_limit);
        assert!(matches!(
            profiler.log_memory_usage("loaded"),
            Some(MemoryWarning::LiveTensorsApproachingLimit { .. })
        ));
        assert_eq!(profiler.usage().num_tensors, 2);
    }
}
