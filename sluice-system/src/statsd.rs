use sluice_statsd::CounterMetric;

/// Counter metrics for sluice system components.
pub enum SystemCounters {
    /// Number of runtime tasks created/spawned.
    ///
    /// Every call to [`spawn`](`crate::spawn()`) increases this counter by one.
    ///
    /// This metric is tagged with:
    /// - `id`: A unique identifier for the task, derived from its location in code.
    /// - `file`: The source filename where the task is created.
    /// - `line`: The source line where the task is created within the file.
    RuntimeTaskCreated,
    /// Number of runtime tasks terminated.
    ///
    /// This metric is tagged with:
    /// - `id`: A unique identifier for the task, derived from its location in code.
    /// - `file`: The source filename where the task is created.
    /// - `line`: The source line where the task is created within the file.
    RuntimeTaskTerminated,
}

impl CounterMetric for SystemCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::RuntimeTaskCreated => "runtime.task.spawn.created",
            Self::RuntimeTaskTerminated => "runtime.task.spawn.terminated",
        }
    }
}
