/// Sink for messages that belong to the task a script runs for.
///
/// Shared by every operation a client runs concurrently, so implementations must
/// tolerate interleaved writes.
pub trait ClientTaskLog: Send + Sync {
    fn info(&self, message: &str);
    fn verbose(&self, message: &str);
    fn warn(&self, message: &str);
}

/// Forwards task messages to `tracing`, tagged with the task id when one is known.
#[derive(Debug, Clone, Default)]
pub struct TracingTaskLog {
    task_id: Option<String>,
}

impl TracingTaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
        }
    }

    fn task_id(&self) -> &str {
        self.task_id.as_deref().unwrap_or("-")
    }
}

impl ClientTaskLog for TracingTaskLog {
    fn info(&self, message: &str) {
        tracing::info!(task_id = %self.task_id(), "{message}");
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(task_id = %self.task_id(), "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(task_id = %self.task_id(), "{message}");
    }
}
