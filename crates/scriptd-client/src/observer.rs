use crate::log::ClientTaskLog;
use crate::metrics::{ClientOperationMetrics, RpcCallMetrics};

/// Receives sealed metrics. Called from every concurrently running operation.
pub trait ClientObserver: Send + Sync {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics, log: &dyn ClientTaskLog);

    fn client_operation_completed(&self, _metrics: &ClientOperationMetrics, _log: &dyn ClientTaskLog) {
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClientObserver;

impl ClientObserver for NoopClientObserver {
    fn rpc_call_completed(&self, _metrics: &RpcCallMetrics, _log: &dyn ClientTaskLog) {}
}

/// Emits one debug event per sealed call and per finished operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingClientObserver;

impl ClientObserver for TracingClientObserver {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics, _log: &dyn ClientTaskLog) {
        tracing::debug!(
            rpc = %metrics.rpc_call(),
            attempts = metrics.attempts().len(),
            with_retries = metrics.with_retries(),
            succeeded = metrics.succeeded(),
            cancelled = metrics.was_cancelled(),
            duration_ms = metrics.duration().as_millis() as u64,
            err = ?metrics.error(),
            "rpc call completed"
        );
    }

    fn client_operation_completed(&self, metrics: &ClientOperationMetrics, _log: &dyn ClientTaskLog) {
        tracing::debug!(
            rpc_calls = metrics.rpc_calls().len(),
            succeeded = metrics.succeeded(),
            cancelled = metrics.was_cancelled(),
            duration_ms = metrics.duration().as_millis() as u64,
            "client operation completed"
        );
    }
}
