use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};
use crate::log::ClientTaskLog;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall, RpcCallMetricsBuilder, TimedOperation};
use crate::observer::ClientObserver;
use crate::retry::{AttemptResult, RetryEngine, RetryEvent, RetryHooks, TimeoutEvent};

/// Runs remote calls through the retry engine and records one metrics entry per call.
#[derive(Clone)]
pub struct RpcCallExecutor {
    engine: RetryEngine,
    observer: Arc<dyn ClientObserver>,
}

impl RpcCallExecutor {
    pub fn new(engine: RetryEngine, observer: Arc<dyn ClientObserver>) -> Self {
        Self { engine, observer }
    }

    pub fn retry_timeout(&self) -> Duration {
        self.engine.retry_timeout()
    }

    /// A copy whose retried calls keep going past the budget until `minimum_attempts` is reached.
    pub fn with_minimum_attempts(&self, minimum_attempts: u32) -> Self {
        Self {
            engine: self.engine.with_minimum_attempts(minimum_attempts),
            observer: Arc::clone(&self.observer),
        }
    }

    /// Dispatches to [`Self::execute_with_retries`] or [`Self::execute_with_no_retries`].
    #[allow(clippy::too_many_arguments)]
    pub async fn execute<T, F, Fut, O>(
        &self,
        retries_enabled: bool,
        rpc_call: RpcCall,
        action: F,
        on_error: O,
        log: &dyn ClientTaskLog,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
        O: FnMut(&ClientError),
    {
        if retries_enabled {
            self.execute_with_retries(rpc_call, action, on_error, log, metrics, cancel)
                .await
        } else {
            self.run(rpc_call, false, action, on_error, log, metrics, cancel)
                .await
        }
    }

    /// `on_error` sees the error of every failed attempt, including ones that are retried.
    pub async fn execute_with_retries<T, F, Fut, O>(
        &self,
        rpc_call: RpcCall,
        action: F,
        on_error: O,
        log: &dyn ClientTaskLog,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
        O: FnMut(&ClientError),
    {
        self.run(rpc_call, true, action, on_error, log, metrics, cancel)
            .await
    }

    pub async fn execute_with_no_retries<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        action: F,
        log: &dyn ClientTaskLog,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        self.run(rpc_call, false, action, |_| {}, log, metrics, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run<T, F, Fut, O>(
        &self,
        rpc_call: RpcCall,
        with_retries: bool,
        action: F,
        mut on_error: O,
        log: &dyn ClientTaskLog,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
        O: FnMut(&ClientError),
    {
        let mut call_metrics = if with_retries {
            RpcCallMetricsBuilder::start_with_retries(rpc_call.clone(), self.engine.retry_timeout())
        } else {
            RpcCallMetricsBuilder::start_without_retries(rpc_call.clone())
        };

        let result = {
            let mut hooks = MetricsHooks {
                rpc_call: &rpc_call,
                attempts: &mut call_metrics,
                on_error: &mut on_error,
                log,
            };
            if with_retries {
                self.engine
                    .execute_with_retries(action, &mut hooks, cancel)
                    .await
            } else {
                self.engine.execute_once(action, &mut hooks, cancel).await
            }
        };

        let sealed = match &result {
            Ok(_) => call_metrics.success(),
            Err(err) => call_metrics.failure(err.clone(), cancel),
        };
        metrics.with_rpc_call(sealed.clone());
        self.observer.rpc_call_completed(&sealed, log);
        result
    }
}

struct MetricsHooks<'a, O> {
    rpc_call: &'a RpcCall,
    attempts: &'a mut RpcCallMetricsBuilder,
    on_error: &'a mut O,
    log: &'a dyn ClientTaskLog,
}

impl<O: FnMut(&ClientError)> RetryHooks<ClientError> for MetricsHooks<'_, O> {
    fn on_attempt(&mut self, start: Instant, end: Instant, result: AttemptResult<'_, ClientError>) {
        let attempt = match result {
            AttemptResult::Succeeded => TimedOperation::success(start, end),
            AttemptResult::Failed(err) => {
                (self.on_error)(err);
                TimedOperation::failure(start, end, err.clone())
            }
            AttemptResult::Cancelled(err) => TimedOperation::cancelled(start, end, err.cloned()),
        };
        self.attempts.with_attempt(attempt);
    }

    fn on_retry(&mut self, event: &RetryEvent<'_, ClientError>) {
        let remaining = event.retry_timeout.saturating_sub(event.elapsed);
        tracing::warn!(
            rpc = %self.rpc_call,
            retry_count = event.retry_count,
            err = %event.error,
            "retrying rpc call"
        );
        self.log.info(&format!(
            "An error occurred communicating with the remote while calling {}. This action will be retried after {} seconds. Retry attempt {}. Retries will be performed for up to {} seconds.",
            self.rpc_call,
            event.sleep.as_secs(),
            event.retry_count,
            remaining.as_secs()
        ));
        self.log.verbose(&event.error.to_string());
    }

    fn on_timeout(&mut self, event: &TimeoutEvent) {
        tracing::warn!(
            rpc = %self.rpc_call,
            retry_count = event.retry_count,
            elapsed_ms = event.elapsed.as_millis() as u64,
            "giving up on rpc call"
        );
        self.log.info(&format!(
            "Could not communicate with the remote while calling {} after {} seconds. No more retries will be attempted.",
            self.rpc_call,
            event.elapsed.as_secs()
        ));
    }
}
