use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Identity of a logical remote operation, used to label metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    service: String,
    name: String,
}

impl RpcCall {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

/// One physical attempt of an [`RpcCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimedOperation {
    start: Instant,
    end: Instant,
    error: Option<ClientError>,
    was_cancelled: bool,
}

impl TimedOperation {
    pub(crate) fn success(start: Instant, end: Instant) -> Self {
        Self {
            start,
            end,
            error: None,
            was_cancelled: false,
        }
    }

    pub(crate) fn failure(start: Instant, end: Instant, error: ClientError) -> Self {
        Self {
            start,
            end,
            error: Some(error),
            was_cancelled: false,
        }
    }

    /// Keeps the attempt's own error when it returned one after the cancellation.
    pub(crate) fn cancelled(start: Instant, end: Instant, error: Option<ClientError>) -> Self {
        Self {
            start,
            end,
            error: Some(error.unwrap_or(ClientError::Cancelled)),
            was_cancelled: true,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Full attempt history of one logical call. Sealed when the call finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCallMetrics {
    rpc_call: RpcCall,
    start: Instant,
    end: Instant,
    retry_timeout: Duration,
    with_retries: bool,
    attempts: Vec<TimedOperation>,
    failure: Option<ClientError>,
    was_cancelled: bool,
}

impl RpcCallMetrics {
    pub fn rpc_call(&self) -> &RpcCall {
        &self.rpc_call
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub fn with_retries(&self) -> bool {
        self.with_retries
    }

    pub fn attempts(&self) -> &[TimedOperation] {
        &self.attempts
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.attempts.last().is_some_and(TimedOperation::succeeded)
    }

    /// The error the call failed with, falling back to the last attempt's error.
    ///
    /// These differ when the budget expired mid-attempt: the call then fails with
    /// the error of the attempt before it.
    pub fn error(&self) -> Option<&ClientError> {
        self.failure
            .as_ref()
            .or_else(|| self.attempts.last().and_then(TimedOperation::error))
    }

    /// True when the caller cancelled the call, even between attempts.
    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled || self.attempts.iter().any(TimedOperation::was_cancelled)
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

#[derive(Debug)]
pub(crate) struct RpcCallMetricsBuilder {
    rpc_call: RpcCall,
    start: Instant,
    retry_timeout: Duration,
    with_retries: bool,
    attempts: Vec<TimedOperation>,
}

impl RpcCallMetricsBuilder {
    pub(crate) fn start_with_retries(rpc_call: RpcCall, retry_timeout: Duration) -> Self {
        Self {
            rpc_call,
            start: Instant::now(),
            retry_timeout,
            with_retries: true,
            attempts: Vec::new(),
        }
    }

    pub(crate) fn start_without_retries(rpc_call: RpcCall) -> Self {
        Self {
            with_retries: false,
            ..Self::start_with_retries(rpc_call, Duration::ZERO)
        }
    }

    pub(crate) fn with_attempt(&mut self, attempt: TimedOperation) {
        self.attempts.push(attempt);
    }

    pub(crate) fn success(self) -> RpcCallMetrics {
        self.seal(None, false)
    }

    pub(crate) fn failure(self, error: ClientError, cancel: &CancellationToken) -> RpcCallMetrics {
        let was_cancelled = cancel.is_cancelled() || error.is_cancelled();
        self.seal(Some(error), was_cancelled)
    }

    fn seal(self, failure: Option<ClientError>, was_cancelled: bool) -> RpcCallMetrics {
        RpcCallMetrics {
            rpc_call: self.rpc_call,
            start: self.start,
            end: Instant::now(),
            retry_timeout: self.retry_timeout,
            with_retries: self.with_retries,
            attempts: self.attempts,
            failure,
            was_cancelled,
        }
    }
}

/// Every call issued while serving one client operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOperationMetrics {
    start: Instant,
    end: Instant,
    rpc_calls: Vec<RpcCallMetrics>,
    failure: Option<ClientError>,
}

impl ClientOperationMetrics {
    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    pub fn rpc_calls(&self) -> &[RpcCallMetrics] {
        &self.rpc_calls
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn error(&self) -> Option<&ClientError> {
        self.failure.as_ref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.failure.as_ref().is_some_and(ClientError::is_cancelled)
    }
}

/// Append-only collector owned by a single client operation.
#[derive(Debug)]
pub struct ClientOperationMetricsBuilder {
    start: Instant,
    rpc_calls: Vec<RpcCallMetrics>,
    failure: Option<ClientError>,
}

impl ClientOperationMetricsBuilder {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            rpc_calls: Vec::new(),
            failure: None,
        }
    }

    pub fn with_rpc_call(&mut self, metrics: RpcCallMetrics) {
        self.rpc_calls.push(metrics);
    }

    /// Marks the operation as failed; the first recorded failure wins.
    pub fn with_failure(&mut self, error: &ClientError) {
        if self.failure.is_none() {
            self.failure = Some(error.clone());
        }
    }

    pub fn rpc_call_count(&self) -> usize {
        self.rpc_calls.len()
    }

    pub fn build(&self) -> ClientOperationMetrics {
        ClientOperationMetrics {
            start: self.start,
            end: Instant::now(),
            rpc_calls: self.rpc_calls.clone(),
            failure: self.failure.clone(),
        }
    }
}
