//! Time-boxed retries for a single logical remote call.
//!
//! The first attempt is never bounded by the retry budget: re-issuing a call
//! that may already be running remotely is worse than waiting for it. Retries
//! after a transient failure run only while the budget lasts, unless the call
//! is still short of its minimum attempt count and its last failure may have
//! reached the remote.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::retry_backoff;

/// Retry eligibility of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable { never_connected: bool },
    Fatal,
    Cancelled,
}

/// Errors the engine can reason about without knowing their concrete type.
pub trait RetryClassify: Sized {
    fn classify(&self) -> FailureClass;

    /// The error reported when the caller's cancellation stops the call.
    fn cancelled() -> Self;
}

/// What a single attempt came to.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    RetryableFailure { error: E, never_connected: bool },
    FatalFailure(E),
    /// Carries the error the attempt returned after the caller cancelled, if it got that far.
    Cancelled(Option<E>),
    /// The retry budget ran out while the attempt was in flight.
    BudgetExhausted,
}

impl<T, E: RetryClassify> AttemptOutcome<T, E> {
    fn from_result(result: Result<T, E>, cancel: &CancellationToken) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) if cancel.is_cancelled() => Self::Cancelled(Some(error)),
            Err(error) => match error.classify() {
                FailureClass::Retryable { never_connected } => Self::RetryableFailure {
                    error,
                    never_connected,
                },
                FailureClass::Fatal => Self::FatalFailure(error),
                FailureClass::Cancelled => Self::Cancelled(Some(error)),
            },
        }
    }
}

/// How an attempt ended, as seen by [`RetryHooks::on_attempt`].
#[derive(Debug, Clone, Copy)]
pub enum AttemptResult<'a, E> {
    Succeeded,
    Failed(&'a E),
    /// Aborted by the caller or by the retry budget, with the attempt's own error when it returned one.
    Cancelled(Option<&'a E>),
}

#[derive(Debug)]
pub struct RetryEvent<'a, E> {
    pub error: &'a E,
    pub sleep: Duration,
    pub retry_count: u32,
    pub retry_timeout: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutEvent {
    pub retry_timeout: Duration,
    pub elapsed: Duration,
    pub retry_count: u32,
}

/// Observation points of a retried call. All default to doing nothing.
pub trait RetryHooks<E> {
    fn on_attempt(&mut self, _start: Instant, _end: Instant, _result: AttemptResult<'_, E>) {}

    /// Called before sleeping ahead of each retry.
    fn on_retry(&mut self, _event: &RetryEvent<'_, E>) {}

    /// Called once when the engine gives up after having entered the retry loop.
    fn on_timeout(&mut self, _event: &TimeoutEvent) {}
}

impl<E> RetryHooks<E> for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEngine {
    retry_timeout: Duration,
    minimum_attempts: u32,
}

impl RetryEngine {
    pub fn new(retry_timeout: Duration) -> Self {
        Self {
            retry_timeout,
            minimum_attempts: 1,
        }
    }

    /// Attempts to make even past the budget, while failures may have reached the remote.
    pub fn with_minimum_attempts(mut self, minimum_attempts: u32) -> Self {
        self.minimum_attempts = minimum_attempts.max(1);
        self
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub fn minimum_attempts(&self) -> u32 {
        self.minimum_attempts
    }

    /// Runs `action` until it succeeds, fails fatally, the budget runs out or `cancel` fires.
    ///
    /// Every attempt receives a child of `cancel`, cancelled once that attempt is over.
    pub async fn execute_with_retries<T, E, F, Fut, H>(
        &self,
        mut action: F,
        hooks: &mut H,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        E: RetryClassify,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: RetryHooks<E>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 1;
        let (mut last_error, mut last_never_connected) =
            match run_attempt(&mut action, hooks, cancel, None).await {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::FatalFailure(error) => return Err(error),
                AttemptOutcome::Cancelled(_) | AttemptOutcome::BudgetExhausted => {
                    return Err(E::cancelled());
                }
                AttemptOutcome::RetryableFailure {
                    error,
                    never_connected,
                } => (error, never_connected),
            };

        let mut retry_count: u32 = 0;
        loop {
            let elapsed = started.elapsed();
            let sleep = retry_backoff(retry_count + 1);
            let within_budget = elapsed + sleep < self.retry_timeout;
            let below_minimum = attempts < self.minimum_attempts && !last_never_connected;

            if !within_budget && !below_minimum {
                hooks.on_timeout(&self.timeout_event(elapsed, retry_count));
                return Err(last_error);
            }

            retry_count += 1;
            hooks.on_retry(&RetryEvent {
                error: &last_error,
                sleep,
                retry_count,
                retry_timeout: self.retry_timeout,
                elapsed,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(E::cancelled()),
                _ = tokio::time::sleep(sleep) => {}
            }

            // An attempt let through only to reach the minimum runs to completion.
            let deadline = (!below_minimum).then(|| started + self.retry_timeout);
            attempts += 1;
            match run_attempt(&mut action, hooks, cancel, deadline).await {
                AttemptOutcome::Success(value) => return Ok(value),
                AttemptOutcome::Cancelled(_) => return Err(E::cancelled()),
                AttemptOutcome::FatalFailure(error) => {
                    hooks.on_timeout(&self.timeout_event(started.elapsed(), retry_count));
                    return Err(error);
                }
                // The aborted attempt may have reached the remote, so the minimum
                // attempt count applies again.
                AttemptOutcome::BudgetExhausted => last_never_connected = false,
                AttemptOutcome::RetryableFailure {
                    error,
                    never_connected,
                } => {
                    last_error = error;
                    last_never_connected = never_connected;
                }
            }
        }
    }

    /// A single attempt, classified the same way a retried call would be.
    pub async fn execute_once<T, E, F, Fut, H>(
        &self,
        mut action: F,
        hooks: &mut H,
        cancel: &CancellationToken,
    ) -> Result<T, E>
    where
        E: RetryClassify,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: RetryHooks<E>,
    {
        match run_attempt(&mut action, hooks, cancel, None).await {
            AttemptOutcome::Success(value) => Ok(value),
            AttemptOutcome::RetryableFailure { error, .. } | AttemptOutcome::FatalFailure(error) => {
                Err(error)
            }
            AttemptOutcome::Cancelled(_) | AttemptOutcome::BudgetExhausted => Err(E::cancelled()),
        }
    }

    fn timeout_event(&self, elapsed: Duration, retry_count: u32) -> TimeoutEvent {
        TimeoutEvent {
            retry_timeout: self.retry_timeout,
            elapsed,
            retry_count,
        }
    }
}

async fn run_attempt<T, E, F, Fut, H>(
    action: &mut F,
    hooks: &mut H,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> AttemptOutcome<T, E>
where
    E: RetryClassify,
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: RetryHooks<E>,
{
    let attempt_token = cancel.child_token();
    let budget = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    let start = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => AttemptOutcome::Cancelled(None),
        _ = budget => AttemptOutcome::BudgetExhausted,
        result = action(attempt_token.clone()) => AttemptOutcome::from_result(result, cancel),
    };
    attempt_token.cancel();
    let end = Instant::now();

    let result = match &outcome {
        AttemptOutcome::Success(_) => AttemptResult::Succeeded,
        AttemptOutcome::RetryableFailure { error, .. } | AttemptOutcome::FatalFailure(error) => {
            AttemptResult::Failed(error)
        }
        AttemptOutcome::Cancelled(error) => AttemptResult::Cancelled(error.as_ref()),
        AttemptOutcome::BudgetExhausted => AttemptResult::Cancelled(None),
    };
    hooks.on_attempt(start, end, result);
    outcome
}
