use std::time::Duration;

const MAX_RETRY_BACKOFF_SECS: u32 = 10;

/// Delay before retry number `retry_count` (1-based): one extra second per retry, capped at ten.
pub fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_secs(u64::from(retry_count.min(MAX_RETRY_BACKOFF_SECS)))
}

/// Spacing between successive status polls of a running script.
pub trait ScriptObserverBackoffStrategy: Send + Sync {
    fn backoff(&self, iteration: u32) -> Duration;
}

/// Geometric growth from a short initial delay, so short scripts report back quickly
/// while long ones are not polled more than once per `max`.
#[derive(Debug, Clone, Copy)]
pub struct DefaultScriptObserverBackoffStrategy {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl DefaultScriptObserverBackoffStrategy {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }
}

impl Default for DefaultScriptObserverBackoffStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), 1.4, Duration::from_millis(5_000))
    }
}

impl ScriptObserverBackoffStrategy for DefaultScriptObserverBackoffStrategy {
    fn backoff(&self, iteration: u32) -> Duration {
        // The exponent is clamped; the cap is reached long before it matters.
        let exponent = iteration.min(64) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }
}
