use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Retry budget for one network sub-operation.
///
/// `retry` counts retries after the first attempt, so a policy with
/// `retry = 2` makes at most three requests. The wait before retry `n`
/// (zero based) is `delay_ms * backoff_factor^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry: u32,
    pub delay_ms: u64,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub const fn new(retry: u32, delay_ms: u64, backoff_factor: f64) -> Self {
        Self {
            retry,
            delay_ms,
            backoff_factor,
        }
    }

    pub const fn download() -> Self {
        Self::new(10, 1000, 1.2)
    }

    pub const fn identity_probe() -> Self {
        Self::new(25, 3000, 1.10)
    }

    pub const fn metrics_probe() -> Self {
        Self::new(10, 2000, 1.25)
    }

    pub fn total_attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    pub fn delay_before_retry(&self, retry_index: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor > 0.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let exponent = i32::try_from(retry_index.min(64)).unwrap_or(64);
        let millis = (self.delay_ms as f64) * factor.powi(exponent);
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.max(0.0).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::download()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

pub fn classify_http_status(status: u16) -> ErrorClass {
    if matches!(status, 408 | 425 | 429) || status >= 500 {
        return ErrorClass::Transient;
    }
    ErrorClass::Permanent
}

pub fn classify_transport_error(err: &reqwest::Error) -> ErrorClass {
    if let Some(status) = err.status() {
        return classify_http_status(status.as_u16());
    }
    if err.is_builder() || err.is_redirect() {
        return ErrorClass::Permanent;
    }
    ErrorClass::Transient
}
