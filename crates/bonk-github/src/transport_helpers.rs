use std::time::Duration;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Retry budget applied to individual GitHub REST calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn normalized(self) -> Self {
        Self {
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms.max(1),
        }
    }

    pub fn allows_another_attempt(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Exponential backoff from `base_delay_ms`, floored by any `Retry-After`
    /// hint and capped at 30 seconds.
    pub fn delay_for(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let floor = Duration::from_millis(self.base_delay_ms);
        if let Some(hint) = retry_after {
            return hint.max(floor);
        }
        let exponent = attempt.saturating_sub(1).min(10) as u32;
        let scaled = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(scaled.min(MAX_BACKOFF_MS))
    }
}

pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Truncates on a char boundary and marks the cut with `...`.
pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}
