use std::time::Duration;

use tokio::time::Instant;
use url::Url;

/// Failures before an endpoint is considered down rather than degraded.
const DOWN_AFTER_FAILURES: u32 = 3;

/// Exponent cap so cooldown math cannot overflow before the ceiling applies.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Aggregate judgement of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Healthy,
    Degraded,
    Down,
}

/// Rolling health record for one endpoint URL.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub url: Url,
    pub status: EndpointStatus,
    pub fail_count: u32,
    pub last_error: Option<Instant>,
    pub last_success: Option<Instant>,
    /// Cooldown gate; the endpoint is not dialed again before this instant.
    pub next_available: Option<Instant>,
}

impl EndpointHealth {
    pub(crate) fn new(url: Url) -> Self {
        Self {
            url,
            status: EndpointStatus::Healthy,
            fail_count: 0,
            last_error: None,
            last_success: None,
            next_available: None,
        }
    }

    /// Whether the cooldown (if any) has expired.
    #[must_use]
    pub fn is_available(&self, now: Instant) -> bool {
        self.next_available.map_or(true, |at| at <= now)
    }

    pub(crate) fn record_failure(
        &mut self,
        now: Instant,
        base_delay: Duration,
        max_cooldown: Duration,
    ) {
        self.fail_count += 1;
        self.last_error = Some(now);
        self.next_available = Some(now + cooldown(self.fail_count, base_delay, max_cooldown));
        self.status = if self.fail_count < DOWN_AFTER_FAILURES {
            EndpointStatus::Degraded
        } else {
            EndpointStatus::Down
        };
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.status = EndpointStatus::Healthy;
        self.fail_count = 0;
        self.last_success = Some(now);
        self.next_available = None;
    }
}

/// `min(2^failures · base, cap)`.
fn cooldown(failures: u32, base_delay: Duration, max_cooldown: Duration) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(MAX_BACKOFF_EXPONENT));
    base_delay.saturating_mul(factor).min(max_cooldown)
}
