// ── Reconnect backoff policy ──

use std::time::Duration;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Consecutive reconnection attempts before giving up.
    /// `None` means retry forever. Default: 10.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Capped exponential backoff.
///
/// `delay = min(initial * 2^attempt, max)`
///
/// Deterministic: no jitter is applied.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    // 2^31 ms is already ~24 days; anything past that saturates to the cap.
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    config
        .initial_delay
        .checked_mul(factor)
        .map_or(config.max_delay, |d| d.min(config.max_delay))
}
