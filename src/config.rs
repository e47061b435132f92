//! Tunables consumed by the orchestrator core.

use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: [u64; 3] = [1_000, 2_000, 4_000];
/// Matches the client's own GPS throttle.
pub const DEFAULT_LOCATION_INTERVAL_SECS: u64 = 8;
pub const DEFAULT_PING_HISTORY: usize = 50;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    /// Wait before retry `n` is `retry_backoff[n - 1]`; the last entry is
    /// reused once the schedule runs out.
    pub retry_backoff: Vec<Duration>,
    pub location_interval: Duration,
    pub ping_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            location_interval: Duration::from_secs(DEFAULT_LOCATION_INTERVAL_SECS),
            ping_history: DEFAULT_PING_HISTORY,
        }
    }
}

impl OrchestratorConfig {
    /// Backoff before the retry numbered `retry_count` (1-based).
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let index = retry_count.saturating_sub(1) as usize;
        self.retry_backoff
            .get(index)
            .or_else(|| self.retry_backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Parse a comma-separated list of milliseconds, e.g. `"1000,2000,4000"`.
pub fn parse_backoff_list(raw: &str) -> Result<Vec<Duration>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("invalid backoff entry: {part}"))
        })
        .collect()
}
