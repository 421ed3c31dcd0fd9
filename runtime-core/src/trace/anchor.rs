use std::time::SystemTime;
use tokio::time::Instant;

/// Pins a monotonic instant to wall-clock time so that receivers can
/// convert event nanotimes into real timestamps.
#[derive(Debug, Clone)]
pub struct TimeAnchor {
    pub real: SystemTime,
    pub instant: Instant,
}

impl TimeAnchor {
    pub fn new() -> Self {
        TimeAnchor {
            real: SystemTime::now(),
            instant: Instant::now(),
        }
    }

    /// Nanoseconds elapsed from the anchor to `at`, saturating at zero for
    /// instants that predate it.
    pub fn nanotime(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.instant).as_nanos() as i64
    }

    /// The `X-Encore-Trace-TimeAnchor` header value: the anchor's unix
    /// nanos, so the receiver can rebase nanotimes.
    pub fn trace_header(&self) -> String {
        let unix_nanos = self
            .real
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        unix_nanos.to_string()
    }
}

impl Default for TimeAnchor {
    fn default() -> Self {
        Self::new()
    }
}
