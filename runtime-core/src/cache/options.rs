use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::time::Duration;

/// When a written key expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Expire this long after the write.
    ExpireIn(Duration),
    /// Expire at the next occurrence of the given local wall-clock time.
    ExpireDailyAt {
        hour: u8,
        minute: u8,
        second: u8,
        /// Offset of the local timezone from UTC, in seconds.
        utc_offset_secs: i32,
    },
    /// No expiry.
    NeverExpire,
    /// Keep whatever TTL the key already has.
    KeepTtl,
}

/// Per-write options. The zero value applies the keyspace default expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub expiry: Option<ExpiryPolicy>,
}

impl WriteOptions {
    pub fn expire_in(d: Duration) -> Self {
        WriteOptions {
            expiry: Some(ExpiryPolicy::ExpireIn(d)),
        }
    }

    pub fn expire_daily_at(hour: u8, minute: u8, second: u8, utc_offset_secs: i32) -> Self {
        WriteOptions {
            expiry: Some(ExpiryPolicy::ExpireDailyAt {
                hour,
                minute,
                second,
                utc_offset_secs,
            }),
        }
    }

    pub fn never_expire() -> Self {
        WriteOptions {
            expiry: Some(ExpiryPolicy::NeverExpire),
        }
    }

    pub fn keep_ttl() -> Self {
        WriteOptions {
            expiry: Some(ExpiryPolicy::KeepTtl),
        }
    }
}

/// The next unix timestamp at which the daily expiry fires, strictly
/// after `now`.
pub(crate) fn next_daily_expiry(
    now: DateTime<Utc>,
    hour: u8,
    minute: u8,
    second: u8,
    utc_offset_secs: i32,
) -> i64 {
    let offset = chrono::FixedOffset::east_opt(utc_offset_secs)
        .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).expect("zero offset is valid"));
    let local_now = now.with_timezone(&offset);
    let today = local_now
        .with_hour(hour as u32)
        .and_then(|t| t.with_minute(minute as u32))
        .and_then(|t| t.with_second(second as u32))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local_now);
    let target = if today > local_now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    target.timestamp()
}

/// Renders the expiry as `SET` command arguments.
pub(crate) fn expiry_args(policy: Option<&ExpiryPolicy>, now: DateTime<Utc>) -> Vec<String> {
    match policy {
        None | Some(ExpiryPolicy::NeverExpire) => Vec::new(),
        Some(ExpiryPolicy::KeepTtl) => vec!["KEEPTTL".to_string()],
        Some(ExpiryPolicy::ExpireIn(d)) => {
            vec!["PX".to_string(), d.as_millis().max(1).to_string()]
        }
        Some(ExpiryPolicy::ExpireDailyAt {
            hour,
            minute,
            second,
            utc_offset_secs,
        }) => vec![
            "EXAT".to_string(),
            next_daily_expiry(now, *hour, *minute, *second, *utc_offset_secs).to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn expire_in_becomes_px() {
        let args = expiry_args(
            Some(&ExpiryPolicy::ExpireIn(Duration::from_secs(30))),
            Utc::now(),
        );
        assert_eq!(args, vec!["PX", "30000"]);
    }

    #[test]
    fn keep_ttl_and_never_expire() {
        assert_eq!(
            expiry_args(Some(&ExpiryPolicy::KeepTtl), Utc::now()),
            vec!["KEEPTTL"]
        );
        assert!(expiry_args(Some(&ExpiryPolicy::NeverExpire), Utc::now()).is_empty());
        assert!(expiry_args(None, Utc::now()).is_empty());
    }

    #[test]
    fn daily_expiry_later_today() {
        let now = at("2026-03-01T10:00:00Z");
        let ts = next_daily_expiry(now, 18, 30, 0, 0);
        assert_eq!(ts, at("2026-03-01T18:30:00Z").timestamp());
    }

    #[test]
    fn daily_expiry_rolls_to_tomorrow() {
        let now = at("2026-03-01T20:00:00Z");
        let ts = next_daily_expiry(now, 18, 30, 0, 0);
        assert_eq!(ts, at("2026-03-02T18:30:00Z").timestamp());
    }

    #[test]
    fn daily_expiry_honors_the_offset() {
        // 02:00 UTC is 10:00 at +08:00; a 09:00 local deadline has passed.
        let now = at("2026-03-01T02:00:00Z");
        let ts = next_daily_expiry(now, 9, 0, 0, 8 * 3600);
        assert_eq!(ts, at("2026-03-02T01:00:00Z").timestamp());
    }
}
