//! Time utilities
//!
//! Timestamps are Unix milliseconds (`u64`) everywhere they are persisted or
//! sent over the API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
///
/// A clock set before 1970 reads as 0 rather than panicking.
///
/// # Examples
/// ```
/// use fp_core::time::now_millis;
///
/// assert!(now_millis() > 0);
/// ```
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Milliseconds elapsed since `since`; 0 if `since` is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    now_millis().saturating_sub(since)
}

/// Whether a `last_seen` timestamp falls outside `window` as of `now`.
///
/// Never-seen counts as stale.
pub fn is_stale(last_seen: Option<u64>, window: Duration, now: u64) -> bool {
    match last_seen {
        Some(seen) => now.saturating_sub(seen) > window.as_millis() as u64,
        None => true,
    }
}

/// Parse a history period such as `30m`, `1h`, `24h` or `7d`.
///
/// A bare number is taken as seconds. Zero-length periods are rejected.
pub fn parse_period(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(3_600)?,
        "d" => value.checked_mul(86_400)?,
        "w" => value.checked_mul(604_800)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_of_future_is_zero() {
        assert_eq!(elapsed_millis(now_millis() + 1_000_000), 0);
    }

    #[test]
    fn staleness_window() {
        let window = Duration::from_secs(90);
        assert!(is_stale(None, window, 1_000));
        assert!(!is_stale(Some(100_000), window, 150_000));
        assert!(is_stale(Some(100_000), window, 190_001));
    }

    #[test]
    fn periods() {
        assert_eq!(parse_period("30m"), Some(Duration::from_secs(1_800)));
        assert_eq!(parse_period("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_period("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_period("7d"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_period("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_period("0h"), None);
        assert_eq!(parse_period("h"), None);
        assert_eq!(parse_period("3y"), None);
        assert_eq!(parse_period(""), None);
    }
}
