//! Fault-signature detection and the degraded-mode record.
//!
//! Capacity limits in this domain are account-wide, so one matching session
//! puts the whole fleet into degraded mode until the reported resume time
//! (plus a safety buffer) has passed.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches "usage limit reached|<epoch>" and "rate limit exceeded ... resets at 5pm" styles.
///
/// The optional `resume` group carries an epoch, an RFC 3339 timestamp or a clock time.
pub const DEFAULT_FAULT_PATTERN: &str = r"(?i)(?:usage|rate) limit (?:reached|exceeded)[^\n]*?(?:\||resets?(?: at)? )(?P<resume>\d{9,}|\d{4}-\d{2}-\d{2}T\S+|\d{1,2}(?::\d{2})?\s*[ap]m)";

/// Transient record of a fleet-wide switch into degraded mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub switched: Vec<SwitchedSession>,
    pub detected_at: DateTime<Utc>,
    pub resume_at: DateTime<Utc>,
    /// Session whose output carried the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RateLimitWindow {
    /// Time after which sessions may switch back.
    pub fn recovery_at(&self, buffer: Duration) -> DateTime<Utc> {
        self.resume_at + buffer
    }

    pub fn recovery_due(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now >= self.recovery_at(buffer)
    }

    /// A record still present this long after its recovery time is an anomaly.
    pub fn is_stale(&self, now: DateTime<Utc>, buffer: Duration, stale_after: Duration) -> bool {
        now > self.recovery_at(buffer) + stale_after
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchedSession {
    pub session: String,
    pub original_mode: String,
}

/// A fault signature found in session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultDetection {
    pub resume_at: DateTime<Utc>,
    pub matched: String,
}

/// Scan `output` for the last occurrence of `pattern`.
///
/// When the match carries no parseable resume time, `now + fallback` is used.
pub fn detect(
    pattern: &Regex,
    output: &str,
    now: DateTime<Utc>,
    fallback: Duration,
) -> Option<FaultDetection> {
    let captures = pattern.captures_iter(output).last()?;
    let matched = captures.get(0)?.as_str().trim().to_string();
    let resume_at = captures
        .name("resume")
        .and_then(|m| parse_resume(m.as_str(), now))
        .unwrap_or(now + fallback);
    Some(FaultDetection { resume_at, matched })
}

/// Parse an epoch (seconds or milliseconds), an RFC 3339 timestamp, or a
/// 12-hour clock time; clock times already past today roll to tomorrow.
pub fn parse_resume(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        let value: i64 = raw.parse().ok()?;
        let secs = if value > 100_000_000_000 {
            value / 1000
        } else {
            value
        };
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    parse_clock(raw, now)
}

fn parse_clock(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = raw.to_ascii_lowercase();
    let (clock, pm) = if let Some(rest) = lower.strip_suffix("pm") {
        (rest.trim(), true)
    } else if let Some(rest) = lower.strip_suffix("am") {
        (rest.trim(), false)
    } else {
        return None;
    };
    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (clock.parse::<u32>().ok()?, 0),
    };
    if !(1..=12).contains(&hour) {
        return None;
    }
    let hour = match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let candidate = now.date_naive().and_time(time).and_utc();
    if candidate <= now {
        Some(candidate + Duration::days(1))
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn pattern() -> Regex {
        Regex::new(DEFAULT_FAULT_PATTERN).expect("regex")
    }

    #[test]
    fn detects_epoch_resume_time() {
        let now = at("2026-03-01T10:00:00Z");
        let found = detect(
            &pattern(),
            "working...\nClaude AI usage limit reached|1772362800\n",
            now,
            Duration::hours(1),
        )
        .expect("detected");
        assert_eq!(found.resume_at, at("2026-03-01T11:00:00Z"));
        assert!(found.matched.contains("usage limit reached"));
    }

    #[test]
    fn clock_time_in_the_past_rolls_to_tomorrow() {
        let now = at("2026-03-01T18:30:00Z");
        let found = detect(
            &pattern(),
            "Rate limit exceeded, resets at 5pm",
            now,
            Duration::hours(1),
        )
        .expect("detected");
        assert_eq!(found.resume_at, at("2026-03-02T17:00:00Z"));
    }

    #[test]
    fn unparseable_resume_uses_fallback() {
        let custom = Regex::new(r"(?i)quota exhausted").expect("regex");
        let now = at("2026-03-01T10:00:00Z");
        let found = detect(&custom, "Quota exhausted", now, Duration::minutes(30)).expect("detected");
        assert_eq!(found.resume_at, at("2026-03-01T10:30:00Z"));
    }

    #[test]
    fn clean_output_has_no_fault() {
        let now = Utc::now();
        assert!(detect(&pattern(), "all tests passed", now, Duration::hours(1)).is_none());
    }

    #[test]
    fn recovery_and_staleness_use_buffers() {
        let window = RateLimitWindow {
            switched: Vec::new(),
            detected_at: at("2026-03-01T10:00:00Z"),
            resume_at: at("2026-03-01T11:00:00Z"),
            source: None,
        };
        let buffer = Duration::minutes(5);
        assert!(!window.recovery_due(at("2026-03-01T11:04:59Z"), buffer));
        assert!(window.recovery_due(at("2026-03-01T11:05:00Z"), buffer));
        assert!(!window.is_stale(at("2026-03-01T12:05:00Z"), buffer, Duration::hours(1)));
        assert!(window.is_stale(at("2026-03-01T12:05:01Z"), buffer, Duration::hours(1)));
    }
}
