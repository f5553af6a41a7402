use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, Locale, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

use crate::model::{Ms, HOUR_MS};

const DAY_MS: Ms = 24 * HOUR_MS;

/// Source of "now". Injected everywhere so lifecycle rules can be tested at exact instants.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wall-clock view of timestamps in the service's configured time zone.
///
/// Hour flooring, business hours and user-facing dates are all evaluated here,
/// so an offset such as `-03:00` moves the whole schedule consistently.
#[derive(Debug, Clone, Copy)]
pub struct LocalCalendar {
    offset: FixedOffset,
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

impl LocalCalendar {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// `None` when the offset is a day or more away from UTC.
    pub fn with_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    fn offset_ms(&self) -> Ms {
        Ms::from(self.offset.local_minus_utc()) * 1000
    }

    /// Start of the local hour containing `t`.
    pub fn floor_to_hour(&self, t: Ms) -> Ms {
        t - (t + self.offset_ms()).rem_euclid(HOUR_MS)
    }

    /// Local hour of day, 0..=23.
    pub fn hour_of_day(&self, t: Ms) -> u32 {
        ((t + self.offset_ms()).rem_euclid(DAY_MS) / HOUR_MS) as u32
    }

    /// Parse an RFC 3339 timestamp, or a bare `YYYY-MM-DDTHH:MM[:SS]` read as local time.
    pub fn parse(&self, raw: &str) -> Option<Ms> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp_millis());
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .and_then(|naive| self.offset.from_local_datetime(&naive).single())
            .map(|dt| dt.timestamp_millis())
    }

    fn local(&self, t: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&self.offset))
    }

    /// RFC 3339 in the local offset, e.g. `2026-03-05T10:00:00.000-03:00`.
    pub fn to_rfc3339(&self, t: Ms) -> String {
        self.local(t)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, false))
            .unwrap_or_default()
    }

    /// Human date for notifications and mails: `dia 05 de março, às 10:00h`.
    pub fn format_slot(&self, t: Ms) -> String {
        self.local(t)
            .map(|dt| {
                dt.format_localized("dia %d de %B, às %-H:%Mh", Locale::pt_BR)
                    .to_string()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2026-03-05T10:37:12Z
    const T: Ms = 1_772_707_032_000;

    #[test]
    fn floor_utc() {
        let cal = LocalCalendar::utc();
        let floored = cal.floor_to_hour(T);
        assert_eq!(floored % HOUR_MS, 0);
        assert!(T - floored < HOUR_MS);
        assert_eq!(cal.hour_of_day(floored), 10);
    }

    #[test]
    fn floor_with_half_hour_offset() {
        // +05:30: 10:37Z is 16:07 local, so the local hour starts at 10:30Z.
        let cal = LocalCalendar::with_offset_minutes(330).unwrap();
        let floored = cal.floor_to_hour(T);
        assert_eq!(T - floored, 7 * 60_000 + 12_000);
        assert_eq!(cal.hour_of_day(floored), 16);
    }

    #[test]
    fn negative_offset_hour_of_day() {
        let cal = LocalCalendar::with_offset_minutes(-180).unwrap();
        assert_eq!(cal.hour_of_day(T), 7);
    }

    #[test]
    fn parse_rfc3339_and_local() {
        let cal = LocalCalendar::with_offset_minutes(-180).unwrap();
        let a = cal.parse("2026-03-05T07:37:12-03:00").unwrap();
        let b = cal.parse("2026-03-05T07:37:12").unwrap();
        assert_eq!(a, T);
        assert_eq!(b, T);
        assert!(cal.parse("not a date").is_none());
    }

    #[test]
    fn format_slot_in_portuguese() {
        let cal = LocalCalendar::utc();
        let s = cal.format_slot(cal.floor_to_hour(T));
        assert_eq!(s, "dia 05 de março, às 10:00h");
    }

    #[test]
    fn rejects_day_sized_offset() {
        assert!(LocalCalendar::with_offset_minutes(24 * 60).is_none());
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
    }
}
