use chrono::{DateTime, FixedOffset, Offset, Utc};
use log::warn;

const HOUR: i32 = 3600;

// Named abbreviations the device understands, with their offsets in minutes.
const NAMED_ZONES: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("EST", -5 * 60),
    ("EDT", -4 * 60),
    ("CST", -6 * 60),
    ("CDT", -5 * 60),
    ("MST", -7 * 60),
    ("MDT", -6 * 60),
    ("PST", -8 * 60),
    ("PDT", -7 * 60),
    ("CET", 60),
    ("CEST", 2 * 60),
    ("IST", 5 * 60 + 30),
    ("CNST", 8 * 60),
    ("HKT", 8 * 60),
    ("JST", 9 * 60),
    ("KST", 9 * 60),
    ("AEST", 10 * 60),
    ("AEDT", 11 * 60),
    ("NZST", 12 * 60),
    ("NZDT", 13 * 60),
];

pub fn resolve(code: &str) -> Option<FixedOffset> {
    let code = code.trim().to_ascii_uppercase();

    if let Some((_, minutes)) = NAMED_ZONES.iter().find(|(name, _)| *name == code) {
        return FixedOffset::east_opt(minutes * 60);
    }

    let rest = code.strip_prefix("UTC")?;
    let (sign, rest) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    // Whole hours; anything after the hour digits is ignored.
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let hours: i32 = rest[..digits].parse().ok()?;
    if hours > 14 {
        return None;
    }
    FixedOffset::east_opt(sign * hours * HOUR)
}

pub fn utc_offset(code: &str) -> FixedOffset {
    resolve(code).unwrap_or_else(|| {
        warn!("unknown timezone {code:?}, using UTC");
        Utc.fix()
    })
}

pub fn local_time(now_secs: i64, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let utc = DateTime::<Utc>::from_timestamp(now_secs, 0)?;
    Some(utc.with_timezone(&offset))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackClock {
    anchor: Option<(i64, u64)>,
}

impl FallbackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor(&mut self, epoch_secs: i64, now_ms: u64) {
        self.anchor = Some((epoch_secs, now_ms));
    }

    pub fn now(&self, now_ms: u64) -> i64 {
        match self.anchor {
            Some((epoch_secs, at_ms)) => {
                epoch_secs + (now_ms.saturating_sub(at_ms) / 1000) as i64
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use pretty_assertions::assert_eq;

    fn offset_minutes(code: &str) -> Option<i32> {
        resolve(code).map(|offset| offset.local_minus_utc() / 60)
    }

    #[test]
    fn resolves_named_codes() {
        assert_eq!(offset_minutes("UTC"), Some(0));
        assert_eq!(offset_minutes("pst"), Some(-480));
        assert_eq!(offset_minutes("CEST"), Some(120));
        assert_eq!(offset_minutes("IST"), Some(330));
        assert_eq!(offset_minutes("NZDT"), Some(780));
    }

    #[test]
    fn resolves_numeric_offsets() {
        assert_eq!(offset_minutes("UTC+8"), Some(480));
        assert_eq!(offset_minutes("UTC-10"), Some(-600));
        assert_eq!(offset_minutes("UTC+5:3"), Some(300));
        assert_eq!(offset_minutes("UTC+15"), None);
        assert_eq!(offset_minutes("UTC8"), None);
        assert_eq!(offset_minutes("UTC+"), None);
    }

    #[test]
    fn unknown_codes_fall_back_to_utc() {
        assert_eq!(resolve("MARS"), None);
        assert_eq!(utc_offset("MARS").local_minus_utc(), 0);
    }

    #[test]
    fn local_time_applies_offset() {
        // 2026-01-05T23:30:00Z
        let local = local_time(1_767_655_800, utc_offset("UTC+8")).unwrap();

        assert_eq!((local.hour(), local.minute()), (7, 30));
    }

    #[test]
    fn fallback_clock_advances_from_anchor() {
        let mut clock = FallbackClock::new();
        assert_eq!(clock.now(5_000), 0);

        clock.anchor(1_767_600_000, 2_000);

        assert_eq!(clock.now(2_000), 1_767_600_000);
        assert_eq!(clock.now(63_999), 1_767_600_061);
    }
}
