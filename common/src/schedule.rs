use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use log::info;
use serde::{Serialize, Serializer};

use crate::error::CommandError;

pub const MAX_SCHEDULES: usize = 10;

const NEVER_FIRED: u16 = 9999;

pub fn is_valid_time(time: u16) -> bool {
    time <= 2359 && time % 100 <= 59
}

pub fn parse_time(value: &str) -> Result<u16, CommandError> {
    let digits: String = value.trim().chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CommandError::InvalidTime(0));
    }
    let time = digits
        .parse::<u16>()
        .map_err(|_| CommandError::InvalidTime(0))?;
    if !is_valid_time(time) {
        return Err(CommandError::InvalidTime(time));
    }
    Ok(time)
}

pub fn parse_action(value: &str) -> Result<bool, CommandError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("on") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("off") || value == "0" {
        Ok(false)
    } else {
        Err(CommandError::InvalidAction)
    }
}

pub fn time_of_day(now: &DateTime<FixedOffset>) -> u16 {
    (now.hour() * 100 + now.minute()) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time: u16,
    pub action: bool,
}

impl ScheduleEntry {
    pub fn action_str(&self) -> &'static str {
        if self.action {
            "ON"
        } else {
            "OFF"
        }
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02} -> {}",
            self.time / 100,
            self.time % 100,
            self.action_str()
        )
    }
}

impl Serialize for ScheduleEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ScheduleEntry", 2)?;
        state.serialize_field(
            "time",
            &format!("{:02}:{:02}", self.time / 100, self.time % 100),
        )?;
        state.serialize_field("action", self.action_str())?;
        state.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleTable {
    entries: Vec<ScheduleEntry>,
}

impl ScheduleTable {
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, time: u16, action: bool) -> Result<(), CommandError> {
        if !is_valid_time(time) {
            return Err(CommandError::InvalidTime(time));
        }
        if self.entries.len() >= MAX_SCHEDULES {
            return Err(CommandError::ScheduleFull);
        }
        self.entries.push(ScheduleEntry { time, action });
        Ok(())
    }

    pub fn remove(&mut self, index: i32) -> Result<(), CommandError> {
        if index == -1 {
            self.entries.clear();
            return Ok(());
        }
        let slot = usize::try_from(index)
            .ok()
            .filter(|slot| *slot < self.entries.len())
            .ok_or(CommandError::InvalidIndex(index))?;
        self.entries.remove(slot);
        Ok(())
    }

    pub(crate) fn from_slots(slots: &[ScheduleEntry]) -> Self {
        Self {
            entries: slots.iter().take(MAX_SCHEDULES).copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FiredLatch {
    day: i32,
    time: u16,
}

#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    latch: FiredLatch,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self {
            latch: FiredLatch {
                day: i32::MIN,
                time: NEVER_FIRED,
            },
        }
    }
}

impl ScheduleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &mut self,
        now: DateTime<FixedOffset>,
        schedules: &ScheduleTable,
    ) -> Option<ScheduleEntry> {
        let current = time_of_day(&now);
        let today = now.num_days_from_ce();

        let entry = schedules
            .entries()
            .iter()
            .find(|entry| entry.time == current)?;

        // Only the first match counts, and it stays latched for the rest of the local day.
        if self.latch.time == current && self.latch.day == today {
            return None;
        }

        self.latch = FiredLatch {
            day: today,
            time: current,
        };
        info!("schedule executed: {entry}");
        Some(*entry)
    }

    pub fn last_fired(&self) -> Option<u16> {
        (self.latch.time != NEVER_FIRED).then_some(self.latch.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn table(entries: &[(u16, bool)]) -> ScheduleTable {
        let mut table = ScheduleTable::default();
        for (time, action) in entries {
            table.add(*time, *action).unwrap();
        }
        table
    }

    #[test]
    fn validator_accepts_exactly_hhmm_values() {
        let accepted = (0..=9999u16).filter(|t| is_valid_time(*t)).count();

        assert_eq!(accepted, 24 * 60);
        assert!(is_valid_time(0));
        assert!(is_valid_time(2359));
        assert!(!is_valid_time(2400));
        assert!(!is_valid_time(2460));
        assert!(!is_valid_time(1260));
        assert!(!is_valid_time(9999));
    }

    #[test]
    fn parses_surface_time_and_action() {
        assert_eq!(parse_time("0730"), Ok(730));
        assert_eq!(parse_time("23:15"), Ok(2315));
        assert_eq!(parse_time("2460"), Err(CommandError::InvalidTime(2460)));
        assert!(parse_time("7h30").is_err());
        assert_eq!(parse_action("ON"), Ok(true));
        assert_eq!(parse_action("0"), Ok(false));
        assert_eq!(parse_action("maybe"), Err(CommandError::InvalidAction));
    }

    #[test]
    fn table_rejects_eleventh_entry() {
        let mut table = ScheduleTable::default();
        for minute in 0..10 {
            table.add(800 + minute, true).unwrap();
        }
        let before = table.clone();

        assert_eq!(table.add(900, false), Err(CommandError::ScheduleFull));
        assert_eq!(table, before);
        assert_eq!(table.len(), MAX_SCHEDULES);
    }

    #[test]
    fn invalid_time_leaves_table_unchanged() {
        let mut table = table(&[(700, true)]);

        assert_eq!(table.add(2400, true), Err(CommandError::InvalidTime(2400)));
        assert_eq!(table.entries(), &[ScheduleEntry { time: 700, action: true }]);
    }

    #[test]
    fn remove_compacts_in_order() {
        let mut table = table(&[(100, true), (200, false), (300, true), (400, false)]);

        table.remove(1).unwrap();
        let times: Vec<u16> = table.entries().iter().map(|entry| entry.time).collect();
        assert_eq!(times, vec![100, 300, 400]);

        assert_eq!(table.remove(3), Err(CommandError::InvalidIndex(3)));
        assert_eq!(table.remove(-2), Err(CommandError::InvalidIndex(-2)));

        table.remove(-1).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.remove(-1), Ok(()));
    }

    #[test]
    fn first_matching_entry_wins_and_fires_once() {
        let table = table(&[(730, true), (730, false)]);
        let mut engine = ScheduleEngine::new();

        assert_eq!(
            engine.check(fixed_time(5, 7, 29), &table),
            None
        );
        assert_eq!(
            engine.check(fixed_time(5, 7, 30), &table),
            Some(ScheduleEntry {
                time: 730,
                action: true
            })
        );
        assert_eq!(engine.check(fixed_time(5, 7, 30), &table), None);
        assert_eq!(engine.check(fixed_time(5, 7, 31), &table), None);
        // Clock stepped back into the same minute on the same day.
        assert_eq!(engine.check(fixed_time(5, 7, 30), &table), None);
        assert_eq!(engine.last_fired(), Some(730));
    }

    #[test]
    fn fires_again_on_the_next_day() {
        let table = table(&[(730, false)]);
        let mut engine = ScheduleEngine::new();

        assert!(engine.check(fixed_time(5, 7, 30), &table).is_some());
        assert!(engine.check(fixed_time(5, 12, 0), &table).is_none());
        assert_eq!(
            engine.check(fixed_time(6, 7, 30), &table),
            Some(ScheduleEntry {
                time: 730,
                action: false
            })
        );
    }

    #[test]
    fn another_firing_releases_the_latch() {
        let table = table(&[(730, true), (731, false)]);
        let mut engine = ScheduleEngine::new();

        assert!(engine.check(fixed_time(5, 7, 30), &table).is_some());
        assert!(engine.check(fixed_time(5, 7, 31), &table).is_some());
        assert_eq!(
            engine.check(fixed_time(5, 7, 30), &table),
            Some(ScheduleEntry {
                time: 730,
                action: true
            })
        );
    }

    #[test]
    fn entries_serialize_as_clock_labels() {
        let entry = ScheduleEntry {
            time: 5,
            action: true,
        };

        assert_eq!(entry.to_string(), "00:05 -> ON");
        assert_eq!(
            serde_json::to_value(entry).unwrap(),
            serde_json::json!({"time": "00:05", "action": "ON"})
        );
    }
}
