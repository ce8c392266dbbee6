use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid PD voltage {0}V")]
    InvalidVoltage(u8),
    #[error("invalid schedule time {0:04} (use HHMM, 0000-2359)")]
    InvalidTime(u16),
    #[error("schedule action must be 'on' or 'off'")]
    InvalidAction,
    #[error("schedule list full (max {max} entries)", max = crate::schedule::MAX_SCHEDULES)]
    ScheduleFull,
    #[error("invalid schedule index {0}")]
    InvalidIndex(i32),
    #[error("invalid {field} length (max {max} characters)")]
    InvalidLength { field: &'static str, max: usize },
}
