use serde::Serialize;

use crate::codec::Level;
use crate::documents::EntryMark;

pub const DEFAULT_TOLERANCE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendanceState {
    OnTime,
    Late,
    Absent,
}

/// A check-in with no recorded offset counts as absent. Offsets up to and
/// including the tolerance are on time.
pub fn classify(entry: Option<&EntryMark>, tolerance_seconds: i64) -> AttendanceState {
    match entry.and_then(|e| e.offset_seconds) {
        None => AttendanceState::Absent,
        Some(offset) if offset > tolerance_seconds => AttendanceState::Late,
        Some(_) => AttendanceState::OnTime,
    }
}

/// Late tolerance per level, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tolerances {
    pub primary_minutes: i64,
    pub secondary_minutes: i64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            primary_minutes: DEFAULT_TOLERANCE_MINUTES,
            secondary_minutes: DEFAULT_TOLERANCE_MINUTES,
        }
    }
}

impl Tolerances {
    pub fn seconds_for(&self, level: Level) -> i64 {
        let minutes = match level {
            Level::Primary => self.primary_minutes,
            Level::Secondary => self.secondary_minutes,
        };
        minutes.saturating_mul(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(offset: Option<i64>) -> EntryMark {
        EntryMark {
            offset_seconds: offset,
        }
    }

    #[test]
    fn missing_or_null_entry_is_absent() {
        assert_eq!(classify(None, 300), AttendanceState::Absent);
        assert_eq!(classify(Some(&mark(None)), 300), AttendanceState::Absent);
    }

    #[test]
    fn tolerance_boundary() {
        assert_eq!(classify(Some(&mark(Some(300))), 300), AttendanceState::OnTime);
        assert_eq!(classify(Some(&mark(Some(301))), 300), AttendanceState::Late);
        assert_eq!(classify(Some(&mark(Some(-120))), 300), AttendanceState::OnTime);
        assert_eq!(classify(Some(&mark(Some(0))), 0), AttendanceState::OnTime);
    }

    #[test]
    fn tolerance_seconds_per_level() {
        let t = Tolerances {
            primary_minutes: 5,
            secondary_minutes: 10,
        };
        assert_eq!(t.seconds_for(Level::Primary), 300);
        assert_eq!(t.seconds_for(Level::Secondary), 600);
        assert_eq!(Tolerances::default().seconds_for(Level::Secondary), 300);
    }

    #[test]
    fn oversized_tolerance_saturates() {
        let t = Tolerances {
            primary_minutes: i64::MAX,
            secondary_minutes: i64::MIN,
        };
        assert_eq!(t.seconds_for(Level::Primary), i64::MAX);
        assert_eq!(t.seconds_for(Level::Secondary), i64::MIN);
        let late_arrival = mark(Some(i64::MAX - 1));
        assert_eq!(
            classify(Some(&late_arrival), t.seconds_for(Level::Primary)),
            AttendanceState::OnTime
        );
    }
}
