use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::Serialize;

use crate::codec::Level;

/// Hour of day after which the attendance of the current day is considered
/// closed, per education level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoffHours {
    pub primary: u32,
    pub secondary: u32,
}

impl Default for CutoffHours {
    fn default() -> Self {
        Self {
            primary: 22,
            secondary: 23,
        }
    }
}

impl CutoffHours {
    pub fn for_level(&self, level: Level) -> u32 {
        match level {
            Level::Primary => self.primary,
            Level::Secondary => self.secondary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessDay {
    pub day: u32,
    pub weekday: &'static str,
}

fn weekday_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => 0,
    }
}

/// Weekdays of `month` (in the year of `now`) that may carry closed attendance.
///
/// Future months yield nothing. In the current month only days before today
/// are returned, plus today once `now` has reached the level's cutoff hour.
pub fn eligible_days(
    month: u32,
    now: &NaiveDateTime,
    level: Level,
    cutoffs: &CutoffHours,
) -> Vec<BusinessDay> {
    let mut out = Vec::new();
    if !(1..=12).contains(&month) || month > now.month() {
        return out;
    }
    let year = now.year();
    let is_current = month == now.month();
    let today = now.day();
    let today_closed = now.hour() >= cutoffs.for_level(level);

    for day in 1..=days_in_month(year, month) {
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            continue;
        };
        let weekday = date.weekday();
        if matches!(weekday, Weekday::Sat | Weekday::Sun) {
            continue;
        }
        if is_current && (day > today || (day == today && !today_closed)) {
            continue;
        }
        out.push(BusinessDay {
            day,
            weekday: weekday_name(weekday),
        });
    }
    out
}
