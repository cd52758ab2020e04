use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;

use crate::calendar::{eligible_days, CutoffHours};
use crate::classify::{classify, AttendanceState};
use crate::codec::{ClassroomSelector, GradeFilter, ReportKind, ReportRequest, TimeRange};
use crate::documents::{parse_daily_entries, DayRecord, StudentAttendanceMonthly};
use crate::job::error::ReportError;
use crate::job::types::{Classroom, Roster};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateCounts {
    pub on_time: u32,
    pub late: u32,
    pub absent: u32,
}

impl StateCounts {
    fn record(&mut self, state: AttendanceState) {
        match state {
            AttendanceState::OnTime => self.on_time += 1,
            AttendanceState::Late => self.late += 1,
            AttendanceState::Absent => self.absent += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomCounts<C> {
    pub total_students: usize,
    pub counts: BTreeMap<u32, C>,
}

pub type DayCounts = BTreeMap<u32, StateCounts>;

/// Report body keyed by classroom id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AggregatedReport {
    ByDay(BTreeMap<String, ClassroomCounts<DayCounts>>),
    ByMonth(BTreeMap<String, ClassroomCounts<StateCounts>>),
}

impl AggregatedReport {
    pub fn classroom_count(&self) -> usize {
        match self {
            AggregatedReport::ByDay(m) => m.len(),
            AggregatedReport::ByMonth(m) => m.len(),
        }
    }
}

/// Inputs that are fixed for one generation run.
#[derive(Debug, Clone, Copy)]
pub struct AggregateContext {
    pub tolerance_seconds: i64,
    pub now: NaiveDateTime,
    pub cutoffs: CutoffHours,
}

pub fn months_in_range(range: &TimeRange) -> RangeInclusive<u32> {
    range.from_month..=range.to_month
}

/// Grade collections that have to be read for `selector`.
pub fn grades_to_query(selector: &ClassroomSelector) -> Vec<u8> {
    match selector.grade {
        GradeFilter::All => (1..=selector.level.max_grade()).collect(),
        GradeFilter::Grade(g) => vec![g],
    }
}

pub fn filter_classrooms<'a>(
    selector: &ClassroomSelector,
    classrooms: &'a [Classroom],
) -> Vec<&'a Classroom> {
    classrooms
        .iter()
        .filter(|c| {
            c.level == selector.level
                && selector.grade.matches(c.grade)
                && selector.section.matches(c.section)
        })
        .collect()
}

/// Day bounds only restrict the first and last month of the range.
fn within_day_bounds(range: &TimeRange, month: u32, day: u32) -> bool {
    if month == range.from_month && range.from_day.is_some_and(|from| day < from) {
        return false;
    }
    if month == range.to_month && range.to_day.is_some_and(|to| day > to) {
        return false;
    }
    true
}

fn students_per_classroom(roster: &Roster) -> HashMap<&str, usize> {
    let mut by_classroom: HashMap<&str, HashSet<&str>> = HashMap::new();
    for s in &roster.students {
        by_classroom
            .entry(s.classroom_id.as_str())
            .or_default()
            .insert(s.id.as_str());
    }
    by_classroom
        .into_iter()
        .map(|(k, v)| (k, v.len()))
        .collect()
}

fn parse_row(row: &StudentAttendanceMonthly) -> Result<BTreeMap<u32, DayRecord>, ReportError> {
    parse_daily_entries(&row.daily_entries).map_err(|e| {
        ReportError::validation(format!(
            "attendance of student {} for month {} is malformed: {}",
            row.student_id, row.month, e
        ))
    })
}

/// Builds the report for `request`.
///
/// Cells are created first from the calendar and the request filters, then
/// attendance rows are folded into them. Rows for unknown students, classrooms
/// outside the selection or days without a cell are ignored.
pub fn aggregate(
    request: &ReportRequest,
    roster: &Roster,
    rows: &[StudentAttendanceMonthly],
    ctx: &AggregateContext,
) -> Result<AggregatedReport, ReportError> {
    let selected = filter_classrooms(&request.classrooms, &roster.classrooms);
    let totals = students_per_classroom(roster);
    let classroom_of: HashMap<&str, &str> = roster
        .students
        .iter()
        .map(|s| (s.id.as_str(), s.classroom_id.as_str()))
        .collect();

    match request.kind {
        ReportKind::ByDay => {
            aggregate_by_day(request, &selected, &totals, &classroom_of, rows, ctx)
                .map(AggregatedReport::ByDay)
        }
        ReportKind::ByMonth => {
            aggregate_by_month(request, &selected, &totals, &classroom_of, rows, ctx)
                .map(AggregatedReport::ByMonth)
        }
    }
}

fn aggregate_by_day(
    request: &ReportRequest,
    selected: &[&Classroom],
    totals: &HashMap<&str, usize>,
    classroom_of: &HashMap<&str, &str>,
    rows: &[StudentAttendanceMonthly],
    ctx: &AggregateContext,
) -> Result<BTreeMap<String, ClassroomCounts<DayCounts>>, ReportError> {
    let range = &request.range;
    let level = request.classrooms.level;

    let mut template: BTreeMap<u32, DayCounts> = BTreeMap::new();
    for month in months_in_range(range) {
        let days = eligible_days(month, &ctx.now, level, &ctx.cutoffs)
            .into_iter()
            .filter(|d| within_day_bounds(range, month, d.day))
            .map(|d| (d.day, StateCounts::default()))
            .collect();
        template.insert(month, days);
    }

    let mut report: BTreeMap<String, ClassroomCounts<DayCounts>> = selected
        .iter()
        .map(|c| {
            (
                c.id.clone(),
                ClassroomCounts {
                    total_students: totals.get(c.id.as_str()).copied().unwrap_or(0),
                    counts: template.clone(),
                },
            )
        })
        .collect();

    for row in rows {
        let Some(classroom_id) = classroom_of.get(row.student_id.as_str()) else {
            continue;
        };
        let Some(entry) = report.get_mut(*classroom_id) else {
            continue;
        };
        let Some(month_cells) = entry.counts.get_mut(&row.month) else {
            continue;
        };
        for (day, record) in parse_row(row)? {
            if let Some(cell) = month_cells.get_mut(&day) {
                cell.record(classify(record.entry.as_ref(), ctx.tolerance_seconds));
            }
        }
    }
    Ok(report)
}

fn aggregate_by_month(
    request: &ReportRequest,
    selected: &[&Classroom],
    totals: &HashMap<&str, usize>,
    classroom_of: &HashMap<&str, &str>,
    rows: &[StudentAttendanceMonthly],
    ctx: &AggregateContext,
) -> Result<BTreeMap<String, ClassroomCounts<StateCounts>>, ReportError> {
    let range = &request.range;
    let template: BTreeMap<u32, StateCounts> = months_in_range(range)
        .map(|m| (m, StateCounts::default()))
        .collect();

    let mut report: BTreeMap<String, ClassroomCounts<StateCounts>> = selected
        .iter()
        .map(|c| {
            (
                c.id.clone(),
                ClassroomCounts {
                    total_students: totals.get(c.id.as_str()).copied().unwrap_or(0),
                    counts: template.clone(),
                },
            )
        })
        .collect();

    for row in rows {
        let Some(classroom_id) = classroom_of.get(row.student_id.as_str()) else {
            continue;
        };
        let Some(entry) = report.get_mut(*classroom_id) else {
            continue;
        };
        let Some(cell) = entry.counts.get_mut(&row.month) else {
            continue;
        };
        for (day, record) in parse_row(row)? {
            if !within_day_bounds(range, row.month, day) {
                continue;
            }
            cell.record(classify(record.entry.as_ref(), ctx.tolerance_seconds));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Level, SectionFilter};
    use crate::job::types::Student;
    use chrono::NaiveDate;

    fn ctx(tolerance_minutes: i64) -> AggregateContext {
        AggregateContext {
            tolerance_seconds: tolerance_minutes * 60,
            now: NaiveDate::from_ymd_opt(2025, 12, 1)
                .and_then(|d| d.and_hms_opt(8, 0, 0))
                .expect("timestamp"),
            cutoffs: CutoffHours::default(),
        }
    }

    fn classroom(id: &str, level: Level, grade: u8, section: char) -> Classroom {
        Classroom {
            id: id.to_string(),
            level,
            grade,
            section,
        }
    }

    fn student(id: &str, classroom_id: &str) -> Student {
        Student {
            id: id.to_string(),
            classroom_id: classroom_id.to_string(),
        }
    }

    fn row(student_id: &str, month: u32, daily: &str) -> StudentAttendanceMonthly {
        StudentAttendanceMonthly {
            student_id: student_id.to_string(),
            month,
            daily_entries: daily.to_string(),
        }
    }

    fn sample_roster() -> Roster {
        Roster {
            classrooms: vec![
                classroom("P4A", Level::Primary, 4, 'A'),
                classroom("P4B", Level::Primary, 4, 'B'),
                classroom("P5A", Level::Primary, 5, 'A'),
            ],
            students: vec![
                student("ana", "P4A"),
                student("beto", "P4A"),
                student("carla", "P4B"),
                student("dario", "P5A"),
            ],
        }
    }

    #[test]
    fn by_day_counts_one_on_time_and_one_absent() {
        let request = decode("D3A6BP4A").expect("decode");
        let rows = vec![
            row("ana", 3, r#"{"10": {"entry": {"offsetSeconds": 180}}}"#),
            row("beto", 3, r#"{"10": {"entry": {"offsetSeconds": null}}}"#),
        ];
        let report = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect("aggregate");
        let AggregatedReport::ByDay(by_class) = report else {
            panic!("expected by-day report");
        };
        assert_eq!(by_class.keys().collect::<Vec<_>>(), vec!["P4A"]);
        let p4a = &by_class["P4A"];
        assert_eq!(p4a.total_students, 2);
        assert_eq!(
            p4a.counts[&3][&10],
            StateCounts {
                on_time: 1,
                late: 0,
                absent: 1
            }
        );
    }

    #[test]
    fn by_day_cells_follow_calendar_and_bounds() {
        let request = decode("D3A6BP4A").expect("decode");
        let report = aggregate(&request, &sample_roster(), &[], &ctx(5)).expect("aggregate");
        let AggregatedReport::ByDay(by_class) = report else {
            panic!("expected by-day report");
        };
        let counts = &by_class["P4A"].counts;
        assert_eq!(counts.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        // March from the 10th: 10-14, 17-21, 24-28, 31.
        assert_eq!(counts[&3].len(), 16);
        assert_eq!(counts[&3].keys().next(), Some(&10));
        // June up to the 11th: 2-6, 9-11.
        assert_eq!(
            counts[&6].keys().copied().collect::<Vec<_>>(),
            vec![2, 3, 4, 5, 6, 9, 10, 11]
        );
        // April is a full month: 22 weekdays in April 2025.
        assert_eq!(counts[&4].len(), 22);
        assert!(counts.values().flat_map(|m| m.values()).all(|c| *c == StateCounts::default()));
    }

    #[test]
    fn by_day_ignores_weekends_and_days_out_of_bounds() {
        let request = decode("D3A6BP4A").expect("decode");
        let rows = vec![row(
            "ana",
            3,
            r#"{"8": {"entry": {"offsetSeconds": 0}},
                "9": {"entry": {"offsetSeconds": 0}},
                "7": {"entry": {"offsetSeconds": 0}},
                "11": {"entry": {"offsetSeconds": 400}}}"#,
        )];
        let report = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect("aggregate");
        let AggregatedReport::ByDay(by_class) = report else {
            panic!("expected by-day report");
        };
        let march = &by_class["P4A"].counts[&3];
        assert!(!march.contains_key(&8));
        assert!(!march.contains_key(&7));
        assert_eq!(march[&11].late, 1);
        let total: u32 = march.values().map(|c| c.on_time + c.late + c.absent).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn future_months_have_no_day_cells() {
        let request = decode("D3A6BP4A").expect("decode");
        let mut early = ctx(5);
        early.now = NaiveDate::from_ymd_opt(2025, 4, 2)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .expect("timestamp");
        let report = aggregate(&request, &sample_roster(), &[], &early).expect("aggregate");
        let AggregatedReport::ByDay(by_class) = report else {
            panic!("expected by-day report");
        };
        let counts = &by_class["P4A"].counts;
        assert!(counts[&5].is_empty());
        assert!(counts[&6].is_empty());
        // 1 April only; the 2nd is still open at 09:00.
        assert_eq!(counts[&4].keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn by_month_counts_all_days_of_selected_classrooms() {
        let request = decode("M35PTT").expect("decode");
        let rows = vec![
            row(
                "ana",
                3,
                r#"{"3": {"entry": {"offsetSeconds": 10}},
                    "4": {"entry": {"offsetSeconds": 700}},
                    "5": {}}"#,
            ),
            row("carla", 5, r#"{"1": {"entry": {"offsetSeconds": 301}}}"#),
            row("dario", 4, r#"{"2": {"entry": {"offsetSeconds": -60}}}"#),
            row("ghost", 4, r#"{"2": {"entry": {"offsetSeconds": 0}}}"#),
            row("ana", 7, r#"{"2": {"entry": {"offsetSeconds": 0}}}"#),
        ];
        let report = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect("aggregate");
        let AggregatedReport::ByMonth(by_class) = report else {
            panic!("expected by-month report");
        };
        assert_eq!(by_class.len(), 3);
        assert_eq!(
            by_class["P4A"].counts[&3],
            StateCounts {
                on_time: 1,
                late: 1,
                absent: 1
            }
        );
        assert_eq!(by_class["P4A"].counts[&4], StateCounts::default());
        assert_eq!(by_class["P4B"].counts[&5].late, 1);
        assert_eq!(by_class["P5A"].counts[&4].on_time, 1);
        assert!(!by_class["P4A"].counts.contains_key(&7));
    }

    #[test]
    fn section_filter_and_empty_roster() {
        let mut request = decode("M35PTB").expect("decode");
        let report = aggregate(&request, &sample_roster(), &[], &ctx(5)).expect("aggregate");
        assert_eq!(report.classroom_count(), 1);

        request.classrooms.section = SectionFilter::All;
        let empty = aggregate(&request, &Roster::default(), &[], &ctx(5)).expect("aggregate");
        assert_eq!(empty.classroom_count(), 0);
        assert_eq!(serde_json::to_string(&empty).expect("json"), "{}");
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let request = decode("M35PTT").expect("decode");
        let rows = vec![row("ana", 3, "{broken")];
        let err = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect_err("malformed");
        assert!(matches!(err, ReportError::Validation(m) if m.contains("ana")));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let request = decode("D3A6BP4T").expect("decode");
        let rows = vec![
            row("carla", 3, r#"{"12": {"entry": {"offsetSeconds": 20}}}"#),
            row("ana", 4, r#"{"1": {"entry": {"offsetSeconds": 999}}, "2": {"entry": null}}"#),
        ];
        let a = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect("aggregate");
        let b = aggregate(&request, &sample_roster(), &rows, &ctx(5)).expect("aggregate");
        assert_eq!(
            serde_json::to_vec(&a).expect("json"),
            serde_json::to_vec(&b).expect("json")
        );
    }

    #[test]
    fn grades_follow_level() {
        let all_primary = decode("M35PTT").expect("decode");
        assert_eq!(grades_to_query(&all_primary.classrooms), vec![1, 2, 3, 4, 5, 6]);
        let all_secondary = decode("M35STT").expect("decode");
        assert_eq!(grades_to_query(&all_secondary.classrooms), vec![1, 2, 3, 4, 5]);
        let one = decode("M35S3T").expect("decode");
        assert_eq!(grades_to_query(&one.classrooms), vec![3]);
    }
}
