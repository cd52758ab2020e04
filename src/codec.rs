//! Combination keys.
//!
//! A report request is identified by a short positional string, for example
//! `D3A6BP4A` (by-day, 03/10 to 06/11, primary, grade 4, section A) or
//! `M36STT` (by-month, March to June, every secondary classroom). Every field
//! is one character.
//! Numbers 1-9 are digits, 10-31 are the letters `A`-`V`.

use serde::Serialize;
use thiserror::Error;

pub const BY_DAY_MIN_LEN: usize = 8;
pub const BY_MONTH_MIN_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReportKind {
    ByDay,
    ByMonth,
}

impl ReportKind {
    pub fn code(self) -> char {
        match self {
            ReportKind::ByDay => 'D',
            ReportKind::ByMonth => 'M',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'D' => Some(ReportKind::ByDay),
            'M' => Some(ReportKind::ByMonth),
            _ => None,
        }
    }

    pub fn min_len(self) -> usize {
        match self {
            ReportKind::ByDay => BY_DAY_MIN_LEN,
            ReportKind::ByMonth => BY_MONTH_MIN_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Level {
    Primary,
    Secondary,
}

impl Level {
    pub fn code(self) -> char {
        match self {
            Level::Primary => 'P',
            Level::Secondary => 'S',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'P' => Some(Level::Primary),
            'S' => Some(Level::Secondary),
            _ => None,
        }
    }

    /// Highest grade taught at this level.
    pub fn max_grade(self) -> u8 {
        match self {
            Level::Primary => 6,
            Level::Secondary => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GradeFilter {
    All,
    Grade(u8),
}

impl GradeFilter {
    pub fn matches(self, grade: u8) -> bool {
        match self {
            GradeFilter::All => true,
            GradeFilter::Grade(g) => g == grade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SectionFilter {
    All,
    Section(char),
}

impl SectionFilter {
    pub fn matches(self, section: char) -> bool {
        match self {
            SectionFilter::All => true,
            SectionFilter::Section(s) => s == section,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub from_month: u32,
    pub from_day: Option<u32>,
    pub to_month: u32,
    pub to_day: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassroomSelector {
    pub level: Level,
    pub grade: GradeFilter,
    pub section: SectionFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportRequest {
    pub kind: ReportKind,
    pub range: TimeRange,
    pub classrooms: ClassroomSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("combination is empty")]
    Empty,
    #[error("unknown report kind {0:?}")]
    UnknownKind(char),
    #[error("combination {len} chars long, {kind:?} needs at least {min}")]
    TooShort {
        kind: ReportKind,
        len: usize,
        min: usize,
    },
    #[error("invalid character {ch:?} for {field}")]
    InvalidChar { field: &'static str, ch: char },
    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("range starts in month {from} after it ends in month {to}")]
    InvertedRange { from: u32, to: u32 },
}

/// Maps `1`-`9` to 1..=9 and `A`-`V` (either case) to 10..=31.
pub fn char_to_number(c: char) -> Option<u32> {
    match c {
        '1'..='9' => c.to_digit(10),
        _ => {
            let up = c.to_ascii_uppercase();
            if ('A'..='V').contains(&up) {
                Some(10 + (up as u32 - 'A' as u32))
            } else {
                None
            }
        }
    }
}

pub fn number_to_char(n: u32) -> Option<char> {
    match n {
        1..=9 => char::from_digit(n, 10),
        10..=31 => char::from_u32('A' as u32 + (n - 10)),
        _ => None,
    }
}

fn decode_number(
    c: char,
    field: &'static str,
    bounds: std::ops::RangeInclusive<u32>,
) -> Result<u32, DecodeError> {
    let n = char_to_number(c).ok_or(DecodeError::InvalidChar { field, ch: c })?;
    if !bounds.contains(&n) {
        return Err(DecodeError::OutOfRange { field, value: n });
    }
    Ok(n)
}

fn decode_level(c: char) -> Result<Level, DecodeError> {
    Level::from_code(c).ok_or(DecodeError::InvalidChar {
        field: "level",
        ch: c,
    })
}

fn decode_grade(c: char) -> Result<GradeFilter, DecodeError> {
    if c == 'T' {
        return Ok(GradeFilter::All);
    }
    match c.to_digit(10) {
        Some(g @ 1..=6) => Ok(GradeFilter::Grade(g as u8)),
        Some(g) => Err(DecodeError::OutOfRange {
            field: "grade",
            value: g,
        }),
        None => Err(DecodeError::InvalidChar {
            field: "grade",
            ch: c,
        }),
    }
}

fn decode_section(c: char) -> Result<SectionFilter, DecodeError> {
    match c {
        'T' => Ok(SectionFilter::All),
        'A'..='Z' => Ok(SectionFilter::Section(c)),
        _ => Err(DecodeError::InvalidChar {
            field: "section",
            ch: c,
        }),
    }
}

pub fn decode(combination: &str) -> Result<ReportRequest, DecodeError> {
    let chars: Vec<char> = combination.chars().collect();
    let Some(&first) = chars.first() else {
        return Err(DecodeError::Empty);
    };
    let kind = ReportKind::from_code(first).ok_or(DecodeError::UnknownKind(first))?;
    if chars.len() < kind.min_len() {
        return Err(DecodeError::TooShort {
            kind,
            len: chars.len(),
            min: kind.min_len(),
        });
    }

    let (range, rest) = match kind {
        ReportKind::ByDay => {
            let from_month = decode_number(chars[1], "month from", 1..=12)?;
            let from_day = decode_number(chars[2], "day from", 1..=31)?;
            let to_month = decode_number(chars[3], "month to", 1..=12)?;
            let to_day = decode_number(chars[4], "day to", 1..=31)?;
            (
                TimeRange {
                    from_month,
                    from_day: Some(from_day),
                    to_month,
                    to_day: Some(to_day),
                },
                &chars[5..],
            )
        }
        ReportKind::ByMonth => {
            let from_month = decode_number(chars[1], "month from", 1..=12)?;
            let to_month = decode_number(chars[2], "month to", 1..=12)?;
            (
                TimeRange {
                    from_month,
                    from_day: None,
                    to_month,
                    to_day: None,
                },
                &chars[3..],
            )
        }
    };
    if range.from_month > range.to_month {
        return Err(DecodeError::InvertedRange {
            from: range.from_month,
            to: range.to_month,
        });
    }

    let classrooms = ClassroomSelector {
        level: decode_level(rest[0])?,
        grade: decode_grade(rest[1])?,
        section: decode_section(rest[2])?,
    };

    Ok(ReportRequest {
        kind,
        range,
        classrooms,
    })
}

/// Inverse of [`decode`] for well-formed requests. Returns `None` when a field
/// cannot be represented by a single character.
pub fn encode(request: &ReportRequest) -> Option<String> {
    let mut out = String::with_capacity(BY_DAY_MIN_LEN);
    out.push(request.kind.code());
    let r = &request.range;
    match request.kind {
        ReportKind::ByDay => {
            out.push(number_to_char(r.from_month)?);
            out.push(number_to_char(r.from_day?)?);
            out.push(number_to_char(r.to_month)?);
            out.push(number_to_char(r.to_day?)?);
        }
        ReportKind::ByMonth => {
            out.push(number_to_char(r.from_month)?);
            out.push(number_to_char(r.to_month)?);
        }
    }
    let sel = &request.classrooms;
    out.push(sel.level.code());
    out.push(match sel.grade {
        GradeFilter::All => 'T',
        GradeFilter::Grade(g) => char::from_digit(u32::from(g), 10)?,
    });
    out.push(match sel.section {
        SectionFilter::All => 'T',
        SectionFilter::Section(s) => s,
    });
    Some(out)
}
