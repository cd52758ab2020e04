//! Monthly attendance documents.
//!
//! Each student has one document per month and grade collection. The day map is
//! stored as a JSON string keyed by day of month:
//! `{"10": {"entry": {"offsetSeconds": 180}, "exit": {"offsetSeconds": null}}}`.

use anyhow::Context;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::codec::Level;
use crate::job::error::ReportError;

#[derive(Debug, Clone, PartialEq)]
pub struct StudentAttendanceMonthly {
    pub student_id: String,
    pub month: u32,
    pub daily_entries: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMark {
    #[serde(default)]
    pub offset_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct DayRecord {
    #[serde(default)]
    pub entry: Option<EntryMark>,
    #[serde(default)]
    pub exit: Option<EntryMark>,
}

/// Parses the day map of a monthly document. A `null` day reads as a day
/// without any check-in.
pub fn parse_daily_entries(raw: &str) -> Result<BTreeMap<u32, DayRecord>, String> {
    let by_key: BTreeMap<String, Option<DayRecord>> =
        serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let mut out = BTreeMap::new();
    for (key, record) in by_key {
        let day = key
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("day key {:?} is not a number", key))?;
        out.insert(day, record.unwrap_or_default());
    }
    Ok(out)
}

pub fn collection_name(prefix: &str, level: Level, grade: u8) -> String {
    format!("{}_{}_{}", prefix, level.code(), grade)
}

pub trait AttendanceSource: Sync {
    /// Every document of `collection` whose month is in `months`.
    fn find_monthly(
        &self,
        collection: &str,
        months: &[u32],
    ) -> Result<Vec<StudentAttendanceMonthly>, ReportError>;
}

/// Document store kept in its own SQLite file. Every query opens a fresh
/// connection so grade collections can be read from several threads.
pub struct SqliteDocumentStore {
    path: PathBuf,
}

impl SqliteDocumentStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS attendance_documents(
                collection TEXT NOT NULL,
                student_id TEXT NOT NULL,
                month INTEGER NOT NULL,
                daily_entries TEXT NOT NULL,
                PRIMARY KEY(collection, student_id, month)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attendance_documents_month
             ON attendance_documents(collection, month)",
            [],
        )?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn upsert_monthly(
        &self,
        collection: &str,
        doc: &StudentAttendanceMonthly,
    ) -> anyhow::Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT INTO attendance_documents(collection, student_id, month, daily_entries)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(collection, student_id, month) DO UPDATE SET
               daily_entries = excluded.daily_entries",
            (collection, &doc.student_id, doc.month, &doc.daily_entries),
        )?;
        Ok(())
    }
}

impl AttendanceSource for SqliteDocumentStore {
    fn find_monthly(
        &self,
        collection: &str,
        months: &[u32],
    ) -> Result<Vec<StudentAttendanceMonthly>, ReportError> {
        if months.is_empty() {
            return Ok(Vec::new());
        }
        let conn = Connection::open(&self.path)?;
        let placeholders = std::iter::repeat("?")
            .take(months.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT student_id, month, daily_entries
             FROM attendance_documents
             WHERE collection = ? AND month IN ({})
             ORDER BY student_id, month",
            placeholders
        );
        let mut bind_values: Vec<Value> = Vec::with_capacity(months.len() + 1);
        bind_values.push(Value::Text(collection.to_string()));
        for m in months {
            bind_values.push(Value::Integer(i64::from(*m)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |r| {
                Ok(StudentAttendanceMonthly {
                    student_id: r.get(0)?,
                    month: r.get(1)?,
                    daily_entries: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
