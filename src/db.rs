use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::warn;

use crate::classify::Tolerances;
use crate::codec::Level;
use crate::job::error::ReportError;
use crate::job::types::{Classroom, ReportRecord, ReportStatus, Roster, Student};

pub const PRIMARY_TOLERANCE_SETTING: &str = "LATE_TOLERANCE_MINUTES_PRIMARY";
pub const SECONDARY_TOLERANCE_SETTING: &str = "LATE_TOLERANCE_MINUTES_SECONDARY";

/// Source of truth for report records.
pub trait ReportStore {
    fn find_report(&self, combination_key: &str) -> Result<Option<ReportRecord>, ReportError>;
    fn insert_report(&self, record: &ReportRecord) -> Result<(), ReportError>;
    fn update_status(
        &self,
        combination_key: &str,
        status: ReportStatus,
        artifact_id: Option<&str>,
    ) -> Result<(), ReportError>;
}

pub trait SettingsSource {
    fn load_tolerances(&self) -> Result<Tolerances, ReportError>;
}

pub trait RosterSource {
    /// Classrooms and students of one education level.
    fn load_roster(&self, level: Level) -> Result<Roster, ReportError>;
}

pub struct SqliteStore {
    conn: Connection,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<SqliteStore> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join("reports.sqlite3");
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_reports(
            combination_key TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            artifact_id TEXT,
            generated_at TEXT NOT NULL,
            requester_role TEXT NOT NULL,
            requester_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_settings(
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            level TEXT NOT NULL,
            grade INTEGER NOT NULL,
            section TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_level ON classrooms(level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_classroom ON students(classroom_id)",
        [],
    )?;

    Ok(SqliteStore { conn })
}

impl SqliteStore {
    /// Releases the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> anyhow::Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("failed to close report database")
    }

    pub fn put_setting(&self, name: &str, value: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO system_settings(name, value) VALUES(?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            (name, value),
        )?;
        Ok(())
    }

    pub fn upsert_classroom(&self, classroom: &Classroom) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO classrooms(id, level, grade, section) VALUES(?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               level = excluded.level,
               grade = excluded.grade,
               section = excluded.section",
            (
                &classroom.id,
                classroom.level.code().to_string(),
                classroom.grade,
                classroom.section.to_string(),
            ),
        )?;
        Ok(())
    }

    pub fn upsert_student(&self, student: &Student) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO students(id, classroom_id) VALUES(?, ?)
             ON CONFLICT(id) DO UPDATE SET classroom_id = excluded.classroom_id",
            (&student.id, &student.classroom_id),
        )?;
        Ok(())
    }
}

impl ReportStore for SqliteStore {
    fn find_report(&self, combination_key: &str) -> Result<Option<ReportRecord>, ReportError> {
        let row = self
            .conn
            .query_row(
                "SELECT combination_key, status, artifact_id, generated_at,
                        requester_role, requester_id
                 FROM attendance_reports
                 WHERE combination_key = ?
                 LIMIT 1",
                [combination_key],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((key, status, artifact_id, generated_at, requester_role, requester_id)) = row
        else {
            return Ok(None);
        };
        let status = ReportStatus::from_code(&status).ok_or_else(|| {
            ReportError::TransientStore(format!("report {} has unknown status {:?}", key, status))
        })?;
        Ok(Some(ReportRecord {
            combination_key: key,
            status,
            artifact_id,
            generated_at,
            requester_role,
            requester_id,
        }))
    }

    fn insert_report(&self, record: &ReportRecord) -> Result<(), ReportError> {
        self.conn.execute(
            "INSERT INTO attendance_reports(
                combination_key, status, artifact_id, generated_at, requester_role, requester_id
             ) VALUES(?, ?, ?, ?, ?, ?)",
            (
                &record.combination_key,
                record.status.code(),
                &record.artifact_id,
                &record.generated_at,
                &record.requester_role,
                &record.requester_id,
            ),
        )?;
        Ok(())
    }

    fn update_status(
        &self,
        combination_key: &str,
        status: ReportStatus,
        artifact_id: Option<&str>,
    ) -> Result<(), ReportError> {
        let changed = self.conn.execute(
            "UPDATE attendance_reports SET status = ?, artifact_id = ? WHERE combination_key = ?",
            (status.code(), artifact_id, combination_key),
        )?;
        if changed == 0 {
            return Err(ReportError::NotFound(format!(
                "report {} not found",
                combination_key
            )));
        }
        Ok(())
    }
}

fn parse_minutes(name: &str, raw: Option<String>, default: i64) -> i64 {
    let Some(raw) = raw else {
        warn!("{name} not configured, using default: {default}");
        return default;
    };
    raw.trim().parse::<i64>().unwrap_or_else(|e| {
        warn!("Invalid {name} value {raw:?}: {e}, using default: {default}");
        default
    })
}

impl SettingsSource for SqliteStore {
    fn load_tolerances(&self) -> Result<Tolerances, ReportError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM system_settings WHERE name IN (?, ?)")?;
        let rows = stmt
            .query_map([PRIMARY_TOLERANCE_SETTING, SECONDARY_TOLERANCE_SETTING], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut primary = None;
        let mut secondary = None;
        for (name, value) in rows {
            if name == PRIMARY_TOLERANCE_SETTING {
                primary = Some(value);
            } else if name == SECONDARY_TOLERANCE_SETTING {
                secondary = Some(value);
            }
        }
        let defaults = Tolerances::default();
        Ok(Tolerances {
            primary_minutes: parse_minutes(
                PRIMARY_TOLERANCE_SETTING,
                primary,
                defaults.primary_minutes,
            ),
            secondary_minutes: parse_minutes(
                SECONDARY_TOLERANCE_SETTING,
                secondary,
                defaults.secondary_minutes,
            ),
        })
    }
}

impl RosterSource for SqliteStore {
    fn load_roster(&self, level: Level) -> Result<Roster, ReportError> {
        let level_code = level.code().to_string();

        let mut stmt = self.conn.prepare(
            "SELECT id, grade, section FROM classrooms WHERE level = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([&level_code], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut classrooms = Vec::with_capacity(rows.len());
        for (id, grade, section) in rows {
            let section_char = section.trim().chars().next();
            let (Ok(grade), Some(section)) = (u8::try_from(grade), section_char) else {
                warn!(classroom = %id, grade, section = %section, "skipping malformed classroom");
                continue;
            };
            classrooms.push(Classroom {
                id,
                level,
                grade,
                section,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.classroom_id
             FROM students s
             JOIN classrooms c ON c.id = s.classroom_id
             WHERE c.level = ?
             ORDER BY s.id",
        )?;
        let students = stmt
            .query_map([&level_code], |r| {
                Ok(Student {
                    id: r.get(0)?,
                    classroom_id: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Roster {
            classrooms,
            students,
        })
    }
}
