use chrono::{FixedOffset, NaiveDateTime, Utc};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};
use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::CutoffHours;
use crate::job::error::ReportError;

pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 12 * 60 * 60;
pub const MAX_CACHE_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for ReportError {
    fn from(e: ConfigError) -> Self {
        ReportError::Configuration(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub attendance_db: PathBuf,
    pub cache_replicas: Vec<PathBuf>,
    pub artifact_dir: PathBuf,
    pub artifact_folder: String,
    pub collection_prefix: String,
    pub cutoffs: CutoffHours,
    pub cache_ttl_seconds: u64,
    pub utc_offset_hours: i32,
    pub fixed_now: Option<NaiveDateTime>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace = PathBuf::from(
            lookup("REPORTS_WORKSPACE").unwrap_or_else(|| {
                info!("REPORTS_WORKSPACE not set, using default: ./workspace");
                "./workspace".to_string()
            }),
        );
        let attendance_db = lookup("REPORTS_ATTENDANCE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join("attendance.sqlite3"));
        let cache_replicas = match lookup("REPORTS_CACHE_REPLICAS") {
            Some(list) => {
                let paths: Vec<PathBuf> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
                if paths.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "REPORTS_CACHE_REPLICAS",
                        value: list,
                        reason: "no replica paths".to_string(),
                    });
                }
                paths
            }
            None => vec![workspace.join("cache.sqlite3")],
        };
        let artifact_dir = lookup("REPORTS_ARTIFACT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join("artifacts"));

        let defaults = CutoffHours::default();
        let cutoffs = CutoffHours {
            primary: parse_or(&lookup, "REPORTS_PRIMARY_CUTOFF_HOUR", defaults.primary)?,
            secondary: parse_or(&lookup, "REPORTS_SECONDARY_CUTOFF_HOUR", defaults.secondary)?,
        };
        for (key, hour) in [
            ("REPORTS_PRIMARY_CUTOFF_HOUR", cutoffs.primary),
            ("REPORTS_SECONDARY_CUTOFF_HOUR", cutoffs.secondary),
        ] {
            if hour > 23 {
                return Err(ConfigError::Invalid {
                    key,
                    value: hour.to_string(),
                    reason: "hour must be between 0 and 23".to_string(),
                });
            }
        }

        let utc_offset_hours: i32 = parse_or(&lookup, "REPORTS_UTC_OFFSET_HOURS", -5)?;
        if !(-12..=14).contains(&utc_offset_hours) {
            return Err(ConfigError::Invalid {
                key: "REPORTS_UTC_OFFSET_HOURS",
                value: utc_offset_hours.to_string(),
                reason: "offset out of range".to_string(),
            });
        }

        let cache_ttl_seconds: u64 = parse_or(
            &lookup,
            "REPORTS_CACHE_TTL_SECONDS",
            DEFAULT_CACHE_TTL_SECONDS,
        )?;
        if cache_ttl_seconds > MAX_CACHE_TTL_SECONDS {
            return Err(ConfigError::Invalid {
                key: "REPORTS_CACHE_TTL_SECONDS",
                value: cache_ttl_seconds.to_string(),
                reason: format!("ttl must not exceed {} seconds", MAX_CACHE_TTL_SECONDS),
            });
        }

        let fixed_now = match lookup("REPORTS_NOW") {
            Some(raw) => Some(
                NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S").map_err(|e| {
                    ConfigError::Invalid {
                        key: "REPORTS_NOW",
                        value: raw.clone(),
                        reason: e.to_string(),
                    }
                })?,
            ),
            None => None,
        };

        Ok(Self {
            workspace,
            attendance_db,
            cache_replicas,
            artifact_dir,
            artifact_folder: lookup("REPORTS_ARTIFACT_FOLDER")
                .unwrap_or_else(|| "reports".to_string()),
            collection_prefix: lookup("REPORTS_COLLECTION_PREFIX")
                .unwrap_or_else(|| "student_attendance".to_string()),
            cutoffs,
            cache_ttl_seconds,
            utc_offset_hours,
            fixed_now,
        })
    }

    /// Local wall-clock time of the school, or the pinned `REPORTS_NOW`.
    pub fn now(&self) -> NaiveDateTime {
        if let Some(fixed) = self.fixed_now {
            return fixed;
        }
        match FixedOffset::east_opt(self.utc_offset_hours * 3600) {
            Some(offset) => Utc::now().with_timezone(&offset).naive_local(),
            None => Utc::now().naive_utc(),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return Ok(default);
    };
    raw.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }
    })
}
