//! Report lifecycle.
//!
//! `NotFound -> Pending -> Available | Error`. The durable store decides whether
//! a key was already requested; the cache mirrors whatever the store holds.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info, warn};

use super::error::ReportError;
use super::types::{ReportPayload, ReportRecord, ReportStatus};
use crate::aggregate::{aggregate, grades_to_query, months_in_range, AggregateContext};
use crate::artifact::ArtifactStore;
use crate::cache::{CachePool, REPORTS_GROUP};
use crate::calendar::CutoffHours;
use crate::codec::{self, ReportRequest};
use crate::config::Config;
use crate::db::{ReportStore, RosterSource, SettingsSource};
use crate::documents::{collection_name, AttendanceSource, StudentAttendanceMonthly};

/// External stores a run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub reports: &'a dyn ReportStore,
    pub settings: &'a dyn SettingsSource,
    pub roster: &'a dyn RosterSource,
    pub attendance: &'a dyn AttendanceSource,
    pub artifacts: &'a dyn ArtifactStore,
    pub cache: &'a CachePool,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub collection_prefix: String,
    pub artifact_folder: String,
    pub cache_ttl_seconds: u64,
    pub cutoffs: CutoffHours,
    pub now: NaiveDateTime,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            collection_prefix: config.collection_prefix.clone(),
            artifact_folder: config.artifact_folder.clone(),
            cache_ttl_seconds: config.cache_ttl_seconds,
            cutoffs: config.cutoffs,
            now: config.now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RunOutcome {
    /// The key was requested before; nothing was regenerated.
    AlreadyExists { record: ReportRecord },
    #[serde(rename_all = "camelCase")]
    Generated {
        record: ReportRecord,
        classroom_count: usize,
    },
}

pub struct ReportJob<'a> {
    stores: Collaborators<'a>,
    settings: JobSettings,
}

impl<'a> ReportJob<'a> {
    pub fn new(stores: Collaborators<'a>, settings: JobSettings) -> Self {
        Self { stores, settings }
    }

    fn timestamp(&self) -> String {
        self.settings.now.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    pub fn run(&self, payload: &ReportPayload) -> Result<RunOutcome, ReportError> {
        let key = payload.combination_key.as_str();
        info!(key, "checking for an existing report");

        if let Some(existing) = self.stores.reports.find_report(key)? {
            info!(key, status = ?existing.status, "report already registered, refreshing cache");
            self.refresh_cache(&existing);
            return Ok(RunOutcome::AlreadyExists { record: existing });
        }

        // A failed insert (for example a concurrent run that won the race) leaves
        // the existing row untouched.
        let pending = payload.record(ReportStatus::Pending, None, &self.timestamp());
        self.stores.reports.insert_report(&pending)?;
        info!(key, "registered pending report");

        match self.generate(&pending) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(key, code = e.code(), "report generation failed: {e}");
                self.mark_failed(&pending);
                Err(e)
            }
        }
    }

    fn generate(&self, pending: &ReportRecord) -> Result<RunOutcome, ReportError> {
        let key = pending.combination_key.as_str();
        let request = codec::decode(key)?;
        info!(key, ?request, "decoded report parameters");

        let level = request.classrooms.level;
        let tolerance_seconds = self.stores.settings.load_tolerances()?.seconds_for(level);
        info!(key, tolerance_seconds, ?level, "loaded late tolerance");

        let roster = self.stores.roster.load_roster(level)?;
        info!(
            key,
            classrooms = roster.classrooms.len(),
            students = roster.students.len(),
            "loaded roster"
        );

        let rows = self.fetch_attendance(&request)?;
        info!(key, rows = rows.len(), "loaded attendance documents");

        let ctx = AggregateContext {
            tolerance_seconds,
            now: self.settings.now,
            cutoffs: self.settings.cutoffs,
        };
        let report = aggregate(&request, &roster, &rows, &ctx)?;
        let classroom_count = report.classroom_count();
        info!(key, classroom_count, "aggregated report");

        let body = serde_json::to_vec(&report).map_err(|e| {
            ReportError::TransientStore(format!("failed to serialize report: {}", e))
        })?;
        let file_name = format!(
            "Report_{}_{}.json",
            key,
            self.settings.now.and_utc().timestamp_millis()
        );
        let artifact = self
            .stores
            .artifacts
            .upload(&body, &self.settings.artifact_folder, &file_name)?;
        info!(key, artifact_id = %artifact.id, file_name, "uploaded report artifact");

        self.stores
            .reports
            .update_status(key, ReportStatus::Available, Some(&artifact.id))?;
        let record = ReportRecord {
            status: ReportStatus::Available,
            artifact_id: Some(artifact.id),
            ..pending.clone()
        };
        self.refresh_cache(&record);
        info!(key, "report available");

        Ok(RunOutcome::Generated {
            record,
            classroom_count,
        })
    }

    /// Reads every grade collection of the request on its own thread and
    /// concatenates the documents in grade order.
    fn fetch_attendance(
        &self,
        request: &ReportRequest,
    ) -> Result<Vec<StudentAttendanceMonthly>, ReportError> {
        let level = request.classrooms.level;
        let months: Vec<u32> = months_in_range(&request.range).collect();
        let collections: Vec<String> = grades_to_query(&request.classrooms)
            .into_iter()
            .map(|g| collection_name(&self.settings.collection_prefix, level, g))
            .collect();
        info!(?collections, ?months, "fetching attendance");

        let source = self.stores.attendance;
        let months = months.as_slice();
        let results: Vec<Result<Vec<StudentAttendanceMonthly>, ReportError>> =
            std::thread::scope(|s| {
                let handles: Vec<_> = collections
                    .iter()
                    .map(|c| s.spawn(move || source.find_monthly(c, months)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().unwrap_or_else(|_| {
                            Err(ReportError::TransientStore(
                                "attendance fetch thread panicked".to_string(),
                            ))
                        })
                    })
                    .collect()
            });

        let mut rows = Vec::new();
        for result in results {
            rows.extend(result?);
        }
        Ok(rows)
    }

    /// Best-effort: never fails the run.
    fn refresh_cache(&self, record: &ReportRecord) {
        let value = match serde_json::to_string(record) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %record.combination_key, "failed to serialize record for cache: {e}");
                return;
            }
        };
        match self.stores.cache.set(
            REPORTS_GROUP,
            &record.combination_key,
            &value,
            Some(self.settings.cache_ttl_seconds),
        ) {
            Ok(()) => info!(
                key = %record.combination_key,
                status = ?record.status,
                "cache refreshed"
            ),
            Err(e) => warn!(key = %record.combination_key, "cache refresh failed: {e}"),
        }
    }

    fn mark_failed(&self, pending: &ReportRecord) {
        let key = pending.combination_key.as_str();
        if let Err(e) = self
            .stores
            .reports
            .update_status(key, ReportStatus::Error, None)
        {
            error!(key, "could not record error status: {e}");
        }
        let record = ReportRecord {
            status: ReportStatus::Error,
            artifact_id: None,
            ..pending.clone()
        };
        self.refresh_cache(&record);
    }
}
