use serde::{Deserialize, Serialize};

use super::error::ReportError;
use crate::codec::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "D")]
    Available,
    #[serde(rename = "E")]
    Error,
}

impl ReportStatus {
    pub fn code(self) -> &'static str {
        match self {
            ReportStatus::Pending => "P",
            ReportStatus::Available => "D",
            ReportStatus::Error => "E",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(ReportStatus::Pending),
            "D" => Some(ReportStatus::Available),
            "E" => Some(ReportStatus::Error),
            _ => None,
        }
    }
}

/// Durable report row. Cached replicas hold the same JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub combination_key: String,
    pub status: ReportStatus,
    pub artifact_id: Option<String>,
    pub generated_at: String,
    pub requester_role: String,
    pub requester_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    #[serde(default)]
    pub combination_key: String,
    #[serde(default)]
    pub requester_role: String,
    #[serde(default)]
    pub requester_id: String,
    #[serde(default)]
    pub generated_at: Option<String>,
}

impl ReportPayload {
    pub fn parse(raw: &str) -> Result<Self, ReportError> {
        let payload: ReportPayload = serde_json::from_str(raw.trim())
            .map_err(|e| ReportError::validation(format!("payload is not valid JSON: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), ReportError> {
        for (name, value) in [
            ("combinationKey", &self.combination_key),
            ("requesterRole", &self.requester_role),
            ("requesterId", &self.requester_id),
        ] {
            if value.trim().is_empty() {
                return Err(ReportError::validation(format!("missing {}", name)));
            }
        }
        Ok(())
    }

    /// Record carrying this request's identifying fields with the given state.
    pub fn record(
        &self,
        status: ReportStatus,
        artifact_id: Option<String>,
        default_generated_at: &str,
    ) -> ReportRecord {
        ReportRecord {
            combination_key: self.combination_key.clone(),
            status,
            artifact_id,
            generated_at: self
                .generated_at
                .clone()
                .unwrap_or_else(|| default_generated_at.to_string()),
            requester_role: self.requester_role.clone(),
            requester_id: self.requester_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classroom {
    pub id: String,
    pub level: Level,
    pub grade: u8,
    pub section: char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: String,
    pub classroom_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub classrooms: Vec<Classroom>,
    pub students: Vec<Student>,
}
