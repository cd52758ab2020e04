pub mod controller;
pub mod error;
pub mod types;

pub use controller::{Collaborators, JobSettings, ReportJob, RunOutcome};
pub use error::ReportError;
pub use types::{ReportPayload, ReportRecord, ReportStatus};
