use thiserror::Error;

use crate::codec::DecodeError;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    TransientStore(String),
    #[error("{0}")]
    Configuration(String),
}

impl ReportError {
    pub fn validation(message: impl Into<String>) -> Self {
        ReportError::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ReportError::Validation(_) => "validation_failed",
            ReportError::NotFound(_) => "not_found",
            ReportError::TransientStore(_) => "store_failed",
            ReportError::Configuration(_) => "bad_config",
        }
    }
}

impl From<DecodeError> for ReportError {
    fn from(e: DecodeError) -> Self {
        ReportError::Validation(format!("invalid combination key: {}", e))
    }
}

impl From<rusqlite::Error> for ReportError {
    fn from(e: rusqlite::Error) -> Self {
        ReportError::TransientStore(e.to_string())
    }
}

impl From<std::io::Error> for ReportError {
    fn from(e: std::io::Error) -> Self {
        ReportError::TransientStore(e.to_string())
    }
}

impl From<zip::result::ZipError> for ReportError {
    fn from(e: zip::result::ZipError) -> Self {
        ReportError::TransientStore(e.to_string())
    }
}

impl From<anyhow::Error> for ReportError {
    fn from(e: anyhow::Error) -> Self {
        ReportError::TransientStore(format!("{:#}", e))
    }
}
