use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CollectorError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid result limit: {0}")]
    InvalidLimit(String),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("invalid keyword tag: {0}")]
    InvalidKeyword(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("unsupported config schema version {0}")]
    UnsupportedSchemaVersion(u32),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("MG-RAST search request failed: {0}")]
    SearchHttp(String),

    #[error("MG-RAST search returned status {status}: {message}")]
    SearchStatus { status: u16, message: String },

    #[error("malformed search page: {0}")]
    MalformedPage(String),

    #[error("rarefaction request failed: {0}")]
    RarefactionHttp(String),

    #[error("rarefaction request returned status {status}: {message}")]
    RarefactionStatus { status: u16, message: String },

    #[error("malformed rarefaction response: {0}")]
    MalformedCurve(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl CollectorError {
    /// Errors raised while validating user input, before any request is issued.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CollectorError::InvalidQuery(_)
                | CollectorError::InvalidLimit(_)
                | CollectorError::InvalidThreshold(_)
                | CollectorError::InvalidKeyword(_)
                | CollectorError::ConfigRead(_)
                | CollectorError::ConfigParse(_)
                | CollectorError::UnsupportedSchemaVersion(_)
                | CollectorError::InvalidSetting(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CollectorError::SearchHttp(_)
                | CollectorError::SearchStatus { .. }
                | CollectorError::MalformedPage(_)
                | CollectorError::RarefactionHttp(_)
                | CollectorError::RarefactionStatus { .. }
                | CollectorError::MalformedCurve(_)
        )
    }
}
