use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::domain::Table;

#[derive(Debug, Error, Diagnostic)]
pub enum ReportError {
    #[error("query request failed: {0}")]
    QueryHttp(String),

    #[error("query service returned status {status}: {message}")]
    QueryStatus { status: u16, message: String },

    #[error("failed to decode query result: {0}")]
    QueryDecode(String),

    #[error("pivot needs at least 3 columns, query returned {columns}")]
    Shape { columns: usize, raw: Box<Table> },

    #[error("template file not found: {0}")]
    #[diagnostic(help("check the `template` entry of report-pipeline.json"))]
    TemplateMissing(PathBuf),

    #[error("template is not a readable xlsx workbook: {0}")]
    TemplateFormat(String),

    #[error("failed to write report artifact: {0}")]
    Injection(String),

    #[error("sheet `{0}` is not present in the template")]
    SheetMissing(String),

    #[error("invalid cell reference: {0}")]
    InvalidCell(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    FetchError,
    ShapeError,
    TemplateMissing,
    InjectionError,
    ConfigError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::FetchError => write!(f, "FetchError"),
            ErrorKind::ShapeError => write!(f, "ShapeError"),
            ErrorKind::TemplateMissing => write!(f, "TemplateMissing"),
            ErrorKind::InjectionError => write!(f, "InjectionError"),
            ErrorKind::ConfigError => write!(f, "ConfigError"),
        }
    }
}

impl ReportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::QueryHttp(_)
            | ReportError::QueryStatus { .. }
            | ReportError::QueryDecode(_) => ErrorKind::FetchError,
            ReportError::Shape { .. } => ErrorKind::ShapeError,
            ReportError::TemplateMissing(_) => ErrorKind::TemplateMissing,
            ReportError::TemplateFormat(_)
            | ReportError::Injection(_)
            | ReportError::SheetMissing(_)
            | ReportError::Filesystem(_) => ErrorKind::InjectionError,
            ReportError::InvalidCell(_)
            | ReportError::ConfigRead(_)
            | ReportError::ConfigParse(_) => ErrorKind::ConfigError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_are_fetch_errors() {
        let err = ReportError::QueryStatus {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::FetchError);
        assert_eq!(
            err.to_string(),
            "query service returned status 500: boom"
        );
    }

    #[test]
    fn disk_errors_during_injection_keep_injection_kind() {
        let err = ReportError::Filesystem("disk full".to_string());
        assert_eq!(err.kind(), ErrorKind::InjectionError);
    }
}
