use miette::Diagnostic;
use sea_orm::DbErr;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(tableflow::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(tableflow::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(tableflow::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(tableflow::db))]
    Db(#[from] DbErr),

    #[error("Invalid table configuration: {0}")]
    #[diagnostic(
        code(tableflow::configuration),
        help("INCREMENTAL tables need a watermark_column, FULL tables must not have one")
    )]
    Configuration(String),

    #[error("Connection failed: {0}")]
    #[diagnostic(code(tableflow::connectivity))]
    Connectivity(String),

    #[error("Data transfer failed: {0}")]
    #[diagnostic(code(tableflow::data_transfer))]
    DataTransfer(String),

    #[error("Table `{schema}.{table}` is already registered")]
    #[diagnostic(
        code(tableflow::uniqueness_violation),
        help("Use update or sync to change an existing table entry")
    )]
    UniquenessViolation { schema: String, table: String },

    #[error("Not found: {0}")]
    #[diagnostic(code(tableflow::not_found))]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(tableflow::other))]
    Other(String),
}

/// Coarse classification used when a failure is written to the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    DataTransfer,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Connectivity => "ConnectivityError",
            ErrorKind::DataTransfer => "DataTransferError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Configuration(_) | FlowError::Config(_) => ErrorKind::Configuration,
            FlowError::Connectivity(_) | FlowError::Io(_) => ErrorKind::Connectivity,
            FlowError::Db(DbErr::Conn(_)) | FlowError::Db(DbErr::ConnectionAcquire(_)) => {
                ErrorKind::Connectivity
            }
            FlowError::DataTransfer(_) | FlowError::Db(_) | FlowError::Serde(_) => {
                ErrorKind::DataTransfer
            }
            FlowError::UniquenessViolation { .. } | FlowError::NotFound(_) | FlowError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message stored in `execution_log.error_message`, prefixed with the error kind
    pub fn log_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
