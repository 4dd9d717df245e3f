//! Error types for the energy monitor daemon.
//!
//! This module defines custom error enums for each component of the daemon,
//! providing descriptive error messages with context information.

use thiserror::Error;

/// Failures reported by the telemetry acquisition layer.
///
/// A missing network path is kept distinct from an authentication problem so
/// the log tells the operator which one to fix.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("No network connectivity to the remote power API")]
    NoConnectivity,

    #[error("Remote session expired or credentials rejected")]
    AuthExpired,

    #[error("Remote power API fault: {0}")]
    RemoteFault(String),
}

/// Errors related to the time-series store and its backing file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to persist energy data to '{path}': {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize energy data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Energy data file is corrupt: {0}")]
    CorruptData(String),

    #[error("Retention must be at least 1 day, got {0}")]
    InvalidRetention(u32),

    #[error("Power reading must be a finite, non-negative kW value, got {0}")]
    InvalidReading(f64),
}

/// Errors related to export of stored readings and reports.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write export '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Export path '{path}' is outside the export folder '{folder}'")]
    OutsideExportFolder { path: String, folder: String },

    #[error("Export IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read energy data for export: {0}")]
    Store(#[from] StoreError),
}

/// Errors related to IPC server operations.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind socket at '{path}': {source}")]
    SocketBindFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command received: {0}")]
    InvalidCommand(String),

    #[error("Failed to serialize response: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine a local data directory for logs")]
    DataDirectoryNotFound,

    #[error("Failed to create log directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    AppenderCreationFailed(String),
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}
