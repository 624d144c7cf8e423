use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaforgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("No config file given and no home directory to look in")]
    NoConfigPath,
}

/// Failures raised by a conversion driver. All of them end up as a `Failed`
/// job row with the rendered message as its error.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("{program} exited with {}: {stderr}", describe_exit(.exit_code))]
    ProcessFailure {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not determine media duration: {0}")]
    Probe(String),

    #[error("Image processing failed: {0}")]
    Image(String),

    #[error("Conversion produced no output at '{0}'")]
    MissingOutput(PathBuf),

    #[error("Conversion task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The durable backend could not be reached; the caller should retry later.
    #[error("Queue backend unavailable: {0}")]
    ServiceUnavailable(String),

    /// Identifiers that cannot be mapped onto the storage layout.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid path component: {0:?}")]
    InvalidComponent(String),
}

pub type Result<T> = std::result::Result<T, MediaforgeError>;
