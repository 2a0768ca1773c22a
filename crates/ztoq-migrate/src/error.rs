//! Error types for the migration engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::EntityType;

/// Exit codes reported by the CLI for each error class.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_NOT_FOUND: u8 = 2;
pub const EXIT_TRANSIENT_EXHAUSTED: u8 = 3;
pub const EXIT_FATAL: u8 = 4;
pub const EXIT_STATE_ERROR: u8 = 5;
pub const EXIT_CANCELLED: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;

/// Coarse error classification driving retry and abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout, rate limiting, temporary 5xx. Retried with backoff.
    Transient,
    /// A record failed transform or validation rules. Ledgered, never retried.
    Validation,
    /// Authentication/authorization, schema mismatch, exhausted retries.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Temporary collaborator failure (timeout, rate limit, 5xx).
    #[error("Transient failure during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Authentication or authorization rejected by a collaborator.
    #[error("Access denied during {operation}: {message}")]
    Unauthorized { operation: String, message: String },

    /// A record does not satisfy a transform or validation rule.
    #[error("Validation failed for {entity_type} {record_id}: {message}")]
    Validation {
        entity_type: EntityType,
        record_id: i64,
        message: String,
    },

    /// Source data cannot be interpreted (irrecoverable schema mismatch).
    #[error("Schema mismatch for {entity_type}: {message}")]
    SchemaMismatch {
        entity_type: EntityType,
        message: String,
    },

    /// Transient failures kept failing after the last allowed attempt.
    #[error("Retries exhausted after {attempts} attempts during {operation}: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// A dependent entity type was scheduled before its dependency completed.
    #[error("Cannot start {entity_type}: dependency {dependency} has not completed this phase")]
    DependencyIncomplete {
        entity_type: EntityType,
        dependency: EntityType,
    },

    /// Illegal workflow state transition.
    #[error("Invalid transition for run {run_id}: {message}")]
    InvalidTransition { run_id: String, message: String },

    /// Unknown run id.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// State document error (integrity, serialization).
    #[error("State error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the run was started - cannot resume with a different configuration")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Transient error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an Unauthorized error
    pub fn unauthorized(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Unauthorized {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a Validation error
    pub fn validation(entity_type: EntityType, record_id: i64, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            entity_type,
            record_id,
            message: message.into(),
        }
    }

    /// Create a SchemaMismatch error
    pub fn schema_mismatch(entity_type: EntityType, message: impl Into<String>) -> Self {
        MigrateError::SchemaMismatch {
            entity_type,
            message: message.into(),
        }
    }

    /// Classify the error for retry and abort decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Transient { .. } => ErrorKind::Transient,
            MigrateError::Validation { .. } => ErrorKind::Validation,
            // Interrupted local IO is worth another attempt; anything else is not.
            MigrateError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::WouldBlock => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether the error may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Map the error to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::ConfigChanged => {
                EXIT_CONFIG_ERROR
            }
            MigrateError::RunNotFound(_) => EXIT_NOT_FOUND,
            MigrateError::Transient { .. } | MigrateError::RetriesExhausted { .. } => {
                EXIT_TRANSIENT_EXHAUSTED
            }
            MigrateError::State(_) | MigrateError::Json(_) | MigrateError::InvalidTransition { .. } => {
                EXIT_STATE_ERROR
            }
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_FATAL,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
