//! Unified error type for the ledger engine.
//!
//! Variants fall into four groups: bad input data for a single record
//! (skipped and counted by batch operations), sequencing conflicts on the
//! invoice counter, configuration or connectivity failures, and invariant
//! violations. Only the first group is recoverable inside a batch, see
//! [`Error::is_record_level`].

use sea_orm::DbErr;
use thiserror::Error;

/// Every error the ledger engine can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// Database or connection failure
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// Configuration could not be read or is invalid
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the problem
        message: String,
    },

    /// No student with this school ID
    #[error("Student not found: {student_id}")]
    StudentNotFound {
        /// School ID that was looked up
        student_id: String,
    },

    /// A student record carries values the ledger cannot bill
    #[error("Invalid data for student {student_id}: {reason}")]
    InvalidStudentData {
        /// School ID of the offending student
        student_id: String,
        /// What is wrong with the record
        reason: String,
    },

    /// A collection amount was zero or negative
    #[error("Invalid amount: {amount}")]
    InvalidAmount {
        /// The rejected amount
        amount: i64,
    },

    /// Month outside 1..=12 or a year chrono cannot represent
    #[error("Invalid period: {year}-{month}")]
    InvalidPeriod {
        /// Year of the period
        year: i32,
        /// Month of the period
        month: u32,
    },

    /// The ledger chain has a hole before the month being computed
    #[error("Student {student_id} has history but no ledger record for {year}-{month:02}")]
    MissingPredecessor {
        /// School ID of the student
        student_id: String,
        /// Year of the missing month
        year: i32,
        /// The missing month
        month: u32,
    },

    /// The invoice counter could not be allocated within the retry budget
    #[error("Invoice counter for {year}-{month:02} still contended after {attempts} attempts")]
    SequenceConflict {
        /// Year of the counter
        year: i32,
        /// Month of the counter
        month: u32,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Computed ledger figures do not satisfy `duno = dudau + phaithu - dathu`
    #[error("Ledger invariant violated for {student_id} {year}-{month:02}: {detail}")]
    InvariantViolation {
        /// School ID of the student
        student_id: String,
        /// Year of the record
        year: i32,
        /// Month of the record
        month: u32,
        /// What failed
        detail: String,
    },

    /// A batch worker task panicked or was cancelled
    #[error("Worker task failed: {message}")]
    TaskFailed {
        /// Description from the join error
        message: String,
    },

    /// The import file is unusable as a whole
    #[error("Import error: {message}")]
    Import {
        /// Description of the problem
        message: String,
    },

    /// CSV reader failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON detail map could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error concerns a single record and should be counted
    /// and skipped instead of aborting a batch.
    #[must_use]
    pub const fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::StudentNotFound { .. }
                | Self::InvalidStudentData { .. }
                | Self::InvalidAmount { .. }
                | Self::MissingPredecessor { .. }
        )
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
