//! Error types for the rekey pipeline.
//!
//! A single error enum covers both phases of a run. None of these errors is
//! retried locally: every variant surfaces to the caller and ends the run.

use thiserror::Error;

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The store rejected or failed the aggregate call. Raised before any
    /// write has been issued.
    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// A document's hex field could not be parsed.
    #[error("Malformed identifier{}: {input:?} ({reason})", record_suffix(.record))]
    MalformedIdentifier {
        /// Zero-based index of the offending record, once known.
        record: Option<u64>,
        /// The raw value that failed to parse.
        input: String,
        reason: String,
    },

    /// A bulk-mutation call failed. Batches before `batch_index` were
    /// applied and are not rolled back.
    #[error(
        "Mutation error in batch {batch_index}: {message} \
         ({batches_applied} batches applied, {records_modified} records modified)"
    )]
    Mutation {
        batch_index: usize,
        batches_applied: usize,
        records_modified: u64,
        message: String,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (config file, network stream, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failed to reach the document store.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The run was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Phase sequencing or task failure.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

fn record_suffix(record: &Option<u64>) -> String {
    match record {
        Some(index) => format!(" at record {}", index),
        None => String::new(),
    }
}

impl PipelineError {
    /// Build a `MalformedIdentifier` error with no record index attached.
    pub fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::MalformedIdentifier {
            record: None,
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Attach a record index to a `MalformedIdentifier` error. Other
    /// variants pass through unchanged.
    pub fn at_record(self, index: u64) -> Self {
        match self {
            PipelineError::MalformedIdentifier { input, reason, .. } => {
                PipelineError::MalformedIdentifier {
                    record: Some(index),
                    input,
                    reason,
                }
            }
            other => other,
        }
    }

    /// Name of the phase this error belongs to, for diagnostics.
    pub fn phase(&self) -> &'static str {
        match self {
            PipelineError::QueryExecution(_) | PipelineError::MalformedIdentifier { .. } => "read",
            PipelineError::Mutation { .. } => "write",
            PipelineError::Config(_) => "setup",
            _ => "run",
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_display_contains(err: &PipelineError, expected: &str) {
        let msg = format!("{}", err);
        assert!(
            msg.contains(expected),
            "Expected display '{}' to contain '{}'",
            msg,
            expected
        );
    }

    // ---------------------------------------------------------------
    // Display
    // ---------------------------------------------------------------

    #[test]
    fn test_query_execution_display() {
        let err = PipelineError::QueryExecution("cursor not found".to_string());
        assert_display_contains(&err, "Query execution error");
        assert_display_contains(&err, "cursor not found");
    }

    #[test]
    fn test_malformed_without_record() {
        let err = PipelineError::malformed("xyz", "invalid hex digit 'x'");
        assert_eq!(
            format!("{}", err),
            "Malformed identifier: \"xyz\" (invalid hex digit 'x')"
        );
    }

    #[test]
    fn test_malformed_with_record() {
        let err = PipelineError::malformed("", "empty input").at_record(17);
        assert_display_contains(&err, "at record 17");
        assert_display_contains(&err, "empty input");
    }

    #[test]
    fn test_mutation_display_reports_partial_progress() {
        let err = PipelineError::Mutation {
            batch_index: 2,
            batches_applied: 2,
            records_modified: 9_998,
            message: "write concern timeout".to_string(),
        };
        assert_display_contains(&err, "batch 2");
        assert_display_contains(&err, "2 batches applied");
        assert_display_contains(&err, "9998 records modified");
        assert_display_contains(&err, "write concern timeout");
    }

    #[test]
    fn test_empty_message() {
        let err = PipelineError::Config(String::new());
        assert_eq!(format!("{}", err), "Configuration error: ");
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    #[test]
    fn test_at_record_ignores_other_variants() {
        let err = PipelineError::Runtime("boom".to_string()).at_record(3);
        assert!(matches!(err, PipelineError::Runtime(ref m) if m == "boom"));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(PipelineError::QueryExecution("x".into()).phase(), "read");
        assert_eq!(PipelineError::malformed("x", "y").phase(), "read");
        let mutation = PipelineError::Mutation {
            batch_index: 0,
            batches_applied: 0,
            records_modified: 0,
            message: "x".into(),
        };
        assert_eq!(mutation.phase(), "write");
        assert_eq!(PipelineError::Config("x".into()).phase(), "setup");
        assert_eq!(PipelineError::Cancelled("x".into()).phase(), "run");
    }

    // ---------------------------------------------------------------
    // From conversions
    // ---------------------------------------------------------------

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        let err: PipelineError = io_err.into();
        assert_display_contains(&err, "I/O error");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: PipelineError = json_err.into();
        assert_display_contains(&err, "Serialization error");
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: PipelineError = toml_err.into();
        assert_display_contains(&err, "Configuration error");
    }

    #[test]
    fn test_question_mark_propagation() {
        fn inner() -> Result<()> {
            Err(PipelineError::Cancelled("shutdown".to_string()))?;
            Ok(())
        }
        assert!(inner().is_err());
    }
}
