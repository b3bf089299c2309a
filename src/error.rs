//! Error types for the telemetry store.

use thiserror::Error;

/// Errors returned by the schema initializer, the scale registry, the
/// event log and the exporters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection pool could not be built or could not hand out a
    /// connection.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A schema statement failed. The remaining statements were skipped.
    #[error("schema statement failed ({statement}): {source}")]
    Schema {
        statement: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A statement could not be prepared or executed, or a row could not be
    /// decoded.
    #[error("query error: {0}")]
    Query(#[from] rusqlite::Error),

    /// A statement succeeded but touched an unexpected number of rows.
    #[error("{operation} affected {affected} rows, expected {expected}")]
    RowCount {
        operation: &'static str,
        expected: usize,
        affected: usize,
    },

    /// The scale id lies outside the configured registry size.
    #[error("scale id {id} out of range, registry holds {max} scales")]
    ScaleOutOfRange { id: u32, max: u32 },

    /// No row was found for a scale right after writing one for it.
    #[error("no rows for scale {scale} right after writing one")]
    MissingWrite { scale: i64 },

    /// An export producer task panicked or was aborted.
    #[error("export producer failed: {0}")]
    Producer(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn row_count(operation: &'static str, expected: usize, affected: usize) -> Self {
        StoreError::RowCount {
            operation,
            expected,
            affected,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
