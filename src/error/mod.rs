use std::fmt;

use pgrx::PgSqlErrorCode;

pub mod testing;

/// Main error type for the pg_publish extension
#[derive(Debug, Clone, PartialEq)]
pub enum PublishError {
    // ============ Registry Errors (P0xxx / 42xxx) ============
    /// Entity is not registered in pg_publish_entity
    MetadataNotFound {
        entity: String,
    },

    /// Registered table does not exist
    TableNotFound {
        table: String,
    },

    /// Table has no primary key, so rows cannot be matched across stores
    MissingPrimaryKey {
        table: String,
    },

    /// Draft and production tables disagree on their scalar columns
    SchemaMismatch {
        entity: String,
        reason: String,
    },

    /// Relationship kind outside belongs_to / has_one / has_many / many_to_many
    UnsupportedRelationKind {
        kind: String,
    },

    /// Foreign key column count does not line up with the key it points at
    RelationshipArityMismatch {
        relation: String,
        expected: usize,
        found: usize,
    },

    // ============ Input Errors (22xxx) ============
    /// Identifier rejected before reaching SQL
    InvalidIdentifier {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Malformed argument
    InvalidInput {
        parameter: String,
        value: String,
        reason: String,
    },

    /// A statement that needs a key predicate was built for no keys
    EmptyKeySet {
        context: String,
    },

    // ============ Resolve Errors (55xxx / 54xxx) ============
    /// A discovery query failed; the closure is uncertain
    DiscoveryFailed {
        entity: String,
        relation: String,
        reason: String,
    },

    /// Closure grew past MAX_CLOSURE_KEYS
    ClosureTooLarge {
        size: usize,
        max_size: usize,
    },

    /// Deadline passed or the backend was asked to cancel
    DeadlineExceeded {
        phase: String,
        elapsed_ms: u64,
    },

    // ============ Apply Errors (XX000) ============
    /// A publish/discard statement failed
    ApplyFailed {
        entity: String,
        step: String,
        reason: String,
    },

    // ============ I/O and System Errors (XX000) ============
    /// PostgreSQL catalog operation failed
    CatalogError {
        operation: String,
        pg_error: String,
    },

    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl PublishError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use PublishError::*;
        match self {
            MetadataNotFound { .. } => "P0001", // Raise exception
            TableNotFound { .. } => "42P01", // Undefined table
            MissingPrimaryKey { .. } => "42P10", // Invalid column reference
            SchemaMismatch { .. } => "42804", // Datatype mismatch
            UnsupportedRelationKind { .. } => "0A000", // Feature not supported
            RelationshipArityMismatch { .. } => "42830", // Invalid foreign key

            InvalidIdentifier { .. } => "42602", // Invalid name
            InvalidInput { .. } => "22023", // Invalid parameter value
            EmptyKeySet { .. } => "22004", // Null value not allowed

            DiscoveryFailed { .. } => "55000", // Object not in prerequisite state
            ClosureTooLarge { .. } => "54000", // Program limit exceeded
            DeadlineExceeded { .. } => "57014", // Query canceled

            ApplyFailed { .. } => "XX000",
            CatalogError { .. } => "XX000",
            SpiError { .. } => "XX000",
            SerializationError { .. } => "XX000",
            InternalError { .. } => "XX000",
        }
    }

    /// SQLSTATE as a pgrx error code, matching [`PublishError::sqlstate`]
    pub fn error_code(&self) -> PgSqlErrorCode {
        use PublishError::*;
        match self {
            MetadataNotFound { .. } => PgSqlErrorCode::ERRCODE_RAISE_EXCEPTION,
            TableNotFound { .. } => PgSqlErrorCode::ERRCODE_UNDEFINED_TABLE,
            MissingPrimaryKey { .. } => PgSqlErrorCode::ERRCODE_INVALID_COLUMN_REFERENCE,
            SchemaMismatch { .. } => PgSqlErrorCode::ERRCODE_DATATYPE_MISMATCH,
            UnsupportedRelationKind { .. } => PgSqlErrorCode::ERRCODE_FEATURE_NOT_SUPPORTED,
            RelationshipArityMismatch { .. } => PgSqlErrorCode::ERRCODE_INVALID_FOREIGN_KEY,

            InvalidIdentifier { .. } => PgSqlErrorCode::ERRCODE_INVALID_NAME,
            InvalidInput { .. } => PgSqlErrorCode::ERRCODE_INVALID_PARAMETER_VALUE,
            EmptyKeySet { .. } => PgSqlErrorCode::ERRCODE_NULL_VALUE_NOT_ALLOWED,

            DiscoveryFailed { .. } => PgSqlErrorCode::ERRCODE_OBJECT_NOT_IN_PREREQUISITE_STATE,
            ClosureTooLarge { .. } => PgSqlErrorCode::ERRCODE_PROGRAM_LIMIT_EXCEEDED,
            DeadlineExceeded { .. } => PgSqlErrorCode::ERRCODE_QUERY_CANCELED,

            ApplyFailed { .. }
            | CatalogError { .. }
            | SpiError { .. }
            | SerializationError { .. }
            | InternalError { .. } => PgSqlErrorCode::ERRCODE_INTERNAL_ERROR,
        }
    }

    /// Raise as a PostgreSQL ERROR; aborts the current transaction
    pub fn raise(self) -> ! {
        pgrx::ereport!(ERROR, self.error_code(), format!("pg_publish: {self}"))
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        PublishError::InternalError { message, file, line }
    }
}

fn truncate(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PublishError::*;
        match self {
            MetadataNotFound { entity } => {
                write!(f, "publish metadata not found for entity '{}'", entity)
            }
            TableNotFound { table } => {
                write!(f, "table '{}' does not exist", table)
            }
            MissingPrimaryKey { table } => {
                write!(f, "table '{}' has no primary key", table)
            }
            SchemaMismatch { entity, reason } => {
                write!(f, "draft and production schemas differ for '{}': {}", entity, reason)
            }
            UnsupportedRelationKind { kind } => {
                write!(
                    f,
                    "unsupported relationship kind '{}' (expected belongs_to, has_one, has_many or many_to_many)",
                    kind
                )
            }
            RelationshipArityMismatch { relation, expected, found } => {
                write!(
                    f,
                    "relationship '{}' has {} foreign key column(s) but the referenced key has {}",
                    relation, found, expected
                )
            }
            InvalidIdentifier { parameter, value, reason } => {
                write!(f, "invalid identifier for '{}' ({}): {}", parameter, value, reason)
            }
            InvalidInput { parameter, value, reason } => {
                write!(f, "invalid value for '{}' ({}): {}", parameter, value, reason)
            }
            EmptyKeySet { context } => {
                write!(f, "empty key set passed to {}", context)
            }
            DiscoveryFailed { entity, relation, reason } => {
                write!(
                    f,
                    "dependency discovery failed for {}.{}: {}",
                    entity, relation, reason
                )
            }
            ClosureTooLarge { size, max_size } => {
                write!(f, "dependency closure of {} keys exceeds maximum {}", size, max_size)
            }
            DeadlineExceeded { phase, elapsed_ms } => {
                write!(f, "{} cancelled after {}ms", phase, elapsed_ms)
            }
            ApplyFailed { entity, step, reason } => {
                write!(f, "{} failed for '{}': {}", step, entity, reason)
            }
            CatalogError { operation, pg_error } => {
                write!(f, "Catalog operation '{}' failed: {}", operation, pg_error)
            }
            SpiError { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error, truncate(query))
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for PublishError {}

/// Result type for publish operations
pub type PublishResult<T> = Result<T, PublishError>;

/// Convert SpiError to PublishError
impl From<pgrx::spi::Error> for PublishError {
    fn from(e: pgrx::spi::Error) -> Self {
        PublishError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to PublishError
impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::PublishError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PublishError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_not_found_message() {
        let err = PublishError::MetadataNotFound {
            entity: "orders".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("not found"));
        assert_eq!(err.sqlstate(), "P0001");
    }

    #[test]
    fn test_arity_mismatch_message() {
        let err = PublishError::RelationshipArityMismatch {
            relation: "orders.line_items".to_string(),
            expected: 2,
            found: 1,
        };

        let msg = err.to_string();
        assert!(msg.contains("orders.line_items"));
        assert!(msg.contains("1 foreign key column(s)"));
        assert!(msg.contains("has 2"));
    }

    #[test]
    fn test_spi_error_truncates_long_query() {
        let err = PublishError::SpiError {
            query: "x".repeat(500),
            error: "boom".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.len() < 200);
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("Test error at {}", "location");

        match err {
            PublishError::InternalError { message, file, line } => {
                assert!(message.contains("Test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_resolve_errors_map_to_distinct_sqlstates() {
        let discovery = PublishError::DiscoveryFailed {
            entity: "orders".to_string(),
            relation: "customer".to_string(),
            reason: "relation does not exist".to_string(),
        };
        let too_large = PublishError::ClosureTooLarge { size: 11, max_size: 10 };
        let deadline = PublishError::DeadlineExceeded {
            phase: "resolve".to_string(),
            elapsed_ms: 30,
        };

        assert_eq!(discovery.sqlstate(), "55000");
        assert_eq!(too_large.sqlstate(), "54000");
        assert_eq!(deadline.sqlstate(), "57014");
        assert!(deadline.to_string().contains("resolve cancelled after 30ms"));
    }
}
