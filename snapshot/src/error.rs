use std::error;
use std::fmt;

/// Result type of every fallible snapshot operation.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Error type of the snapshot subsystem.
///
/// A [`SnapshotError`] is either a single error made of an [`ErrorKind`], a static description
/// and an optional dynamic detail, or an aggregate of many errors, e.g. the failures of several
/// chunk workers.
#[derive(Debug, Clone)]
pub struct SnapshotError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<SnapshotError>),
}

/// Classification of snapshot errors.
///
/// The kind decides how an error is handled: transient kinds are retried locally, view kinds
/// restart the snapshot job and planning kinds abort start-up.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    SourceConnectionFailed,
    MetadataStoreConnectionFailed,

    // Query & Execution Errors
    SourceQueryFailed,
    MetadataStoreQueryFailed,
    SourceLockTimeout,
    SourceOperationCanceled,

    // Schema Errors
    SourceSchemaError,

    // Planning Errors
    PlanningFailed,

    // Exported View Errors
    ViewTokenInvalid,
    ExportedViewLost,

    // Job & Chunk Errors
    LiveJobExists,
    InvalidJobTransition,
    ChunkRetriesExhausted,
    JobFailed,

    // Data Errors
    ConversionError,
    InvalidData,
    ValidationError,

    // Configuration Errors
    ConfigError,

    // IO & Serialization Errors
    IoError,
    SourceIoError,
    DeserializationError,

    // Security & Authentication Errors
    EncryptionError,
    AuthenticationError,
    PermissionDenied,

    // State & Workflow Errors
    InvalidState,
    ChunkWorkerPanic,

    // Source Server Errors
    SourceSnapshotTooOld,
    SourceDatabaseInRecovery,
    SourceDatabaseShutdown,

    // General Errors
    SourceError,

    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures that are expected to go away when the operation is retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceConnectionFailed
                | ErrorKind::MetadataStoreConnectionFailed
                | ErrorKind::SourceLockTimeout
                | ErrorKind::SourceIoError
                | ErrorKind::IoError
                | ErrorKind::SourceDatabaseInRecovery
        )
    }
}

impl SnapshotError {
    /// Aggregates many errors into one.
    pub fn many(errors: Vec<SnapshotError>) -> SnapshotError {
        SnapshotError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the dynamic detail, or the first one found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }

    /// An aggregate is transient only when every error inside it is.
    pub fn is_transient(&self) -> bool {
        match self.repr {
            ErrorRepr::Many(ref errors) => {
                !errors.is_empty() && errors.iter().all(|err| err.is_transient())
            }
            _ => self.kind().is_transient(),
        }
    }
}

impl PartialEq for SnapshotError {
    fn eq(&self, other: &SnapshotError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => write!(f, "{kind:?}: {desc}"),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                write!(f, "{kind:?}: {desc} -> {detail}")
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SnapshotError {}

impl From<(ErrorKind, &'static str)> for SnapshotError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> SnapshotError {
        SnapshotError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for SnapshotError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> SnapshotError {
        SnapshotError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for SnapshotError
where
    E: Into<SnapshotError>,
{
    fn from(errors: Vec<E>) -> SnapshotError {
        SnapshotError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> SnapshotError {
        SnapshotError::from((ErrorKind::IoError, "I/O error occurred", err.to_string()))
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> SnapshotError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        SnapshotError::from((kind, description, err.to_string()))
    }
}

impl From<std::num::ParseIntError> for SnapshotError {
    fn from(err: std::num::ParseIntError) -> SnapshotError {
        SnapshotError::from((
            ErrorKind::ConversionError,
            "Integer parsing failed",
            err.to_string(),
        ))
    }
}

impl From<snapshot_postgres::schema::ParseTableNameError> for SnapshotError {
    fn from(err: snapshot_postgres::schema::ParseTableNameError) -> SnapshotError {
        SnapshotError::from((
            ErrorKind::ConfigError,
            "Invalid table reference",
            err.to_string(),
        ))
    }
}

/// Maps errors by SQLSTATE class so that callers can tell transient failures apart from
/// logical ones.
impl From<tokio_postgres::Error> for SnapshotError {
    fn from(err: tokio_postgres::Error) -> SnapshotError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    // Connection errors (08xxx)
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION => (
                        ErrorKind::SourceConnectionFailed,
                        "Postgres connection error",
                    ),

                    // Authentication errors (28xxx)
                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "Postgres authentication failed",
                    ),

                    SqlState::INSUFFICIENT_PRIVILEGE => (
                        ErrorKind::PermissionDenied,
                        "Postgres permission denied",
                    ),

                    // Data conversion errors (22xxx)
                    SqlState::DATA_EXCEPTION
                    | SqlState::INVALID_TEXT_REPRESENTATION
                    | SqlState::NUMERIC_VALUE_OUT_OF_RANGE => (
                        ErrorKind::ConversionError,
                        "Postgres data conversion error",
                    ),

                    // Schema object not found (42xxx)
                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_FUNCTION
                    | SqlState::UNDEFINED_SCHEMA => (
                        ErrorKind::SourceSchemaError,
                        "Postgres schema object not found",
                    ),

                    SqlState::SYNTAX_ERROR | SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION => (
                        ErrorKind::SourceQueryFailed,
                        "Postgres syntax error",
                    ),

                    // Resource errors (53xxx)
                    SqlState::INSUFFICIENT_RESOURCES
                    | SqlState::OUT_OF_MEMORY
                    | SqlState::TOO_MANY_CONNECTIONS => (
                        ErrorKind::SourceConnectionFailed,
                        "Postgres resource limitation",
                    ),
                    SqlState::DISK_FULL => (ErrorKind::SourceIoError, "Postgres disk full"),

                    // Transaction errors (40xxx, 25xxx)
                    SqlState::TRANSACTION_ROLLBACK
                    | SqlState::T_R_SERIALIZATION_FAILURE
                    | SqlState::T_R_DEADLOCK_DETECTED
                    | SqlState::INVALID_TRANSACTION_STATE
                    | SqlState::ACTIVE_SQL_TRANSACTION
                    | SqlState::NO_ACTIVE_SQL_TRANSACTION
                    | SqlState::IN_FAILED_SQL_TRANSACTION => {
                        (ErrorKind::InvalidState, "Postgres transaction error")
                    }
                    SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT
                    | SqlState::IDLE_SESSION_TIMEOUT => (
                        ErrorKind::SourceConnectionFailed,
                        "Postgres session timeout",
                    ),

                    SqlState::SYSTEM_ERROR | SqlState::INTERNAL_ERROR => {
                        (ErrorKind::SourceQueryFailed, "Postgres system error")
                    }
                    SqlState::IO_ERROR | SqlState::DATA_CORRUPTED | SqlState::INDEX_CORRUPTED => {
                        (ErrorKind::SourceIoError, "Postgres I/O error")
                    }

                    // Operator intervention (57xxx)
                    SqlState::OPERATOR_INTERVENTION | SqlState::QUERY_CANCELED => (
                        ErrorKind::SourceOperationCanceled,
                        "Postgres operation canceled",
                    ),
                    SqlState::ADMIN_SHUTDOWN | SqlState::CRASH_SHUTDOWN => (
                        ErrorKind::SourceDatabaseShutdown,
                        "Postgres shutdown",
                    ),
                    SqlState::CANNOT_CONNECT_NOW => (
                        ErrorKind::SourceDatabaseInRecovery,
                        "Postgres database in recovery",
                    ),

                    SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE | SqlState::OBJECT_IN_USE => (
                        ErrorKind::InvalidState,
                        "Postgres object not in prerequisite state",
                    ),
                    SqlState::LOCK_NOT_AVAILABLE => {
                        (ErrorKind::SourceLockTimeout, "Postgres lock not available")
                    }

                    SqlState::SNAPSHOT_TOO_OLD => {
                        (ErrorKind::SourceSnapshotTooOld, "Postgres snapshot too old")
                    }

                    SqlState::FEATURE_NOT_SUPPORTED => (
                        ErrorKind::SourceSchemaError,
                        "Postgres feature not supported",
                    ),

                    _ => (ErrorKind::SourceError, "Postgres error"),
                }
            }
            // Errors without SQLSTATE come from the client side, e.g. a closed connection.
            None => (
                ErrorKind::SourceConnectionFailed,
                "Postgres connection failed",
            ),
        };

        SnapshotError::from((kind, description, err.to_string()))
    }
}

impl From<rustls::Error> for SnapshotError {
    fn from(err: rustls::Error) -> SnapshotError {
        SnapshotError::from((
            ErrorKind::EncryptionError,
            "TLS configuration failed",
            err.to_string(),
        ))
    }
}

/// Metadata store errors get their own kinds so that a broken store is not mistaken for a broken
/// source.
impl From<sqlx::Error> for SnapshotError {
    fn from(err: sqlx::Error) -> SnapshotError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => (
                ErrorKind::LiveJobExists,
                "A live snapshot job already exists",
            ),
            sqlx::Error::Database(_) => (
                ErrorKind::MetadataStoreQueryFailed,
                "Metadata store query failed",
            ),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => (
                ErrorKind::MetadataStoreConnectionFailed,
                "Metadata store connection failed",
            ),
            sqlx::Error::Migrate(_) => (
                ErrorKind::MetadataStoreQueryFailed,
                "Metadata store migration failed",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorKind::DeserializationError,
                "Metadata store value could not be decoded",
            ),
            _ => (
                ErrorKind::MetadataStoreQueryFailed,
                "Metadata store operation failed",
            ),
        };

        SnapshotError::from((kind, description, err.to_string()))
    }
}

impl From<sqlx::migrate::MigrateError> for SnapshotError {
    fn from(err: sqlx::migrate::MigrateError) -> SnapshotError {
        SnapshotError::from((
            ErrorKind::MetadataStoreQueryFailed,
            "Metadata store migration failed",
            err.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, snapshot_error};

    #[test]
    fn single_error_reports_its_kind_and_detail() {
        let err = SnapshotError::from((ErrorKind::PlanningFailed, "Table introspection failed"));
        assert_eq!(err.kind(), ErrorKind::PlanningFailed);
        assert_eq!(err.detail(), None);

        let err = SnapshotError::from((
            ErrorKind::SourceSchemaError,
            "Table not found",
            "public.orders".to_string(),
        ));
        assert_eq!(err.kinds(), vec![ErrorKind::SourceSchemaError]);
        assert_eq!(err.detail(), Some("public.orders"));
    }

    #[test]
    fn aggregated_errors_flatten_kinds() {
        let inner = SnapshotError::many(vec![
            SnapshotError::from((ErrorKind::SourceIoError, "read failed")),
            SnapshotError::from((ErrorKind::ViewTokenInvalid, "view gone", "0001".to_string())),
        ]);
        let outer = SnapshotError::from(vec![
            inner,
            SnapshotError::from((ErrorKind::ChunkWorkerPanic, "panic")),
        ]);

        assert_eq!(outer.kind(), ErrorKind::SourceIoError);
        assert_eq!(
            outer.kinds(),
            vec![
                ErrorKind::SourceIoError,
                ErrorKind::ViewTokenInvalid,
                ErrorKind::ChunkWorkerPanic
            ]
        );
        assert_eq!(outer.detail(), Some("0001"));
        assert!(!outer.is_transient());
    }

    #[test]
    fn empty_aggregate_is_unknown_and_not_transient() {
        let err = SnapshotError::many(vec![]);

        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(err.kinds().is_empty());
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_classification() {
        let connection = SnapshotError::from((
            ErrorKind::MetadataStoreConnectionFailed,
            "connection reset",
        ));
        assert!(connection.is_transient());

        let logical = SnapshotError::from((ErrorKind::InvalidJobTransition, "bad transition"));
        assert!(!logical.is_transient());

        let all_transient = SnapshotError::many(vec![
            connection.clone(),
            SnapshotError::from((ErrorKind::SourceLockTimeout, "lock")),
        ]);
        assert!(all_transient.is_transient());
    }

    #[test]
    fn display_includes_kind_description_and_detail() {
        let err = SnapshotError::from((
            ErrorKind::ExportedViewLost,
            "Exported view lost",
            "connection closed".to_string(),
        ));

        assert_eq!(
            err.to_string(),
            "ExportedViewLost: Exported view lost -> connection closed"
        );

        let many = SnapshotError::many(vec![
            SnapshotError::from((ErrorKind::InvalidData, "a")),
            SnapshotError::from((ErrorKind::InvalidData, "b")),
        ]);
        assert!(many.to_string().contains("2 total"));
    }

    #[test]
    fn macros_build_and_return_errors() {
        let err = snapshot_error!(ErrorKind::InvalidJobTransition, "Job is not running", 42);
        assert_eq!(err.kind(), ErrorKind::InvalidJobTransition);
        assert_eq!(err.detail(), Some("42"));

        fn fails() -> SnapshotResult<()> {
            bail!(ErrorKind::ChunkRetriesExhausted, "Chunk failed too often");
        }

        assert_eq!(fails().unwrap_err().kind(), ErrorKind::ChunkRetriesExhausted);
    }

    #[test]
    fn json_errors_are_deserialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();

        assert_eq!(
            SnapshotError::from(err).kind(),
            ErrorKind::DeserializationError
        );
    }
}
