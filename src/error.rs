use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Which kind of integrity rule the store rejected a write with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Unique,
    ForeignKey,
    Other,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Rejected before the store was touched.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("constraint violation ({kind:?}): {message}")]
    ConstraintViolation { kind: Constraint, message: String },

    /// The store aborted the transaction because of a concurrent writer.
    /// Callers may retry with a fresh transaction.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ConstraintViolation {
                kind: Constraint::Unique,
                ..
            }
        )
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self,
            StoreError::ConstraintViolation {
                kind: Constraint::ForeignKey,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::RowNotFound = err {
            return StoreError::NotFound("record");
        }

        if let Some(db_err) = err.as_database_error() {
            let message = db_err.message().to_string();

            let kind = match db_err.kind() {
                ErrorKind::UniqueViolation => Some(Constraint::Unique),
                ErrorKind::ForeignKeyViolation => Some(Constraint::ForeignKey),
                ErrorKind::NotNullViolation | ErrorKind::CheckViolation => Some(Constraint::Other),
                _ => None,
            };
            if let Some(kind) = kind {
                return StoreError::ConstraintViolation { kind, message };
            }

            if is_busy(db_err) {
                return StoreError::Conflict(message);
            }
        }

        StoreError::Database(err)
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// SQLite reports extended result codes (e.g. BUSY_SNAPSHOT = 517); the low
/// byte is the primary code.
fn is_busy(db_err: &dyn DatabaseError) -> bool {
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(StoreError::Conflict("database is locked".into()).is_retryable());
        assert!(!StoreError::Validation("x".into()).is_retryable());
        assert!(!StoreError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[tokio::test]
    async fn classifies_sqlite_constraint_errors() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (k TEXT NOT NULL UNIQUE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (k) VALUES ('a')")
            .execute(&pool)
            .await
            .unwrap();

        let err: StoreError = sqlx::query("INSERT INTO t (k) VALUES ('a')")
            .execute(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(err.is_unique_violation());

        let err: StoreError = sqlx::query("INSERT INTO t (k) VALUES (NULL)")
            .execute(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(matches!(
            err,
            StoreError::ConstraintViolation {
                kind: Constraint::Other,
                ..
            }
        ));
    }
}
