use diesel::r2d2;
use thiserror::Error;

use crate::qq::IdError;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

impl From<diesel::result::Error> for DatabaseError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => DatabaseError::Duplicate(info.message().to_string()),
            other => DatabaseError::Query(other.to_string()),
        }
    }
}

impl From<r2d2::PoolError> for DatabaseError {
    fn from(err: r2d2::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DatabaseError {
    fn from(err: tokio::task::JoinError) -> Self {
        DatabaseError::Task(err.to_string())
    }
}

impl From<IdError> for DatabaseError {
    fn from(err: IdError) -> Self {
        DatabaseError::InvalidData(err.to_string())
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violations_map_to_duplicate() {
        struct Info;
        impl diesel::result::DatabaseErrorInformation for Info {
            fn message(&self) -> &str {
                "UNIQUE constraint failed: message.mxid"
            }
            fn details(&self) -> Option<&str> {
                None
            }
            fn hint(&self) -> Option<&str> {
                None
            }
            fn table_name(&self) -> Option<&str> {
                None
            }
            fn column_name(&self) -> Option<&str> {
                None
            }
            fn constraint_name(&self) -> Option<&str> {
                None
            }
            fn statement_position(&self) -> Option<i32> {
                None
            }
        }

        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new(Info),
        );
        assert!(matches!(DatabaseError::from(err), DatabaseError::Duplicate(msg) if msg.contains("message.mxid")));
        assert!(matches!(
            DatabaseError::from(diesel::result::Error::NotFound),
            DatabaseError::Query(_)
        ));
    }
}
