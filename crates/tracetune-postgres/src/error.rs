//! Error types for the PostgreSQL gateway.

use thiserror::Error;

/// Errors raised by the postgres store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PostgresError {
    /// Pool construction or checkout failed.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Query execution failed.
    #[error("query error: {0}")]
    Query(String),

    /// A stored row did not decode into the data model.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// The database URL could not be parsed.
    #[error("invalid database URL: {0}")]
    InvalidUrl(String),
}

impl From<tokio_postgres::Error> for PostgresError {
    fn from(err: tokio_postgres::Error) -> Self {
        PostgresError::Query(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for PostgresError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        PostgresError::Pool(err.to_string())
    }
}

impl From<PostgresError> for tracetune::Error {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::InvalidRow(msg) => tracetune::Error::InvalidData(msg),
            other => tracetune::Error::Storage(other.to_string()),
        }
    }
}
