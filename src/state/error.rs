use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Unexpected row shape: {0}")]
    BadRow(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
