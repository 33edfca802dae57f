use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("RPC transport error: {0}")]
    Rpc(#[from] alloy::transports::TransportError),

    #[error("ABI decode error: {0}")]
    Abi(#[from] alloy::sol_types::Error),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Pool-level database failures that are worth retrying. A closed pool
    /// never reopens, so `PoolClosed` is final.
    pub fn is_transient_db(&self) -> bool {
        matches!(
            self,
            AppError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pool_timeouts_and_io_are_transient() {
        assert!(AppError::Database(sqlx::Error::PoolTimedOut).is_transient_db());
        assert!(AppError::Database(sqlx::Error::Io(std::io::Error::other("reset"))).is_transient_db());
        assert!(!AppError::Database(sqlx::Error::PoolClosed).is_transient_db());
        assert!(!AppError::Database(sqlx::Error::RowNotFound).is_transient_db());
        assert!(!AppError::Chain("down".to_string()).is_transient_db());
    }
}
