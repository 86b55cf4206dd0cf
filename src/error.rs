use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KattaError {
    #[error("Metadata store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Conflicting store write: {0}")]
    StoreConflict(String),

    #[error("Path '{0}' not found")]
    PathNotFound(String),

    #[error("Path '{0}' already exists")]
    PathExists(String),

    #[error("Failed to open shard: {0}")]
    ShardOpenFailure(String),

    #[error("Rpc timed out: {0}")]
    RpcTimeout(String),

    #[error("Shard '{0}' has no live replica")]
    ShardUnavailable(String),

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Deploy failed: {0}")]
    DeployFailure(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Wire encoding error: {0}")]
    WireError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type KattaResult<T> = Result<T, KattaError>;

impl serde::Serialize for KattaError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<bincode::Error> for KattaError {
    fn from(err: bincode::Error) -> Self {
        KattaError::WireError(err.to_string())
    }
}

impl From<reqwest::Error> for KattaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KattaError::RpcTimeout(err.to_string())
        } else if err.is_connect() {
            KattaError::NetworkError(format!("connect: {}", err))
        } else {
            KattaError::NetworkError(err.to_string())
        }
    }
}

impl IntoResponse for KattaError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            KattaError::PathNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            KattaError::PathExists(_) | KattaError::StoreConflict(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            KattaError::MalformedQuery(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            KattaError::RpcTimeout(_) => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            KattaError::StoreUnavailable(_) | KattaError::ShardUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            // Default to 500
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = KattaError::ShardUnavailable("wiki#s2".to_string());
        assert_eq!(err.to_string(), "Shard 'wiki#s2' has no live replica");

        let err = KattaError::PathExists("/indexes/wiki".to_string());
        assert_eq!(err.to_string(), "Path '/indexes/wiki' already exists");

        let err = KattaError::MalformedQuery("empty query".to_string());
        assert_eq!(err.to_string(), "Malformed query: empty query");
    }

    #[test]
    fn test_errors_serialize_as_display() {
        let err = KattaError::RpcTimeout("search".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("timed out"));
    }
}
