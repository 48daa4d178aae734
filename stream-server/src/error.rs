use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::TelemetryError;
use serde_json::json;
use std::io;
use thiserror::Error;

/// 存储错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 没有该比赛的采集文件
    #[error("Capture not found: {0}")]
    NotFound(String),

    /// 比赛仍在写入中
    #[error("Match {0} is still in progress")]
    InProgress(String),

    #[error("Writer is closed for match {0}")]
    WriterClosed(String),
}

/// 流服务错误
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error(transparent)]
    InvalidRequest(#[from] TelemetryError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            StreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::Unauthorized => StatusCode::UNAUTHORIZED,
            StreamError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            StreamError::Storage(_) | StreamError::NetworkError(_) | StreamError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
