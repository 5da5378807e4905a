use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;
use crate::validation::ValidationError;

/// every way a request can fail, resolved at the request boundary
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid JSON body")]
    InvalidJson,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Database error")]
    Store(#[from] StoreError),

    /// details stay in the server log
    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidJson => StatusCode::BAD_REQUEST,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Store(e) => {
                tracing::error!("Database error: {}", e);
                json!({ "error": self.to_string(), "details": e.to_string() })
            }
            AppError::Internal(details) => {
                tracing::error!("Server error: {}", details);
                json!({ "error": self.to_string() })
            }
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
