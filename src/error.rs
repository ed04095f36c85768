// src/error.rs
use std::fmt;

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Which stored entity a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Poll,
    Option,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Poll => write!(f, "Poll"),
            Entity::Option => write!(f, "Option"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{entity} {key} not found.")]
    NotFound { entity: Entity, key: String },

    #[error("A vote from this voter was already recorded for this poll.")]
    DuplicateVote,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl AppError {
    pub fn poll_not_found(poll_id: i64) -> Self {
        AppError::NotFound {
            entity: Entity::Poll,
            key: poll_id.to_string(),
        }
    }

    pub fn option_not_found(value: &str) -> Self {
        AppError::NotFound {
            entity: Entity::Option,
            key: format!("\"{value}\""),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound { .. } => "NOT_FOUND",
            AppError::DuplicateVote => "DUPLICATE_VOTE",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Store(_) => "STORE_FAILURE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::DuplicateVote => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Store failures are logged in full but reported generically.
        let details = match &self {
            AppError::Store(e) => {
                error!(error = %e, "store operation failed");
                "The request could not be completed.".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": true,
            "kind": self.kind(),
            "details": details,
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
