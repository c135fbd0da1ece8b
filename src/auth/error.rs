use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::repo::StoreError;

/// Flow outcome taxonomy. Callers branch on the variant, not on message
/// content; the message is what the boundary renders to the user.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(&'static str),
    #[error("User already exists")]
    Conflict,
    #[error("Invalid password")]
    InvalidCredentials,
    #[error("User not found")]
    NotFound,
    #[error("Not authorized, login again")]
    Unauthorized,
    #[error("Invalid OTP")]
    InvalidOtp,
    #[error("OTP Expired")]
    OtpExpired,
    #[error("Account already verified")]
    AlreadyVerified,
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    // Statuses are normalized across all flows; the original surface
    // signaled "not found" distinctly on only one path.
    fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) | AuthError::InvalidOtp | AuthError::OtpExpired => {
                StatusCode::BAD_REQUEST
            }
            AuthError::InvalidCredentials | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::Conflict | AuthError::AlreadyVerified => StatusCode::CONFLICT,
            AuthError::Store(_) | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "flow failed");
        }
        let body = json!({ "success": false, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}
