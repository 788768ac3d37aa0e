//! The one error type every handler returns.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ledger::LedgerError;
use crate::redeem::RedeemError;
use crate::tasks::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    InsufficientCredit,
    NotFound,
    AlreadyRedeemed,
    InternalError,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::InsufficientCredit => StatusCode::PAYMENT_REQUIRED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyRedeemed => StatusCode::CONFLICT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.error == ErrorKind::InternalError {
            tracing::error!(message = %self.message, "Request failed");
        }
        (self.error.status(), Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::invalid_input(rejection.body_text())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let kind = match &err {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InsufficientCredit { .. } => ErrorKind::InsufficientCredit,
            EngineError::Internal(_) => ErrorKind::InternalError,
        };
        ApiError::new(kind, err.to_string())
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound => ApiError::unauthorized("unknown API key"),
            LedgerError::InvalidAmount(_) => ApiError::invalid_input(err.to_string()),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<RedeemError> for ApiError {
    fn from(err: RedeemError) -> Self {
        match err {
            RedeemError::InvalidInput(_) => ApiError::invalid_input(err.to_string()),
            RedeemError::NotFound => ApiError::not_found(err.to_string()),
            RedeemError::AlreadyRedeemed => {
                ApiError::new(ErrorKind::AlreadyRedeemed, err.to_string())
            }
            RedeemError::Ledger(inner) => inner.into(),
            RedeemError::Storage(_) => ApiError::internal(err.to_string()),
        }
    }
}
