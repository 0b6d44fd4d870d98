use crate::ledger::LedgerError;
use crate::orchestration::{AdminError, RateError, ReconcileError, WithdrawalError};
use crate::settlement::SettlementError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: String, requested: String },
    #[error("Ledger invariant violated: {0}")]
    Invariant(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => AppError::InsufficientBalance {
                available: available.to_canonical_string(),
                requested: requested.to_canonical_string(),
            },
            LedgerError::PurchaseUnknown(_) => AppError::NotFound(err.to_string()),
            LedgerError::NonPositiveAmount(_) => AppError::BadRequest(err.to_string()),
            LedgerError::InvariantViolation(msg) => AppError::Invariant(msg),
            LedgerError::Db(e) => e.into(),
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        if err.is_transient() {
            AppError::Unavailable(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

impl From<WithdrawalError> for AppError {
    fn from(err: WithdrawalError) -> Self {
        use WithdrawalError as W;
        match err {
            W::InsufficientBalance {
                available,
                requested,
            } => AppError::InsufficientBalance {
                available: available.to_canonical_string(),
                requested: requested.to_canonical_string(),
            },
            W::ActiveWithdrawalExists { .. } | W::InvalidTransition(_) => {
                AppError::Conflict(err.to_string())
            }
            W::RecipientNotConfigured(rail) => AppError::BadRequest(format!(
                "{}; add a {} recipient before withdrawing",
                err, rail
            )),
            W::RecipientNotVerified(rail) => AppError::BadRequest(format!(
                "{}; complete {} recipient verification first",
                err, rail
            )),
            W::BelowMinimum { .. } | W::InvalidRecipient(_) | W::RateUnavailable => {
                AppError::BadRequest(err.to_string())
            }
            W::WithdrawalsSuspended => AppError::Forbidden(err.to_string()),
            W::UserNotFound(_) | W::NotFound(_) => AppError::NotFound(err.to_string()),
            W::NoAdapter(_) => AppError::Internal(err.to_string()),
            W::Settlement {
                withdrawal_id,
                source,
            } => {
                let msg = format!(
                    "withdrawal {} is pending; settlement not confirmed: {}",
                    withdrawal_id, source
                );
                if source.is_transient() {
                    AppError::Unavailable(msg)
                } else {
                    AppError::Internal(msg)
                }
            }
            W::Ledger(e) => e.into(),
            W::Db(e) => e.into(),
        }
    }
}

impl From<AdminError> for AppError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Withdrawal(e) => e.into(),
            AdminError::Db(e) => e.into(),
            AdminError::UserNotFound(_) => AppError::NotFound(err.to_string()),
            AdminError::NotManual(_) | AdminError::InFlight(_) | AdminError::Manual(_) => {
                AppError::Conflict(err.to_string())
            }
            AdminError::MissingReason
            | AdminError::MissingExternalRef
            | AdminError::InvalidWallet(_)
            | AdminError::Rates(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Ledger(e) => e.into(),
            ReconcileError::NegativeAggregate(msg) => AppError::Invariant(msg),
            ReconcileError::Db(e) => e.into(),
        }
    }
}

impl From<RateError> for AppError {
    fn from(err: RateError) -> Self {
        match err {
            RateError::Db(e) => e.into(),
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg }))
            }
            AppError::InsufficientBalance {
                available,
                requested,
            } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Insufficient balance",
                    "available": available,
                    "requested": requested,
                }),
            ),
            AppError::Invariant(msg) => {
                tracing::error!(error = %msg, "Request aborted by ledger invariant");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg }))
            }
        };

        (status, Json(body)).into_response()
    }
}
