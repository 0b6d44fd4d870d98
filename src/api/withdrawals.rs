use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::balance::parse_user;
use crate::api::AppState;
use crate::domain::Withdrawal;
use crate::error::AppError;
use crate::orchestration::{WithdrawalError, WithdrawalRequest};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub withdrawals: Vec<Withdrawal>,
}

pub async fn create_withdrawal(
    Query(params): Query<OwnerQuery>,
    State(state): State<AppState>,
    Json(request): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<Withdrawal>), AppError> {
    let user = parse_user(&params.user)?;
    let withdrawal = state.withdrawals.request(&user, request).await?;
    Ok((StatusCode::CREATED, Json(withdrawal)))
}

pub async fn list_withdrawals(
    Query(params): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = parse_user(&params.user)?;
    let withdrawals = state.withdrawals.history(&user, params.limit).await?;
    Ok(Json(HistoryResponse { withdrawals }))
}

/// Look up by withdrawal id, falling back to the client reference.
pub async fn get_withdrawal(
    Path(id): Path<String>,
    Query(params): Query<OwnerQuery>,
    State(state): State<AppState>,
) -> Result<Json<Withdrawal>, AppError> {
    let user = parse_user(&params.user)?;
    let withdrawal = match state.withdrawals.status(&user, &id).await {
        Ok(w) => w,
        Err(WithdrawalError::NotFound(_)) => {
            let w = state.withdrawals.status_by_client_ref(&id).await?;
            if w.user_id != user {
                return Err(AppError::NotFound(format!("Withdrawal {} not found", id)));
            }
            w
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(withdrawal))
}
