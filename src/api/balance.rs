use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::{BalanceSheet, UserId};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDto {
    pub generation: u8,
    pub count: i64,
    pub earnings: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub user_id: String,
    pub total_earnings: String,
    pub total_withdrawn: String,
    pub pending_withdrawals: String,
    pub processing_withdrawals: String,
    pub available: String,
    pub generations: Vec<GenerationDto>,
}

impl From<BalanceSheet> for BalanceResponse {
    fn from(sheet: BalanceSheet) -> Self {
        Self {
            available: sheet.available().to_canonical_string(),
            generations: sheet
                .generations
                .iter()
                .enumerate()
                .map(|(i, g)| GenerationDto {
                    generation: i as u8 + 1,
                    count: g.count,
                    earnings: g.earnings.to_canonical_string(),
                })
                .collect(),
            user_id: sheet.user_id.to_string(),
            total_earnings: sheet.total_earnings.to_canonical_string(),
            total_withdrawn: sheet.total_withdrawn.to_canonical_string(),
            pending_withdrawals: sheet.pending_withdrawals.to_canonical_string(),
            processing_withdrawals: sheet.processing_withdrawals.to_canonical_string(),
        }
    }
}

pub(crate) fn parse_user(raw: &str) -> Result<UserId, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("user is required".into()));
    }
    Ok(UserId::new(trimmed))
}

pub async fn get_balance(
    Query(params): Query<UserQuery>,
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, AppError> {
    let user = parse_user(&params.user)?;
    let sheet = state.ledger.balance(&user).await?;
    Ok(Json(sheet.into()))
}
