use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::{Currency, Decimal, Purchase, PurchaseKind, TimeMs, UserId};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseBody {
    pub id: String,
    pub buyer_id: String,
    #[serde(default = "default_kind")]
    pub kind: PurchaseKind,
    pub gross_amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub shares: i64,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
}

fn default_kind() -> PurchaseKind {
    PurchaseKind::Regular
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditDto {
    pub beneficiary_id: String,
    pub generation: u8,
    pub amount: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub purchase_id: String,
    pub inserted: Vec<CreditDto>,
    pub already_posted: usize,
}

/// Record a purchase event. Replaying the same id is accepted and ignored.
pub async fn record_purchase(
    State(state): State<AppState>,
    Json(body): Json<PurchaseBody>,
) -> Result<(StatusCode, Json<RecordResponse>), AppError> {
    if body.id.trim().is_empty() || body.buyer_id.trim().is_empty() {
        return Err(AppError::BadRequest("id and buyerId are required".into()));
    }
    if body.gross_amount.is_negative() {
        return Err(AppError::BadRequest("grossAmount must not be negative".into()));
    }

    let purchase = Purchase {
        id: body.id.trim().to_string(),
        buyer_id: UserId::new(body.buyer_id.trim()),
        kind: body.kind,
        gross_amount: body.gross_amount,
        currency: body.currency.map(Currency::new).unwrap_or_else(Currency::ngn),
        shares: body.shares,
        completed_at: body.completed_at_ms.map(TimeMs::new),
    };
    let created = state.repo.insert_purchase(&purchase).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RecordResponse {
            id: purchase.id,
            created,
        }),
    ))
}

pub async fn apply_purchase(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ApplyResponse>, AppError> {
    let outcome = state.ledger.apply_purchase(&id).await?;
    Ok(Json(ApplyResponse {
        purchase_id: id,
        inserted: outcome
            .inserted
            .into_iter()
            .map(|c| CreditDto {
                beneficiary_id: c.beneficiary_id.to_string(),
                generation: c.generation.get(),
                amount: c.amount.to_canonical_string(),
                currency: c.currency.to_string(),
            })
            .collect(),
        already_posted: outcome.already_posted,
    }))
}
