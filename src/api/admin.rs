//! Privileged routes. Authentication is expected in front of this service;
//! handlers only record who the caller says they are.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::balance::parse_user;
use crate::api::AppState;
use crate::config::CommissionRates;
use crate::domain::{AdminAction, Decimal, UserId, Withdrawal};
use crate::error::AppError;
use crate::ledger::InvariantReport;
use crate::orchestration::{
    ChainRepairReport, ResyncReport, SweepReport, VerifyReport, WalletSetup,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminBody {
    pub actor_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPaidBody {
    pub actor_id: String,
    pub reason: String,
    pub external_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBody {
    pub actor_id: String,
    pub reason: String,
    pub signer_url: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatesBody {
    pub actor_id: String,
    pub reason: String,
    pub rates: [Decimal; 3],
}

#[derive(Debug, Deserialize)]
pub struct OptionalUser {
    pub user: Option<String>,
}

impl OptionalUser {
    fn parse(&self) -> Result<Option<UserId>, AppError> {
        self.user.as_deref().map(parse_user).transpose()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncResponse {
    #[serde(flatten)]
    pub report: ResyncReport,
    /// Users still breaching an invariant after the rebuild.
    pub unhealthy: Vec<InvariantReport>,
}

pub async fn approve_withdrawal(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<Withdrawal>, AppError> {
    let w = state.admin.approve(&body.actor_id, &id, &body.reason).await?;
    Ok(Json(w))
}

pub async fn reject_withdrawal(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<Withdrawal>, AppError> {
    let w = state.admin.reject(&body.actor_id, &id, &body.reason).await?;
    Ok(Json(w))
}

pub async fn mark_withdrawal_paid(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<MarkPaidBody>,
) -> Result<Json<Withdrawal>, AppError> {
    let w = state
        .admin
        .mark_paid(&body.actor_id, &id, &body.external_ref, &body.reason)
        .await?;
    Ok(Json(w))
}

pub async fn resolve_withdrawal_paid(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<MarkPaidBody>,
) -> Result<Json<Withdrawal>, AppError> {
    let w = state
        .admin
        .resolve_paid(&body.actor_id, &id, &body.external_ref, &body.reason)
        .await?;
    Ok(Json(w))
}

pub async fn resolve_withdrawal_failed(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<Withdrawal>, AppError> {
    let w = state
        .admin
        .resolve_failed(&body.actor_id, &id, &body.reason)
        .await?;
    Ok(Json(w))
}

pub async fn suspend_user(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<AckResponse>, AppError> {
    let user = parse_user(&id)?;
    state.admin.suspend(&body.actor_id, &user, &body.reason).await?;
    Ok(Json(AckResponse { ok: true }))
}

pub async fn unsuspend_user(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<AckResponse>, AppError> {
    let user = parse_user(&id)?;
    state
        .admin
        .unsuspend(&body.actor_id, &user, &body.reason)
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

pub async fn install_wallet(
    State(state): State<AppState>,
    Json(body): Json<WalletBody>,
) -> Result<Json<AckResponse>, AppError> {
    let setup = WalletSetup {
        signer_url: body.signer_url,
        address: body.address,
    };
    state
        .admin
        .install_wallet(&body.actor_id, setup, &body.reason)
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

pub async fn clear_wallet(
    State(state): State<AppState>,
    Json(body): Json<AdminBody>,
) -> Result<Json<AckResponse>, AppError> {
    let cleared = state.admin.clear_wallet(&body.actor_id, &body.reason).await?;
    Ok(Json(AckResponse { ok: cleared }))
}

pub async fn set_commission_rates(
    State(state): State<AppState>,
    Json(body): Json<RatesBody>,
) -> Result<Json<AckResponse>, AppError> {
    let rates = CommissionRates::new(body.rates).map_err(|e| AppError::BadRequest(e.to_string()))?;
    state
        .admin
        .set_commission_rates(&body.actor_id, rates, &body.reason)
        .await?;
    Ok(Json(AckResponse { ok: true }))
}

pub async fn list_actions(
    Path(target): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<AdminAction>>, AppError> {
    Ok(Json(state.admin.list_actions(&target).await?))
}

pub async fn verify_pending(
    Query(params): Query<OptionalUser>,
    State(state): State<AppState>,
) -> Result<Json<VerifyReport>, AppError> {
    let user = params.parse()?;
    Ok(Json(state.reconciler.verify_pending(user.as_ref()).await?))
}

pub async fn sweep_duplicates(
    State(state): State<AppState>,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.reconciler.sweep_duplicate_credits().await?))
}

pub async fn resync(
    Query(params): Query<OptionalUser>,
    State(state): State<AppState>,
) -> Result<Json<ResyncResponse>, AppError> {
    let user = params.parse()?;
    let report = state.reconciler.resync(user.as_ref()).await?;
    let unhealthy = match user {
        Some(id) => {
            let r = state.ledger.audit(&id).await?;
            if r.is_healthy() {
                Vec::new()
            } else {
                vec![r]
            }
        }
        None => state.reconciler.audit_all().await?,
    };
    Ok(Json(ResyncResponse { report, unhealthy }))
}

pub async fn repair_broken_chains(
    State(state): State<AppState>,
) -> Result<Json<ChainRepairReport>, AppError> {
    Ok(Json(state.reconciler.repair_broken_chains().await?))
}
