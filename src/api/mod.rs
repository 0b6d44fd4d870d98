pub mod admin;
pub mod balance;
pub mod health;
pub mod purchases;
pub mod withdrawals;

use crate::db::Repository;
use crate::ledger::Ledger;
use crate::orchestration::{AdminService, Reconciler, WithdrawalService};
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub ledger: Ledger,
    pub withdrawals: WithdrawalService,
    pub admin: AdminService,
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(withdrawals: WithdrawalService, admin: AdminService) -> Self {
        let ledger = withdrawals.ledger().clone();
        Self {
            repo: ledger.repo().clone(),
            ledger,
            reconciler: Reconciler::new(withdrawals.clone()),
            withdrawals,
            admin,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/balance", get(balance::get_balance))
        .route(
            "/v1/withdrawals",
            get(withdrawals::list_withdrawals).post(withdrawals::create_withdrawal),
        )
        .route("/v1/withdrawals/:id", get(withdrawals::get_withdrawal))
        .route("/v1/purchases", post(purchases::record_purchase))
        .route("/v1/purchases/:id/apply", post(purchases::apply_purchase))
        .route(
            "/v1/admin/withdrawals/:id/approve",
            post(admin::approve_withdrawal),
        )
        .route(
            "/v1/admin/withdrawals/:id/reject",
            post(admin::reject_withdrawal),
        )
        .route(
            "/v1/admin/withdrawals/:id/mark-paid",
            post(admin::mark_withdrawal_paid),
        )
        .route(
            "/v1/admin/withdrawals/:id/resolve-paid",
            post(admin::resolve_withdrawal_paid),
        )
        .route(
            "/v1/admin/withdrawals/:id/resolve-failed",
            post(admin::resolve_withdrawal_failed),
        )
        .route("/v1/admin/users/:id/suspend", post(admin::suspend_user))
        .route("/v1/admin/users/:id/unsuspend", post(admin::unsuspend_user))
        .route(
            "/v1/admin/wallet",
            post(admin::install_wallet).delete(admin::clear_wallet),
        )
        .route("/v1/admin/verify-pending", post(admin::verify_pending))
        .route(
            "/v1/admin/reconcile/duplicates",
            post(admin::sweep_duplicates),
        )
        .route("/v1/admin/reconcile/resync", post(admin::resync))
        .route(
            "/v1/admin/reconcile/broken-chains",
            post(admin::repair_broken_chains),
        )
        .route("/v1/admin/audit/:target", get(admin::list_actions))
        .route(
            "/v1/admin/commission-rates",
            put(admin::set_commission_rates),
        )
        .layer(cors)
        .with_state(state)
}
