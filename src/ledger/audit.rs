//! Recompute a balance sheet from the ledger, and compare.

use crate::db::repo::ledger::{credits_for_beneficiary, debits_for_user, load_balance_sheet};
use crate::db::repo::withdrawals::{active_reservations, count_active_for_user};
use crate::domain::{BalanceSheet, UserId};
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;

use super::LedgerError;

/// The balance sheet implied by credits, debits and active withdrawals.
pub async fn compute_from_ledger(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<BalanceSheet, sqlx::Error> {
    let mut sheet = BalanceSheet::empty(user_id.clone());

    for credit in credits_for_beneficiary(conn, user_id).await? {
        sheet.total_earnings += credit.amount;
        let bucket = &mut sheet.generations[credit.generation.index()];
        bucket.count += 1;
        bucket.earnings += credit.amount;
    }
    sheet.total_withdrawn = debits_for_user(conn, user_id)
        .await?
        .into_iter()
        .map(|d| d.amount)
        .sum();

    let (pending, processing) = active_reservations(conn, user_id).await?;
    sheet.pending_withdrawals = pending;
    sheet.processing_withdrawals = processing;

    Ok(sheet)
}

/// Breaches found for one user. Empty `breaches` means healthy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantReport {
    pub user_id: UserId,
    pub breaches: Vec<String>,
}

impl InvariantReport {
    pub fn is_healthy(&self) -> bool {
        self.breaches.is_empty()
    }
}

pub(super) async fn audit_user(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<InvariantReport, LedgerError> {
    let stored = load_balance_sheet(conn, user_id)
        .await?
        .unwrap_or_else(|| BalanceSheet::empty(user_id.clone()));
    let expected = compute_from_ledger(conn, user_id).await?;

    let mut breaches: Vec<String> = stored
        .diff(&expected)
        .into_iter()
        .map(|d| format!("aggregate drift {}", d))
        .collect();

    if stored.available().is_negative() {
        breaches.push(format!("negative available balance {}", stored.available()));
    }
    let active = count_active_for_user(conn, user_id).await?;
    if active > 1 {
        breaches.push(format!("{} active withdrawals", active));
    }

    if !breaches.is_empty() {
        tracing::warn!(user_id = %user_id, breaches = ?breaches, "Invariant audit found breaches");
    }
    Ok(InvariantReport {
        user_id: user_id.clone(),
        breaches,
    })
}
