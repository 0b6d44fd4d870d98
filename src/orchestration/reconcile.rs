//! Reconciliation jobs: verify-pending, duplicate-credit sweep, resync and
//! broken-chain repair.

use super::withdrawals::{RefreshOutcome, WithdrawalError, WithdrawalService};
use crate::db::repo::ledger::{
    credits_in_group, delete_credit, load_balance_sheet, lock_balance_sheet, store_balance_sheet,
    CreditKey,
};
use crate::db::repo::users::clear_referrer;
use crate::db::Repository;
use crate::domain::{BalanceSheet, Decimal, UserId};
use crate::ledger::{InvariantReport, Ledger, LedgerError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Withdrawals polled at once by verify-pending.
const VERIFY_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Duplicate group {0} would drive the aggregate negative")]
    NegativeAggregate(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub checked: usize,
    pub transitioned: usize,
    pub resubmitted: usize,
    pub unchanged: usize,
    /// Withdrawal ids left pending for a human to look at.
    pub needs_review: Vec<String>,
    /// Transient failures; these withdrawals are retried on the next pass.
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub groups: usize,
    pub credits_removed: usize,
    pub amount_removed: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub users: usize,
    /// Users whose stored sheet differed from the ledger.
    pub corrected: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRepairReport {
    pub repaired: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    repo: Repository,
    ledger: Ledger,
    withdrawals: WithdrawalService,
}

impl Reconciler {
    pub fn new(withdrawals: WithdrawalService) -> Self {
        let ledger = withdrawals.ledger().clone();
        Self {
            repo: ledger.repo().clone(),
            ledger,
            withdrawals,
        }
    }

    /// Poll every in-flight instant withdrawal (optionally for one user) and
    /// drive it to wherever its adapter says it is. Nothing times out: a
    /// withdrawal stays pending until a terminal answer arrives.
    pub async fn verify_pending(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<VerifyReport, ReconcileError> {
        let unsettled = self.repo.list_unsettled_instant(user_id).await?;
        let mut report = VerifyReport {
            checked: unsettled.len(),
            ..Default::default()
        };

        let results: Vec<(String, Result<RefreshOutcome, WithdrawalError>)> =
            stream::iter(unsettled)
                .map(|w| async move {
                    let id = w.id.clone();
                    (id, self.withdrawals.refresh(w).await)
                })
                .buffer_unordered(VERIFY_CONCURRENCY)
                .collect()
                .await;

        for (id, result) in results {
            match result {
                Ok(RefreshOutcome::Unchanged) => report.unchanged += 1,
                Ok(RefreshOutcome::Transitioned(_)) => report.transitioned += 1,
                Ok(RefreshOutcome::Resubmitted(_)) => report.resubmitted += 1,
                Ok(RefreshOutcome::NeedsReview(_)) => report.needs_review.push(id),
                Err(WithdrawalError::InvalidTransition(e)) => {
                    debug!(withdrawal_id = %id, error = %e, "Withdrawal moved during verify");
                    report.unchanged += 1;
                }
                Err(e) => {
                    warn!(withdrawal_id = %id, error = %e, "Verify failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            transitioned = report.transitioned,
            resubmitted = report.resubmitted,
            needs_review = report.needs_review.len(),
            errors = report.errors,
            "Verify-pending complete"
        );
        Ok(report)
    }

    /// Remove all but the earliest credit of every duplicated
    /// `(beneficiary, purchase, generation)` and take the removed amounts
    /// back out of the aggregates, one transaction per group. Restores the
    /// unique index afterwards.
    pub async fn sweep_duplicate_credits(&self) -> Result<SweepReport, ReconcileError> {
        let mut report = SweepReport::default();

        for key in self.repo.find_duplicate_credit_keys().await? {
            let (removed, amount) = self.sweep_group(&key).await?;
            if removed > 0 {
                report.groups += 1;
                report.credits_removed += removed;
                report.amount_removed += amount;
            }
        }

        self.repo.ensure_credit_uniqueness().await?;
        info!(
            groups = report.groups,
            credits_removed = report.credits_removed,
            amount_removed = %report.amount_removed,
            "Duplicate-credit sweep complete"
        );
        Ok(report)
    }

    async fn sweep_group(&self, key: &CreditKey) -> Result<(usize, Decimal), ReconcileError> {
        let user_id = &key.beneficiary_id;
        let mut tx = self.repo.begin().await?;
        lock_balance_sheet(&mut tx, user_id).await?;

        let rows = credits_in_group(&mut tx, key).await?;
        let mut removed = 0;
        let mut amount = Decimal::zero();
        for row in rows.iter().skip(1) {
            if delete_credit(&mut tx, &row.id).await? {
                removed += 1;
                amount += row.amount;
            }
        }
        if removed == 0 {
            return Ok((0, amount));
        }

        let Some(mut sheet) = load_balance_sheet(&mut tx, user_id).await? else {
            return Err(ReconcileError::NegativeAggregate(format!(
                "{}/{}/{}",
                user_id,
                key.purchase_id,
                key.generation.get()
            )));
        };
        let bucket = &mut sheet.generations[key.generation.index()];
        bucket.count -= removed as i64;
        bucket.earnings -= amount;
        sheet.total_earnings -= amount;
        if sheet.total_earnings.is_negative() || bucket_negative(&sheet, key) {
            error!(
                user_id = %user_id,
                purchase_id = %key.purchase_id,
                generation = key.generation.get(),
                "Duplicate sweep would drive aggregates negative"
            );
            return Err(ReconcileError::NegativeAggregate(format!(
                "{}/{}/{}",
                user_id,
                key.purchase_id,
                key.generation.get()
            )));
        }
        store_balance_sheet(&mut tx, &sheet).await?;
        tx.commit().await?;

        warn!(
            user_id = %user_id,
            purchase_id = %key.purchase_id,
            generation = key.generation.get(),
            removed,
            amount = %amount,
            kept = %rows[0].id,
            "Removed duplicate commission credits"
        );
        Ok((removed, amount))
    }

    /// Recompute balance sheets from the ledger and overwrite them.
    pub async fn resync(&self, user_id: Option<&UserId>) -> Result<ResyncReport, ReconcileError> {
        let users = match user_id {
            Some(id) => vec![id.clone()],
            None => self.repo.list_ledger_user_ids().await?,
        };

        let mut report = ResyncReport {
            users: users.len(),
            ..Default::default()
        };
        for id in users {
            let (before, after) = self.ledger.rebuild(&id).await?;
            let drift = before.diff(&after);
            if !drift.is_empty() {
                warn!(user_id = %id, drift = ?drift, "Balance sheet rebuilt from ledger");
                report.corrected.push(id);
            }
        }

        info!(
            users = report.users,
            corrected = report.corrected.len(),
            "Resync complete"
        );
        Ok(report)
    }

    /// Null every referrer handle that does not resolve to a user.
    pub async fn repair_broken_chains(&self) -> Result<ChainRepairReport, ReconcileError> {
        let mut report = ChainRepairReport::default();
        for user in self.repo.list_users_with_broken_referrer().await? {
            let Some(handle) = user.referrer_handle.as_ref() else {
                continue;
            };
            let mut conn = self.repo.pool().acquire().await?;
            if clear_referrer(&mut conn, &user.id, handle).await? {
                info!(user_id = %user.id, referrer = %handle, "Cleared unresolvable referrer");
                report.repaired.push(user.id);
            }
        }
        Ok(report)
    }

    /// Read-only invariant check across every user with ledger activity.
    /// Only unhealthy reports are returned.
    pub async fn audit_all(&self) -> Result<Vec<InvariantReport>, ReconcileError> {
        let mut unhealthy = Vec::new();
        for id in self.repo.list_ledger_user_ids().await? {
            let report = self.ledger.audit(&id).await?;
            if !report.is_healthy() {
                unhealthy.push(report);
            }
        }
        Ok(unhealthy)
    }
}

fn bucket_negative(sheet: &BalanceSheet, key: &CreditKey) -> bool {
    let bucket = sheet.generation(key.generation);
    bucket.count < 0 || bucket.earnings.is_negative()
}
