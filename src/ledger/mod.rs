//! Transactional ledger: commission credits in, withdrawal debits out, and
//! the per-user balance sheet kept in lockstep with both.
//!
//! Every mutation opens a transaction whose first statement is a write to the
//! user's balance-sheet row ([`lock_balance_sheet`]). That takes SQLite's
//! write lock before anything is read, so operations on one user are
//! linearised by commit order.
//!
//! The `*_in` functions run on a caller-supplied connection so the withdrawal
//! service can combine a ledger effect with a state change in one commit.

mod audit;

pub use audit::{compute_from_ledger, InvariantReport};

use crate::config::SharedCommissionRates;
use crate::db::repo::ledger::{
    insert_credit, insert_debit, load_balance_sheet, lock_balance_sheet, store_balance_sheet,
};
use crate::db::repo::{purchases, users};
use crate::db::Repository;
use crate::domain::{
    BalanceSheet, CommissionCredit, Decimal, Purchase, ReservationBucket, TimeMs, User, UserId,
    WithdrawalDebit, MAX_GENERATION,
};
use crate::engine::compute_credits;
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },
    #[error("Purchase {0} is unknown or not completed")]
    PurchaseUnknown(String),
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Result of applying one purchase.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Credits inserted by this call.
    pub inserted: Vec<CommissionCredit>,
    /// Proposals that already existed (replays).
    pub already_posted: usize,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    repo: Repository,
    rates: SharedCommissionRates,
}

impl Ledger {
    pub fn new(repo: Repository, rates: SharedCommissionRates) -> Self {
        Self { repo, rates }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn rates(&self) -> &SharedCommissionRates {
        &self.rates
    }

    /// Post the commission credits owed for a completed purchase.
    ///
    /// Replays are no-ops: a credit whose `(beneficiary, purchase, generation)`
    /// already exists is skipped and the aggregates are left alone.
    pub async fn apply_purchase(&self, purchase_id: &str) -> Result<ApplyOutcome, LedgerError> {
        let mut conn = self.repo.pool().acquire().await?;
        let purchase = purchases::find_purchase(&mut conn, purchase_id)
            .await?
            .filter(Purchase::is_completed)
            .ok_or_else(|| LedgerError::PurchaseUnknown(purchase_id.to_string()))?;
        let upline = resolve_upline(&mut conn, &purchase.buyer_id).await?;
        drop(conn);

        let proposals = compute_credits(&purchase, &upline, &self.rates.current());
        let mut outcome = ApplyOutcome::default();
        if proposals.is_empty() {
            debug!(purchase_id, "No commission credits for purchase");
            return Ok(outcome);
        }

        let mut tx = self.repo.begin().await?;
        for proposal in &proposals {
            lock_balance_sheet(&mut tx, &proposal.beneficiary_id).await?;
        }

        let now = TimeMs::now();
        for proposal in proposals {
            let credit = CommissionCredit {
                id: uuid::Uuid::new_v4().to_string(),
                beneficiary_id: proposal.beneficiary_id,
                descendant_id: proposal.descendant_id,
                generation: proposal.generation,
                purchase_id: proposal.purchase_id,
                kind: proposal.kind,
                amount: proposal.amount,
                currency: proposal.currency,
                rate_at_post: proposal.rate_at_post,
                created_at: now,
            };

            if !insert_credit(&mut tx, &credit).await? {
                debug!(
                    purchase_id,
                    beneficiary = %credit.beneficiary_id,
                    generation = credit.generation.get(),
                    "Credit already posted"
                );
                outcome.already_posted += 1;
                continue;
            }

            let mut sheet = load_sheet(&mut tx, &credit.beneficiary_id).await?;
            sheet.total_earnings += credit.amount;
            let bucket = &mut sheet.generations[credit.generation.index()];
            bucket.count += 1;
            bucket.earnings += credit.amount;
            store_balance_sheet(&mut tx, &sheet).await?;

            info!(
                purchase_id,
                beneficiary = %credit.beneficiary_id,
                generation = credit.generation.get(),
                amount = %credit.amount,
                currency = %credit.currency,
                "Commission credited"
            );
            outcome.inserted.push(credit);
        }
        tx.commit().await?;

        Ok(outcome)
    }

    /// Hold `amount` of the user's available balance in `pendingWithdrawals`.
    pub async fn reserve(
        &self,
        user_id: &UserId,
        amount: Decimal,
    ) -> Result<BalanceSheet, LedgerError> {
        let mut tx = self.repo.begin().await?;
        let sheet = reserve_in(&mut tx, user_id, amount).await?;
        tx.commit().await?;
        Ok(sheet)
    }

    pub async fn promote_to_processing(
        &self,
        user_id: &UserId,
        amount: Decimal,
    ) -> Result<BalanceSheet, LedgerError> {
        let mut tx = self.repo.begin().await?;
        let sheet = promote_in(&mut tx, user_id, amount).await?;
        tx.commit().await?;
        Ok(sheet)
    }

    /// Record the debit for a paid withdrawal. Returns false when it had
    /// already been settled.
    pub async fn settle(
        &self,
        user_id: &UserId,
        amount: Decimal,
        withdrawal_id: &str,
        external_ref: &str,
        from: ReservationBucket,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.repo.begin().await?;
        let settled =
            settle_in(&mut tx, user_id, amount, withdrawal_id, external_ref, from).await?;
        tx.commit().await?;
        Ok(settled)
    }

    pub async fn release(
        &self,
        user_id: &UserId,
        amount: Decimal,
        from: ReservationBucket,
    ) -> Result<BalanceSheet, LedgerError> {
        let mut tx = self.repo.begin().await?;
        let sheet = release_in(&mut tx, user_id, amount, from).await?;
        tx.commit().await?;
        Ok(sheet)
    }

    /// Recompute the user's balance sheet from the ledger and open
    /// withdrawals, and overwrite it. Returns `(before, after)`.
    pub async fn rebuild(
        &self,
        user_id: &UserId,
    ) -> Result<(BalanceSheet, BalanceSheet), LedgerError> {
        let mut tx = self.repo.begin().await?;
        lock_balance_sheet(&mut tx, user_id).await?;
        let before = load_sheet(&mut tx, user_id).await?;
        let after = compute_from_ledger(&mut tx, user_id).await?;
        store_balance_sheet(&mut tx, &after).await?;
        tx.commit().await?;
        Ok((before, after))
    }

    /// Current balance sheet; all zeros for a user with no ledger activity.
    pub async fn balance(&self, user_id: &UserId) -> Result<BalanceSheet, LedgerError> {
        Ok(self
            .repo
            .get_balance_sheet(user_id)
            .await?
            .unwrap_or_else(|| BalanceSheet::empty(user_id.clone())))
    }

    /// Read-only check of the stored aggregate against the ledger.
    pub async fn audit(&self, user_id: &UserId) -> Result<InvariantReport, LedgerError> {
        let mut conn = self.repo.pool().acquire().await?;
        audit::audit_user(&mut conn, user_id).await
    }
}

/// Walk `referrer_handle` links upward from the buyer, at most three steps.
///
/// The walk stops at the first handle that does not resolve.
pub async fn resolve_upline(
    conn: &mut SqliteConnection,
    buyer_id: &UserId,
) -> Result<Vec<User>, sqlx::Error> {
    let mut upline = Vec::with_capacity(MAX_GENERATION as usize);
    let Some(mut current) = users::find_by_id(conn, buyer_id).await? else {
        return Ok(upline);
    };

    while upline.len() < MAX_GENERATION as usize {
        let Some(handle) = current.referrer_handle.clone() else {
            break;
        };
        match users::find_by_handle(conn, &handle).await? {
            Some(ancestor) => {
                upline.push(ancestor.clone());
                current = ancestor;
            }
            None => {
                debug!(user = %current.id, referrer = %handle, "Referrer handle does not resolve");
                break;
            }
        }
    }
    Ok(upline)
}

async fn load_sheet(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<BalanceSheet, sqlx::Error> {
    Ok(load_balance_sheet(conn, user_id)
        .await?
        .unwrap_or_else(|| BalanceSheet::empty(user_id.clone())))
}

fn require_positive(amount: Decimal) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::NonPositiveAmount(amount))
    }
}

/// Take `amount` out of a reservation bucket, refusing to go negative.
fn drain_bucket(
    sheet: &mut BalanceSheet,
    bucket: ReservationBucket,
    amount: Decimal,
) -> Result<(), LedgerError> {
    let reserved = sheet.reserved(bucket);
    if reserved < amount {
        let msg = format!(
            "user {} has {} reserved in {:?}, cannot remove {}",
            sheet.user_id, reserved, bucket, amount
        );
        error!(user_id = %sheet.user_id, "{}", msg);
        return Err(LedgerError::InvariantViolation(msg));
    }
    *sheet.reserved_mut(bucket) -= amount;
    Ok(())
}

pub async fn reserve_in(
    conn: &mut SqliteConnection,
    user_id: &UserId,
    amount: Decimal,
) -> Result<BalanceSheet, LedgerError> {
    require_positive(amount)?;
    lock_balance_sheet(conn, user_id).await?;
    let mut sheet = load_sheet(conn, user_id).await?;

    let available = sheet.available();
    if available < amount {
        return Err(LedgerError::InsufficientBalance {
            available,
            requested: amount,
        });
    }
    sheet.pending_withdrawals += amount;
    store_balance_sheet(conn, &sheet).await?;

    debug!(user_id = %user_id, amount = %amount, "Reserved");
    Ok(sheet)
}

pub async fn promote_in(
    conn: &mut SqliteConnection,
    user_id: &UserId,
    amount: Decimal,
) -> Result<BalanceSheet, LedgerError> {
    require_positive(amount)?;
    lock_balance_sheet(conn, user_id).await?;
    let mut sheet = load_sheet(conn, user_id).await?;
    drain_bucket(&mut sheet, ReservationBucket::Pending, amount)?;
    sheet.processing_withdrawals += amount;
    store_balance_sheet(conn, &sheet).await?;

    debug!(user_id = %user_id, amount = %amount, "Promoted reservation to processing");
    Ok(sheet)
}

pub async fn settle_in(
    conn: &mut SqliteConnection,
    user_id: &UserId,
    amount: Decimal,
    withdrawal_id: &str,
    external_ref: &str,
    from: ReservationBucket,
) -> Result<bool, LedgerError> {
    require_positive(amount)?;
    lock_balance_sheet(conn, user_id).await?;

    let debit = WithdrawalDebit {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        amount,
        withdrawal_id: withdrawal_id.to_string(),
        external_ref: external_ref.to_string(),
        created_at: TimeMs::now(),
    };
    if !insert_debit(conn, &debit).await? {
        debug!(withdrawal_id, "Withdrawal already settled");
        return Ok(false);
    }

    let mut sheet = load_sheet(conn, user_id).await?;
    drain_bucket(&mut sheet, from, amount)?;
    sheet.total_withdrawn += amount;
    store_balance_sheet(conn, &sheet).await?;

    info!(
        user_id = %user_id,
        withdrawal_id,
        external_ref,
        amount = %amount,
        "Withdrawal debited"
    );
    Ok(true)
}

pub async fn release_in(
    conn: &mut SqliteConnection,
    user_id: &UserId,
    amount: Decimal,
    from: ReservationBucket,
) -> Result<BalanceSheet, LedgerError> {
    require_positive(amount)?;
    lock_balance_sheet(conn, user_id).await?;
    let mut sheet = load_sheet(conn, user_id).await?;
    drain_bucket(&mut sheet, from, amount)?;
    store_balance_sheet(conn, &sheet).await?;

    debug!(user_id = %user_id, amount = %amount, bucket = ?from, "Released reservation");
    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{Currency, PurchaseKind};
    use tempfile::TempDir;

    async fn setup() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledger.db");
        let pool = init_db(db_path.to_str().unwrap()).await.unwrap();
        let ledger = Ledger::new(Repository::new(pool), SharedCommissionRates::default());
        (ledger, temp_dir)
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_rejects_non_positive() {
        let (ledger, _temp) = setup().await;
        let user = UserId::new("u1");
        let err = ledger.reserve(&user, Decimal::zero()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NonPositiveAmount(_)));
    }

    #[tokio::test]
    async fn test_release_more_than_reserved_is_violation() {
        let (ledger, _temp) = setup().await;
        let user = UserId::new("u1");
        let err = ledger
            .release(&user, dec("1"), ReservationBucket::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
        assert_eq!(ledger.balance(&user).await.unwrap(), BalanceSheet::empty(user));
    }

    #[tokio::test]
    async fn test_unknown_and_incomplete_purchase() {
        let (ledger, _temp) = setup().await;
        let err = ledger.apply_purchase("nope").await.unwrap_err();
        assert!(matches!(err, LedgerError::PurchaseUnknown(_)));

        let repo = ledger.repo().clone();
        repo.upsert_user(&User::new("u1", "alice", None)).await.unwrap();
        repo.insert_purchase(&Purchase {
            id: "p1".to_string(),
            buyer_id: UserId::new("u1"),
            kind: PurchaseKind::Regular,
            gross_amount: dec("1000"),
            currency: Currency::ngn(),
            shares: 1,
            completed_at: None,
        })
        .await
        .unwrap();
        let err = ledger.apply_purchase("p1").await.unwrap_err();
        assert!(matches!(err, LedgerError::PurchaseUnknown(_)));
    }

    #[tokio::test]
    async fn test_resolve_upline_stops_at_missing_handle() {
        let (ledger, _temp) = setup().await;
        let repo = ledger.repo();
        repo.upsert_user(&User::new("a", "alice", Some("ghost"))).await.unwrap();
        repo.upsert_user(&User::new("b", "bob", Some("alice"))).await.unwrap();
        repo.upsert_user(&User::new("c", "carol", Some("bob"))).await.unwrap();

        let mut conn = repo.pool().acquire().await.unwrap();
        let upline = resolve_upline(&mut conn, &UserId::new("c")).await.unwrap();
        let ids: Vec<&str> = upline.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
