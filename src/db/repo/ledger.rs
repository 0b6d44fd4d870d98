//! Commission credits, withdrawal debits and balance sheets.
//!
//! Decimal sums are computed in Rust, never with SQL `SUM`, which would go
//! through REAL and lose precision.

use crate::domain::{
    BalanceSheet, CommissionCredit, Currency, Decimal, Generation, GenerationBucket, TimeMs,
    UserId, WithdrawalDebit,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decode_decimal, decode_enum, decode_error, Repository};
use crate::db::migrations::CREDIT_UNIQUE_INDEX;

/// Lazily create the user's balance sheet.
///
/// This is a write, so running it first in a transaction takes SQLite's write
/// lock before anything is read. Every mutating ledger transaction starts
/// here; that is what serialises operations on the same user.
pub async fn lock_balance_sheet(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO balance_sheets (user_id, updated_at) VALUES (?, ?) ON CONFLICT(user_id) DO NOTHING",
    )
    .bind(user_id.as_str())
    .bind(TimeMs::now().as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn sheet_from_row(row: &SqliteRow) -> Result<BalanceSheet, sqlx::Error> {
    let dec = |col: &str| -> Result<Decimal, sqlx::Error> {
        let raw: String = row.get(col);
        decode_decimal(col, &raw)
    };
    let bucket = |count: &str, earnings: &str| -> Result<GenerationBucket, sqlx::Error> {
        Ok(GenerationBucket {
            count: row.get(count),
            earnings: dec(earnings)?,
        })
    };
    Ok(BalanceSheet {
        user_id: UserId::new(row.get::<String, _>("user_id")),
        total_earnings: dec("total_earnings")?,
        total_withdrawn: dec("total_withdrawn")?,
        pending_withdrawals: dec("pending_withdrawals")?,
        processing_withdrawals: dec("processing_withdrawals")?,
        generations: [
            bucket("gen1_count", "gen1_earnings")?,
            bucket("gen2_count", "gen2_earnings")?,
            bucket("gen3_count", "gen3_earnings")?,
        ],
    })
}

pub async fn load_balance_sheet(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<Option<BalanceSheet>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM balance_sheets WHERE user_id = ?")
        .bind(user_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(sheet_from_row).transpose()
}

/// Overwrite every field of the user's balance sheet.
pub async fn store_balance_sheet(
    conn: &mut SqliteConnection,
    sheet: &BalanceSheet,
) -> Result<(), sqlx::Error> {
    let [g1, g2, g3] = sheet.generations;
    sqlx::query(
        r#"
        INSERT INTO balance_sheets (
            user_id, total_earnings, total_withdrawn, pending_withdrawals, processing_withdrawals,
            gen1_count, gen1_earnings, gen2_count, gen2_earnings, gen3_count, gen3_earnings, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            total_earnings = excluded.total_earnings,
            total_withdrawn = excluded.total_withdrawn,
            pending_withdrawals = excluded.pending_withdrawals,
            processing_withdrawals = excluded.processing_withdrawals,
            gen1_count = excluded.gen1_count,
            gen1_earnings = excluded.gen1_earnings,
            gen2_count = excluded.gen2_count,
            gen2_earnings = excluded.gen2_earnings,
            gen3_count = excluded.gen3_count,
            gen3_earnings = excluded.gen3_earnings,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(sheet.user_id.as_str())
    .bind(sheet.total_earnings.to_canonical_string())
    .bind(sheet.total_withdrawn.to_canonical_string())
    .bind(sheet.pending_withdrawals.to_canonical_string())
    .bind(sheet.processing_withdrawals.to_canonical_string())
    .bind(g1.count)
    .bind(g1.earnings.to_canonical_string())
    .bind(g2.count)
    .bind(g2.earnings.to_canonical_string())
    .bind(g3.count)
    .bind(g3.earnings.to_canonical_string())
    .bind(TimeMs::now().as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a credit. Returns false when `(beneficiary, purchase, generation)`
/// already exists.
pub async fn insert_credit(
    conn: &mut SqliteConnection,
    credit: &CommissionCredit,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO commission_credits (
            id, beneficiary_id, descendant_id, generation, purchase_id, kind,
            amount, currency, rate_at_post, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(beneficiary_id, purchase_id, generation) DO NOTHING
        "#,
    )
    .bind(&credit.id)
    .bind(credit.beneficiary_id.as_str())
    .bind(credit.descendant_id.as_str())
    .bind(credit.generation.get() as i64)
    .bind(&credit.purchase_id)
    .bind(credit.kind.to_string())
    .bind(credit.amount.to_canonical_string())
    .bind(credit.currency.as_str())
    .bind(credit.rate_at_post.to_canonical_string())
    .bind(credit.created_at.as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn credit_from_row(row: &SqliteRow) -> Result<CommissionCredit, sqlx::Error> {
    let generation: i64 = row.get("generation");
    let kind: String = row.get("kind");
    let amount: String = row.get("amount");
    let rate: String = row.get("rate_at_post");
    Ok(CommissionCredit {
        id: row.get("id"),
        beneficiary_id: UserId::new(row.get::<String, _>("beneficiary_id")),
        descendant_id: UserId::new(row.get::<String, _>("descendant_id")),
        generation: decode_generation(generation)?,
        purchase_id: row.get("purchase_id"),
        kind: decode_enum("kind", &kind)?,
        amount: decode_decimal("amount", &amount)?,
        currency: Currency::new(row.get::<String, _>("currency")),
        rate_at_post: decode_decimal("rate_at_post", &rate)?,
        created_at: TimeMs::new(row.get("created_at")),
    })
}

fn decode_generation(raw: i64) -> Result<Generation, sqlx::Error> {
    u8::try_from(raw)
        .ok()
        .and_then(Generation::new)
        .ok_or_else(|| decode_error("generation", &raw.to_string(), "out of range"))
}

/// All credits earned by `user_id`, oldest first.
pub async fn credits_for_beneficiary(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<Vec<CommissionCredit>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, beneficiary_id, descendant_id, generation, purchase_id, kind,
               amount, currency, rate_at_post, created_at
        FROM commission_credits
        WHERE beneficiary_id = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(user_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(credit_from_row).collect()
}

/// Insert a debit. Returns false when the withdrawal was already debited.
pub async fn insert_debit(
    conn: &mut SqliteConnection,
    debit: &WithdrawalDebit,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO withdrawal_debits (id, user_id, amount, withdrawal_id, external_ref, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(withdrawal_id) DO NOTHING
        "#,
    )
    .bind(&debit.id)
    .bind(debit.user_id.as_str())
    .bind(debit.amount.to_canonical_string())
    .bind(&debit.withdrawal_id)
    .bind(&debit.external_ref)
    .bind(debit.created_at.as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn debit_from_row(row: &SqliteRow) -> Result<WithdrawalDebit, sqlx::Error> {
    let amount: String = row.get("amount");
    Ok(WithdrawalDebit {
        id: row.get("id"),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        amount: decode_decimal("amount", &amount)?,
        withdrawal_id: row.get("withdrawal_id"),
        external_ref: row.get("external_ref"),
        created_at: TimeMs::new(row.get("created_at")),
    })
}

pub async fn debits_for_user(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<Vec<WithdrawalDebit>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, amount, withdrawal_id, external_ref, created_at
        FROM withdrawal_debits
        WHERE user_id = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(user_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(debit_from_row).collect()
}

pub async fn find_debit_for_withdrawal(
    conn: &mut SqliteConnection,
    withdrawal_id: &str,
) -> Result<Option<WithdrawalDebit>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, amount, withdrawal_id, external_ref, created_at
        FROM withdrawal_debits
        WHERE withdrawal_id = ?
        "#,
    )
    .bind(withdrawal_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(debit_from_row).transpose()
}

/// Key of a group of credits that should have been unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditKey {
    pub beneficiary_id: UserId,
    pub purchase_id: String,
    pub generation: Generation,
}

/// One stored credit row inside a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRowRef {
    pub id: String,
    pub amount: Decimal,
}

/// Credits of one duplicate group, earliest first.
pub async fn credits_in_group(
    conn: &mut SqliteConnection,
    key: &CreditKey,
) -> Result<Vec<CreditRowRef>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, amount
        FROM commission_credits
        WHERE beneficiary_id = ? AND purchase_id = ? AND generation = ?
        ORDER BY created_at ASC, rowid ASC
        "#,
    )
    .bind(key.beneficiary_id.as_str())
    .bind(&key.purchase_id)
    .bind(key.generation.get() as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter()
        .map(|r| {
            let amount: String = r.get("amount");
            Ok(CreditRowRef {
                id: r.get("id"),
                amount: decode_decimal("amount", &amount)?,
            })
        })
        .collect()
}

pub async fn delete_credit(conn: &mut SqliteConnection, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM commission_credits WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

impl Repository {
    /// Read a user's balance sheet, if one was ever created.
    pub async fn get_balance_sheet(
        &self,
        user_id: &UserId,
    ) -> Result<Option<BalanceSheet>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        load_balance_sheet(&mut conn, user_id).await
    }

    pub async fn list_credits(&self, user_id: &UserId) -> Result<Vec<CommissionCredit>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        credits_for_beneficiary(&mut conn, user_id).await
    }

    pub async fn list_debits(&self, user_id: &UserId) -> Result<Vec<WithdrawalDebit>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        debits_for_user(&mut conn, user_id).await
    }

    /// Credits of a purchase, ordered by generation.
    pub async fn credits_for_purchase(
        &self,
        purchase_id: &str,
    ) -> Result<Vec<CommissionCredit>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, beneficiary_id, descendant_id, generation, purchase_id, kind,
                   amount, currency, rate_at_post, created_at
            FROM commission_credits
            WHERE purchase_id = ?
            ORDER BY generation ASC, rowid ASC
            "#,
        )
        .bind(purchase_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(credit_from_row).collect()
    }

    /// Users that own a balance sheet or appear anywhere in the ledger.
    pub async fn list_ledger_user_ids(&self) -> Result<Vec<UserId>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT user_id FROM balance_sheets
            UNION SELECT beneficiary_id FROM commission_credits
            UNION SELECT user_id FROM withdrawal_debits
            UNION SELECT user_id FROM withdrawals
            ORDER BY 1 ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| UserId::new(r.get::<String, _>(0)))
            .collect())
    }

    /// `(beneficiary, purchase, generation)` keys held by more than one credit.
    pub async fn find_duplicate_credit_keys(&self) -> Result<Vec<CreditKey>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT beneficiary_id, purchase_id, generation
            FROM commission_credits
            GROUP BY beneficiary_id, purchase_id, generation
            HAVING COUNT(*) > 1
            ORDER BY beneficiary_id ASC, purchase_id ASC, generation ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(CreditKey {
                    beneficiary_id: UserId::new(r.get::<String, _>("beneficiary_id")),
                    purchase_id: r.get("purchase_id"),
                    generation: decode_generation(r.get("generation"))?,
                })
            })
            .collect()
    }

    /// (Re)create the storage-level no-double-credit constraint.
    pub async fn ensure_credit_uniqueness(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREDIT_UNIQUE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Whether the credit uniqueness index is in place. It is missing only
    /// when the database was opened with duplicate credits still present.
    pub async fn credit_uniqueness_enforced(&self) -> Result<bool, sqlx::Error> {
        let index: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'uq_credit_beneficiary_purchase_generation'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(index.is_some())
    }
}
