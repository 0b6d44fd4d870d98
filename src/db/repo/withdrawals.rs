//! Withdrawal rows and guarded state updates.

use crate::domain::{
    make_client_ref, CryptoQuote, Decimal, RecipientDetails, SettlementMode, TimeMs, UserId,
    Withdrawal, WithdrawalState,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decode_decimal, decode_enum, decode_error, is_unique_violation_on, Repository};

/// Tries at a free client reference before the collision is returned.
const CLIENT_REF_ATTEMPTS: usize = 8;

const WITHDRAWAL_COLUMNS: &str = r#"
    id, user_id, amount, rail, mode, state, client_ref, external_ref, payload,
    ngn_per_usdt, amount_usdt, reason_on_failure, created_at, submitted_at,
    approved_at, processing_at, paid_at, failed_at, rejected_at, updated_at
"#;

fn withdrawal_from_row(row: &SqliteRow) -> Result<Withdrawal, sqlx::Error> {
    let amount: String = row.get("amount");
    let rail: String = row.get("rail");
    let mode: String = row.get("mode");
    let state: String = row.get("state");
    let payload: String = row.get("payload");
    let ngn_per_usdt: Option<String> = row.get("ngn_per_usdt");
    let amount_usdt: Option<String> = row.get("amount_usdt");
    let ts = |col: &str| row.get::<Option<i64>, _>(col).map(TimeMs::new);

    let quote = match (ngn_per_usdt, amount_usdt) {
        (Some(rate), Some(usdt)) => Some(CryptoQuote {
            ngn_per_usdt: decode_decimal("ngn_per_usdt", &rate)?,
            amount_usdt: decode_decimal("amount_usdt", &usdt)?,
        }),
        _ => None,
    };
    let payload: RecipientDetails =
        serde_json::from_str(&payload).map_err(|e| decode_error("payload", &payload, e))?;

    Ok(Withdrawal {
        id: row.get("id"),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        amount: decode_decimal("amount", &amount)?,
        rail: decode_enum("rail", &rail)?,
        mode: decode_enum::<SettlementMode>("mode", &mode)?,
        state: decode_enum("state", &state)?,
        client_ref: row.get("client_ref"),
        external_ref: row.get("external_ref"),
        payload,
        quote,
        reason_on_failure: row.get("reason_on_failure"),
        created_at: TimeMs::new(row.get("created_at")),
        submitted_at: ts("submitted_at"),
        approved_at: ts("approved_at"),
        processing_at: ts("processing_at"),
        paid_at: ts("paid_at"),
        failed_at: ts("failed_at"),
        rejected_at: ts("rejected_at"),
        updated_at: TimeMs::new(row.get("updated_at")),
    })
}

/// Insert a new withdrawal row.
///
/// Fails with a unique violation if the user already has an active
/// withdrawal (partial index) or the client reference is taken.
pub async fn insert_withdrawal(
    conn: &mut SqliteConnection,
    w: &Withdrawal,
) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_string(&w.payload)
        .map_err(|e| sqlx::Error::Protocol(format!("payload encode: {}", e)))?;
    sqlx::query(
        r#"
        INSERT INTO withdrawals (
            id, user_id, amount, rail, mode, state, client_ref, external_ref, payload,
            ngn_per_usdt, amount_usdt, reason_on_failure, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&w.id)
    .bind(w.user_id.as_str())
    .bind(w.amount.to_canonical_string())
    .bind(w.rail.to_string())
    .bind(w.mode.to_string())
    .bind(w.state.as_str())
    .bind(&w.client_ref)
    .bind(w.external_ref.as_deref())
    .bind(payload)
    .bind(w.quote.map(|q| q.ngn_per_usdt.to_canonical_string()))
    .bind(w.quote.map(|q| q.amount_usdt.to_canonical_string()))
    .bind(w.reason_on_failure.as_deref())
    .bind(w.created_at.as_ms())
    .bind(w.updated_at.as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert `w`, moving its client reference one millisecond on while the
/// reference is taken by an earlier withdrawal of the same user.
pub async fn insert_withdrawal_with_fresh_ref(
    conn: &mut SqliteConnection,
    w: &mut Withdrawal,
) -> Result<(), sqlx::Error> {
    let mut stamp = w.created_at;
    for _ in 0..CLIENT_REF_ATTEMPTS {
        match insert_withdrawal(conn, w).await {
            Err(e) if is_unique_violation_on(&e, "withdrawals.client_ref") => {
                stamp = TimeMs::new(stamp.as_ms() + 1);
                w.client_ref = make_client_ref(w.rail, &w.user_id, stamp);
            }
            other => return other,
        }
    }
    insert_withdrawal(conn, w).await
}

pub async fn find_withdrawal(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Withdrawal>, sqlx::Error> {
    let sql = format!("SELECT {} FROM withdrawals WHERE id = ?", WITHDRAWAL_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(withdrawal_from_row).transpose()
}

/// The user's active (pending, approved or processing) withdrawal, if any.
pub async fn find_active_for_user(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<Option<Withdrawal>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM withdrawals WHERE user_id = ? AND state IN ('pending', 'approved', 'processing') ORDER BY created_at ASC LIMIT 1",
        WITHDRAWAL_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(user_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(withdrawal_from_row).transpose()
}

/// Fields written alongside a state change.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate<'a> {
    pub external_ref: Option<&'a str>,
    pub reason: Option<&'a str>,
}

/// Compare-and-set the state of a withdrawal.
///
/// Returns false if the row was not in `from` (someone else moved it first).
pub async fn update_state(
    conn: &mut SqliteConnection,
    id: &str,
    from: WithdrawalState,
    to: WithdrawalState,
    update: StateUpdate<'_>,
    at: TimeMs,
) -> Result<bool, sqlx::Error> {
    let stamp_column = match to {
        WithdrawalState::Pending => "updated_at",
        WithdrawalState::Approved => "approved_at",
        WithdrawalState::Processing => "processing_at",
        WithdrawalState::Paid => "paid_at",
        WithdrawalState::Failed => "failed_at",
        WithdrawalState::Rejected => "rejected_at",
    };
    let sql = format!(
        r#"
        UPDATE withdrawals SET
            state = ?,
            external_ref = COALESCE(?, external_ref),
            reason_on_failure = COALESCE(?, reason_on_failure),
            {} = ?,
            updated_at = ?
        WHERE id = ? AND state = ?
        "#,
        stamp_column
    );
    let result = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(update.external_ref)
        .bind(update.reason)
        .bind(at.as_ms())
        .bind(at.as_ms())
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Reserved amounts per bucket, summed from the user's active withdrawals.
pub async fn active_reservations(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<(Decimal, Decimal), sqlx::Error> {
    let rows = sqlx::query(
        "SELECT amount, state FROM withdrawals WHERE user_id = ? AND state IN ('pending', 'approved', 'processing')",
    )
    .bind(user_id.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut pending = Decimal::zero();
    let mut processing = Decimal::zero();
    for row in rows {
        let amount: String = row.get("amount");
        let state: String = row.get("state");
        let amount = decode_decimal("amount", &amount)?;
        match decode_enum::<WithdrawalState>("state", &state)? {
            WithdrawalState::Processing => processing += amount,
            _ => pending += amount,
        }
    }
    Ok((pending, processing))
}

/// Number of active withdrawals held by a user.
pub async fn count_active_for_user(
    conn: &mut SqliteConnection,
    user_id: &UserId,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM withdrawals WHERE user_id = ? AND state IN ('pending', 'approved', 'processing')",
    )
    .bind(user_id.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.get("n"))
}

impl Repository {
    pub async fn get_withdrawal(&self, id: &str) -> Result<Option<Withdrawal>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        find_withdrawal(&mut conn, id).await
    }

    pub async fn get_withdrawal_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<Withdrawal>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE client_ref = ?",
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(client_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(withdrawal_from_row).transpose()
    }

    /// A user's withdrawals, newest first.
    pub async fn list_withdrawals(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<Withdrawal>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE user_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
            WITHDRAWAL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(withdrawal_from_row).collect()
    }

    /// Instant-mode withdrawals awaiting settlement, oldest first.
    pub async fn list_unsettled_instant(
        &self,
        user_id: Option<&UserId>,
    ) -> Result<Vec<Withdrawal>, sqlx::Error> {
        let filter = if user_id.is_some() {
            "AND user_id = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE mode = 'instant' AND state IN ('pending', 'processing') {} ORDER BY created_at ASC",
            WITHDRAWAL_COLUMNS, filter
        );
        let mut query = sqlx::query(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(withdrawal_from_row).collect()
    }

    /// Claim the first hand-off of a pending withdrawal to its adapter.
    ///
    /// Returns `false` if another caller already claimed it or it has left
    /// `pending`; that caller owns the submission.
    pub async fn claim_submission(&self, id: &str, at: TimeMs) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE withdrawals SET submitted_at = ?, updated_at = ? WHERE id = ? AND state = 'pending' AND submitted_at IS NULL",
        )
        .bind(at.as_ms())
        .bind(at.as_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-stamp an in-flight withdrawal that is being sent again. Only for
    /// rails whose provider deduplicates on the client reference.
    pub async fn reclaim_submission(&self, id: &str, at: TimeMs) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE withdrawals SET submitted_at = ?, updated_at = ? WHERE id = ? AND state IN ('pending', 'processing')",
        )
        .bind(at.as_ms())
        .bind(at.as_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Undo [`claim_submission`](Self::claim_submission) when the adapter
    /// failed before anything left the process.
    pub async fn clear_submitted(&self, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE withdrawals SET submitted_at = NULL WHERE id = ? AND state = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the external reference of an in-flight withdrawal.
    pub async fn set_external_ref(&self, id: &str, external_ref: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE withdrawals SET external_ref = ?, updated_at = ? WHERE id = ? AND external_ref IS NULL",
        )
        .bind(external_ref)
        .bind(TimeMs::now().as_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
