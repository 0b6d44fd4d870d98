//! Purchase events.

use crate::domain::{Currency, Purchase, TimeMs, UserId};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decode_decimal, decode_enum, Repository};

fn purchase_from_row(row: &SqliteRow) -> Result<Purchase, sqlx::Error> {
    let kind: String = row.get("kind");
    let gross: String = row.get("gross_amount");
    let completed_at: Option<i64> = row.get("completed_at");
    Ok(Purchase {
        id: row.get("id"),
        buyer_id: UserId::new(row.get::<String, _>("buyer_id")),
        kind: decode_enum("kind", &kind)?,
        gross_amount: decode_decimal("gross_amount", &gross)?,
        currency: Currency::new(row.get::<String, _>("currency")),
        shares: row.get("shares"),
        completed_at: completed_at.map(TimeMs::new),
    })
}

pub async fn find_purchase(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Purchase>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, buyer_id, kind, gross_amount, currency, shares, completed_at
        FROM purchases
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(purchase_from_row).transpose()
}

impl Repository {
    /// Record a purchase event idempotently.
    ///
    /// Returns false if a purchase with the same id already exists.
    pub async fn insert_purchase(&self, purchase: &Purchase) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO purchases (id, buyer_id, kind, gross_amount, currency, shares, completed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&purchase.id)
        .bind(purchase.buyer_id.as_str())
        .bind(purchase.kind.to_string())
        .bind(purchase.gross_amount.to_canonical_string())
        .bind(purchase.currency.as_str())
        .bind(purchase.shares)
        .bind(purchase.completed_at.map(|t| t.as_ms()))
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a purchase completed. Already-completed purchases keep their time.
    pub async fn mark_purchase_completed(
        &self,
        id: &str,
        at: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE purchases SET completed_at = ? WHERE id = ? AND completed_at IS NULL",
        )
        .bind(at.as_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_purchase(&self, id: &str) -> Result<Option<Purchase>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        find_purchase(&mut conn, id).await
    }
}
