//! Exchange-rate cache. Exactly one row is active at a time.

use crate::domain::{Decimal, ExchangeRate, TimeMs};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{decode_decimal, Repository};

fn rate_from_row(row: &SqliteRow) -> Result<ExchangeRate, sqlx::Error> {
    let usdt: String = row.get("ngn_per_usdt");
    let bnb: String = row.get("ngn_per_bnb");
    Ok(ExchangeRate {
        id: row.get("id"),
        ngn_per_usdt: decode_decimal("ngn_per_usdt", &usdt)?,
        ngn_per_bnb: decode_decimal("ngn_per_bnb", &bnb)?,
        fetched_at: TimeMs::new(row.get("fetched_at")),
        active: row.get::<i64, _>("active") != 0,
    })
}

impl Repository {
    /// Store a fresh rate and make it the only active one.
    pub async fn activate_exchange_rate(
        &self,
        ngn_per_usdt: Decimal,
        ngn_per_bnb: Decimal,
        fetched_at: TimeMs,
    ) -> Result<ExchangeRate, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE exchange_rates SET active = 0 WHERE active = 1")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "INSERT INTO exchange_rates (ngn_per_usdt, ngn_per_bnb, fetched_at, active) VALUES (?, ?, ?, 1)",
        )
        .bind(ngn_per_usdt.to_canonical_string())
        .bind(ngn_per_bnb.to_canonical_string())
        .bind(fetched_at.as_ms())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ExchangeRate {
            id: result.last_insert_rowid(),
            ngn_per_usdt,
            ngn_per_bnb,
            fetched_at,
            active: true,
        })
    }

    pub async fn active_exchange_rate(&self) -> Result<Option<ExchangeRate>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, ngn_per_usdt, ngn_per_bnb, fetched_at, active FROM exchange_rates WHERE active = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rate_from_row).transpose()
    }
}
