//! Database migrations and initialization.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::{info, warn};

/// Initialize the SQLite database with schema and pragmas.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .after_connect(|conn, _meta| Box::pin(async move { configure_pragmas_conn(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized successfully at {}", db_path);
    Ok(pool)
}

/// One credit per (beneficiary, purchase, generation).
pub(crate) const CREDIT_UNIQUE_INDEX: &str = r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_credit_beneficiary_purchase_generation
        ON commission_credits(beneficiary_id, purchase_id, generation)
"#;

/// Run all database migrations.
///
/// The credit uniqueness index is only created on a clean ledger. A database
/// that already holds duplicate credits opens without it, and the duplicate
/// sweep creates it once the duplicates are gone.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    let schema_sql = include_str!("schema.sql");

    for statement in schema_sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    let duplicates: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT 1 FROM commission_credits
        GROUP BY beneficiary_id, purchase_id, generation
        HAVING COUNT(*) > 1
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    if duplicates.is_some() {
        warn!("Duplicate commission credits present; credit uniqueness deferred to the duplicate sweep");
    } else {
        sqlx::query(CREDIT_UNIQUE_INDEX).execute(pool).await?;
    }

    info!("Migrations completed successfully");
    Ok(())
}

/// Configure SQLite pragmas.
///
/// `busy_timeout` matters here: ledger transactions take the write lock up
/// front, and concurrent writers wait on it rather than failing.
async fn configure_pragmas_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Row;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    // journal_mode returns the actual mode set; must use fetch to get result
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    tracing::debug!("SQLite journal_mode set to: {}", journal_mode);

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fresh_pool() -> (SqlitePool, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (pool, temp_dir)
    }

    #[tokio::test]
    async fn test_init_db_creates_database() {
        let (pool, temp_dir) = fresh_pool().await;
        assert!(temp_dir.path().join("test.db").exists());

        let result: (i64,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let (pool, _temp) = fresh_pool().await;

        for table in [
            "users",
            "purchases",
            "commission_credits",
            "withdrawals",
            "withdrawal_debits",
            "balance_sheets",
            "exchange_rates",
            "admin_actions",
        ] {
            let result: (String,) =
                sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name=?")
                    .bind(table)
                    .fetch_one(&pool)
                    .await
                    .unwrap_or_else(|e| panic!("missing table {}: {}", table, e));
            assert_eq!(result.0, table);
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let (pool, _temp) = fresh_pool().await;

        run_migrations(&pool)
            .await
            .expect("second migration run failed");

        let result: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type='table'")
                .fetch_one(&pool)
                .await
                .expect("query failed");
        assert!(result.0 > 0);
    }

    #[tokio::test]
    async fn test_reopen_with_duplicate_credits_defers_index() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.unwrap();
        sqlx::query("DROP INDEX uq_credit_beneficiary_purchase_generation")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, handle, created_at) VALUES ('a', 'a', 1)")
            .execute(&pool)
            .await
            .unwrap();
        for id in ["c1", "c2"] {
            sqlx::query(
                r#"
                INSERT INTO commission_credits (
                    id, beneficiary_id, descendant_id, generation, purchase_id, kind,
                    amount, currency, rate_at_post, created_at
                ) VALUES (?, 'a', 'b', 1, 'p1', 'regular', '1500', 'NGN', '15', 1)
                "#,
            )
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        }
        pool.close().await;

        let pool = init_db(&db_path).await.expect("reopen failed");
        let index: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='index' AND name='uq_credit_beneficiary_purchase_generation'",
        )
        .fetch_optional(&pool)
        .await
        .unwrap();
        assert!(index.is_none());
    }

    #[tokio::test]
    async fn test_single_active_exchange_rate_enforced() {
        let (pool, _temp) = fresh_pool().await;

        sqlx::query(
            "INSERT INTO exchange_rates (ngn_per_usdt, ngn_per_bnb, fetched_at, active) VALUES ('1650', '900000', 1, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let second = sqlx::query(
            "INSERT INTO exchange_rates (ngn_per_usdt, ngn_per_bnb, fetched_at, active) VALUES ('1700', '900000', 2, 1)",
        )
        .execute(&pool)
        .await;
        assert!(second.is_err(), "two active rates must be rejected");
    }

    #[tokio::test]
    async fn test_pragmas_configured() {
        let (pool, _temp) = fresh_pool().await;

        let result: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        // `journal_mode=WAL` is best-effort; SQLite can fall back depending on environment.
        assert!(
            matches!(result.0.as_str(), "wal" | "delete"),
            "unexpected journal_mode: {}",
            result.0
        );
    }
}
