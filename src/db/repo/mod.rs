//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for pool-level reads and
//! connection-scoped functions for work that must share a transaction.
//! Functions are organized across submodules by domain:
//! - `users.rs` - Users, referral handles, recipient details
//! - `purchases.rs` - Purchase events
//! - `ledger.rs` - Commission credits, withdrawal debits, balance sheets
//! - `withdrawals.rs` - Withdrawal rows and state updates
//! - `rates.rs` - Exchange-rate cache
//! - `admin.rs` - Admin audit log

pub mod admin;
pub mod ledger;
pub mod purchases;
pub mod rates;
pub mod users;
pub mod withdrawals;

use crate::domain::Decimal;
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Underlying pool, for callers that run their own statements.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction.
    ///
    /// Ledger transactions must write before they read (see
    /// [`ledger::lock_balance_sheet`]) so SQLite hands out the write lock up
    /// front instead of failing the upgrade later.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }
}

/// Parse a stored decimal column.
pub(crate) fn decode_decimal(column: &str, raw: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(raw).map_err(|e| decode_error(column, raw, e))
}

/// Parse a stored enum column.
pub(crate) fn decode_enum<T: FromStr>(column: &str, raw: &str) -> Result<T, sqlx::Error>
where
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| decode_error(column, raw, e))
}

pub(crate) fn decode_error(column: &str, raw: &str, err: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(format!("invalid {} value {:?}: {}", column, raw, err).into())
}

/// True when `err` is a UNIQUE violation naming `column` (`table.column`).
pub(crate) fn is_unique_violation_on(err: &sqlx::Error, column: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.message().contains(column),
        _ => false,
    }
}
