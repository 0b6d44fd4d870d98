//! Users, referral handles and withdrawal recipients.

use crate::domain::{BankAccount, CryptoWallet, Handle, TimeMs, User, UserId};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::Repository;

fn user_from_row(row: &SqliteRow) -> User {
    let referrer: Option<String> = row.get("referrer_handle");
    User {
        id: UserId::new(row.get::<String, _>("id")),
        handle: Handle::new(row.get::<String, _>("handle")),
        referrer_handle: referrer.map(Handle::new),
        withdrawals_suspended: row.get::<i64, _>("withdrawals_suspended") != 0,
    }
}

/// Look up a user by id.
pub async fn find_by_id(
    conn: &mut SqliteConnection,
    id: &UserId,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, handle, referrer_handle, withdrawals_suspended FROM users WHERE id = ?",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(user_from_row))
}

/// Look up a user by public handle.
pub async fn find_by_handle(
    conn: &mut SqliteConnection,
    handle: &Handle,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, handle, referrer_handle, withdrawals_suspended FROM users WHERE handle = ?",
    )
    .bind(handle.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(user_from_row))
}

/// Set or clear the suspension flag. Returns false if the user is unknown.
pub async fn set_withdrawals_suspended(
    conn: &mut SqliteConnection,
    id: &UserId,
    suspended: bool,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET withdrawals_suspended = ? WHERE id = ?")
        .bind(suspended as i64)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Null a referrer handle, but only if it still holds `expected`.
pub async fn clear_referrer(
    conn: &mut SqliteConnection,
    id: &UserId,
    expected: &Handle,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE users SET referrer_handle = NULL WHERE id = ? AND referrer_handle = ?",
    )
    .bind(id.as_str())
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

impl Repository {
    /// Insert a user, or update the mutable fields of an existing one.
    ///
    /// The handle of an existing user is never rewritten.
    pub async fn upsert_user(&self, user: &User) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO users (id, handle, referrer_handle, withdrawals_suspended, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                referrer_handle = excluded.referrer_handle,
                withdrawals_suspended = excluded.withdrawals_suspended
            "#,
        )
        .bind(user.id.as_str())
        .bind(user.handle.as_str())
        .bind(user.referrer_handle.as_ref().map(|h| h.as_str()))
        .bind(user.withdrawals_suspended as i64)
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &UserId) -> Result<Option<User>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        find_by_id(&mut conn, id).await
    }

    pub async fn list_user_ids(&self) -> Result<Vec<UserId>, sqlx::Error> {
        let rows = sqlx::query("SELECT id FROM users ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| UserId::new(r.get::<String, _>("id")))
            .collect())
    }

    /// Users whose `referrer_handle` names no existing user.
    pub async fn list_users_with_broken_referrer(&self) -> Result<Vec<User>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.handle, u.referrer_handle, u.withdrawals_suspended
            FROM users u
            WHERE u.referrer_handle IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM users r WHERE r.handle = u.referrer_handle)
            ORDER BY u.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn upsert_bank_account(
        &self,
        user_id: &UserId,
        account: &BankAccount,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO bank_accounts (user_id, account_number, bank_code, bank_name, account_name, verified, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                account_number = excluded.account_number,
                bank_code = excluded.bank_code,
                bank_name = excluded.bank_name,
                account_name = excluded.account_name,
                verified = excluded.verified,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(&account.account_number)
        .bind(&account.bank_code)
        .bind(&account.bank_name)
        .bind(&account.account_name)
        .bind(account.verified as i64)
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_bank_account(
        &self,
        user_id: &UserId,
    ) -> Result<Option<BankAccount>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT account_number, bank_code, bank_name, account_name, verified FROM bank_accounts WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| BankAccount {
            account_number: r.get("account_number"),
            bank_code: r.get("bank_code"),
            bank_name: r.get("bank_name"),
            account_name: r.get("account_name"),
            verified: r.get::<i64, _>("verified") != 0,
        }))
    }

    pub async fn upsert_crypto_wallet(
        &self,
        user_id: &UserId,
        wallet: &CryptoWallet,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO crypto_wallets (user_id, address, verified, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                address = excluded.address,
                verified = excluded.verified,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id.as_str())
        .bind(&wallet.address)
        .bind(wallet.verified as i64)
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_crypto_wallet(
        &self,
        user_id: &UserId,
    ) -> Result<Option<CryptoWallet>, sqlx::Error> {
        let row = sqlx::query("SELECT address, verified FROM crypto_wallets WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| CryptoWallet {
            address: r.get("address"),
            verified: r.get::<i64, _>("verified") != 0,
        }))
    }
}
