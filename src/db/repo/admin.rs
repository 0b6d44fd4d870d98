//! Admin audit log.

use crate::domain::{AdminAction, TimeMs};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::{decode_enum, Repository};

/// Append an audit row inside the caller's transaction.
pub async fn record_admin_action(
    conn: &mut SqliteConnection,
    action: &AdminAction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO admin_actions (actor_id, action, target_id, reason, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&action.actor_id)
    .bind(action.action.as_str())
    .bind(&action.target_id)
    .bind(&action.reason)
    .bind(action.created_at.as_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Repository {
    /// Audit rows touching `target_id`, oldest first.
    pub async fn list_admin_actions(
        &self,
        target_id: &str,
    ) -> Result<Vec<AdminAction>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT actor_id, action, target_id, reason, created_at
            FROM admin_actions
            WHERE target_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let action: String = r.get("action");
                Ok(AdminAction {
                    actor_id: r.get("actor_id"),
                    action: decode_enum("action", &action)?,
                    target_id: r.get("target_id"),
                    reason: r.get("reason"),
                    created_at: TimeMs::new(r.get("created_at")),
                })
            })
            .collect()
    }
}
