//! TTL locks in the `engine_locks` table.
//!
//! Acquire is an upsert that only overwrites an expired row, so at most one
//! live token exists per key.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::lock::{LockService, LockToken};

#[async_trait]
impl LockService for super::Db {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO engine_locks (key, token, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE engine_locks.expires_at <= now()
             RETURNING token",
        )
        .bind(key)
        .bind(&token.0)
        .bind(ttl.as_secs_f64())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.filter(|(t,)| *t == token.0).map(|_| token))
    }

    async fn heartbeat(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE engine_locks SET expires_at = now() + make_interval(secs => $3)
             WHERE key = $1 AND token = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(&token.0)
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let rows_affected = sqlx::query("DELETE FROM engine_locks WHERE key = $1 AND token = $2")
            .bind(key)
            .bind(&token.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(rows_affected == 1)
    }
}
