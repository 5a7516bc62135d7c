//! Device token directory seam.
//!
//! The directory itself is owned elsewhere; the dispatcher only retires dead
//! addresses and records when live ones were last used.

use async_trait::async_trait;
use sqlx::PgPool;

/// Operations the dispatcher needs from the token directory.
///
/// Both calls must be idempotent: retiring an already-retired address is a no-op.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn deactivate(&self, addresses: &[String]) -> anyhow::Result<()>;

    async fn touch_last_used(&self, addresses: &[String]) -> anyhow::Result<()>;
}

/// Token store that only logs; used when no directory is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTokenStore;

#[async_trait]
impl TokenStore for NoopTokenStore {
    async fn deactivate(&self, addresses: &[String]) -> anyhow::Result<()> {
        tracing::debug!(count = addresses.len(), "No token store configured, skipping deactivation");
        Ok(())
    }

    async fn touch_last_used(&self, _addresses: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Token store backed by the `device_tokens` table.
#[derive(Debug, Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn deactivate(&self, addresses: &[String]) -> anyhow::Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE device_tokens
            SET active = false, deactivated_at = NOW()
            WHERE token = ANY($1) AND active = true
            "#,
        )
        .bind(addresses.to_vec())
        .execute(&self.pool)
        .await?;

        tracing::info!(
            requested = addresses.len(),
            deactivated = result.rows_affected(),
            "Deactivated device tokens"
        );
        Ok(())
    }

    async fn touch_last_used(&self, addresses: &[String]) -> anyhow::Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE device_tokens SET last_used_at = NOW() WHERE token = ANY($1)")
            .bind(addresses.to_vec())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
