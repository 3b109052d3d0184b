use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::user::{Role, UserRecord},
};

/// Read access to accounts plus the single flag the MFA flow owns.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Finds an active user by email, case-insensitively.
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserRecord>>;

    async fn set_mfa_enabled(&self, user_id: Uuid, enabled: bool) -> Result<()>;
}

/// A helper function to map a `tokio_postgres::Row` to a `UserRecord`.
fn row_to_user(row: &Row) -> Result<UserRecord> {
    let role: String = row.try_get("role")?;
    Ok(UserRecord {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse::<Role>().map_err(AppError::Internal)?,
        mfa_enabled: row.try_get("mfa_enabled")?,
        is_active: row.try_get("is_active")?,
    })
}

/// The `users` table behind a connection pool.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: Pool,
}

impl PgUserDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT id, email, password_hash, role, mfa_enabled, is_active
                FROM users
                WHERE lower(email) = lower($1) AND is_active = true
                "#,
                &[&email],
            )
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT id, email, password_hash, role, mfa_enabled, is_active
                FROM users
                WHERE id = $1
                "#,
                &[&user_id],
            )
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    async fn set_mfa_enabled(&self, user_id: Uuid, enabled: bool) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE users
                SET mfa_enabled = $1, updated_at = NOW()
                WHERE id = $2
                "#,
                &[&enabled, &user_id],
            )
            .await?;

        if updated == 0 {
            return Err(AppError::Internal(format!("User {} not found", user_id)));
        }
        tracing::info!("✅ mfa_enabled={} stored for user {}", enabled, user_id);
        Ok(())
    }
}
