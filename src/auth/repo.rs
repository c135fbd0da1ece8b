use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record was modified concurrently")]
    StaleWrite,
}

/// User record. OTP fields and their expiries are set and cleared together;
/// `version` is bumped by every successful save.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_account_verified: bool,
    pub verify_otp: Option<String>,
    pub verify_otp_expiry: Option<OffsetDateTime>,
    pub reset_otp: Option<String>,
    pub reset_otp_expiry: Option<OffsetDateTime>,
    pub version: i64,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn new(name: &str, email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            password_hash,
            is_account_verified: false,
            verify_otp: None,
            verify_otp_expiry: None,
            reset_otp: None,
            reset_otp_expiry: None,
            version: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Persistence seam for user records, independent of the storage engine.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn insert(&self, user: User) -> Result<User, StoreError>;
    /// Whole-record update, guarded by an optimistic version check. A save
    /// against a record that was updated in the meantime fails with
    /// `StaleWrite` instead of silently overwriting.
    async fn save(&self, user: &User) -> Result<User, StoreError>;
}

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, is_account_verified,
                   verify_otp, verify_otp_expiry, reset_otp, reset_otp_expiry,
                   version, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, password_hash, is_account_verified,
                   verify_otp, verify_otp_expiry, reset_otp, reset_otp_expiry,
                   version, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn insert(&self, user: User) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, name, email, password_hash, is_account_verified,
                               verify_otp, verify_otp_expiry, reset_otp, reset_otp_expiry,
                               version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, name, email, password_hash, is_account_verified,
                      verify_otp, verify_otp_expiry, reset_otp, reset_otp_expiry,
                      version, created_at
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_account_verified)
        .bind(&user.verify_otp)
        .bind(user.verify_otp_expiry)
        .bind(&user.reset_otp)
        .bind(user.reset_otp_expiry)
        .bind(user.version)
        .bind(user.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn save(&self, user: &User) -> Result<User, StoreError> {
        let updated = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET name = $2, email = $3, password_hash = $4, is_account_verified = $5,
                verify_otp = $6, verify_otp_expiry = $7,
                reset_otp = $8, reset_otp_expiry = $9,
                version = version + 1
            WHERE id = $1 AND version = $10
            RETURNING id, name, email, password_hash, is_account_verified,
                      verify_otp, verify_otp_expiry, reset_otp, reset_otp_expiry,
                      version, created_at
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_account_verified)
        .bind(&user.verify_otp)
        .bind(user.verify_otp_expiry)
        .bind(&user.reset_otp)
        .bind(user.reset_otp_expiry)
        .bind(user.version)
        .fetch_optional(&self.pool)
        .await?;
        updated.ok_or(StoreError::StaleWrite)
    }
}

/// In-process store used by `AppState::fake()` and unit tests. Mirrors the
/// Postgres store's version check.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().unwrap();
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().unwrap();
        Ok(users.get(&id).cloned())
    }

    async fn insert(&self, user: User) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap();
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn save(&self, user: &User) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&user.id) {
            Some(stored) if stored.version == user.version => {
                let mut updated = user.clone();
                updated.version += 1;
                *stored = updated.clone();
                Ok(updated)
            }
            _ => Err(StoreError::StaleWrite),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_find_by_email_and_id() {
        let store = MemoryCredentialStore::new();
        let user = store
            .insert(User::new("Alice", "a@x.com", "hash".into()))
            .await
            .expect("insert");

        let by_email = store.find_by_email("a@x.com").await.expect("find");
        assert_eq!(by_email.as_ref().map(|u| u.id), Some(user.id));

        let by_id = store.find_by_id(user.id).await.expect("find");
        assert_eq!(by_id.map(|u| u.email), Some("a@x.com".to_string()));
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let store = MemoryCredentialStore::new();
        let mut user = store
            .insert(User::new("Alice", "a@x.com", "hash".into()))
            .await
            .expect("insert");

        user.name = "Alice B".into();
        let updated = store.save(&user).await.expect("save");
        assert_eq!(updated.version, user.version + 1);
        assert_eq!(updated.name, "Alice B");
    }

    #[tokio::test]
    async fn stale_save_is_rejected() {
        let store = MemoryCredentialStore::new();
        let user = store
            .insert(User::new("Alice", "a@x.com", "hash".into()))
            .await
            .expect("insert");

        // Two readers pick up the same version; the second write loses.
        let mut first = user.clone();
        let mut second = user.clone();
        first.verify_otp = Some("111111".into());
        second.verify_otp = Some("222222".into());

        store.save(&first).await.expect("first save wins");
        let err = store.save(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite));
    }

    #[tokio::test]
    async fn save_of_unknown_record_is_rejected() {
        let store = MemoryCredentialStore::new();
        let user = User::new("Ghost", "g@x.com", "hash".into());
        let err = store.save(&user).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite));
    }
}
