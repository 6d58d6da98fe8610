//! SQLite-backed settings store.
//!
//! The trading core only reads configs and toggles `active`; the remaining
//! write operations serve the bot surface and billing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::key_lock::KeyedLocks;
use super::models::UserConfigRow;
use super::DbPool;
use crate::domain::entities::user_config::{UserConfig, RISK_SCHEMA_VERSION};
use crate::domain::errors::{SettingsError, ValidationError};
use crate::domain::repositories::SettingsStore;

pub struct SqliteSettingsStore {
    pool: DbPool,
    locks: Arc<KeyedLocks>,
}

impl SqliteSettingsStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    async fn fetch_row(&self, user_id: &str) -> Result<Option<UserConfigRow>, SettingsError> {
        sqlx::query_as::<_, UserConfigRow>("SELECT * FROM user_configs WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error(&format!("load config for {}", user_id), e))
    }

    /// Create or replace a user's config. Clears any recorded `config_error`.
    pub async fn upsert(&self, config: &UserConfig) -> Result<(), SettingsError> {
        let risk_params = config
            .risk_params
            .to_json()
            .map_err(|source| SettingsError::Validation {
                user_id: config.user_id.clone(),
                source,
            })?;

        let _guard = self.locks.lock(&config.user_id).await;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO user_configs (
                user_id, symbol, risk_params, schema_version, active,
                subscription_expiry, config_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)
            ON CONFLICT(user_id) DO UPDATE SET
                symbol = excluded.symbol,
                risk_params = excluded.risk_params,
                schema_version = excluded.schema_version,
                active = excluded.active,
                subscription_expiry = excluded.subscription_expiry,
                config_error = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.user_id)
        .bind(&config.symbol)
        .bind(&risk_params)
        .bind(RISK_SCHEMA_VERSION)
        .bind(config.active)
        .bind(config.subscription_expiry)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("upsert config for {}", config.user_id), e))?;

        debug!("Upserted config for user {}", config.user_id);
        Ok(())
    }

    /// Update a single risk parameter and return the re-validated config.
    ///
    /// The rest of the stored object, unknown keys included, is kept as is.
    pub async fn set_risk_param(
        &self,
        user_id: &str,
        key: &str,
        value: f64,
    ) -> Result<UserConfig, SettingsError> {
        let invalid = |source| SettingsError::Validation {
            user_id: user_id.to_string(),
            source,
        };
        let number = Number::from_f64(value).ok_or_else(|| invalid(ValidationError::MustBeFinite))?;

        let _guard = self.locks.lock(user_id).await;
        let mut row = self
            .fetch_row(user_id)
            .await?
            .ok_or_else(|| SettingsError::NotFound(user_id.to_string()))?;

        let mut object: Map<String, Value> = serde_json::from_str(&row.risk_params)
            .ok()
            .and_then(|v: Value| v.as_object().cloned())
            .unwrap_or_default();
        object.insert(key.to_string(), Value::Number(number));
        row.risk_params = serde_json::to_string(&object)
            .map_err(|e| invalid(ValidationError::Malformed(e.to_string())))?;

        let config = row.to_config().map_err(invalid)?;

        sqlx::query(
            r#"
            UPDATE user_configs
            SET risk_params = ?1, config_error = NULL, updated_at = ?2
            WHERE user_id = ?3
            "#,
        )
        .bind(&row.risk_params)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("update risk params for {}", user_id), e))?;

        debug!("Set risk param {}={} for user {}", key, value, user_id);
        Ok(config)
    }

    /// Extend the subscription by `days`, counting from the current expiry if
    /// it is still in the future and from now otherwise.
    pub async fn extend_subscription(
        &self,
        user_id: &str,
        days: i64,
    ) -> Result<DateTime<Utc>, SettingsError> {
        if days <= 0 {
            return Err(SettingsError::Validation {
                user_id: user_id.to_string(),
                source: ValidationError::MustBePositive,
            });
        }

        let _guard = self.locks.lock(user_id).await;
        let row = self
            .fetch_row(user_id)
            .await?
            .ok_or_else(|| SettingsError::NotFound(user_id.to_string()))?;

        let now = Utc::now();
        let base = match row.subscription_expiry {
            Some(expiry) if expiry > now => expiry,
            _ => now,
        };
        let new_expiry = base + Duration::days(days);

        sqlx::query(
            "UPDATE user_configs SET subscription_expiry = ?1, updated_at = ?2 WHERE user_id = ?3",
        )
        .bind(new_expiry)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("extend subscription for {}", user_id), e))?;

        info!(
            "Subscription for user {} extended by {} days until {}",
            user_id, days, new_expiry
        );
        Ok(new_expiry)
    }

    /// Last validation error recorded for the user's config, if any
    pub async fn config_error(&self, user_id: &str) -> Result<Option<String>, SettingsError> {
        Ok(self
            .fetch_row(user_id)
            .await?
            .ok_or_else(|| SettingsError::NotFound(user_id.to_string()))?
            .config_error)
    }

    async fn record_config_error(&self, user_id: &str, message: &str) -> Result<(), SettingsError> {
        let _guard = self.locks.lock(user_id).await;
        sqlx::query("UPDATE user_configs SET config_error = ?1 WHERE user_id = ?2")
            .bind(message)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&format!("record config error for {}", user_id), e))?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, user_id: &str) -> Result<UserConfig, SettingsError> {
        let row = self
            .fetch_row(user_id)
            .await?
            .ok_or_else(|| SettingsError::NotFound(user_id.to_string()))?;

        row.to_config().map_err(|source| SettingsError::Validation {
            user_id: user_id.to_string(),
            source,
        })
    }

    async fn list_active_subscribed(&self) -> Result<Vec<UserConfig>, SettingsError> {
        let rows = sqlx::query_as::<_, UserConfigRow>(
            "SELECT * FROM user_configs WHERE active = 1 ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list active configs", e))?;

        let now = Utc::now();
        let mut configs = Vec::with_capacity(rows.len());
        for row in rows.iter().filter(|row| row.is_subscribed(now)) {
            match row.to_config() {
                Ok(config) => configs.push(config),
                Err(e) => {
                    let message = e.to_string();
                    warn!("Skipping user {}: invalid config: {}", row.user_id, message);
                    if row.config_error.as_deref() != Some(message.as_str()) {
                        if let Err(e) = self.record_config_error(&row.user_id, &message).await {
                            warn!("Could not record config error for {}: {}", row.user_id, e);
                        }
                    }
                }
            }
        }

        Ok(configs)
    }

    async fn set_active(&self, user_id: &str, active: bool) -> Result<(), SettingsError> {
        let _guard = self.locks.lock(user_id).await;
        let rows_affected = sqlx::query(
            "UPDATE user_configs SET active = ?1, updated_at = ?2 WHERE user_id = ?3",
        )
        .bind(active)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&format!("set active for {}", user_id), e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(SettingsError::NotFound(user_id.to_string()));
        }

        debug!("Set active={} for user {}", active, user_id);
        Ok(())
    }
}

fn storage_error(context: &str, e: sqlx::Error) -> SettingsError {
    error!("Failed to {}: {}", context, e);
    SettingsError::Storage(format!("Failed to {}: {}", context, e))
}
