use crate::domain::entities::user_config::UserConfig;
use crate::domain::errors::SettingsError;
use async_trait::async_trait;

/// Persisted per-user configuration, as seen by the trading core.
///
/// Reads may be slightly stale. Writes are durable before the call returns;
/// writes for one user are serialized, writes for different users are not.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load and validate one user's config.
    ///
    /// Fails with `SettingsError::NotFound` when the user has no config and
    /// `SettingsError::Validation` when the stored risk params are invalid.
    async fn get(&self, user_id: &str) -> Result<UserConfig, SettingsError>;

    /// All users with `active` set and an unexpired subscription. Invalid
    /// configs are left out.
    async fn list_active_subscribed(&self) -> Result<Vec<UserConfig>, SettingsError>;

    /// Set the `active` flag. Idempotent.
    async fn set_active(&self, user_id: &str, active: bool) -> Result<(), SettingsError>;
}
