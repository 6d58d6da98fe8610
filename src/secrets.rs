//! Gateway credential handling
//!
//! API keys and secrets are held in `Zeroizing<String>` so they are wiped
//! from memory on drop. Each secret is read from the 1Password CLI when an
//! `op://` reference is configured, with the plain environment variable as a
//! fallback.

use std::process::Command;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const ENV_API_KEY: &str = "GATEWAY_API_KEY";
pub const ENV_API_SECRET: &str = "GATEWAY_API_SECRET";
pub const ENV_API_KEY_OP_REF: &str = "GATEWAY_API_KEY_OP_REF";
pub const ENV_API_SECRET_OP_REF: &str = "GATEWAY_API_SECRET_OP_REF";

/// Shortest secret accepted for a live gateway
pub const MIN_SECRET_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SecretError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// API credentials for the exchange gateway
#[derive(Clone)]
pub struct GatewayCredentials {
    api_key: Zeroizing<String>,
    api_secret: Zeroizing<String>,
}

impl GatewayCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: Zeroizing::new(api_key.into()),
            api_secret: Zeroizing::new(api_secret.into()),
        }
    }

    /// Load credentials from the process environment
    pub fn from_env() -> Result<Self, SecretError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load credentials through `lookup`, which resolves variable names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SecretError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = load_secret(&lookup, ENV_API_KEY_OP_REF, ENV_API_KEY)?;
        let api_secret = load_secret(&lookup, ENV_API_SECRET_OP_REF, ENV_API_SECRET)?;
        validate_secret_strength(&api_secret, MIN_SECRET_LENGTH)?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

/// First four characters followed by `***`
fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}***", prefix)
}

fn load_secret<F>(
    lookup: &F,
    op_ref_var: &str,
    env_var: &str,
) -> Result<Zeroizing<String>, SecretError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(reference) = lookup(op_ref_var).filter(|r| !r.trim().is_empty()) {
        match load_from_op_cli(&reference) {
            Ok(secret) => {
                info!("Loaded {} from 1Password CLI", env_var);
                return Ok(secret);
            }
            Err(e) => warn!("{}; falling back to {}", e, env_var),
        }
    }

    lookup(env_var)
        .map(|value| Zeroizing::new(value.trim().to_string()))
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SecretError::EnvVarNotSet(env_var.to_string()))
}

fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .output()
        .map_err(|e| SecretError::OnePasswordError(format!("failed to run 'op': {}", e)))?;

    if !output.status.success() {
        return Err(SecretError::OnePasswordError(format!(
            "'op read' failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let secret = String::from_utf8(output.stdout)
        .map_err(|e| SecretError::OnePasswordError(format!("invalid UTF-8 from 'op': {}", e)))?;
    let secret = Zeroizing::new(secret.trim().to_string());
    if secret.is_empty() {
        return Err(SecretError::OnePasswordError(
            "'op read' returned an empty secret".to_string(),
        ));
    }
    Ok(secret)
}

/// Reject secrets that are too short or obviously placeholders
pub fn validate_secret_strength(secret: &str, min_length: usize) -> Result<(), SecretError> {
    if secret.len() < min_length {
        return Err(SecretError::ValidationFailed(format!(
            "secret too short: {} characters (minimum: {})",
            secret.len(),
            min_length
        )));
    }

    let lower = secret.to_lowercase();
    for pattern in ["changeme", "placeholder", "your_secret", "xxxx"] {
        if lower.contains(pattern) {
            return Err(SecretError::ValidationFailed(format!(
                "secret contains placeholder text: {}",
                pattern
            )));
        }
    }
    Ok(())
}
