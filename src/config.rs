use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::services::retry::RetryPolicy;
use crate::secrets::SecretError;

/// Which gateway adapter the engine trades through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Signed orders against the exchange endpoint
    Live,
    /// Live prices, simulated fills
    Paper,
}

impl FromStr for GatewayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(GatewayMode::Live),
            "paper" => Ok(GatewayMode::Paper),
            other => Err(format!("unknown gateway mode '{}' (expected live or paper)", other)),
        }
    }
}

impl Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Live => write!(f, "live"),
            GatewayMode::Paper => write!(f, "paper"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GATEWAY_ENDPOINT is not set")]
    MissingEndpoint,

    #[error("Invalid GATEWAY_ENDPOINT '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Gateway credentials: {0}")]
    Credentials(#[from] SecretError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Process-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval_seconds: u64,
    pub reconciliation_interval_seconds: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_milliseconds: u64,
    pub retry_max_backoff_milliseconds: u64,
    /// Bound on every single gateway call
    pub gateway_timeout_milliseconds: u64,
    pub gateway_mode: GatewayMode,
    pub gateway_endpoint: Option<String>,
    pub gateway_recv_window: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            reconciliation_interval_seconds: 30,
            retry_max_attempts: 3,
            retry_initial_backoff_milliseconds: 500,
            retry_max_backoff_milliseconds: 8000,
            gateway_timeout_milliseconds: 10000,
            gateway_mode: GatewayMode::Paper,
            gateway_endpoint: None,
            gateway_recv_window: 5000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` resolves. Out-of-range or
    /// unparsable values are logged and the default kept.
    pub fn from_lookup<F>(lookup: F) -> EngineConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        config.poll_interval_seconds = override_in_range(
            &lookup,
            "POLL_INTERVAL_SECONDS",
            1..=86_400,
            config.poll_interval_seconds,
        );
        config.reconciliation_interval_seconds = override_in_range(
            &lookup,
            "RECONCILIATION_INTERVAL_SECONDS",
            1..=3600,
            config.reconciliation_interval_seconds,
        );
        config.retry_max_attempts = override_in_range(
            &lookup,
            "RETRY_MAX_ATTEMPTS",
            1..=10,
            config.retry_max_attempts,
        );
        config.retry_initial_backoff_milliseconds = override_in_range(
            &lookup,
            "RETRY_INITIAL_BACKOFF_MILLISECONDS",
            1..=60_000,
            config.retry_initial_backoff_milliseconds,
        );
        config.retry_max_backoff_milliseconds = override_in_range(
            &lookup,
            "RETRY_MAX_BACKOFF_MILLISECONDS",
            1..=300_000,
            config.retry_max_backoff_milliseconds,
        );
        if config.retry_max_backoff_milliseconds < config.retry_initial_backoff_milliseconds {
            tracing::warn!(
                "RETRY_MAX_BACKOFF_MILLISECONDS ({}) is below the initial backoff ({}), raising it",
                config.retry_max_backoff_milliseconds,
                config.retry_initial_backoff_milliseconds
            );
            config.retry_max_backoff_milliseconds = config.retry_initial_backoff_milliseconds;
        }
        config.gateway_timeout_milliseconds = override_in_range(
            &lookup,
            "GATEWAY_TIMEOUT_MILLISECONDS",
            100..=120_000,
            config.gateway_timeout_milliseconds,
        );
        config.gateway_recv_window = override_in_range(
            &lookup,
            "GATEWAY_RECV_WINDOW",
            1..=60_000,
            config.gateway_recv_window,
        );

        if let Some(mode) = lookup("GATEWAY_MODE") {
            match mode.parse::<GatewayMode>() {
                Ok(value) => config.gateway_mode = value,
                Err(e) => tracing::warn!("{}, using default: {}", e, config.gateway_mode),
            }
        }

        config.gateway_endpoint = lookup("GATEWAY_ENDPOINT")
            .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
            .filter(|endpoint| !endpoint.is_empty());

        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_seconds)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_milliseconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_milliseconds),
            max_backoff: Duration::from_millis(self.retry_max_backoff_milliseconds),
            call_timeout: self.gateway_timeout(),
        }
    }
}

fn override_in_range<F, T>(
    lookup: &F,
    name: &str,
    range: std::ops::RangeInclusive<T>,
    default: T,
) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Display + Copy,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (must be between {} and {}), using default: {}",
                name,
                value,
                range.start(),
                range.end(),
                default
            );
            default
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                default
            );
            default
        }
    }
}
