//! Exchange gateway adapters
//!
//! Gateways are created once at startup and shared by every user loop.

pub mod http_gateway;
pub mod paper_gateway;

pub use http_gateway::HttpExchangeGateway;
pub use paper_gateway::PaperGateway;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigError, EngineConfig, GatewayMode};
use crate::domain::repositories::ExchangeGateway;
use crate::secrets::{GatewayCredentials, SecretError};

/// Build the gateway selected by `config.gateway_mode`
///
/// Live mode needs credentials; paper mode signs price queries when
/// credentials are available and runs unsigned otherwise.
pub fn build_gateway(
    config: &EngineConfig,
    credentials: Result<GatewayCredentials, SecretError>,
) -> Result<Arc<dyn ExchangeGateway>, ConfigError> {
    let endpoint = config
        .gateway_endpoint
        .as_deref()
        .ok_or(ConfigError::MissingEndpoint)?;

    match config.gateway_mode {
        GatewayMode::Live => {
            let gateway = HttpExchangeGateway::new(
                endpoint,
                Some(credentials?),
                config.gateway_recv_window,
                config.gateway_timeout(),
            )?;
            info!("✓ Live gateway ready: {}", endpoint);
            Ok(Arc::new(gateway))
        }
        GatewayMode::Paper => {
            let credentials = match credentials {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    warn!("Paper gateway running without credentials: {}", e);
                    None
                }
            };
            let prices = HttpExchangeGateway::new(
                endpoint,
                credentials,
                config.gateway_recv_window,
                config.gateway_timeout(),
            )?;
            info!("✓ Paper gateway ready (prices from {})", endpoint);
            Ok(Arc::new(PaperGateway::new(Arc::new(prices))))
        }
    }
}
