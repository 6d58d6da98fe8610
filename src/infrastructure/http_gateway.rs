//! HTTP exchange gateway
//!
//! REST adapter for [`ExchangeGateway`]. Requests carrying user or order data
//! are signed with HMAC-SHA256 over `timestamp + api_key + recv_window + payload`,
//! where the payload is the JSON body for POST and the query string for GET.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConfigError;
use crate::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use crate::domain::entities::trade::TradeSide;
use crate::domain::errors::GatewayError;
use crate::domain::repositories::{ExchangeGateway, GatewayResult};
use crate::secrets::GatewayCredentials;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = concat!("tradeloop/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    position: Option<ExchangePosition>,
}

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    client_order_id: &'a str,
    user_id: &'a str,
    symbol: &'a str,
    side: TradeSide,
    quantity: f64,
    reduce_only: bool,
    leverage: f64,
}

impl<'a> From<&'a OrderRequest> for OrderBody<'a> {
    fn from(order: &'a OrderRequest) -> Self {
        OrderBody {
            client_order_id: &order.client_order_id,
            user_id: &order.user_id,
            symbol: &order.symbol,
            side: order.side,
            quantity: order.quantity,
            reduce_only: order.params.reduce_only,
            leverage: order.params.leverage,
        }
    }
}

pub struct HttpExchangeGateway {
    client: Client,
    base_url: Url,
    credentials: Option<GatewayCredentials>,
    recv_window: u64,
    timeout: Duration,
}

impl HttpExchangeGateway {
    /// Build a gateway for `endpoint`. Without credentials only unsigned
    /// price queries succeed.
    pub fn new(
        endpoint: &str,
        credentials: Option<GatewayCredentials>,
        recv_window: u64,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let base_url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "expected an http(s) base URL".to_string(),
            });
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        info!(
            "HTTP gateway for {} ({})",
            base_url,
            if credentials.is_some() { "signed" } else { "unsigned" }
        );

        Ok(Self {
            client,
            base_url,
            credentials,
            recv_window,
            timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn signed(&self, request: RequestBuilder, payload: &str) -> GatewayResult<RequestBuilder> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            GatewayError::InvalidCredentials("no API credentials configured".to_string())
        })?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = sign(
            credentials.api_secret(),
            timestamp,
            credentials.api_key(),
            self.recv_window,
            payload,
        )?;

        Ok(request
            .header("X-API-KEY", credentials.api_key())
            .header("X-TIMESTAMP", timestamp.to_string())
            .header("X-RECV-WINDOW", self.recv_window.to_string())
            .header("X-SIGNATURE", signature))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> GatewayResult<T> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let err = classify_status(status, &body);
            warn!("Gateway responded {}: {}", status, err);
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| {
            GatewayError::MalformedResponse(format!("{} (body: {})", e, truncate(&body, 200)))
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl ExchangeGateway for HttpExchangeGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderResult> {
        let body = serde_json::to_string(&OrderBody::from(order))
            .map_err(|e| GatewayError::MalformedResponse(format!("order encoding: {}", e)))?;
        let request = self
            .client
            .post(self.url(&["v1", "orders"]))
            .header("Content-Type", "application/json");
        let request = self.signed(request, &body)?.body(body);

        debug!(
            "Placing {} {} {} (client order {})",
            order.side, order.quantity, order.symbol, order.client_order_id
        );
        self.send(request).await
    }

    async fn get_price(&self, symbol: &str) -> GatewayResult<f64> {
        let mut request = self.client.get(self.url(&["v1", "price", symbol]));
        if self.credentials.is_some() {
            request = self.signed(request, "")?;
        }
        let response: PriceResponse = self.send(request).await?;
        Ok(response.price)
    }

    async fn get_position(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> GatewayResult<Option<ExchangePosition>> {
        let request = self
            .client
            .get(self.url(&["v1", "position", user_id, symbol]));
        let request = self.signed(request, "")?;
        let response: PositionResponse = self.send(request).await?;
        Ok(response.position)
    }
}

/// Hex HMAC-SHA256 of `timestamp + api_key + recv_window + payload`
pub fn sign(
    secret: &str,
    timestamp: i64,
    api_key: &str,
    recv_window: u64,
    payload: &str,
) -> GatewayResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidCredentials(format!("HMAC key: {}", e)))?;
    mac.update(format!("{}{}{}{}", timestamp, api_key, recv_window, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map a non-success HTTP status onto the gateway error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = format!("{} {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        401 | 403 => GatewayError::InvalidCredentials(detail),
        404 | 422 if body.to_lowercase().contains("symbol") => GatewayError::SymbolRejected(detail),
        429 => GatewayError::RateLimited(detail),
        408 | 500..=599 => GatewayError::Unavailable(detail),
        _ => GatewayError::Network(detail),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
