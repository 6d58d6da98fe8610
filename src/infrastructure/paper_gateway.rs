//! Paper trading gateway
//!
//! Quotes come from a real price source; orders fill immediately at the
//! current quote against an in-memory position book. Positions are lost on
//! restart, so paper mode is for dry runs only.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::entities::order::{ExchangePosition, OrderRequest, OrderResult};
use crate::domain::errors::GatewayError;
use crate::domain::repositories::{ExchangeGateway, GatewayResult};

#[derive(Default)]
struct Book {
    /// Keyed by (user_id, symbol)
    positions: HashMap<(String, String), ExchangePosition>,
    /// Confirmed fills by client order id, so resubmissions do not fill
    /// twice. Only the latest entry and exit of each position are kept.
    fills: HashMap<String, ((String, String), OrderResult)>,
}

pub struct PaperGateway {
    prices: Arc<dyn ExchangeGateway>,
    book: Mutex<Book>,
    next_order: AtomicU64,
}

impl PaperGateway {
    pub fn new(prices: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            prices,
            book: Mutex::new(Book::default()),
            next_order: AtomicU64::new(1),
        }
    }

    fn fill(&self, price: f64) -> OrderResult {
        OrderResult::Confirmed {
            order_id: format!("paper-{}", self.next_order.fetch_add(1, Ordering::Relaxed)),
            fill_price: price,
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_order(&self, order: &OrderRequest) -> GatewayResult<OrderResult> {
        if let Some((_, previous)) = self.book.lock().await.fills.get(&order.client_order_id) {
            return Ok(previous.clone());
        }

        let price = self.prices.get_price(&order.symbol).await?;
        if !price.is_finite() || price <= 0.0 {
            return Err(GatewayError::MalformedResponse(format!(
                "price {} for {}",
                price, order.symbol
            )));
        }

        let key = (order.user_id.clone(), order.symbol.clone());
        let mut book = self.book.lock().await;
        let result = if order.params.reduce_only {
            let closes = matches!(
                book.positions.get(&key),
                Some(position) if position.side == order.side.opposite()
            );
            if closes {
                book.positions.remove(&key);
                self.fill(price)
            } else {
                OrderResult::Rejected {
                    reason: "reduce-only order without an opposite position".to_string(),
                }
            }
        } else if book.positions.contains_key(&key) {
            OrderResult::Rejected {
                reason: "position already open".to_string(),
            }
        } else {
            // A new position retires the fills of the previous one
            book.fills.retain(|_, (owner, _)| *owner != key);
            book.positions.insert(
                key.clone(),
                ExchangePosition {
                    side: order.side,
                    quantity: order.quantity,
                    entry_price: price,
                },
            );
            self.fill(price)
        };

        info!(
            "Paper {} {} {} for {}: {:?}",
            order.side, order.quantity, order.symbol, order.user_id, result
        );
        if let OrderResult::Confirmed { .. } = result {
            book.fills.insert(order.client_order_id.clone(), (key, result.clone()));
        }
        Ok(result)
    }

    async fn get_price(&self, symbol: &str) -> GatewayResult<f64> {
        self.prices.get_price(symbol).await
    }

    async fn get_position(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> GatewayResult<Option<ExchangePosition>> {
        let book = self.book.lock().await;
        Ok(book
            .positions
            .get(&(user_id.to_string(), symbol.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::{NewTrade, TradeRecord, TradeSide};
    use chrono::Utc;

    struct FixedPrice(f64);

    #[async_trait]
    impl ExchangeGateway for FixedPrice {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn place_order(&self, _order: &OrderRequest) -> GatewayResult<OrderResult> {
            Err(GatewayError::Unavailable("price source only".into()))
        }

        async fn get_price(&self, _symbol: &str) -> GatewayResult<f64> {
            Ok(self.0)
        }

        async fn get_position(
            &self,
            _user_id: &str,
            _symbol: &str,
        ) -> GatewayResult<Option<ExchangePosition>> {
            Ok(None)
        }
    }

    fn open_trade(side: TradeSide, quantity: f64) -> TradeRecord {
        TradeRecord::opened(
            1,
            NewTrade {
                user_id: "u1".into(),
                symbol: "BTCUSDT".into(),
                side,
                entry_price: 100.0,
                quantity,
                leverage: 1.0,
                entry_order_id: None,
                opened_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_entry_then_exit() {
        let gw = PaperGateway::new(Arc::new(FixedPrice(100.0)));
        let entry = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Buy, 2.0, 1.0).unwrap();

        let result = gw.place_order(&entry).await.unwrap();
        assert!(matches!(result, OrderResult::Confirmed { fill_price, .. } if fill_price == 100.0));

        let position = gw.get_position("u1", "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(position.side, TradeSide::Buy);
        assert_eq!(position.quantity, 2.0);

        let exit = OrderRequest::exit(&open_trade(TradeSide::Buy, 2.0)).unwrap();
        assert!(matches!(
            gw.place_order(&exit).await.unwrap(),
            OrderResult::Confirmed { .. }
        ));
        assert!(gw.get_position("u1", "BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejections() {
        let gw = PaperGateway::new(Arc::new(FixedPrice(100.0)));

        let exit = OrderRequest::exit(&open_trade(TradeSide::Buy, 1.0)).unwrap();
        assert!(matches!(
            gw.place_order(&exit).await.unwrap(),
            OrderResult::Rejected { .. }
        ));

        let first = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Buy, 1.0, 1.0).unwrap();
        let second = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Buy, 1.0, 1.0).unwrap();
        gw.place_order(&first).await.unwrap();
        assert!(matches!(
            gw.place_order(&second).await.unwrap(),
            OrderResult::Rejected { .. }
        ));

        // Same-side reduce-only does not close a long
        let mut wrong_side = OrderRequest::exit(&open_trade(TradeSide::Sell, 1.0)).unwrap();
        wrong_side.side = TradeSide::Buy;
        assert!(matches!(
            gw.place_order(&wrong_side).await.unwrap(),
            OrderResult::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let gw = PaperGateway::new(Arc::new(FixedPrice(100.0)));
        let entry = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Sell, 1.0, 1.0).unwrap();

        let first = gw.place_order(&entry).await.unwrap();
        let again = gw.place_order(&entry).await.unwrap();
        assert_eq!(first, again);
        assert!(gw.get_position("u1", "BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fills_do_not_accumulate() {
        let gw = PaperGateway::new(Arc::new(FixedPrice(100.0)));

        for _ in 0..5 {
            let entry = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Buy, 1.0, 1.0).unwrap();
            gw.place_order(&entry).await.unwrap();
            let exit = OrderRequest::exit(&open_trade(TradeSide::Buy, 1.0)).unwrap();
            gw.place_order(&exit).await.unwrap();

            // The exit stays resubmittable until the next entry
            assert!(matches!(
                gw.place_order(&exit).await.unwrap(),
                OrderResult::Confirmed { .. }
            ));
        }
        let rejected = OrderRequest::exit(&open_trade(TradeSide::Buy, 1.0)).unwrap();
        gw.place_order(&rejected).await.unwrap();

        assert_eq!(gw.book.lock().await.fills.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_quote_is_transient() {
        let gw = PaperGateway::new(Arc::new(FixedPrice(f64::NAN)));
        let entry = OrderRequest::entry("u1", "BTCUSDT", TradeSide::Buy, 1.0, 1.0).unwrap();
        let err = gw.place_order(&entry).await.unwrap_err();
        assert!(err.is_transient());
    }
}
