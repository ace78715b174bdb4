// =============================================================================
// Venue — market data and execution abstraction over an exchange backend
// =============================================================================
//
// An explicit trait boundary in place of dynamic dispatch against whatever
// exchange SDK happens to be configured. `async_trait` is used because
// dyn-compatible async methods on traits still require it on this crate's
// edition; see DESIGN.md.
//
// The only backend shipped is Binance, built from `binance::client` (REST
// signing, klines, orders, book ticker, funding) plus
// `binance::rate_limit::RateLimitTracker` for pre-flight weight/order
// throttling, following the existing client/rate-limiter split.
// =============================================================================

use async_trait::async_trait;

use crate::binance::client::BinanceClient;
use crate::binance::rate_limit::RateLimitTracker;
use crate::data_model::Bar;

#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

impl BookTicker {
    pub fn spread_bps(&self) -> f64 {
        if self.bid <= 0.0 || self.ask <= 0.0 {
            return 0.0;
        }
        let mid = (self.bid + self.ask) / 2.0;
        if mid <= 0.0 {
            return 0.0;
        }
        (self.ask - self.bid) / mid * 10_000.0
    }
}

#[derive(Debug, Clone)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct NewOrderRequest {
    pub side: crate::types::Side,
    pub quantity: f64,
    pub price: Option<f64>,
    pub passive: bool,
}

#[derive(Debug, Clone)]
pub struct NewOrderResponse {
    pub order_id: u64,
    pub fill_price: f64,
    pub fill_qty: f64,
}

/// Read-only market data surface a driver needs per bar.
#[async_trait]
pub trait MarketDataVenue: Send + Sync {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> anyhow::Result<Vec<Bar>>;
    async fn book_ticker(&self, symbol: &str) -> anyhow::Result<BookTicker>;
    async fn exchange_info(&self, symbol: &str) -> anyhow::Result<SymbolFilters>;
    async fn premium_index(&self, symbol: &str) -> anyhow::Result<f64>;
}

/// Order placement surface used by the live (non-paper) execution path.
/// The paper executor in `execution.rs` does not call this trait; it is
/// retained for the eventual live account-mode switch.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn new_order(&self, symbol: &str, req: NewOrderRequest) -> anyhow::Result<NewOrderResponse>;
}

pub struct BinanceVenue {
    client: BinanceClient,
    rate_limit: RateLimitTracker,
}

impl BinanceVenue {
    pub fn new(client: BinanceClient) -> Self {
        Self {
            client,
            rate_limit: RateLimitTracker::new(),
        }
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }
}

#[async_trait]
impl MarketDataVenue for BinanceVenue {
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> anyhow::Result<Vec<Bar>> {
        if !self.rate_limit.can_send_request(2) {
            anyhow::bail!("rate limit would be exceeded by klines request");
        }
        self.client.get_klines(symbol, interval, limit).await
    }

    async fn book_ticker(&self, symbol: &str) -> anyhow::Result<BookTicker> {
        let (bid, ask) = self.client.book_ticker(symbol).await?;
        Ok(BookTicker { bid, ask })
    }

    async fn exchange_info(&self, symbol: &str) -> anyhow::Result<SymbolFilters> {
        let info = self.client.get_symbol_info(symbol).await?;
        let filters = info["filters"].as_array().cloned().unwrap_or_default();

        let mut step_size = 0.000_001;
        let mut tick_size = 0.01;
        let mut min_notional = 5.0;

        for f in filters {
            match f["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    if let Some(s) = f["stepSize"].as_str() {
                        step_size = s.parse().unwrap_or(step_size);
                    }
                }
                Some("PRICE_FILTER") => {
                    if let Some(s) = f["tickSize"].as_str() {
                        tick_size = s.parse().unwrap_or(tick_size);
                    }
                }
                Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                    if let Some(s) = f["minNotional"].as_str() {
                        min_notional = s.parse().unwrap_or(min_notional);
                    }
                }
                _ => {}
            }
        }

        Ok(SymbolFilters {
            step_size,
            tick_size,
            min_notional,
        })
    }

    async fn premium_index(&self, symbol: &str) -> anyhow::Result<f64> {
        self.client.premium_index(symbol).await
    }
}

#[async_trait]
impl ExecutionVenue for BinanceVenue {
    async fn new_order(&self, symbol: &str, req: NewOrderRequest) -> anyhow::Result<NewOrderResponse> {
        if !self.rate_limit.can_place_order() {
            anyhow::bail!("rate limit would be exceeded by new_order request");
        }
        let side = match req.side {
            crate::types::Side::Buy => "BUY",
            crate::types::Side::Sell => "SELL",
            crate::types::Side::Hold => anyhow::bail!("cannot place an order for a Hold side"),
        };
        let order_type = if req.passive { "LIMIT" } else { "MARKET" };
        let tif = if req.passive { Some("GTX") } else { None };

        let resp = self
            .client
            .place_order(symbol, side, order_type, req.quantity, req.price, tif, None)
            .await?;
        self.rate_limit.record_order_sent();

        let order_id = resp["orderId"].as_u64().unwrap_or(0);
        let fill_price = resp["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| req.price)
            .unwrap_or(0.0);
        let fill_qty = resp["executedQty"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(req.quantity);

        Ok(NewOrderResponse {
            order_id,
            fill_price,
            fill_qty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_ticker_spread_bps_is_symmetric_around_mid() {
        let bt = BookTicker { bid: 99.0, ask: 101.0 };
        assert!((bt.spread_bps() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn book_ticker_spread_is_zero_for_degenerate_quotes() {
        let bt = BookTicker { bid: 0.0, ask: 0.0 };
        assert_eq!(bt.spread_bps(), 0.0);
    }
}
