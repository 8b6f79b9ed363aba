pub mod okx;

use crate::error::Result;
use async_trait::async_trait;

pub use okx::{AccountConfig, Balance, OkxClient, OrderReceipt, OrderRecord, Ticker};

/// The slice of the exchange surface the monitoring loop depends on.
///
/// The full REST client lives on [`OkxClient`]; the loop only ever probes the
/// connection, looks up a price, and places market orders, so that is all the
/// seam carries. Mock implementations back the loop's tests.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn check_connection(&self) -> Result<()>;

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Places a market order. Non-idempotent: money moves on success, so the
    /// caller must never re-submit the same logical signal without confirming
    /// the first attempt did not go through.
    async fn place_market_order(&self, symbol: &str, side: &str, size: &str)
        -> Result<OrderReceipt>;
}
