pub mod postgres;

use crate::error::Result;
use crate::models::{FlowRecord, Side, TradingPosition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use postgres::PostgresStore;

/// Read-only access to the flow records written by the ingestion job.
///
/// `list_new_records` is a pure read and safe to call concurrently for
/// different assets. Failures surface as `StoreUnavailable`; the caller must
/// not advance its watermark when that happens.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Records for `asset` strictly newer than `since`, ascending by date.
    /// An empty vec means nothing new, not an error.
    async fn list_new_records(
        &self,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>>;
}

/// Fields for one new position row. Exactly one row is created per
/// successful order; there is no update-in-place for the same signal.
pub struct NewPosition<'a> {
    pub symbol: &'a str,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub total_flow: f64,
    pub exchange_order_id: &'a str,
}

/// Aggregate view over all persisted positions, computed on demand.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub total_positions: i64,
    pub open_positions: i64,
    pub closed_positions: i64,
    pub aggregate_profit_loss: f64,
}

/// Owns every write to the trading_positions table.
#[async_trait]
pub trait PositionLedger: Send + Sync {
    async fn record_open_position(&self, new: NewPosition<'_>) -> Result<TradingPosition>;

    async fn stats(&self) -> Result<LedgerStats>;
}
