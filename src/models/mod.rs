use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One dated observation of net capital flow for a tracked asset.
///
/// Written by the external ETF-flow ingestion job; this crate only reads it.
/// Uniquely keyed by (asset, date), ordered by date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub asset: String,
    pub date: DateTime<Utc>,
    pub total_flow: f64,
    /// Optional per-source breakdown as stored by the ingestion job.
    pub breakdown: Option<serde_json::Value>,
}

/// Trade direction derived from the sign of a flow value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The order side the exchange expects for this position direction.
    pub fn as_order_side(&self) -> &'static str {
        match self {
            Side::Long => "buy",
            Side::Short => "sell",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision that a flow record is significant enough to act on.
///
/// Transient: derived deterministically from a FlowRecord and the configured
/// threshold, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSignal {
    pub asset: String,
    pub flow_value: f64,
    pub side: Side,
    pub strength: f64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Cancelled,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            "cancelled" => Some(PositionStatus::Cancelled),
            _ => None,
        }
    }
}

/// A persisted trading position, created right after a successful order.
///
/// Positions are created `Open` and left for downstream reconciliation
/// tooling to close; the monitoring loop never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPosition {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub total_flow: f64,
    pub exchange_order_id: String,
    pub status: PositionStatus,
    pub profit_loss: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The most recent signal the monitor acted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastSignal {
    pub asset: String,
    pub flow_value: f64,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Process-lifetime counters for a running monitor.
///
/// Accumulate monotonically; reset only via an explicit `reset_stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub total_signals: u64,
    pub per_asset_signals: HashMap<String, u64>,
    pub successful_trades: u64,
    pub failed_trades: u64,
    pub last_signal: Option<LastSignal>,
}

impl MonitoringStats {
    /// Fraction of signals that resulted in a successful trade, as a percent.
    pub fn success_rate(&self) -> f64 {
        if self.total_signals == 0 {
            return 0.0;
        }
        self.successful_trades as f64 / self.total_signals as f64 * 100.0
    }
}

/// Complete observable state of the monitoring loop, returned as a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub is_running: bool,
    pub watermarks: HashMap<String, DateTime<Utc>>,
    pub stats: MonitoringStats,
}

/// One asset the monitor polls, mapping the flow table symbol to the
/// instrument traded on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedAsset {
    pub symbol: String,
    pub exchange_symbol: String,
}

impl TrackedAsset {
    pub fn new(symbol: impl Into<String>, exchange_symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_symbol: exchange_symbol.into(),
        }
    }
}
