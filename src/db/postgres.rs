use crate::db::{FlowStore, LedgerStats, NewPosition, PositionLedger};
use crate::error::{BotError, Result};
use crate::models::{FlowRecord, PositionStatus, Side, TradingPosition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

/// Postgres-backed flow store and position ledger.
///
/// The etf_flows table is written by the external ingestion job and only read
/// here; trading_positions is owned by this crate.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Most recent flow record for an asset, used for startup reporting.
    pub async fn latest_record(&self, asset: &str) -> Result<Option<FlowRecord>> {
        let row = sqlx::query(
            r#"
            SELECT asset, date, total_flow, breakdown
            FROM etf_flows
            WHERE asset = $1
            ORDER BY date DESC
            LIMIT 1
            "#,
        )
        .bind(asset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_flow).transpose()
    }

    /// All positions still marked open, newest first.
    pub async fn open_positions(&self) -> Result<Vec<TradingPosition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, side, size, entry_price, total_flow,
                   exchange_order_id, status, profit_loss, created_at, updated_at
            FROM trading_positions
            WHERE status = 'open'
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_position).collect()
    }

    /// Recent positions regardless of status, newest first.
    pub async fn list_positions(&self, limit: i64) -> Result<Vec<TradingPosition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, side, size, entry_price, total_flow,
                   exchange_order_id, status, profit_loss, created_at, updated_at
            FROM trading_positions
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_position).collect()
    }

    /// Status transition for downstream reconciliation tooling. The
    /// monitoring loop itself never calls this.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: PositionStatus,
        profit_loss: Option<f64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trading_positions
            SET status = $1, profit_loss = COALESCE($2, profit_loss), updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(profit_loss.map(decimal))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BotError::StoreUnavailable(format!(
                "position {} not found",
                id
            )));
        }

        tracing::info!("Position {} marked {}", id, status.as_str());
        Ok(())
    }

    /// Delete all positions (testing only).
    #[cfg(test)]
    pub async fn clear_all_positions(&self) -> Result<()> {
        sqlx::query("DELETE FROM trading_positions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete all flow rows (testing only).
    #[cfg(test)]
    pub async fn clear_all_flows(&self) -> Result<()> {
        sqlx::query("DELETE FROM etf_flows")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowStore for PostgresStore {
    async fn list_new_records(
        &self,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT asset, date, total_flow, breakdown
            FROM etf_flows
            WHERE asset = $1 AND date > $2
            ORDER BY date ASC
            "#,
        )
        .bind(asset)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_flow).collect()
    }
}

#[async_trait]
impl PositionLedger for PostgresStore {
    async fn record_open_position(&self, new: NewPosition<'_>) -> Result<TradingPosition> {
        let id = Uuid::new_v4();

        let row = sqlx::query(
            r#"
            INSERT INTO trading_positions (
                id, symbol, side, size, entry_price, total_flow,
                exchange_order_id, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'open')
            RETURNING created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(new.symbol)
        .bind(new.side.as_str())
        .bind(decimal(new.size))
        .bind(decimal(new.entry_price))
        .bind(decimal(new.total_flow))
        .bind(new.exchange_order_id)
        .fetch_one(&self.pool)
        .await?;

        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        tracing::info!(
            "Created position {} ({} {} {})",
            id,
            new.symbol,
            new.side,
            new.size
        );

        Ok(TradingPosition {
            id,
            symbol: new.symbol.to_string(),
            side: new.side,
            size: new.size,
            entry_price: new.entry_price,
            total_flow: new.total_flow,
            exchange_order_id: new.exchange_order_id.to_string(),
            status: PositionStatus::Open,
            profit_loss: None,
            created_at,
            updated_at,
        })
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_positions,
                   COUNT(*) FILTER (WHERE status = 'open') AS open_positions,
                   COUNT(*) FILTER (WHERE status = 'closed') AS closed_positions,
                   COALESCE(SUM(profit_loss), 0) AS aggregate_profit_loss
            FROM trading_positions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let aggregate: Decimal = row.get("aggregate_profit_loss");

        Ok(LedgerStats {
            total_positions: row.get("total_positions"),
            open_positions: row.get("open_positions"),
            closed_positions: row.get("closed_positions"),
            aggregate_profit_loss: to_f64(aggregate)?,
        })
    }
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}

fn to_f64(value: Decimal) -> Result<f64> {
    value
        .to_string()
        .parse()
        .map_err(|_| BotError::StoreUnavailable(format!("non-numeric value {}", value)))
}

fn row_to_flow(row: sqlx::postgres::PgRow) -> Result<FlowRecord> {
    let total_flow: Decimal = row.get("total_flow");

    Ok(FlowRecord {
        asset: row.get("asset"),
        date: row.get("date"),
        total_flow: to_f64(total_flow)?,
        breakdown: row.get("breakdown"),
    })
}

fn row_to_position(row: sqlx::postgres::PgRow) -> Result<TradingPosition> {
    let side_str: String = row.get("side");
    let side = match side_str.as_str() {
        "long" => Side::Long,
        "short" => Side::Short,
        other => {
            return Err(BotError::StoreUnavailable(format!(
                "invalid side in row: {}",
                other
            )))
        }
    };

    let status_str: String = row.get("status");
    let status = PositionStatus::parse(&status_str).ok_or_else(|| {
        BotError::StoreUnavailable(format!("invalid status in row: {}", status_str))
    })?;

    let size: Decimal = row.get("size");
    let entry_price: Decimal = row.get("entry_price");
    let total_flow: Decimal = row.get("total_flow");
    let profit_loss: Option<Decimal> = row.get("profit_loss");

    Ok(TradingPosition {
        id: row.get("id"),
        symbol: row.get("symbol"),
        side,
        size: to_f64(size)?,
        entry_price: to_f64(entry_price)?,
        total_flow: to_f64(total_flow)?,
        exchange_order_id: row.get("exchange_order_id"),
        status,
        profit_loss: profit_loss.map(to_f64).transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
