use thiserror::Error;

/// Error taxonomy for the flow trading bot.
///
/// `StoreUnavailable` is transient and retried automatically on the next
/// evaluation pass (the watermark is not advanced). `Exchange` and
/// `GatewayUnavailable` during order execution count as failed trades and are
/// NOT retried: the watermark still advances, so the missed trade is dropped.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("flow store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("exchange gateway unreachable: {0}")]
    GatewayUnavailable(String),

    #[error("exchange error (code {code}): {message}")]
    Exchange { code: String, message: String },

    #[error("no ticker data returned for {0}")]
    TickerUnavailable(String),

    #[error("invalid price for sizing: {0}")]
    InvalidPrice(f64),

    #[error("invalid order side: {0} (expected buy or sell)")]
    InvalidSide(String),

    #[error("unknown symbol: {0}")]
    InvalidSymbol(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        BotError::GatewayUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for BotError {
    fn from(err: sqlx::Error) -> Self {
        BotError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BotError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BotError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
