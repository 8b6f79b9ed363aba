// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use api::ExchangeApi;
pub use config::BotConfig;
pub use db::{FlowStore, PositionLedger};
pub use engine::FlowMonitor;
pub use error::{BotError, Result};
pub use models::*;
