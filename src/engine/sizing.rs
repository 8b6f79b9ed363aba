use crate::config::SizingConfig;
use crate::error::{BotError, Result};
use crate::models::FlowSignal;

/// Convert a signal's strength and the current market price into an order
/// quantity.
///
/// Notional is `max_position_notional * min(strength, cap)`: stronger flow
/// buys a larger position, but outsized spikes are capped so a single flow
/// print cannot blow up the position size. The quantity is rounded to the
/// configured number of decimals to match exchange lot-size conventions.
///
/// Pure: no network or store access, unit-testable in isolation.
pub fn position_size(
    signal: &FlowSignal,
    current_price: f64,
    max_position_notional: f64,
    sizing: &SizingConfig,
) -> Result<f64> {
    if !current_price.is_finite() || current_price <= 0.0 {
        return Err(BotError::InvalidPrice(current_price));
    }

    let notional = max_position_notional * signal.strength.min(sizing.strength_cap);
    let quantity = notional / current_price;

    let factor = 10f64.powi(sizing.size_decimals as i32);
    Ok((quantity * factor).round() / factor)
}

/// Render a quantity the way the exchange expects it on the wire, with the
/// full configured decimal precision (e.g. `0.04000`).
pub fn format_size(quantity: f64, sizing: &SizingConfig) -> String {
    format!("{:.*}", sizing.size_decimals as usize, quantity)
}
