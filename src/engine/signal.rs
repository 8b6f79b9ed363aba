use crate::models::{FlowRecord, FlowSignal, Side};

/// Decide whether a flow record is significant enough to trade on.
///
/// Returns `None` when the absolute flow is below the threshold — the common
/// case and not an error. The boundary is inclusive: a flow whose magnitude
/// equals the threshold produces a signal with strength 1.0. A zero flow is
/// below any positive threshold and never signals.
///
/// Deterministic: identical inputs always produce identical output.
pub fn evaluate_flow(record: &FlowRecord, min_flow_threshold: f64) -> Option<FlowSignal> {
    let flow_value = record.total_flow;

    if flow_value.abs() < min_flow_threshold {
        return None;
    }

    let side = if flow_value > 0.0 {
        Side::Long
    } else {
        Side::Short
    };

    Some(FlowSignal {
        asset: record.asset.clone(),
        flow_value,
        side,
        strength: flow_value.abs() / min_flow_threshold,
        date: record.date,
    })
}
