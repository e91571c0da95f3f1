//! Answers to the panel's metrics queries

use fp_core::probe;
use fp_protocol::{ErrorCode, Message};

/// Sample this host and build the reply to `MetricsQuery { request_id }`.
/// A failed probe is reported as `MetricsUnavailable` on the control stream.
pub async fn report(request_id: u64) -> Message {
    match probe::sample_async().await {
        Ok(snapshot) => Message::MetricsReport {
            request_id,
            snapshot,
        },
        Err(e) => {
            tracing::warn!("Metrics probe failed: {}", e);
            Message::Error {
                code: ErrorCode::MetricsUnavailable,
                message: e.to_string(),
            }
        }
    }
}
