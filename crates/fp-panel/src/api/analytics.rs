//! Usage history

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use fp_core::time::{now_millis, parse_period};
use fp_core::{MetricSample, NodeId, PanelError};

use super::ApiError;
use crate::state::PanelState;

const DEFAULT_PERIOD: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    /// `30m`, `1h`, `24h`, `7d`, ...
    pub period: Option<String>,
}

pub async fn node_usage(
    State(state): State<Arc<PanelState>>,
    Path(id): Path<NodeId>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    state.registry.get(&id)?;
    let period = match query.period.as_deref() {
        None => DEFAULT_PERIOD,
        Some(p) => parse_period(p)
            .ok_or_else(|| PanelError::Invalid(format!("'{}' is not a period", p)))?,
    };
    Ok(Json(state.history.query(&id, period, now_millis())))
}
