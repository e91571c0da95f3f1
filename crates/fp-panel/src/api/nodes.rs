//! `/nodes` handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use fp_core::{NodeId, Operator};

use super::ApiError;
use crate::deploy::DeploymentJob;
use crate::metrics::SyncReport;
use crate::registry::{NewNode, NodeUpdate, NodeView};
use crate::state::PanelState;

pub async fn list(State(state): State<Arc<PanelState>>) -> Json<Vec<NodeView>> {
    Json(state.registry.list())
}

pub async fn get(
    State(state): State<Arc<PanelState>>,
    Path(id): Path<NodeId>,
) -> Result<Json<NodeView>, ApiError> {
    Ok(Json(state.registry.view(&id)?))
}

pub async fn create(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Json(body): Json<NewNode>,
) -> Result<(StatusCode, Json<NodeView>), ApiError> {
    let view = state.registry.create(&operator, body)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn update(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<NodeId>,
    Json(body): Json<NodeUpdate>,
) -> Result<Json<NodeView>, ApiError> {
    Ok(Json(state.registry.update(&operator, &id, body)?))
}

pub async fn delete(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<NodeId>,
) -> Result<StatusCode, ApiError> {
    state.delete_node(&operator, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Settings written verbatim into the agent's `[database]` section
    pub db_config: Option<serde_json::Value>,
}

pub async fn deploy_agent(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<NodeId>,
    body: Option<Json<DeployRequest>>,
) -> Result<(StatusCode, Json<DeploymentJob>), ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let job = state
        .deployer
        .deploy_agent(&operator, &id, request.db_config)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn deploy_status(
    State(state): State<Arc<PanelState>>,
    Path(id): Path<NodeId>,
) -> Result<Json<DeploymentJob>, ApiError> {
    Ok(Json(state.deployer.deploy_status(&id)?))
}

pub async fn sync(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Path(id): Path<NodeId>,
) -> Result<Json<SyncReport>, ApiError> {
    tracing::debug!("Manual sync of {} requested by {}", id, operator.name);
    Ok(Json(state.collector.sync_node(&id).await?))
}
