//! `/terminal` handlers. Shell bytes travel base64-encoded.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use fp_core::{NodeId, Operator, PanelError, ShellId, ShellState, TerminalSize};

use super::ApiError;
use crate::session::{ShellOutput, ShellSummary};
use crate::state::PanelState;

#[derive(Debug, Serialize)]
pub struct Ack {
    ok: bool,
}

const OK: Json<Ack> = Json(Ack { ok: true });

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub node_id: NodeId,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub shell_id: ShellId,
}

pub async fn start(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Json(body): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let size = match (body.rows, body.cols) {
        (None, None) => None,
        (rows, cols) => Some(TerminalSize::new(
            rows.unwrap_or(state.config.shell.default_rows),
            cols.unwrap_or(state.config.shell.default_cols),
        )),
    };
    let shell_id = state
        .shells
        .start_shell(&operator, &body.node_id, size)
        .await?;
    Ok(Json(StartResponse { shell_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub node_id: NodeId,
    pub shell_id: ShellId,
    /// base64
    pub data: String,
}

pub async fn input(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Json(body): Json<InputRequest>,
) -> Result<Json<Ack>, ApiError> {
    let data = STANDARD
        .decode(body.data.as_bytes())
        .map_err(|e| PanelError::Invalid(format!("data is not base64: {}", e)))?;
    state
        .shells
        .send_input(&operator, &body.node_id, &body.shell_id, Bytes::from(data))
        .await?;
    Ok(OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputQuery {
    /// Optional; checked against the shell's node when given
    pub node_id: Option<NodeId>,
    pub shell_id: ShellId,
}

#[derive(Debug, Serialize)]
pub struct OutputEvent {
    seq: u64,
    /// base64
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputResponse {
    shell_id: ShellId,
    state: ShellState,
    events: Vec<OutputEvent>,
    dropped: u64,
    exit_code: Option<i32>,
}

impl From<ShellOutput> for OutputResponse {
    fn from(out: ShellOutput) -> Self {
        Self {
            shell_id: out.shell_id,
            state: out.state,
            events: out
                .events
                .into_iter()
                .map(|c| OutputEvent {
                    seq: c.seq,
                    data: STANDARD.encode(&c.data),
                })
                .collect(),
            dropped: out.dropped,
            exit_code: out.exit_code,
        }
    }
}

pub async fn output(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<OutputResponse>, ApiError> {
    let out = state
        .shells
        .poll_output(&operator, query.node_id.as_ref(), &query.shell_id)
        .await?;
    Ok(Json(out.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub shell_id: ShellId,
    pub cols: u16,
    pub rows: u16,
}

pub async fn resize(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Json(body): Json<ResizeRequest>,
) -> Result<Json<Ack>, ApiError> {
    state
        .shells
        .resize_shell(&operator, &body.shell_id, TerminalSize::new(body.rows, body.cols))
        .await?;
    Ok(OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub shell_id: ShellId,
}

pub async fn close(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
    Json(body): Json<CloseRequest>,
) -> Result<Json<Ack>, ApiError> {
    state.shells.close_shell(&operator, &body.shell_id).await?;
    Ok(OK)
}

pub async fn sessions(
    State(state): State<Arc<PanelState>>,
    Extension(operator): Extension<Operator>,
) -> Json<Vec<ShellSummary>> {
    Json(state.shells.list_shells(&operator))
}
