//! Operator HTTP API
//!
//! JSON in camelCase. Everything except `/health` needs an operator bearer
//! token; the middleware resolves it to an `Operator` extension. Node,
//! deploy, sync and analytics routes additionally need an admin operator.

mod analytics;
mod error;
mod nodes;
mod terminal;

pub use error::ApiError;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use fp_core::{Operator, PanelError};

use crate::state::PanelState;

pub fn router(state: Arc<PanelState>) -> Router {
    let admin = Router::new()
        .route("/nodes", get(nodes::list).post(nodes::create))
        .route(
            "/nodes/:id",
            get(nodes::get).put(nodes::update).delete(nodes::delete),
        )
        .route("/nodes/:id/deploy-agent", post(nodes::deploy_agent))
        .route("/nodes/:id/deploy-status", get(nodes::deploy_status))
        .route("/nodes/:id/sync", post(nodes::sync))
        .route("/analytics/node-usage/:id", get(analytics::node_usage))
        .route_layer(middleware::from_fn(require_admin));

    // Shell ownership is checked by the gateway itself
    let protected = Router::new()
        .merge(admin)
        .route("/terminal/start", post(terminal::start))
        .route("/terminal/input", post(terminal::input))
        .route("/terminal/output", get(terminal::output))
        .route("/terminal/resize", post(terminal::resize))
        .route("/terminal/close", post(terminal::close))
        .route("/terminal/sessions", get(terminal::sessions))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_operator,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health(State(state): State<Arc<PanelState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "nodes": state.registry.ids().len(),
        "agents": state.agents.len(),
        "shells": state.shells.len(),
    }))
}

async fn require_operator(
    State(state): State<Arc<PanelState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let operator = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .and_then(|t| state.authenticate(t))
        .ok_or(ApiError(PanelError::Unauthorized))?;

    tracing::trace!(
        "{} {} by {}",
        request.method(),
        request.uri().path(),
        operator.name
    );
    request.extensions_mut().insert(operator);
    Ok(next.run(request).await)
}

/// Runs inside `require_operator`, which has already attached the operator
async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let operator = request
        .extensions()
        .get::<Operator>()
        .ok_or(ApiError(PanelError::Unauthorized))?;
    if !operator.admin {
        return Err(ApiError(PanelError::Forbidden(format!(
            "{} is not an administrator",
            operator.name
        ))));
    }
    Ok(next.run(request).await)
}
