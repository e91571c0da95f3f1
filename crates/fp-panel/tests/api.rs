//! HTTP API through the axum router, one request at a time

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use fp_core::config::OperatorToken;
use fp_core::ConnectionType;
use fp_panel::api::router;
use fp_panel::registry::sha256_hex;
use fp_panel::store::Store;

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_as(app, OPERATOR_TOKEN, method, uri, body).await
}

async fn call_as(
    app: &Router,
    token: &str,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token));
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    send(app, builder.body(body).unwrap()).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let panel = panel();
    let app = router(panel.state.clone());

    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["nodes"], 1);
}

#[tokio::test]
async fn test_missing_or_wrong_token_is_unauthorized() {
    let panel = panel();
    let app = router(panel.state.clone());

    let request = Request::get("/nodes").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let request = Request::get("/nodes")
        .header(header::AUTHORIZATION, "Bearer not-the-token")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_node_crud() {
    let panel = panel();
    let app = router(panel.state.clone());

    let (status, nodes) = call(&app, "GET", "/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes.as_array().unwrap().len(), 1);
    assert_eq!(nodes[0]["isLocal"], true);

    let (status, created) = call(
        &app,
        "POST",
        "/nodes",
        Some(json!({
            "name": "db-1",
            "hostname": "db-1.example.net",
            "ip": "10.0.0.9",
            "sshPassword": "hunter2",
            "connectionType": "tunnel",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "connection_error");
    assert_eq!(created["hasPassword"], true);
    assert!(created.get("sshPassword").is_none());
    let id = created["id"].as_str().unwrap().to_string();

    let (status, updated) = call(
        &app,
        "PUT",
        &format!("/nodes/{}", id),
        Some(json!({ "name": "db-primary" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["name"], "db-primary");

    let (status, _) = call(&app, "DELETE", &format!("/nodes/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, "GET", &format!("/nodes/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_create_node_rejects_missing_fields() {
    let panel = panel();
    let app = router(panel.state.clone());

    let (status, body) = call(
        &app,
        "POST",
        "/nodes",
        Some(json!({ "name": "", "hostname": "h", "ip": "10.0.0.1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid");
}

#[tokio::test]
async fn test_delete_local_node_conflicts() {
    let panel = panel();
    let app = router(panel.state.clone());
    let local = panel.state.registry.local().unwrap();

    let (status, body) = call(&app, "DELETE", &format!("/nodes/{}", local.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn test_deploy_over_http() {
    let panel = panel();
    let app = router(panel.state.clone());
    let node = panel
        .state
        .registry
        .create(&ops(), new_node("edge-1", fp_core::ConnectionType::Tunnel))
        .unwrap();

    let (status, job) = call(
        &app,
        "POST",
        &format!("/nodes/{}/deploy-agent", node.id),
        Some(json!({ "dbConfig": { "host": "127.0.0.1", "port": 5432, "password": null } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["status"], "running");

    let mut last = Value::Null;
    for _ in 0..200 {
        let (status, job) =
            call(&app, "GET", &format!("/nodes/{}/deploy-status", node.id), None).await;
        assert_eq!(status, StatusCode::OK);
        last = job;
        if last["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["status"], "success");

    let (_, view) = call(&app, "GET", &format!("/nodes/{}", node.id), None).await;
    assert_eq!(view["status"], "active");
    assert_eq!(view["connectionType"], "tunnel");
}

#[tokio::test]
async fn test_terminal_on_direct_node_is_unprocessable() {
    let panel = panel();
    let app = router(panel.state.clone());
    let local = panel.state.registry.local().unwrap();

    let (status, body) = call(
        &app,
        "POST",
        "/terminal/start",
        Some(json!({ "nodeId": local.id })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "node_not_tunnel");
}

#[tokio::test]
async fn test_terminal_round_trip() {
    let panel = panel();
    let node_id = deployed_tunnel_node(&panel, "edge-1").await;
    let app = router(panel.state.clone());

    let (status, started) = call(
        &app,
        "POST",
        "/terminal/start",
        Some(json!({ "nodeId": node_id, "cols": 120, "rows": 40 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let shell_id = started["shellId"].as_str().unwrap().to_string();

    let (status, ack) = call(
        &app,
        "POST",
        "/terminal/input",
        Some(json!({ "nodeId": node_id, "shellId": shell_id, "data": STANDARD.encode("ls\n") })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["ok"], true);

    // The shell id alone is enough to poll
    let mut text = Vec::new();
    for _ in 0..200 {
        let (status, out) = call(
            &app,
            "GET",
            &format!("/terminal/output?shellId={}", shell_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        for event in out["events"].as_array().unwrap() {
            text.extend(STANDARD.decode(event["data"].as_str().unwrap()).unwrap());
        }
        if String::from_utf8_lossy(&text).contains("beta.txt") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(String::from_utf8_lossy(&text).contains("alpha.txt  beta.txt"));

    let (_, sessions) = call(&app, "GET", "/terminal/sessions", None).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["shellId"], shell_id.as_str());

    let (status, _) = call(
        &app,
        "POST",
        "/terminal/close",
        Some(json!({ "shellId": shell_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        "GET",
        &format!("/terminal/output?nodeId={}&shellId={}", node_id, shell_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_input_encoding_is_rejected() {
    let panel = panel();
    let node_id = deployed_tunnel_node(&panel, "edge-1").await;
    let shell_id = panel
        .state
        .shells
        .start_shell(&ops(), &node_id, None)
        .await
        .unwrap();
    let app = router(panel.state.clone());

    let (status, _) = call(
        &app,
        "POST",
        "/terminal/input",
        Some(json!({ "nodeId": node_id, "shellId": shell_id, "data": "%%%" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_usage_rejects_unknown_period() {
    let panel = panel();
    let app = router(panel.state.clone());
    let local = panel.state.registry.local().unwrap();

    let (status, samples) = call(
        &app,
        "GET",
        &format!("/analytics/node-usage/{}", local.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(samples.as_array().unwrap().is_empty());

    let (status, _) = call(
        &app,
        "GET",
        &format!("/analytics/node-usage/{}?period=fortnight", local.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_non_admin_cannot_manage_nodes() {
    let mut config = test_config();
    config.operators.push(OperatorToken {
        name: "viewer".into(),
        token_sha256: sha256_hex("viewer-token"),
        admin: false,
    });
    let panel = panel_with(config, Store::in_memory());
    let app = router(panel.state.clone());
    let node = panel
        .state
        .registry
        .create(&ops(), new_node("web-1", ConnectionType::Direct))
        .unwrap();
    let path = format!("/nodes/{}", node.id);

    let (status, body) = call_as(&app, "viewer-token", "DELETE", &path, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
    assert!(panel.state.registry.get(&node.id).is_ok());

    for (method, uri) in [
        ("GET", "/nodes".to_string()),
        ("POST", format!("{}/deploy-agent", path)),
        ("POST", format!("{}/sync", path)),
        ("GET", format!("/analytics/node-usage/{}", node.id)),
    ] {
        let (status, _) = call_as(&app, "viewer-token", method, &uri, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", method, uri);
    }

    // Shells stay open to every operator
    let (status, _) = call_as(&app, "viewer-token", "GET", "/terminal/sessions", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&app, "DELETE", &path, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
