//! Control-plane and metrics HTTP surfaces.
//!
//! Backend services ask whether a user is online, push raw payloads to
//! them, list live connections and force a disconnect. The routes delegate
//! to [`ControlPlane`].

use crate::bridge::{ControlPlane, PushOutcome};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use courier_core::{CourierError, CourierResult};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ConnectedResponse {
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ack: String,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub disconnected: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub remote: String,
    pub connected_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
}

/// Build the control-plane router.
pub fn router(control: ControlPlane) -> Router {
    Router::new()
        .route("/v1/users/{user_id}/connected", get(connected_handler))
        .route("/v1/users/{user_id}/payload", post(payload_handler))
        .route("/v1/users/{user_id}/connection", delete(disconnect_handler))
        .route("/v1/connections", get(connections_handler))
        .route("/health", get(health_handler))
        .with_state(control)
}

/// Build the router serving `GET /metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

/// Bind an HTTP listener. Port conflicts surface here, before serving.
pub async fn bind(addr: SocketAddr) -> CourierResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| CourierError::Transport(format!("bind {addr}: {e}")))
}

/// Serve `router` on a bound `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> CourierResult<()> {
    info!(addr = %listener.local_addr()?, "HTTP listener started");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// GET /v1/users/{user_id}/connected
async fn connected_handler(
    State(control): State<ControlPlane>,
    Path(user_id): Path<String>,
) -> Json<ConnectedResponse> {
    let connected = control.is_connected(&user_id).await;
    Json(ConnectedResponse { connected })
}

/// POST /v1/users/{user_id}/payload
async fn payload_handler(
    State(control): State<ControlPlane>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<AckResponse>) {
    let outcome = control.push_payload(&user_id, body.to_vec()).await;
    let status = match outcome {
        PushOutcome::Sent | PushOutcome::NoActiveConnection => StatusCode::OK,
        PushOutcome::TransportFailed(_) => StatusCode::BAD_GATEWAY,
    };
    let ack = outcome.ack().to_string();
    (status, Json(AckResponse { ack }))
}

/// DELETE /v1/users/{user_id}/connection
async fn disconnect_handler(
    State(control): State<ControlPlane>,
    Path(user_id): Path<String>,
) -> Json<DisconnectResponse> {
    let disconnected = control.disconnect(&user_id).await;
    Json(DisconnectResponse { disconnected })
}

/// GET /v1/connections
async fn connections_handler(State(control): State<ControlPlane>) -> Json<ConnectionsResponse> {
    let mut connections: Vec<ConnectionInfo> = control
        .registry()
        .snapshot()
        .await
        .into_iter()
        .map(|(id, handle)| ConnectionInfo {
            id,
            remote: handle.remote_addr().to_string(),
            connected_secs: handle.connected_secs(),
        })
        .collect();
    connections.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ConnectionsResponse { connections })
}

/// GET /health
async fn health_handler(State(control): State<ControlPlane>) -> Json<HealthResponse> {
    let connections = control.registry().count().await;
    Json(HealthResponse {
        status: "ok",
        connections,
    })
}

/// GET /metrics
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn registry_with(id: &str) -> (Arc<ConnectionRegistry>, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(registry.next_serial(), "127.0.0.1:2".parse().unwrap(), tx);
        registry.add(id, handle).await;
        (registry, rx)
    }

    #[tokio::test]
    async fn connected_reports_presence() {
        let (registry, _rx) = registry_with("u1").await;
        let app = router(ControlPlane::new(registry));

        let req = Request::builder()
            .uri("/v1/users/u1/connected")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["connected"], true);

        let req = Request::builder()
            .uri("/v1/users/u2/connected")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(body_json(resp).await["connected"], false);
    }

    #[tokio::test]
    async fn payload_to_unknown_user() {
        let app = router(ControlPlane::new(Arc::new(ConnectionRegistry::new())));
        let req = Request::builder()
            .method("POST")
            .uri("/v1/users/ghost/payload")
            .body(Body::from("hello"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["ack"], "No active connection");
    }

    #[tokio::test]
    async fn payload_to_connected_user() {
        let (registry, mut rx) = registry_with("u1").await;
        let app = router(ControlPlane::new(registry));

        let owner = tokio::spawn(async move {
            let Some(Outbound::Push { payload, ack }) = rx.recv().await else {
                panic!("no push");
            };
            let _ = ack.send(Ok(()));
            payload
        });

        let req = Request::builder()
            .method("POST")
            .uri("/v1/users/u1/payload")
            .body(Body::from("hello"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["ack"], "Payload sent");
        assert_eq!(owner.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn payload_write_failure_is_bad_gateway() {
        let (registry, rx) = registry_with("u1").await;
        drop(rx);
        let app = router(ControlPlane::new(registry));

        let req = Request::builder()
            .method("POST")
            .uri("/v1/users/u1/payload")
            .body(Body::from("hello"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["ack"], "Failed to send payload");
    }

    #[tokio::test]
    async fn health_counts_connections() {
        let (registry, _rx) = registry_with("u1").await;
        let app = router(ControlPlane::new(registry));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
    }

    #[tokio::test]
    async fn connections_lists_live_entries() {
        let (registry, _rx1) = registry_with("u2").await;
        let (tx, _rx2) = mpsc::channel(4);
        let handle = ConnectionHandle::new(registry.next_serial(), "10.0.0.7:5000".parse().unwrap(), tx);
        registry.add("u1", handle).await;
        let app = router(ControlPlane::new(registry));

        let req = Request::builder().uri("/v1/connections").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        let list = parsed["connections"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["id"], "u1");
        assert_eq!(list[0]["remote"], "10.0.0.7:5000");
        assert_eq!(list[1]["id"], "u2");
    }

    #[tokio::test]
    async fn disconnect_closes_registered_user() {
        let (registry, mut rx) = registry_with("u1").await;
        let app = router(ControlPlane::new(registry.clone()));

        let req = Request::builder()
            .method("DELETE")
            .uri("/v1/users/u1/connection")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["disconnected"], true);
        assert!(matches!(rx.recv().await, Some(Outbound::Close)));
        assert!(!registry.exists("u1").await);

        let req = Request::builder()
            .method("DELETE")
            .uri("/v1/users/u1/connection")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(body_json(resp).await["disconnected"], false);
    }

    #[tokio::test]
    async fn serve_answers_on_bound_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let app = router(ControlPlane::new(Arc::new(ConnectionRegistry::new())));
        let serving = tokio::spawn(serve(listener, app, shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_reports_port_in_use() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = bind(taken.local_addr().unwrap()).await.unwrap_err();
        assert!(matches!(err, CourierError::Transport(_)));
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = metrics_router(handle);

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = router(ControlPlane::new(Arc::new(ConnectionRegistry::new())));
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
