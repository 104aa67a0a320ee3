//! HTTP side of the server.
//!
//! The WebSocket endpoint has no fixed path: any request that carries upgrade
//! headers is upgraded. `GET /health` is the only real route; every other
//! plain request gets a short liveness string.

use crate::hub::Hub;
use crate::ws::handle_socket;
use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use framelink_common::protocol::SERVICE_NAME;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const LIVENESS_TEXT: &str = "FrameLink WebSocket Server Running";

/// Build the complete router: health, upgrade-anywhere fallback and middleware.
pub fn build_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health).options(preflight))
        .fallback(fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
    connections: usize,
}

async fn health(State(hub): State<Arc<Hub>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        timestamp: chrono::Utc::now().to_rfc3339(),
        connections: hub.stats().await.connections,
    })
}

async fn preflight() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
}

async fn fallback(State(hub): State<Arc<Hub>>, req: Request) -> Response {
    if req.method() == Method::OPTIONS {
        return preflight().await.into_response();
    }

    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (mut parts, _body) = req.into_parts();

    match WebSocketUpgrade::from_request_parts(&mut parts, &hub).await {
        Ok(ws) => {
            let max = hub.settings().max_frame_bytes;
            ws.max_message_size(max)
                .max_frame_size(max)
                .on_upgrade(move |socket| handle_socket(socket, hub, remote))
        }
        Err(_) => (StatusCode::OK, LIVENESS_TEXT).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubSettings;
    use axum::body::Body;
    use serde_json::Value;
    use tower::ServiceExt;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(HubSettings::default()))
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn health_reports_service_and_connections() {
        let hub = hub();
        let _a = hub.accept(None).await;
        let _b = hub.accept(None).await;

        let resp = build_router(hub)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let v: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(v["status"], "healthy");
        assert_eq!(v["service"], "framelink-signaling");
        assert_eq!(v["connections"], 2);
        assert!(chrono::DateTime::parse_from_rfc3339(v["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn plain_requests_get_liveness_text() {
        let resp = build_router(hub())
            .oneshot(Request::builder().uri("/anything").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, LIVENESS_TEXT.as_bytes());
    }

    #[tokio::test]
    async fn options_is_permissive() {
        for uri in ["/", "/health"] {
            let resp = build_router(hub())
                .oneshot(
                    Request::builder()
                        .method(Method::OPTIONS)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            assert_eq!(
                resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
                "*",
                "{uri}"
            );
        }
    }
}
