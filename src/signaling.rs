//! HTTP/JSON signaling surface.
//!
//! Browsers drive the gateway through six endpoints: health and stats
//! reads, offer/answer negotiation, heartbeats, and stream probe/stop.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::capture::StreamInfo;
use crate::config::StreamType;
use crate::session::{HealthSnapshot, SessionManager, StatsSnapshot};
use crate::Error;

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub stream_type: StreamType,
}

#[derive(Debug, Serialize)]
pub struct OfferResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: &'static str,
    pub pc_id: String,
    /// Seconds between heartbeats the client is expected to send
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub pc_id: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: &'static str,
    pub connection_state: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamStartRequest {
    pub rtsp_url: String,
    #[serde(default)]
    pub stream_type: StreamType,
}

#[derive(Debug, Deserialize)]
pub struct StreamStopRequest {
    pub pc_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn map_error(e: Error) -> HandlerError {
    let status = match &e {
        Error::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::UnknownSession(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

/// Build the signaling router
pub fn build_router(manager: SessionManager) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/offer", post(offer_handler))
        .route("/api/heartbeat", post(heartbeat_handler))
        .route("/api/stream/start", post(stream_start_handler))
        .route("/api/stream/stop", post(stream_stop_handler))
        .with_state(manager)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    addr: SocketAddr,
    manager: SessionManager,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let router = build_router(manager);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "signaling server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_handler(State(manager): State<SessionManager>) -> Json<HealthSnapshot> {
    Json(manager.health().await)
}

async fn stats_handler(State(manager): State<SessionManager>) -> Json<StatsSnapshot> {
    Json(manager.stats().await)
}

async fn offer_handler(
    State(manager): State<SessionManager>,
    Json(request): Json<OfferRequest>,
) -> Result<Json<OfferResponse>, HandlerError> {
    if request.sdp_type != "offer" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("expected an offer, got '{}'", request.sdp_type),
            }),
        ));
    }

    let (pc_id, answer_sdp) = manager
        .create_session(request.sdp, request.rtsp_url, request.stream_type)
        .await
        .map_err(map_error)?;

    Ok(Json(OfferResponse {
        sdp: answer_sdp,
        sdp_type: "answer",
        pc_id,
        heartbeat_interval: manager.config().heartbeat_interval_secs,
    }))
}

async fn heartbeat_handler(
    State(manager): State<SessionManager>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, HandlerError> {
    let state = manager
        .heartbeat(&request.pc_id)
        .await
        .map_err(map_error)?;

    Ok(Json(HeartbeatResponse {
        status: "ok",
        connection_state: state.to_string(),
    }))
}

async fn stream_start_handler(
    State(manager): State<SessionManager>,
    Json(request): Json<StreamStartRequest>,
) -> Result<Json<StreamInfo>, HandlerError> {
    let info = manager
        .probe_stream(&request.rtsp_url)
        .await
        .map_err(map_error)?;

    Ok(Json(info))
}

async fn stream_stop_handler(
    State(manager): State<SessionManager>,
    Json(request): Json<StreamStopRequest>,
) -> Json<StatusResponse> {
    manager.stop(&request.pc_id).await;
    Json(StatusResponse { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DisabledCaptureFactory;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn router() -> Router {
        let manager = SessionManager::new(
            GatewayConfig::default(),
            Arc::new(DisabledCaptureFactory),
        )
        .unwrap();
        build_router(manager)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["total_connections"], 0);
        assert_eq!(body["healthy_connections"], 0);
        assert_eq!(body["timeout_connections"], 0);
    }

    #[tokio::test]
    async fn test_stats_endpoint_empty() {
        let response = router()
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["max_connections"], 20);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_session_is_bad_request() {
        let request = Request::post("/api/heartbeat")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"pc_id":"no-such-id"}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_ok() {
        let request = Request::post("/api/stream/stop")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"pc_id":"no-such-id"}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_offer_rejects_non_offer_type() {
        let request = Request::post("/api/offer")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"sdp":"v=0","type":"answer","rtsp_url":"rtsp://cam.local/main"}"#,
            ))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_start_without_backend_is_server_error() {
        let request = Request::post("/api/stream/start")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"rtsp_url":"rtsp://cam.local/main"}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
