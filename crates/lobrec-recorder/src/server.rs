use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::SessionStatus;
use crate::metrics::encode_metrics;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: String,
    pub connected: bool,
    pub subscriptions_ready: bool,
    pub sessions: u64,
}

impl HealthResponse {
    fn from_status(status: &str, session: &SessionStatus) -> Self {
        Self {
            status: status.to_string(),
            state: session.state.to_string(),
            connected: session.state == crate::connection::ConnectionState::Connected,
            subscriptions_ready: session.subscriptions_ready,
            sessions: session.sessions,
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub session: watch::Receiver<SessionStatus>,
}

impl ServerState {
    pub fn new(session: watch::Receiver<SessionStatus>) -> Self {
        Self { session }
    }
}

/// Always 200 while the process is up.
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let session = *state.session.borrow();
    Json(HealthResponse::from_status("ok", &session))
}

/// 200 only once connected with subscriptions in place.
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let session = *state.session.borrow();
    if session.is_ready() {
        (StatusCode::OK, Json(HealthResponse::from_status("ready", &session)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::from_status("not_ready", &session)),
        )
    }
}

async fn metrics() -> String {
    encode_metrics()
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_state(state: ConnectionState, ready: bool) -> ServerState {
        let (_tx, rx) = watch::channel(SessionStatus {
            state,
            subscriptions_ready: ready,
            sessions: 1,
        });
        ServerState::new(rx)
    }

    async fn get_status(state: ServerState, uri: &str) -> StatusCode {
        create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_health_returns_ok_while_reconnecting() {
        let state = create_test_state(ConnectionState::Reconnecting, false);
        assert_eq!(get_status(state, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_when_subscribed() {
        let state = create_test_state(ConnectionState::Connected, true);
        assert_eq!(get_status(state, "/ready").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_ready_before_acks() {
        let state = create_test_state(ConnectionState::Connected, false);
        assert_eq!(get_status(state, "/ready").await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_not_ready_when_dead() {
        let state = create_test_state(ConnectionState::Dead, true);
        assert_eq!(get_status(state, "/ready").await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = create_test_state(ConnectionState::Connected, true);
        assert_eq!(get_status(state, "/metrics").await, StatusCode::OK);
    }
}
