use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{close_code, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use notify_core::UserId;
use notify_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{credential_from_parts, AuthError, PrincipalResolver};
use crate::connections::Connection;
use crate::health::{self, HealthResponse};
use crate::orchestrator::{FanoutOrchestrator, SessionHandler};
use crate::websocket::WsConnection;

/// Route clients connect to for their feed.
pub const FEED_PATH: &str = "/post/feed/posted";

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<FanoutOrchestrator>,
    pub resolver: Arc<dyn PrincipalResolver>,
    /// Cancelled when the process starts shutting down.
    pub shutdown: CancellationToken,
    pub start_time: Instant,
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<FanoutOrchestrator>,
        resolver: Arc<dyn PrincipalResolver>,
        shutdown: CancellationToken,
        max_message_size: usize,
    ) -> Self {
        Self {
            orchestrator,
            resolver,
            shutdown,
            start_time: Instant::now(),
            max_message_size,
        }
    }
}

/// Build the Axum router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(FEED_PATH, get(feed_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the state's shutdown token is cancelled.
pub async fn start(settings: &ServerSettings, state: AppState) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = state.shutdown.clone();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(%local_addr, "gateway listening");
    Ok(ServerHandle { local_addr, task })
}

pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// The authenticated user behind a request.
pub struct Principal(pub UserId);

impl FromRequestParts<AppState> for Principal {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credential = credential_from_parts(parts).ok_or(AuthError::MissingCredential)?;
        let user = state.resolver.resolve(&credential).await.map_err(|e| {
            debug!(error = %e, "rejected credential");
            e
        })?;
        Ok(Self(user))
    }
}

/// GET /post/feed/posted
async fn feed_handler(
    State(state): State<AppState>,
    Principal(user): Principal,
    ConnectInfo(endpoint): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let max = state.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| serve_socket(socket, endpoint, user, state))
}

async fn serve_socket(socket: WebSocket, endpoint: SocketAddr, user: UserId, state: AppState) {
    let (sink, mut stream) = socket.split();
    let ws = Arc::new(WsConnection::new(endpoint, sink));
    let connection: Arc<dyn Connection> = ws.clone();

    if let Err(e) = state
        .orchestrator
        .handle_session(&state.shutdown, Arc::clone(&connection), &user)
        .await
    {
        warn!(user_id = %user, %endpoint, error = %e, kind = e.error_kind(), "session setup failed");
        ws.close_with(close_code::ERROR, "session setup failed").await;
        state.orchestrator.end_session(&user, &connection).await;
        return;
    }
    info!(user_id = %user, %endpoint, "session started");

    // Inbound frames carry nothing; read only to notice the peer leaving.
    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(user_id = %user, %endpoint, error = %e, "read failed");
                    break;
                }
            },
        }
    }

    state.orchestrator.end_session(&user, &connection).await;
    info!(user_id = %user, %endpoint, "session ended");
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.orchestrator.connections();
    let consumers = state.orchestrator.consumers().len();
    Json(health::health_check(
        state.start_time,
        connections.user_count(),
        connections.connection_count(),
        consumers,
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use notify_broker::memory::MemoryBroker;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{JwtResolver, PassthroughResolver};
    use crate::mock::MockConnection;

    fn state_with(resolver: Arc<dyn PrincipalResolver>) -> AppState {
        let orchestrator = Arc::new(FanoutOrchestrator::new(Arc::new(MemoryBroker::new())));
        AppState::new(orchestrator, resolver, CancellationToken::new(), 64 * 1024)
    }

    fn app(state: AppState) -> Router {
        router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let state = state_with(Arc::new(PassthroughResolver));
        state
            .orchestrator
            .handle_session(&state.shutdown, MockConnection::at(1001), &UserId::from_raw("u1"))
            .await
            .unwrap();

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["users"], 1);
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["consumers"], 1);
    }

    #[tokio::test]
    async fn feed_without_credential_is_401() {
        let req = Request::builder().uri(FEED_PATH).body(Body::empty()).unwrap();
        let resp = app(state_with(Arc::new(PassthroughResolver)))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn feed_with_bad_token_is_401() {
        let resolver = JwtResolver::new(&SecretString::from("secret".to_string()));
        let req = Request::builder()
            .uri(FEED_PATH)
            .header("authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let resp = app(state_with(Arc::new(resolver))).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let parsed = body_json(resp).await;
        assert!(parsed["error"].as_str().unwrap().starts_with("invalid token"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app(state_with(Arc::new(PassthroughResolver)))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
