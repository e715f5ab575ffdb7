// DicyVPN - REST API Module
// Handles HTTP API endpoints for tunnel control

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

// added for /api/events
use axum::response::sse::Event;
use axum::response::Sse;
use futures::{stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::WatchStream;

use serde::Serialize;
use tracing::{error, info, warn};

use chrono::Utc;
use dicyvpn_common::{Error, LoginRequest, StatusEvent};
use std::time::Duration;

use crate::manager::VpnManager;

/// Shared application state
pub struct AppState {
    pub manager: Arc<VpnManager>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/servers", get(list_servers))
        .route("/api/connect/:id", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// HTTP status and machine-readable code for a client error
fn error_status(error: &Error) -> (StatusCode, Option<&'static str>) {
    match error {
        Error::NoSubscription => (StatusCode::PAYMENT_REQUIRED, Some("NO_SUBSCRIPTION")),
        Error::DevicesLimitReached => (StatusCode::FORBIDDEN, Some("DEVICES_LIMIT_REACHED")),
        Error::ServerNotFound(_) => (StatusCode::NOT_FOUND, None),
        Error::NotLoggedIn => (StatusCode::UNAUTHORIZED, Some("NOT_LOGGED_IN")),
        Error::Unauthorized => (StatusCode::UNAUTHORIZED, Some("SESSION_EXPIRED")),
        Error::InvalidCredentials => (StatusCode::UNAUTHORIZED, Some("INVALID_CREDENTIALS")),
        Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, None),
        Error::Cancelled => (StatusCode::CONFLICT, Some("CANCELLED")),
        Error::Remote(_) | Error::UnparseableResponse(_) | Error::Http(_) => {
            (StatusCode::BAD_GATEWAY, None)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    }
}

fn error_response(error: Error) -> axum::response::Response {
    let (status, code) = error_status(&error);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code,
        }),
    )
        .into_response()
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// Current tunnel status and server
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.status())
}

/// Server catalog from the VPN service
async fn list_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.servers().await {
        Ok(servers) => Json(servers).into_response(),
        Err(e) => {
            error!("Failed to list servers: {}", e);
            error_response(e)
        }
    }
}

/// Connect to a server
///
/// Answers once the bring-up is scheduled; progress follows on /api/events.
async fn connect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("API: Connect request for {}", id);

    match state.manager.connect(&id).await {
        Ok(server) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse {
                message: format!("Connecting to {} ({})", server.name, server.id),
            }),
        )
            .into_response(),
        Err(Error::Cancelled) => {
            info!("Connect request for {} was superseded", id);
            error_response(Error::Cancelled)
        }
        Err(e) => {
            error!("Failed to connect to {}: {}", id, e);
            error_response(e)
        }
    }
}

/// Disconnect the tunnel
async fn disconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Disconnect request");
    state.manager.disconnect().await;
    Json(SuccessResponse {
        message: "Disconnecting".to_string(),
    })
}

/// Log in to the VPN service
async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    info!("API: Login request");

    match state.manager.login(&request.email, &request.password).await {
        Ok(()) => Json(SuccessResponse {
            message: "Logged in".to_string(),
        })
        .into_response(),
        Err(e) => {
            warn!("Login failed: {}", e);
            error_response(e)
        }
    }
}

/// Log out of the VPN service
async fn logout(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("API: Logout request");

    match state.manager.logout().await {
        Ok(()) => Json(SuccessResponse {
            message: "Logged out".to_string(),
        })
        .into_response(),
        Err(e) => {
            error!("Logout failed: {}", e);
            error_response(e)
        }
    }
}

/// GET /api/events  → SSE stream of status changes
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    // The watch stream yields the current status first
    let manager = state.manager.clone();
    let status_events = WatchStream::new(manager.subscribe()).filter_map(move |status| {
        let event = StatusEvent::Status {
            status,
            server: manager.current_server(),
            timestamp: Utc::now(),
        };
        async move { to_sse_event(&event).map(Ok::<_, Infallible>) }
    });

    // Heartbeat stream to keep connections warm and allow clients to detect liveness
    let heartbeat_stream = heartbeat_stream();

    let merged = stream::select(status_events, heartbeat_stream);

    // Take events until shutdown signal is received
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn to_sse_event(event: &StatusEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::error!("Failed to serialize StatusEvent: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&StatusEvent::Heartbeat { timestamp: Utc::now() }) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ConnectionCoordinator;
    use crate::observer::TunnelStateObserver;
    use crate::backend::TunnelStateListener;
    use crate::testing::{test_credentials, wait_until, Event, EventLog, FakeBackend, FakeRemote};
    use axum::body::Body;
    use axum::http::Request;
    use dicyvpn_common::{
        connect_with_events, create_daemon_client, ConnectEventHandler, ConnectionMode,
        DaemonClientConfig, InterfaceState, Server, StatusResponse, TunnelSettings, TunnelStatus,
    };
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct TestDaemon {
        state: Arc<AppState>,
        observer: Arc<TunnelStateObserver>,
        remote: Arc<FakeRemote>,
        log: EventLog,
    }

    fn test_daemon() -> TestDaemon {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(TunnelStateObserver::new());
        let remote = Arc::new(FakeRemote::new(log.clone()));
        let backend = Arc::new(FakeBackend::new(log.clone(), observer.clone()));
        let coordinator = ConnectionCoordinator::new(
            remote.clone(),
            backend,
            observer.clone(),
            test_credentials(),
            TunnelSettings::default(),
        );
        let manager = Arc::new(VpnManager::new(
            remote.clone(),
            coordinator,
            observer.clone(),
            None,
        ));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        TestDaemon {
            state: Arc::new(AppState {
                manager,
                shutdown_tx,
            }),
            observer,
            remote,
            log,
        }
    }

    fn test_router() -> (Router, Arc<FakeRemote>) {
        let daemon = test_daemon();
        (create_router(daemon.state), daemon.remote)
    }

    /// Serve the router on a loopback port and return a client config for it
    async fn serve_loopback(state: Arc<AppState>) -> DaemonClientConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        DaemonClientConfig {
            connection_mode: ConnectionMode::Http,
            daemon_host: "127.0.0.1".to_string(),
            daemon_port: port,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        statuses: Vec<TunnelStatus>,
        connected: Option<String>,
    }

    impl ConnectEventHandler for RecordingHandler {
        fn on_status(&mut self, status: TunnelStatus, _server: Option<&Server>) {
            self.statuses.push(status);
        }

        fn on_connected(&mut self, server: Option<&Server>) {
            self.connected = server.map(|s| s.id.clone());
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&Error::NoSubscription).0, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(error_status(&Error::DevicesLimitReached).0, StatusCode::FORBIDDEN);
        assert_eq!(
            error_status(&Error::ServerNotFound("XX".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(error_status(&Error::NotLoggedIn).0, StatusCode::UNAUTHORIZED);
        assert_eq!(error_status(&Error::InvalidCredentials).0, StatusCode::UNAUTHORIZED);
        assert_eq!(error_status(&Error::InvalidInput("x".into())).0, StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&Error::Cancelled).0, StatusCode::CONFLICT);
        assert_eq!(error_status(&Error::Remote("x".into())).0, StatusCode::BAD_GATEWAY);
        assert_eq!(
            error_status(&Error::Config("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (router, _) = test_router();
        let response = router
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status: StatusResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(status.status, TunnelStatus::NotRunning);
        assert!(status.server.is_none());
    }

    #[tokio::test]
    async fn test_connect_endpoint_accepts() {
        let (router, _) = test_router();
        let response = router
            .oneshot(Request::post("/api/connect/DE_01").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_connect_endpoint_maps_errors() {
        let (router, remote) = test_router();

        let response = router
            .clone()
            .oneshot(Request::post("/api/connect/XX_99").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        remote.fail_connect_with(r#"{"reply":{"code":"NO_SUBSCRIPTION","message":"no plan"}}"#);
        let response = router
            .oneshot(Request::post("/api/connect/DE_01").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body_json(response).await["code"], "NO_SUBSCRIPTION");
    }

    #[tokio::test]
    async fn test_login_endpoint_rejects_bad_credentials() {
        let (router, remote) = test_router();
        let request = Request::post("/api/login")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"email":"user@example.com","password":"password123"}"#,
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(remote.logins.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        // With test interval override, we should see a heartbeat well within 1s.
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[tokio::test]
    async fn test_switch_follows_new_server_until_connected() {
        let daemon = test_daemon();
        let manager = daemon.state.manager.clone();
        manager.connect("DE_01").await.unwrap();
        daemon.observer.on_state_change(InterfaceState::Up);
        daemon.log.lock().unwrap().clear();

        let config = serve_loopback(daemon.state.clone()).await;
        let client = create_daemon_client(&config).unwrap();
        let follower = tokio::spawn(async move {
            let mut handler = RecordingHandler::default();
            let result = connect_with_events(&client, &config, "NL_02", &mut handler).await;
            (result, handler)
        });

        // The old tunnel is still up while the switch waits for teardown
        let log = daemon.log.clone();
        wait_until(move || {
            log.lock()
                .unwrap()
                .iter()
                .any(|event| matches!(event, Event::BringDown(_)))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!follower.is_finished());

        daemon.observer.on_state_change(InterfaceState::Down);
        daemon.observer.on_state_change(InterfaceState::Up);

        let (result, handler) = tokio::time::timeout(Duration::from_secs(5), follower)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        assert_eq!(handler.connected.as_deref(), Some("NL_02"));
        assert_eq!(handler.statuses.last(), Some(&TunnelStatus::Connected));
        assert!(events_contain_bring_up(&daemon.log));
    }

    fn events_contain_bring_up(log: &EventLog) -> bool {
        log.lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, Event::BringUp(_)))
    }

    #[test]
    fn test_status_event_payload() {
        let event = StatusEvent::Status {
            status: TunnelStatus::Connecting,
            server: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""status":"connecting""#));
        assert!(dicyvpn_common::sse::parse_data_line(&format!("data: {}", json)).is_some());
    }
}
