use crate::terminator::Terminator;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

/// Header carrying the caller's copy of the shared secret.
pub const SECRET_HEADER: &str = "x-secret-key";

const INDEX_HTML: &str = include_str!("../static/index.html");

struct AppState<T> {
    secret: Arc<str>,
    terminator: Arc<T>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            secret: Arc::clone(&self.secret),
            terminator: Arc::clone(&self.terminator),
        }
    }
}

/// Build the gateway: `GET /` serves the page, `POST /terminate` runs the
/// termination. Every other path or method gets a plain 404.
pub fn router<T: Terminator>(terminator: Arc<T>, secret: &str) -> Router {
    let state = AppState {
        secret: Arc::from(secret),
        terminator,
    };

    Router::new()
        .route("/", get(index).fallback(not_found))
        .route("/terminate", post(terminate::<T>).fallback(not_found))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until `shutdown` resolves, then drain in-flight requests.
///
/// Draining stops after `drain_timeout`; a request still running then (a hung
/// termination command, say) is abandoned so the session can be released.
pub async fn run(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    drain_timeout: Duration,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("listening on http://{local_addr}");

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let shutdown = async move {
        shutdown.await;
        let _ = signalled_tx.send(());
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future();

    let drain_deadline = async move {
        match signalled_rx.await {
            Ok(()) => tokio::time::sleep(drain_timeout).await,
            // The server ended on its own; let its result through.
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        served = server => served,
        _ = drain_deadline => {
            tracing::warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "in-flight requests still running after shutdown, abandoning them"
            );
            Ok(())
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

async fn terminate<T: Terminator>(State(state): State<AppState<T>>, headers: HeaderMap) -> Response {
    // A missing or non-UTF-8 header is just a wrong key.
    let supplied = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if supplied != Some(&*state.secret) {
        tracing::warn!("rejected terminate request: invalid secret key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "error": "Invalid secret key"})),
        )
            .into_response();
    }

    match state.terminator.terminate_non_essential_connections().await {
        Ok(result) => {
            tracing::info!(backends = result.len(), "terminated non-essential connections");
            Json(serde_json::json!({
                "success": true,
                "message": "Connections terminated successfully",
                "result": result,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "termination command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.message()})),
            )
                .into_response()
        }
    }
}
