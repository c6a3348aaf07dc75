//! HTTP server: routes, shared state and lifecycle.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Request, State,
    },
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::AccessGate;
use crate::config::ProxyConfig;
use crate::rewrite::HtmlRewriter;
use crate::upstream::UpstreamPool;
use crate::{http_relay, ws_relay};

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub gate: AccessGate,
    pub pool: Arc<UpstreamPool>,
    pub rewriter: Arc<HtmlRewriter>,
    pub config: Arc<ProxyConfig>,
}

/// The proxy's HTTP server
pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(config: ProxyConfig, gate: AccessGate) -> anyhow::Result<Self> {
        let rewriter = HtmlRewriter::new()?;
        Ok(Self {
            state: AppState {
                gate,
                pool: Arc::new(UpstreamPool::new(config.upstream.clone())),
                rewriter: Arc::new(rewriter),
                config: Arc::new(config),
            },
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Create router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/instances/:instance_id/ui", any(ui_handler))
            .route("/api/instances/:instance_id/ui/", any(ui_handler))
            .route("/api/instances/:instance_id/ui/*path", any(ui_handler))
            .layer(cors_layer(&self.state.config.cors_origins));

        let router = if self.state.config.request_logging {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        };

        router.with_state(self.state.clone())
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.state.config.listen).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves, then
    /// close the upstream client pool.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("UI proxy listening on http://{}", listener.local_addr()?);

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        self.state.pool.close();
        info!("UI proxy stopped");
        result.map_err(Into::into)
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(list)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "uiproxy",
        "version": uiproxy_common::VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct UiParams {
    instance_id: String,
}

/// Every method on the UI prefix. WebSocket upgrades go to the WebSocket
/// relay, everything else to the HTTP relay.
async fn ui_handler(
    State(state): State<AppState>,
    Path(params): Path<UiParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    req: Request,
) -> Response {
    if let Ok(ws) = ws {
        let uri = req.uri().clone();
        let headers = req.headers().clone();
        return ws_relay::handle(state, params.instance_id, ws, uri, headers).await;
    }

    let instance_id = params.instance_id;
    match http_relay::relay(state, instance_id.clone(), req).await {
        Ok(response) => response,
        Err(e) => {
            if e.status().is_server_error() {
                warn!(instance_id = %instance_id, status = e.status().as_u16(), "UI proxy request failed: {}", e);
            }
            e.into_response()
        }
    }
}
