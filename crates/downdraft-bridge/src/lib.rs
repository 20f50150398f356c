//! Loopback enqueue bridge
//!
//! A small HTTP listener that lets companion processes (the browser
//! extension's native host, helper scripts) hand URLs to the engine.
//! Binds 127.0.0.1 only.
//!
//! - `GET /api/health` — liveness probe, answers while the app is running
//! - `POST /api/enqueue` — submit a URL; forwarded into an mpsc channel
//!
//! The bridge never touches engine internals: everything it accepts becomes
//! an [`EnqueueRequest`] for the host application to service.

use axum::{
    extract::State,
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use downdraft_types::is_downloadable_url;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};

/// A URL handed in from outside, with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub url: String,
    /// Free-form origin tag, e.g. "extension" or "cli"
    pub source: String,
}

/// Body accepted by `POST /api/enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueuePayload {
    pub url: String,
    pub source: Option<String>,
}

/// Response for both endpoints' control paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub error: Option<String>,
}

/// Response for the liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Build the bridge router around a channel to the host application.
pub fn router(queue_tx: mpsc::Sender<EnqueueRequest>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/enqueue", post(handle_enqueue))
        .layer(cors)
        .with_state(queue_tx)
}

/// The loopback listener.
pub struct BridgeServer {
    port: u16,
    queue_tx: mpsc::Sender<EnqueueRequest>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl BridgeServer {
    pub fn new(port: u16, queue_tx: mpsc::Sender<EnqueueRequest>) -> Self {
        Self {
            port,
            queue_tx,
            shutdown_tx: None,
        }
    }

    /// Bind and serve until [`stop`](Self::stop) is called.
    pub async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let app = router(self.queue_tx.clone());
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        tracing::info!("enqueue bridge listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        let mut shutdown_rx = shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    pub fn stop(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(());
        }
    }
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_enqueue(
    State(queue_tx): State<mpsc::Sender<EnqueueRequest>>,
    Json(payload): Json<EnqueuePayload>,
) -> Json<EnqueueResponse> {
    if !is_downloadable_url(&payload.url) {
        return Json(EnqueueResponse {
            success: false,
            error: Some("Invalid URL".to_string()),
        });
    }

    let request = EnqueueRequest {
        url: payload.url,
        source: payload.source.unwrap_or_else(|| "unknown".to_string()),
    };

    tracing::info!("enqueue from {}: {}", request.source, request.url);

    match queue_tx.send(request).await {
        Ok(()) => Json(EnqueueResponse {
            success: true,
            error: None,
        }),
        Err(_) => Json(EnqueueResponse {
            success: false,
            error: Some("Engine is not accepting downloads".to_string()),
        }),
    }
}
