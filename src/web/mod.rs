//! Control-panel HTTP server
//!
//! JSON API over the store, reconciler, tracker, and log buffer. Listener
//! errors are logged, never fatal: the router keeps routing with or without
//! its panel.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::logbuf::LogBuffer;
use crate::reconcile::Reconciler;
use crate::rules::DomainMatcher;
use crate::store::Store;
use crate::tracker::Tracker;

/// Shared state behind every handler
pub struct AppState {
    pub store: Arc<Store>,
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<Tracker>,
    pub matcher: Arc<DomainMatcher>,
    pub logbuf: Arc<LogBuffer>,
    pub cancel: CancellationToken,
}

impl AppState {
    /// Apply bundle changes in the background after a store mutation has
    /// been answered.
    pub fn trigger_mutation(&self) {
        let reconciler = Arc::clone(&self.reconciler);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.apply_mutation(&cancel).await {
                error!(error = %e, "apply mutation failed");
            }
        });
    }
}

/// Build the API router
#[must_use]
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/logs", get(handlers::logs))
        .route(
            "/api/bundles",
            get(handlers::list_bundles).post(handlers::create_bundle),
        )
        .route(
            "/api/bundles/:name",
            get(handlers::get_bundle).delete(handlers::delete_bundle),
        )
        .route("/api/bundles/:name/enable", put(handlers::enable_bundle))
        .route("/api/bundles/:name/disable", put(handlers::disable_bundle))
        .route("/api/bundles/:name/selectors", post(handlers::add_selector))
        .route(
            "/api/bundles/:name/selectors/remove",
            post(handlers::remove_selector),
        )
        .route("/api/export", get(handlers::export))
        .route("/api/import", post(handlers::import))
        .route("/api/apply", post(handlers::apply))
        .with_state(state)
}

/// Bind and serve the panel until cancellation.
///
/// Bind and serve errors are logged; the caller is never aborted by them.
pub async fn serve(listen: SocketAddr, state: Arc<AppState>, cancel: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %listen, error = %e, "control panel failed to bind");
            return;
        }
    };

    info!(addr = %listen, "control panel listening");
    let app = create_router(state);
    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "control panel server error");
    }
}
