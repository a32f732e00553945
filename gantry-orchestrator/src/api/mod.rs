//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain. Everything except
//! the health check lives under `/v1` behind bearer authentication.

pub mod auth;
pub mod error;
pub mod health;
pub mod job;
pub mod node;
pub mod stats;

use axum::{
    Router,
    http::{HeaderName, Method, header},
    middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::registry::NodeRegistry;
use crate::service::{JobService, LifecycleMonitor, LogService};
use auth::IdentityProvider;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub registry: Arc<NodeRegistry>,
    pub logs: Arc<LogService>,
    pub monitor: Arc<LifecycleMonitor>,
    /// Wakes the scheduler after a submission or a node joining
    pub trigger: Arc<Notify>,
    pub identities: Arc<dyn IdentityProvider>,
    /// Flips to `true` when the server starts shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Resolves once shutdown begins, or once nothing is left to signal it.
    /// Long-lived responses end on this so graceful shutdown can drain them.
    pub fn shutting_down(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let mut shutdown = self.shutdown.clone();
        async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let v1 = Router::new()
        // Job endpoints
        .route("/jobs", get(job::list_jobs).post(job::submit_job))
        .route("/jobs/{id}", get(job::get_job))
        .route("/jobs/{id}/cancel", post(job::cancel_job))
        .route("/jobs/{id}/events", get(job::list_job_events))
        .route("/jobs/{id}/report", post(job::report_job))
        .route(
            "/jobs/{id}/logs",
            get(job::get_job_logs).post(job::append_job_logs),
        )
        .route("/events", get(job::event_feed))
        // Node endpoints
        .route("/nodes", get(node::list_nodes))
        .route("/nodes/{id}", delete(node::remove_node))
        .route("/nodes/{id}/heartbeat", post(node::heartbeat))
        // Cluster endpoints
        .route("/stats", get(stats::cluster_stats))
        .route("/whoami", get(auth::whoami))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .nest("/v1", v1)
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([HeaderName::from_static(job::TOTAL_COUNT_HEADER)])
}
