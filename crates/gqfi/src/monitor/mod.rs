//! Monitor API (SPEC_FULL.md §1.5): an optional, read-only observability
//! surface over a running campaign. Generalized from the teacher's
//! `api/routes.rs`/`api/ws.rs`/`api/middleware.rs`, trimmed from roughly
//! seventy AI-ops handlers down to the four endpoints an operator watching
//! a fault-injection run actually needs.

pub mod handlers;
pub mod middleware;
pub mod ws;

use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::middleware as axum_middleware;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tower::limit::ConcurrencyLimitLayer;
use tower::timeout::error::Elapsed;
use tower::timeout::TimeoutLayer;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::events::{CampaignEvent, EVENT_CHANNEL_CAPACITY};

/// A stalled request (e.g. a client that opens `/events` and never reads)
/// must not pin a handler task forever; every plain HTTP route gets a
/// bounded deadline. The WebSocket route is exempt (added after this
/// layer) since a live event stream is expected to outlive it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Caps how many monitor requests are served concurrently, so a runaway
/// polling client can't starve the campaign process of tokio worker time.
const MAX_CONCURRENT_REQUESTS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ShardStatusEntry {
    pub shard_id: u32,
    pub experiment_count: u64,
    pub records_written: u64,
}

/// Shared, continuously-updated snapshot of the running campaign. A
/// campaign driver (not part of this crate's library surface, see
/// SPEC_FULL.md §1.5) updates this through [`MonitorState::status`] as
/// shards report progress; handlers only ever read it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CampaignStatus {
    pub target: String,
    pub total_shards: u32,
    pub shards: Vec<ShardStatusEntry>,
}

impl CampaignStatus {
    pub fn new(target: impl Into<String>, total_shards: u32) -> Self {
        Self {
            target: target.into(),
            total_shards,
            shards: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct MonitorState {
    pub status: Arc<RwLock<CampaignStatus>>,
    pub events: broadcast::Sender<CampaignEvent>,
}

impl MonitorState {
    pub fn new(initial: CampaignStatus) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status: Arc::new(RwLock::new(initial)),
            events,
        }
    }

    pub fn publish(&self, event: CampaignEvent) {
        // No active subscriber is not an error; the campaign runs the same
        // whether or not anyone is watching.
        let _ = self.events.send(event);
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::campaign_status,
        handlers::campaign_shards,
    ),
    components(schemas(
        handlers::HealthResponse,
        handlers::ShardStatusResponse,
        CampaignStatus,
        ShardStatusEntry,
    )),
    tags(
        (name = "health", description = "Liveness probe"),
        (name = "campaign", description = "Campaign and shard progress"),
    ),
    info(
        title = "gqfi monitor API",
        version = "0.1.0",
        description = "Read-only view of a running fault-injection campaign",
    )
)]
pub struct ApiDoc;

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            "request exceeded the monitor API's deadline".to_string(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unhandled monitor API error: {err}"),
        )
    }
}

pub fn create_router(state: MonitorState) -> Router {
    // The REST surface gets a hard per-request deadline; the `/events`
    // WebSocket is mounted outside this layer since a live stream is
    // meant to stay open indefinitely.
    let rest = Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/campaign/status", get(handlers::campaign_status))
        .route("/api/v1/campaign/shards", get(handlers::campaign_shards))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        );

    Router::new()
        .merge(rest)
        .route("/events", get(ws::events_handler))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_status_has_no_shards() {
        let status = CampaignStatus::new("demo_target", 4);
        assert_eq!(status.total_shards, 4);
        assert!(status.shards.is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let state = MonitorState::new(CampaignStatus::new("demo_target", 1));
        state.publish(CampaignEvent::LogLine {
            level: "info".into(),
            message: "hello".into(),
            ts_millis: 0,
        });
    }

    #[tokio::test]
    async fn health_endpoint_responds_through_the_full_layer_stack() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let state = MonitorState::new(CampaignStatus::new("demo_target", 1));
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
