//! REST handlers for the monitor API.
//!
//! Scoped to what an operator watching a running campaign needs: overall
//! progress, per-shard detail, and a liveness probe. None of the teacher's
//! AI-ops surface (autonomy, graph, drift, orchestrator, ...) applies here.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::{CampaignStatus, MonitorState};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness probe.
#[utoipa::path(get, path = "/api/v1/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ShardStatusResponse {
    pub shard_id: u32,
    pub experiment_count: u64,
    pub records_written: u64,
    pub finished: bool,
}

/// Overall campaign progress: target name and aggregate record counts.
#[utoipa::path(get, path = "/api/v1/campaign/status", responses((status = 200, body = CampaignStatus)))]
pub async fn campaign_status(State(state): State<MonitorState>) -> Json<CampaignStatus> {
    Json(state.status.read().await.clone())
}

/// Per-shard detail for the running campaign.
#[utoipa::path(get, path = "/api/v1/campaign/shards", responses((status = 200, body = [ShardStatusResponse])))]
pub async fn campaign_shards(State(state): State<MonitorState>) -> Json<Vec<ShardStatusResponse>> {
    let status = state.status.read().await;
    Json(
        status
            .shards
            .iter()
            .map(|s| ShardStatusResponse {
                shard_id: s.shard_id,
                experiment_count: s.experiment_count,
                records_written: s.records_written,
                finished: s.records_written >= s.experiment_count,
            })
            .collect(),
    )
}
