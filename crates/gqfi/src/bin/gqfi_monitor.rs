//! Standalone monitor API server (SPEC_FULL.md §1.5): serves the
//! read-only campaign status/health/events surface over HTTP and
//! WebSocket, exactly as the teacher's `sisctl` binary serves its own
//! API — but this binary owns no campaign state of its own. A
//! `gqfi-campaign` run that wants a live monitor publishes into the same
//! `MonitorState` in-process instead of going through this binary; this
//! is the standalone shell used for the Swagger UI and a bare health
//! check.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gqfi::events::MonitorLayer;
use gqfi::monitor::{create_router, CampaignStatus, MonitorState};

/// Serve the read-only monitor API.
#[derive(Parser, Debug)]
#[command(name = "gqfi-monitor")]
struct Args {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, default_value = "127.0.0.1:8871")]
    bind: SocketAddr,

    /// Target name reported by the initial (empty) campaign status.
    #[arg(long, default_value = "none")]
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = MonitorState::new(CampaignStatus::new(args.target, 0));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(MonitorLayer::new(state.events.clone()))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting gqfi monitor API");
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("gqfi-monitor listening on http://{}", args.bind);
    info!("WebSocket events: ws://{}/events", args.bind);
    info!("Swagger UI: http://{}/swagger-ui", args.bind);

    axum::serve(listener, app).await?;
    Ok(())
}
