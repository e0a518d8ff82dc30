//! Structured events broadcast to the optional monitor API.
//!
//! Mirrors the teacher's `QemuEvent` shape: a serde-tagged enum streamed
//! over a [`tokio::sync::broadcast`] channel, consumed by the WebSocket
//! handler in `monitor::ws` and by nothing else in the core pipeline.

use serde::Serialize;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::inject::Outcome;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum CampaignEvent {
    ShardStarted {
        target: String,
        shard_id: u32,
        resume_from: u64,
    },
    RecordAppended {
        target: String,
        shard_id: u32,
        addr: u64,
        bit: u8,
        time: u64,
        outcome: Outcome,
    },
    ShardFinished {
        target: String,
        shard_id: u32,
        total_records: u64,
    },
    LogLine {
        level: String,
        message: String,
        ts_millis: i64,
    },
}

/// Default broadcast channel capacity; matches the teacher's event bus
/// sizing (clients that fall behind see a `Lagged` count, not a stall).
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A [`tracing_subscriber::Layer`] that re-broadcasts every log record as a
/// [`CampaignEvent::LogLine`] over the monitor API's broadcast channel,
/// generalized from the teacher's `WebSocketLayer`. Shard/campaign/analyze
/// progress still goes over [`crate::monitor::MonitorState::publish`]
/// directly as the more specific `ShardStarted`/`RecordAppended`/
/// `ShardFinished` variants; this layer only covers plain log lines so a
/// monitor client sees everything `tracing` emits, not just progress.
pub struct MonitorLayer {
    sender: tokio::sync::broadcast::Sender<CampaignEvent>,
}

impl MonitorLayer {
    pub fn new(sender: tokio::sync::broadcast::Sender<CampaignEvent>) -> Self {
        Self { sender }
    }
}

impl<S: Subscriber> Layer<S> for MonitorLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "debug",
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(message) = visitor.message {
            let _ = self.sender.send(CampaignEvent::LogLine {
                level: level.to_string(),
                message,
                ts_millis: chrono::Utc::now().timestamp_millis(),
            });
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}
