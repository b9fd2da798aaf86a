//! C6: a single WebSocket listener (on `web_port + 1`) broadcasting logs,
//! status snapshots, and switcher passthrough traffic to subscribers,
//! replaying a bounded ring buffer of recent log lines on connect.

use std::collections::VecDeque;
use std::sync::Arc;

use std::sync::Mutex;

use matchbox_protocol::config::LOG_RING_CAPACITY;
use matchbox_protocol::status::{LogLevel, LogRecord, StatusSnapshot};
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Clone)]
pub struct Bus {
    logs: broadcast::Sender<LogRecord>,
    status: broadcast::Sender<StatusSnapshot>,
    switcher: broadcast::Sender<String>,
    ring: Arc<Mutex<VecDeque<LogRecord>>>,
}

impl Bus {
    pub fn new() -> Self {
        let (logs, _) = broadcast::channel(256);
        let (status, _) = broadcast::channel(32);
        let (switcher, _) = broadcast::channel(256);
        Self {
            logs,
            status,
            switcher,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY))),
        }
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRecord> {
        self.logs.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub fn subscribe_switcher(&self) -> broadcast::Receiver<String> {
        self.switcher.subscribe()
    }

    pub fn replay_logs(&self) -> Vec<LogRecord> {
        self.ring.lock().expect("ring mutex poisoned").iter().cloned().collect()
    }

    pub fn publish_status(&self, snapshot: StatusSnapshot) {
        let _ = self.status.send(snapshot);
    }

    pub fn publish_switcher(&self, raw: String) {
        let _ = self.switcher.send(raw);
    }

    fn publish_log(&self, record: LogRecord) {
        let _ = self.logs.send(record.clone());
        let mut ring = self.ring.lock().expect("ring mutex poisoned");
        if ring.len() >= LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// A `tracing_subscriber::Layer` that republishes every formatted log
/// event through the bus, so `tracing::info!`/`warn!`/`error!` calls feed
/// `/ws/logs` without an explicit bus call at each site.
pub struct BusLayer {
    bus: Bus,
}

impl BusLayer {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        };

        self.bus.publish_log(LogRecord {
            level,
            message,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_log_is_stored_in_ring() {
        let bus = Bus::new();
        bus.publish_log(LogRecord {
            level: LogLevel::Info,
            message: "hello".to_string(),
            timestamp: 0.0,
        });
        let replay = bus.replay_logs();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message, "hello");
    }

    #[tokio::test]
    async fn status_subscriber_receives_published_snapshot() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_status();
        bus.publish_status(StatusSnapshot::default());
        let received = rx.recv().await.unwrap();
        assert_eq!(received, StatusSnapshot::default());
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let bus = Bus::new();
        for i in 0..(LOG_RING_CAPACITY + 10) {
            bus.publish_log(LogRecord {
                level: LogLevel::Info,
                message: format!("line {i}"),
                timestamp: 0.0,
            });
        }
        assert!(bus.replay_logs().len() <= LOG_RING_CAPACITY);
    }
}
