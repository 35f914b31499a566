//! Observable event journal shared by the core and the HTTP status page.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedStatus = Arc<RwLock<StatusBoard>>;

pub struct StatusBoard {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub events: VecDeque<StatusEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    Config,
    Button,
    Timer,
    Error,
    System,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedStatus {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a valve transition.
    pub fn record_valve(&mut self, on: bool, auto_close_secs: Option<u64>) {
        let detail = match (on, auto_close_secs) {
            (true, Some(secs)) => format!("valve on (auto-close in {secs}s)"),
            (true, None) => "valve on".to_string(),
            (false, _) => "valve off".to_string(),
        };
        self.push_event(EventKind::Valve, detail);
    }

    /// Record an accepted configuration update.
    pub fn record_config(&mut self, detail: String) {
        self.push_event(EventKind::Config, detail);
    }

    pub fn record_button(&mut self, detail: String) {
        self.push_event(EventKind::Button, detail);
    }

    pub fn record_timer(&mut self, detail: String) {
        self.push_event(EventKind::Timer, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Update the connection flag, journaling only actual changes.
    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected == connected {
            return;
        }
        self.mqtt_connected = connected;
        let detail = if connected {
            "mqtt connected"
        } else {
            "mqtt disconnected"
        };
        self.push_event(EventKind::System, detail.to_string());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Events, newest first.
    pub fn recent(&self) -> Vec<StatusEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(StatusEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
