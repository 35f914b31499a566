//! Push-button watcher: turns raw falling edges into valve toggles.
//!
//! ```text
//! Idle ──[edge outside lockout]──▶ Debouncing ──[settled, pressed]──▶ toggle ─▶ Idle
//!                                       └──────[settled, released]──▶ noise ──▶ Idle
//! ```
//!
//! The interrupt side only produces timestamps; all decisions happen here,
//! and the toggle goes through the same locked entry point as every other
//! transition.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::hardware::ButtonInput;
use crate::status::SharedStatus;
use crate::valve::ValveController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Delay before re-sampling the pin after an edge.
    pub settle: Duration,
    /// Edges closer than this to the last accepted edge are dropped outright.
    pub lockout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    Pressed,
    Noise,
    Suppressed,
}

pub struct ButtonWatcher<B> {
    input: B,
    valve: ValveController,
    timing: DebounceConfig,
    status: SharedStatus,
    last_accepted: Option<Instant>,
}

impl<B: ButtonInput> ButtonWatcher<B> {
    pub fn new(
        input: B,
        valve: ValveController,
        timing: DebounceConfig,
        status: SharedStatus,
    ) -> Self {
        Self {
            input,
            valve,
            timing,
            status,
            last_accepted: None,
        }
    }

    /// Consume edges until the sender side goes away.
    pub async fn run(mut self, mut edges: UnboundedReceiver<Instant>) {
        info!(
            settle_ms = self.timing.settle.as_millis() as u64,
            lockout_ms = self.timing.lockout.as_millis() as u64,
            "button watcher started"
        );
        while let Some(at) = edges.recv().await {
            self.on_edge(at).await;
        }
        info!("button edge channel closed, watcher stopping");
    }

    pub async fn on_edge(&mut self, at: Instant) -> EdgeOutcome {
        if let Some(prev) = self.last_accepted {
            if at.saturating_duration_since(prev) < self.timing.lockout {
                debug!("edge inside lockout window dropped");
                return EdgeOutcome::Suppressed;
            }
        }
        self.last_accepted = Some(at);

        // Debouncing: the edge only counts if the pin is still held after
        // the settle delay.
        tokio::time::sleep(self.timing.settle).await;
        let pressed = self.input.is_pressed();

        if pressed {
            info!("button pressed, toggling valve");
            self.status
                .write()
                .await
                .record_button("button pressed".to_string());
            self.valve.toggle().await;
            EdgeOutcome::Pressed
        } else {
            debug!("spurious edge ignored");
            EdgeOutcome::Noise
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
