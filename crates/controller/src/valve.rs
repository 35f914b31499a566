//! Valve state machine: the sole writer of actuator state and the sole owner
//! of the auto-close timer.
//!
//! Every transition runs under one lock, in a fixed order:
//!
//! ```text
//! cancel pending close ─▶ mutate state ─▶ write outputs ─▶ publish ─▶ (schedule close)
//! ```
//!
//! There is no idempotence short-circuit: re-opening an open valve publishes
//! again and restarts its auto-close window.
//!
//! `shutdown` latches: once it has run, opens, toggles, and timer expiries
//! are ignored, so the valve stays closed while the process winds down.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::hardware::ActuatorPort;
use crate::mqtt::PublishPort;
use crate::status::SharedStatus;
use crate::timer::{TimerHandle, TimerService};

/// Outbound channel carrying `on`/`off` after every transition.
pub const VALVE_STATE_CHANNEL: &str = "valve_state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValveState {
    pub is_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValveSnapshot {
    pub is_open: bool,
    pub auto_close_pending: bool,
}

struct PendingClose {
    generation: u64,
    handle: TimerHandle,
}

struct ValveInner {
    state: ValveState,
    pending: Option<PendingClose>,
    generation: u64,
    shut_down: bool,
    actuator: Box<dyn ActuatorPort>,
}

impl ValveInner {
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.handle.cancel();
            debug!(
                generation = pending.generation,
                already_fired = pending.handle.is_finished(),
                "auto-close cancelled"
            );
        }
    }
}

#[derive(Clone)]
pub struct ValveController {
    inner: Arc<Mutex<ValveInner>>,
    publisher: Arc<dyn PublishPort>,
    timers: TimerService,
    status: SharedStatus,
}

impl ValveController {
    pub fn new(
        actuator: Box<dyn ActuatorPort>,
        publisher: Arc<dyn PublishPort>,
        timers: TimerService,
        status: SharedStatus,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ValveInner {
                state: ValveState::default(),
                pending: None,
                generation: 0,
                shut_down: false,
                actuator,
            })),
            publisher,
            timers,
            status,
        }
    }

    /// Open the valve. A non-zero duration schedules an auto-close that many
    /// seconds from now; zero leaves the valve open until told otherwise.
    pub async fn open(&self, duration_secs: u64) {
        let mut inner = self.inner.lock().await;
        self.open_locked(&mut inner, duration_secs).await;
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.cancel_pending();
        self.apply(&mut inner, false, None).await;
    }

    /// Close if open, otherwise open with no auto-close.
    pub async fn toggle(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            debug!("valve shut down, ignoring toggle");
            return;
        }
        if inner.state.is_open {
            inner.cancel_pending();
            self.apply(&mut inner, false, None).await;
        } else {
            self.open_locked(&mut inner, 0).await;
        }
    }

    /// Cancel any pending close and force the outputs off.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shut_down = true;
        inner.cancel_pending();
        info!("forcing valve closed for shutdown");
        self.apply(&mut inner, false, None).await;
    }

    pub async fn snapshot(&self) -> ValveSnapshot {
        let inner = self.inner.lock().await;
        ValveSnapshot {
            is_open: inner.state.is_open,
            auto_close_pending: inner.pending.is_some(),
        }
    }

    async fn open_locked(&self, inner: &mut ValveInner, duration_secs: u64) {
        if inner.shut_down {
            debug!(duration_secs, "valve shut down, ignoring open");
            return;
        }
        inner.cancel_pending();
        let auto_close = (duration_secs > 0).then_some(duration_secs);
        self.apply(inner, true, auto_close).await;

        if let Some(secs) = auto_close {
            inner.generation = inner.generation.wrapping_add(1);
            let generation = inner.generation;
            let this = self.clone();
            let handle = self
                .timers
                .schedule(Duration::from_secs(secs), async move {
                    this.expire(generation).await;
                });
            inner.pending = Some(PendingClose { generation, handle });
            debug!(generation, secs, "auto-close scheduled");
        }
    }

    /// Timer entry point. Only the generation that is still pending may close
    /// the valve; anything else lost a race with a newer transition.
    async fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            debug!(generation, "valve shut down, ignoring auto-close");
            return;
        }
        match &inner.pending {
            Some(pending) if pending.generation == generation => {}
            _ => {
                debug!(generation, "stale auto-close ignored");
                return;
            }
        }
        // This task is the timer; drop its handle rather than abort itself.
        inner.pending = None;

        info!(generation, "auto-close timer expired");
        self.status
            .write()
            .await
            .record_timer("auto-close timer expired".to_string());
        self.apply(&mut inner, false, None).await;
    }

    async fn apply(&self, inner: &mut ValveInner, on: bool, auto_close_secs: Option<u64>) {
        inner.state.is_open = on;
        inner.actuator.set_outputs(on);
        self.publisher
            .publish(VALVE_STATE_CHANNEL, if on { "on" } else { "off" });

        match auto_close_secs {
            Some(secs) => info!(auto_close_secs = secs, "valve ON"),
            None => info!("valve {}", if on { "ON" } else { "OFF" }),
        }
        self.status.write().await.record_valve(on, auto_close_secs);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
