//! Threshold policy: decides, after every configuration change, whether the
//! valve should open, close, or be left alone.
//!
//! The configuration lock is held across mutate → evaluate → act, so a
//! decision never sees a torn snapshot and two updates cannot interleave
//! their valve commands. Lock order is always config, then valve.

use serde::Serialize;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::status::SharedStatus;
use crate::valve::ValveController;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerConfig {
    pub moisture_level: i64,
    pub moisture_threshold: i64,
    pub manual_mode: bool,
    pub manual_open_command: bool,
    pub open_duration_minutes: i64,
    pub open_duration_seconds: i64,
}

impl ControllerConfig {
    /// Total auto-close window. Non-positive totals mean "no auto-close".
    pub fn open_duration_secs(&self) -> u64 {
        let total = self
            .open_duration_minutes
            .saturating_mul(60)
            .saturating_add(self.open_duration_seconds);
        u64::try_from(total).unwrap_or(0)
    }
}

/// A single field mutation decoded from an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    MoistureLevel(i64),
    MoistureThreshold(i64),
    ManualMode(bool),
    OpenValve(bool),
    OpenTimeMinutes(i64),
    OpenTimeSeconds(i64),
}

impl ConfigUpdate {
    pub fn apply_to(self, cfg: &mut ControllerConfig) {
        match self {
            Self::MoistureLevel(v) => cfg.moisture_level = v,
            Self::MoistureThreshold(v) => cfg.moisture_threshold = v,
            Self::ManualMode(v) => cfg.manual_mode = v,
            Self::OpenValve(v) => cfg.manual_open_command = v,
            Self::OpenTimeMinutes(v) => cfg.open_duration_minutes = v,
            Self::OpenTimeSeconds(v) => cfg.open_duration_seconds = v,
        }
    }
}

impl fmt::Display for ConfigUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MoistureLevel(v) => write!(f, "moisture_level={v}"),
            Self::MoistureThreshold(v) => write!(f, "moisture_threshold={v}"),
            Self::ManualMode(v) => write!(f, "manual_mode={v}"),
            Self::OpenValve(v) => write!(f, "open_valve={v}"),
            Self::OpenTimeMinutes(v) => write!(f, "valve_open_time_m={v}"),
            Self::OpenTimeSeconds(v) => write!(f, "valve_open_time_s={v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Open { duration_secs: u64 },
    Close,
    /// Automatic mode with adequate moisture. A running cycle is left on its
    /// existing timer; the valve is never closed early here.
    Hold,
}

pub fn decide(cfg: &ControllerConfig) -> Decision {
    match (cfg.manual_mode, cfg.manual_open_command) {
        (false, _) if cfg.moisture_level < cfg.moisture_threshold => Decision::Open {
            duration_secs: cfg.open_duration_secs(),
        },
        (false, _) => Decision::Hold,
        (true, true) => Decision::Open { duration_secs: 0 },
        (true, false) => Decision::Close,
    }
}

pub struct PolicyEvaluator {
    config: Mutex<ControllerConfig>,
    valve: ValveController,
    status: SharedStatus,
}

impl PolicyEvaluator {
    pub fn new(initial: ControllerConfig, valve: ValveController, status: SharedStatus) -> Self {
        Self {
            config: Mutex::new(initial),
            valve,
            status,
        }
    }

    /// Apply one field mutation and re-evaluate the whole snapshot.
    pub async fn apply(&self, update: ConfigUpdate) -> Decision {
        let mut cfg = self.config.lock().await;
        update.apply_to(&mut cfg);
        debug!(%update, "config updated");
        self.status.write().await.record_config(update.to_string());
        self.evaluate_locked(&cfg).await
    }

    /// Re-evaluate the current snapshot without changing it.
    pub async fn on_config_changed(&self) -> Decision {
        let cfg = self.config.lock().await;
        self.evaluate_locked(&cfg).await
    }

    pub async fn snapshot(&self) -> ControllerConfig {
        *self.config.lock().await
    }

    async fn evaluate_locked(&self, cfg: &ControllerConfig) -> Decision {
        let decision = decide(cfg);
        match decision {
            Decision::Open { duration_secs } if !cfg.manual_mode => {
                info!(
                    moisture = cfg.moisture_level,
                    threshold = cfg.moisture_threshold,
                    duration_secs,
                    "moisture below threshold, opening valve"
                );
                self.valve.open(duration_secs).await;
            }
            Decision::Open { duration_secs } => {
                info!("manual mode, opening valve");
                self.valve.open(duration_secs).await;
            }
            Decision::Close => {
                info!("manual mode, closing valve");
                self.valve.close().await;
            }
            Decision::Hold => {
                debug!(
                    moisture = cfg.moisture_level,
                    threshold = cfg.moisture_threshold,
                    "no action"
                );
            }
        }
        decision
    }
}

// ===========================================================================
// Tests
// ===========================================================================
