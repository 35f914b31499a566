//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;

use crate::hardware::{ActuatorPort, ButtonInput};
use crate::mqtt::PublishPort;
use crate::status::{SharedStatus, StatusBoard};
use crate::timer::TimerService;
use crate::valve::{ValveController, VALVE_STATE_CHANNEL};

#[derive(Default)]
pub(crate) struct RecordingPublisher {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingPublisher {
    pub(crate) fn payloads(&self, channel: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl PublishPort for RecordingPublisher {
    fn publish(&self, channel: &str, payload: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
    }
}

pub(crate) struct RecordingActuator {
    levels: Arc<Mutex<Vec<bool>>>,
}

impl ActuatorPort for RecordingActuator {
    fn set_outputs(&mut self, on: bool) {
        self.levels.lock().unwrap().push(on);
    }
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedButton {
    pressed: Arc<AtomicBool>,
}

impl ScriptedButton {
    pub(crate) fn set_pressed(&self, pressed: bool) {
        self.pressed.store(pressed, Ordering::SeqCst);
    }
}

impl ButtonInput for ScriptedButton {
    fn is_pressed(&self) -> bool {
        self.pressed.load(Ordering::SeqCst)
    }
}

/// A valve controller wired to recording doubles on the current runtime.
pub(crate) struct ValveFixture {
    pub(crate) valve: ValveController,
    pub(crate) publisher: Arc<RecordingPublisher>,
    pub(crate) status: SharedStatus,
    levels: Arc<Mutex<Vec<bool>>>,
}

impl ValveFixture {
    pub(crate) fn new() -> Self {
        let levels = Arc::new(Mutex::new(Vec::new()));
        let publisher = Arc::new(RecordingPublisher::default());
        let status = StatusBoard::shared();
        let valve = ValveController::new(
            Box::new(RecordingActuator {
                levels: Arc::clone(&levels),
            }),
            publisher.clone(),
            TimerService::new(Handle::current()),
            Arc::clone(&status),
        );
        Self {
            valve,
            publisher,
            status,
            levels,
        }
    }

    pub(crate) fn levels(&self) -> Vec<bool> {
        self.levels.lock().unwrap().clone()
    }

    /// Payloads published on the valve state channel, oldest first.
    pub(crate) fn published(&self) -> Vec<String> {
        self.publisher.payloads(VALVE_STATE_CHANNEL)
    }
}
