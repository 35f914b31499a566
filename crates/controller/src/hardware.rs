//! Valve, status LED and push-button pins. The `gpio` feature gates the real
//! rppal driver; without it, a mock board logs level changes instead.

use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
#[cfg(feature = "gpio")]
use std::sync::Mutex;
#[cfg(not(feature = "gpio"))]
use tracing::info;

/// Drives the valve output and the indicator LED. Both always move together.
pub trait ActuatorPort: Send {
    fn set_outputs(&mut self, on: bool);
}

/// Samples the manual push-button.
pub trait ButtonInput: Send + Sync {
    fn is_pressed(&self) -> bool;
}

/// Electrical level for a logical on/off, honouring relay polarity.
pub(crate) fn output_high(on: bool, active_low: bool) -> bool {
    on != active_low
}

// ---------------------------------------------------------------------------
// Real GPIO (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    valve: OutputPin,
    led: OutputPin,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(valve_pin: u8, led_pin: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let valve = gpio
            .get(valve_pin)
            .with_context(|| format!("failed to claim valve gpio {valve_pin}"))?
            .into_output();
        let led = gpio
            .get(led_pin)
            .with_context(|| format!("failed to claim led gpio {led_pin}"))?
            .into_output();

        let mut board = Self {
            valve,
            led,
            active_low,
        };
        // Fail-safe: ensure "OFF" at startup
        board.set_outputs(false);
        tracing::info!(valve_pin, led_pin, active_low, "valve board initialised");
        Ok(board)
    }
}

#[cfg(feature = "gpio")]
impl ActuatorPort for ValveBoard {
    fn set_outputs(&mut self, on: bool) {
        // The LED mirrors the logical state; only the relay is polarity-aware.
        if output_high(on, self.active_low) {
            self.valve.set_high();
        } else {
            self.valve.set_low();
        }
        if on {
            self.led.set_high();
        } else {
            self.led.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
pub(crate) struct ButtonPin {
    pin: Mutex<InputPin>,
}

#[cfg(feature = "gpio")]
impl ButtonPin {
    /// Claim the button pin with its pull-up and forward every falling edge
    /// into `edges`. The interrupt callback does nothing else.
    pub(crate) fn new(pin_num: u8, edges: UnboundedSender<Instant>) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let mut pin = gpio
            .get(pin_num)
            .with_context(|| format!("failed to claim button gpio {pin_num}"))?
            .into_input_pullup();
        pin.set_async_interrupt(Trigger::FallingEdge, move |_level| {
            let _ = edges.send(Instant::now());
        })
        .with_context(|| format!("failed to register interrupt on gpio {pin_num}"))?;

        tracing::info!(pin = pin_num, "button interrupt registered");
        Ok(Self {
            pin: Mutex::new(pin),
        })
    }
}

#[cfg(feature = "gpio")]
impl ButtonInput for ButtonPin {
    fn is_pressed(&self) -> bool {
        // Pulled up: pressed reads LOW.
        self.pin.lock().map(|p| p.is_low()).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Mock board (development — no hardware, logs state)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    pub(super) valve_pin: u8,
    pub(super) led_pin: u8,
    pub(super) active_low: bool,
    pub(super) on: bool,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(valve_pin: u8, led_pin: u8, active_low: bool) -> Result<Self> {
        info!(
            valve_pin,
            led_pin, active_low, "[mock-gpio] valve board initialised (no hardware)"
        );
        Ok(Self {
            valve_pin,
            led_pin,
            active_low,
            on: false,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuatorPort for ValveBoard {
    fn set_outputs(&mut self, on: bool) {
        self.on = on;
        info!(
            valve_pin = self.valve_pin,
            led_pin = self.led_pin,
            high = output_high(on, self.active_low),
            "[mock-gpio] valve {}",
            if on { "ON" } else { "OFF" }
        );
    }
}

#[cfg(not(feature = "gpio"))]
pub(crate) struct ButtonPin {
    // Held so the edge channel stays open for the watcher.
    _edges: UnboundedSender<Instant>,
}

#[cfg(not(feature = "gpio"))]
impl ButtonPin {
    pub(crate) fn new(pin_num: u8, edges: UnboundedSender<Instant>) -> Result<Self> {
        info!(pin = pin_num, "[mock-gpio] button registered (never pressed)");
        Ok(Self { _edges: edges })
    }
}

#[cfg(not(feature = "gpio"))]
impl ButtonInput for ButtonPin {
    fn is_pressed(&self) -> bool {
        false
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_high_relay_follows_state() {
        assert!(output_high(true, false));
        assert!(!output_high(false, false));
    }

    #[test]
    fn active_low_relay_inverts_state() {
        assert!(!output_high(true, true));
        assert!(output_high(false, true));
    }

    #[cfg(not(feature = "gpio"))]
    mod mock {
        use super::super::*;
        use tokio::sync::mpsc;

        #[test]
        fn valve_board_starts_off() {
            let board = ValveBoard::new(17, 27, false).unwrap();
            assert!(!board.on);
            assert_eq!(board.valve_pin, 17);
            assert_eq!(board.led_pin, 27);
        }

        #[test]
        fn valve_board_tracks_outputs() {
            let mut board = ValveBoard::new(17, 27, true).unwrap();
            board.set_outputs(true);
            assert!(board.on);
            board.set_outputs(false);
            assert!(!board.on);
        }

        #[test]
        fn mock_button_is_never_pressed() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let button = ButtonPin::new(22, tx).unwrap();
            assert!(!button.is_pressed());
        }

        #[tokio::test]
        async fn mock_button_keeps_edge_channel_open() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let _button = ButtonPin::new(22, tx).unwrap();
            assert!(matches!(
                rx.try_recv(),
                Err(mpsc::error::TryRecvError::Empty)
            ));
        }
    }
}
