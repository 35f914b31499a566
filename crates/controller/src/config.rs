//! TOML settings file loading, environment overrides, and validation.
//!
//! The file only carries process settings and the initial controller
//! configuration; runtime updates received over MQTT are never written back.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::button::DebounceConfig;
use crate::policy::ControllerConfig;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub gpio: GpioSettings,
    pub timing: TimingSettings,
    pub defaults: DefaultsSettings,
    pub web: WebSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "homeassistant.local".to_string(),
            port: 1883,
            client_id: "irrigation-controller".to_string(),
            topic_prefix: "garden".to_string(),
            keep_alive_secs: 60,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioSettings {
    pub valve_pin: i64,
    pub led_pin: i64,
    pub button_pin: i64,
    pub relay_active_low: bool,
}

impl Default for GpioSettings {
    fn default() -> Self {
        Self {
            valve_pin: 17,
            led_pin: 27,
            button_pin: 22,
            relay_active_low: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub heartbeat_secs: u64,
    pub button_settle_ms: u64,
    pub button_lockout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            button_settle_ms: 30,
            button_lockout_ms: 200,
        }
    }
}

impl TimingSettings {
    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            settle: Duration::from_millis(self.button_settle_ms),
            lockout: Duration::from_millis(self.button_lockout_ms),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Initial controller configuration, in effect until the first message for
/// each field arrives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsSettings {
    pub moisture_level: i64,
    pub moisture_threshold: i64,
    pub manual_mode: bool,
    pub open_valve: bool,
    pub open_time_m: i64,
    pub open_time_s: i64,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            moisture_level: 0,
            moisture_threshold: 0,
            manual_mode: false,
            open_valve: false,
            open_time_m: 0,
            open_time_s: 5,
        }
    }
}

impl DefaultsSettings {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            moisture_level: self.moisture_level,
            moisture_threshold: self.moisture_threshold,
            manual_mode: self.manual_mode,
            manual_open_command: self.open_valve,
            open_duration_minutes: self.open_time_m,
            open_duration_seconds: self.open_time_s,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// rumqttc refuses keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Settings {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD`,
    /// `WEB_PORT` and `RELAY_ACTIVE_LOW`. Unparsable values are ignored with
    /// a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = parse_env(&lookup, "MQTT_PORT") {
            self.mqtt.port = port;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(port) = parse_env(&lookup, "WEB_PORT") {
            self.web.port = port;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.gpio.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_gpio(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_defaults(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if m.topic_prefix.trim().is_empty() {
            errors.push("mqtt.topic_prefix is empty".to_string());
        } else if m.topic_prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt.topic_prefix '{}' must not contain wildcards",
                m.topic_prefix
            ));
        } else if m.topic_prefix.ends_with('/') {
            errors.push(format!(
                "mqtt.topic_prefix '{}' must not end with '/'",
                m.topic_prefix
            ));
        }
        if m.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                m.keep_alive_secs
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".to_string());
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let pins = [
            ("valve_pin", self.gpio.valve_pin),
            ("led_pin", self.gpio.led_pin),
            ("button_pin", self.gpio.button_pin),
        ];

        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("gpio.{name} {pin} is already used by another output"));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        if t.heartbeat_secs == 0 {
            errors.push("timing.heartbeat_secs must be positive".to_string());
        }
        if t.button_settle_ms == 0 {
            errors.push("timing.button_settle_ms must be positive".to_string());
        }
        if t.button_settle_ms >= t.button_lockout_ms {
            errors.push(format!(
                "timing.button_settle_ms ({}) must be shorter than button_lockout_ms ({})",
                t.button_settle_ms, t.button_lockout_ms
            ));
        }
    }

    fn validate_defaults(&self, errors: &mut Vec<String>) {
        let d = &self.defaults;
        if d.open_time_m < 0 {
            errors.push(format!(
                "defaults.open_time_m must not be negative, got {}",
                d.open_time_m
            ));
        }
        if d.open_time_s < 0 {
            errors.push(format!(
                "defaults.open_time_s must not be negative, got {}",
                d.open_time_s
            ));
        }
    }

    /// Pin numbers narrowed for the GPIO driver. Only valid after `validate`.
    pub fn gpio_pins(&self) -> Result<(u8, u8, u8)> {
        let narrow = |name: &str, pin: i64| {
            u8::try_from(pin).with_context(|| format!("gpio.{name} {pin} out of range"))
        };
        Ok((
            narrow("valve_pin", self.gpio.valve_pin)?,
            narrow("led_pin", self.gpio.led_pin)?,
            narrow("button_pin", self.gpio.button_pin)?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML settings file (defaults if it does not exist),
/// apply environment overrides, then validate.
pub fn load(path: &str) -> Result<Settings> {
    load_with_env(path, |key| std::env::var(key).ok())
}

fn load_with_env<F>(path: &str, lookup: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse settings: {path}"))?
    } else {
        info!(path, "no settings file, using defaults");
        Settings::default()
    };

    settings.apply_env(lookup);
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;

    info!(
        host = %settings.mqtt.host,
        port = settings.mqtt.port,
        prefix = %settings.mqtt.topic_prefix,
        "settings loaded"
    );
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(settings: &Settings, needle: &str) {
        let err = settings.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_file_uses_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.mqtt.host, "homeassistant.local");
        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.mqtt.topic_prefix, "garden");
        assert_eq!(settings.gpio.valve_pin, 17);
        assert_eq!(settings.gpio.led_pin, 27);
        assert_eq!(settings.gpio.button_pin, 22);
        assert_eq!(settings.timing.heartbeat_secs, 30);
        assert_eq!(settings.defaults.open_time_s, 5);
        assert!(settings.web.enabled);
        settings.validate().unwrap();
    }

    #[test]
    fn parse_full_file() {
        let toml_str = r#"
[mqtt]
host = "10.0.0.2"
port = 8883
topic_prefix = "yard/bed1"
username = "pi"
password = "secret"

[gpio]
valve_pin = 5
led_pin = 6
button_pin = 13
relay_active_low = true

[timing]
heartbeat_secs = 10
button_settle_ms = 20
button_lockout_ms = 300

[defaults]
moisture_threshold = 40
open_time_m = 2
open_time_s = 0

[web]
enabled = false
"#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.mqtt.host, "10.0.0.2");
        assert_eq!(settings.mqtt.client_id, "irrigation-controller");
        assert_eq!(settings.mqtt.username.as_deref(), Some("pi"));
        assert!(settings.gpio.relay_active_low);
        assert_eq!(settings.gpio_pins().unwrap(), (5, 6, 13));
        assert_eq!(
            settings.timing.debounce(),
            DebounceConfig {
                settle: Duration::from_millis(20),
                lockout: Duration::from_millis(300),
            }
        );
        assert!(!settings.web.enabled);

        let cfg = settings.defaults.controller_config();
        assert_eq!(cfg.moisture_threshold, 40);
        assert_eq!(cfg.open_duration_secs(), 120);
        assert!(!cfg.manual_mode);
    }

    #[test]
    fn example_file_is_valid() {
        let settings: Settings =
            toml::from_str(include_str!("../controller.example.toml")).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.defaults.controller_config().open_duration_secs(), 5);
    }

    #[test]
    fn unknown_field_type_fails_to_parse() {
        assert!(toml::from_str::<Settings>("[gpio]\nvalve_pin = \"seventeen\"").is_err());
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[
            ("MQTT_HOST", "broker"),
            ("MQTT_PORT", "1999"),
            ("MQTT_USERNAME", "user"),
            ("MQTT_PASSWORD", "pass"),
            ("WEB_PORT", "9090"),
            ("RELAY_ACTIVE_LOW", "1"),
        ]));
        assert_eq!(settings.mqtt.host, "broker");
        assert_eq!(settings.mqtt.port, 1999);
        assert_eq!(settings.mqtt.username.as_deref(), Some("user"));
        assert_eq!(settings.mqtt.password.as_deref(), Some("pass"));
        assert_eq!(settings.web.port, 9090);
        assert!(settings.gpio.relay_active_low);
    }

    #[test]
    fn unparsable_env_port_is_ignored() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("MQTT_PORT", "not-a-port")]));
        assert_eq!(settings.mqtt.port, 1883);
    }

    #[test]
    fn missing_env_changes_nothing() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[]));
        assert_eq!(settings.mqtt.host, "homeassistant.local");
        assert!(settings.mqtt.username.is_none());
    }

    // -- Validation: mqtt -------------------------------------------------

    #[test]
    fn empty_prefix_rejected() {
        let mut settings = Settings::default();
        settings.mqtt.topic_prefix = " ".into();
        assert_validation_err(&settings, "topic_prefix is empty");
    }

    #[test]
    fn wildcard_prefix_rejected() {
        let mut settings = Settings::default();
        settings.mqtt.topic_prefix = "garden/#".into();
        assert_validation_err(&settings, "must not contain wildcards");
    }

    #[test]
    fn trailing_slash_prefix_rejected() {
        let mut settings = Settings::default();
        settings.mqtt.topic_prefix = "garden/".into();
        assert_validation_err(&settings, "must not end with '/'");
    }

    #[test]
    fn short_keep_alive_rejected() {
        let mut settings = Settings::default();
        settings.mqtt.keep_alive_secs = 2;
        assert_validation_err(&settings, "keep_alive_secs must be at least 5");
    }

    #[test]
    fn password_without_username_rejected() {
        let mut settings = Settings::default();
        settings.mqtt.password = Some("x".into());
        assert_validation_err(&settings, "password is set without");
    }

    // -- Validation: gpio -------------------------------------------------

    #[test]
    fn reserved_pin_rejected() {
        let mut settings = Settings::default();
        settings.gpio.valve_pin = 1;
        assert_validation_err(&settings, "gpio.valve_pin 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn pin_28_rejected() {
        let mut settings = Settings::default();
        settings.gpio.button_pin = 28;
        assert_validation_err(&settings, "gpio.button_pin 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_pin_rejected() {
        let mut settings = Settings::default();
        settings.gpio.led_pin = 17;
        assert_validation_err(&settings, "gpio.led_pin 17 is already used");
    }

    #[test]
    fn boundary_pins_accepted() {
        let mut settings = Settings::default();
        settings.gpio.valve_pin = 2;
        settings.gpio.led_pin = 27;
        settings.gpio.button_pin = 3;
        settings.validate().unwrap();
    }

    // -- Validation: timing / defaults ------------------------------------

    #[test]
    fn zero_heartbeat_rejected() {
        let mut settings = Settings::default();
        settings.timing.heartbeat_secs = 0;
        assert_validation_err(&settings, "heartbeat_secs must be positive");
    }

    #[test]
    fn settle_must_be_shorter_than_lockout() {
        let mut settings = Settings::default();
        settings.timing.button_settle_ms = 200;
        assert_validation_err(
            &settings,
            "button_settle_ms (200) must be shorter than button_lockout_ms (200)",
        );
    }

    #[test]
    fn negative_default_duration_rejected() {
        let mut settings = Settings::default();
        settings.defaults.open_time_s = -1;
        assert_validation_err(&settings, "open_time_s must not be negative");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut settings = Settings::default();
        settings.mqtt.topic_prefix = "".into();
        settings.gpio.valve_pin = 0;
        settings.timing.heartbeat_secs = 0;
        let msg = format!("{:#}", settings.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "unexpected message: {msg}");
        assert!(msg.contains("topic_prefix"));
        assert!(msg.contains("valve_pin"));
        assert!(msg.contains("heartbeat_secs"));
    }

    // -- Load -------------------------------------------------------------

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let settings = load_with_env("/nonexistent/irrigation-controller.toml", no_env).unwrap();
        assert_eq!(settings.gpio.valve_pin, 17);
        assert_eq!(settings.mqtt.host, "homeassistant.local");
    }

    #[test]
    fn load_applies_injected_environment() {
        let settings = load_with_env("/nonexistent/irrigation-controller.toml", |key| {
            (key == "MQTT_HOST").then(|| "broker.lan".to_string())
        })
        .unwrap();
        assert_eq!(settings.mqtt.host, "broker.lan");
    }

    #[test]
    fn load_rejects_password_without_username_from_env() {
        let err = load_with_env("/nonexistent/irrigation-controller.toml", |key| {
            (key == "MQTT_PASSWORD").then(|| "secret".to_string())
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid settings"));
    }

    #[test]
    fn load_reads_and_validates_file() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-controller-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[gpio]\nvalve_pin = 0\n").unwrap();
        let err = load_with_env(path.to_str().unwrap(), no_env).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(format!("{err:#}").contains("not a valid BCM GPIO pin"));
    }
}
