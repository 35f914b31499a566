mod button;
mod config;
mod dispatcher;
mod hardware;
mod mqtt;
mod policy;
mod status;
#[cfg(test)]
mod testing;
mod timer;
mod valve;
mod web;

use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::{env, sync::Arc, time::Duration};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use button::ButtonWatcher;
use dispatcher::MessageDispatcher;
use hardware::{ButtonPin, ValveBoard};
use mqtt::{MqttPublisher, PublishPort};
use policy::PolicyEvaluator;
use status::StatusBoard;
use timer::TimerService;
use valve::ValveController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let settings = config::load(&config_path)?;
    let (valve_pin, led_pin, button_pin) = settings.gpio_pins()?;
    let prefix = settings.mqtt.topic_prefix.clone();

    let status = StatusBoard::shared();

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = AsyncClient::new(mqtt::options(&settings.mqtt), 20);
    let publisher: Arc<dyn PublishPort> = Arc::new(MqttPublisher::new(client.clone(), &prefix));

    // ── Hardware ────────────────────────────────────────────────────
    let board = ValveBoard::new(valve_pin, led_pin, settings.gpio.relay_active_low)
        .context("failed to initialise valve outputs")?;
    let (edge_tx, edge_rx) = mpsc::unbounded_channel();
    let button = ButtonPin::new(button_pin, edge_tx).context("failed to initialise button")?;

    // ── Core ────────────────────────────────────────────────────────
    let valve = ValveController::new(
        Box::new(board),
        Arc::clone(&publisher),
        TimerService::new(Handle::current()),
        Arc::clone(&status),
    );
    let policy = Arc::new(PolicyEvaluator::new(
        settings.defaults.controller_config(),
        valve.clone(),
        Arc::clone(&status),
    ));
    let dispatcher = Arc::new(MessageDispatcher::new(
        &prefix,
        Arc::clone(&policy),
        Arc::clone(&status),
    ));

    // ── Tasks ───────────────────────────────────────────────────────
    let watcher = ButtonWatcher::new(
        button,
        valve.clone(),
        settings.timing.debounce(),
        Arc::clone(&status),
    );
    tokio::spawn(watcher.run(edge_rx));

    tokio::spawn(mqtt::heartbeat(
        Arc::clone(&publisher),
        settings.timing.heartbeat(),
    ));

    tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        dispatcher,
        Arc::clone(&status),
        prefix.clone(),
    ));

    if settings.web.enabled {
        let web_state = web::AppState {
            status: Arc::clone(&status),
            valve: valve.clone(),
            policy: Arc::clone(&policy),
        };
        let port = settings.web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_state, port).await {
                error!("{e:#}");
            }
        });
    }

    status
        .write()
        .await
        .record_system("controller started".to_string());
    // Configured defaults take effect immediately; the built-in ones hold.
    policy.on_config_changed().await;
    info!(%prefix, "system ready, listening for mqtt messages and button presses");

    shutdown_signal().await;

    info!("shutting down");
    valve.shutdown().await;
    // Give the event loop a moment to flush the final valve_state.
    tokio::time::sleep(Duration::from_millis(250)).await;
    if let Err(e) = client.try_disconnect() {
        error!("mqtt disconnect failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
