//! MQTT plumbing around the core: the outbound publish port, the inbound
//! event loop (with resubscribe on every connect), and the liveness
//! heartbeat.

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::dispatcher::{Channel, MessageDispatcher};
use crate::status::SharedStatus;

pub const HEARTBEAT_CHANNEL: &str = "controller/heartbeat";
pub const HEARTBEAT_PAYLOAD: &str = "online";

/// Back-off between failed polls of the event loop.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Publish port
// ---------------------------------------------------------------------------

/// Fire-and-forget outbound messages. Implementations must not block and
/// must swallow (and log) their own failures.
pub trait PublishPort: Send + Sync {
    fn publish(&self, channel: &str, payload: &str);
}

pub fn topic(prefix: &str, channel: &str) -> String {
    format!("{prefix}/{channel}")
}

pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, topic_prefix: &str) -> Self {
        Self {
            client,
            topic_prefix: topic_prefix.to_string(),
        }
    }
}

impl PublishPort for MqttPublisher {
    fn publish(&self, channel: &str, payload: &str) {
        let topic = topic(&self.topic_prefix, channel);
        match self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
        {
            Ok(()) => debug!(%topic, %payload, "published"),
            Err(e) => warn!(%topic, "publish failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn options(settings: &MqttSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    if let Some(username) = &settings.username {
        opts.set_credentials(username, settings.password.as_deref().unwrap_or_default());
    }
    opts
}

/// Subscribe every inbound channel. Uses the non-blocking request path so it
/// can run from inside the event loop task.
pub(crate) fn subscribe_all(client: &AsyncClient, prefix: &str) -> Result<(), ClientError> {
    for channel in Channel::ALL {
        client.try_subscribe(topic(prefix, channel.name()), QoS::AtLeastOnce)?;
    }
    Ok(())
}

/// Drive the connection forever. rumqttc reconnects on the next poll after
/// an error; the valve is deliberately left alone during outages.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    dispatcher: Arc<MessageDispatcher>,
    status: SharedStatus,
    topic_prefix: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                // Rejections are logged and journaled by the dispatcher.
                let _ = dispatcher.handle(&p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(prefix = %topic_prefix, "mqtt connected, subscribing");
                if let Err(e) = subscribe_all(&client, &topic_prefix) {
                    error!("mqtt subscribe failed: {e}");
                    status
                        .write()
                        .await
                        .record_error(format!("mqtt subscribe failed: {e}"));
                }
                status.write().await.set_mqtt_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                status.write().await.set_mqtt_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = status.write().await;
                    if st.mqtt_connected {
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    st.set_mqtt_connected(false);
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

pub async fn heartbeat(publisher: Arc<dyn PublishPort>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        publisher.publish(HEARTBEAT_CHANNEL, HEARTBEAT_PAYLOAD);
        debug!("heartbeat published");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
