//! Decodes inbound `<prefix>/<channel>` messages into configuration updates
//! and forwards them to the policy evaluator.

use std::num::ParseIntError;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::policy::{ConfigUpdate, Decision, PolicyEvaluator};
use crate::status::SharedStatus;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    MoistureLevel,
    MoistureThreshold,
    ManualMode,
    OpenValve,
    OpenTimeMinutes,
    OpenTimeSeconds,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::MoistureLevel,
        Channel::MoistureThreshold,
        Channel::ManualMode,
        Channel::OpenValve,
        Channel::OpenTimeMinutes,
        Channel::OpenTimeSeconds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::MoistureLevel => "moisture_level",
            Self::MoistureThreshold => "moisture_threshold",
            Self::ManualMode => "manual_mode",
            Self::OpenValve => "open_valve",
            Self::OpenTimeMinutes => "valve_open_time_m",
            Self::OpenTimeSeconds => "valve_open_time_s",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Resolve "<prefix>/<channel>" to a channel.
pub(crate) fn channel_for_topic(prefix: &str, topic: &str) -> Option<Channel> {
    topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(Channel::from_name)
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unhandled topic '{0}'")]
    UnknownTopic(String),

    #[error("payload for {channel} is not valid UTF-8")]
    NotUtf8 { channel: &'static str },

    #[error("could not parse payload for {channel}: {payload:?}")]
    InvalidInteger {
        channel: &'static str,
        payload: String,
        #[source]
        source: ParseIntError,
    },

    #[error("negative duration for {channel}: {value}")]
    NegativeDuration { channel: &'static str, value: i64 },
}

/// Decode a payload for `channel`. Integers are signed decimals, except
/// durations which must be non-negative; booleans are `true` (any case) or
/// false for anything else.
pub(crate) fn parse_update(
    channel: Channel,
    payload: &[u8],
) -> Result<ConfigUpdate, DispatchError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| DispatchError::NotUtf8 {
            channel: channel.name(),
        })?
        .trim();

    let int = || {
        text.parse::<i64>()
            .map_err(|source| DispatchError::InvalidInteger {
                channel: channel.name(),
                payload: text.to_string(),
                source,
            })
    };
    let duration = || -> Result<i64, DispatchError> {
        let value = int()?;
        if value < 0 {
            return Err(DispatchError::NegativeDuration {
                channel: channel.name(),
                value,
            });
        }
        Ok(value)
    };
    let flag = || text.eq_ignore_ascii_case("true");

    Ok(match channel {
        Channel::MoistureLevel => ConfigUpdate::MoistureLevel(int()?),
        Channel::MoistureThreshold => ConfigUpdate::MoistureThreshold(int()?),
        Channel::ManualMode => ConfigUpdate::ManualMode(flag()),
        Channel::OpenValve => ConfigUpdate::OpenValve(flag()),
        Channel::OpenTimeMinutes => ConfigUpdate::OpenTimeMinutes(duration()?),
        Channel::OpenTimeSeconds => ConfigUpdate::OpenTimeSeconds(duration()?),
    })
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct MessageDispatcher {
    topic_prefix: String,
    policy: Arc<PolicyEvaluator>,
    status: SharedStatus,
}

impl MessageDispatcher {
    pub fn new(topic_prefix: &str, policy: Arc<PolicyEvaluator>, status: SharedStatus) -> Self {
        Self {
            topic_prefix: topic_prefix.to_string(),
            policy,
            status,
        }
    }

    /// Handle one inbound message. Rejections are logged and journaled here;
    /// the field stays unchanged and no evaluation runs.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Decision, DispatchError> {
        match self.decode(topic, payload) {
            Ok(update) => {
                debug!(%topic, %update, "received");
                Ok(self.policy.apply(update).await)
            }
            Err(e) => {
                warn!(%topic, "rejected message: {e}");
                self.status.write().await.record_error(e.to_string());
                Err(e)
            }
        }
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Result<ConfigUpdate, DispatchError> {
        let channel = channel_for_topic(&self.topic_prefix, topic)
            .ok_or_else(|| DispatchError::UnknownTopic(topic.to_string()))?;
        parse_update(channel, payload)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
