use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }
}

/// Station-side view of the radio while joining a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Idle,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    FailStopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Subscribed => "SUBSCRIBED",
            Self::FailStopped => "FAIL_STOPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimePhase {
    Booting,
    Provisioning,
    Networked,
    Standalone,
    Restarting,
}

impl RuntimePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::Provisioning => "PROVISIONING",
            Self::Networked => "NETWORKED",
            Self::Standalone => "STANDALONE",
            Self::Restarting => "RESTARTING",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: String,
    pub name: String,
    pub direction: &'static str,
    pub analog: bool,
    pub state: u16,
    pub enabled: bool,
    #[serde(rename = "timerMs")]
    pub timer_ms: u64,
    #[serde(rename = "revertPending")]
    pub revert_pending: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    #[serde(rename = "stationName")]
    pub station_name: String,
    pub phase: &'static str,
    pub session: &'static str,
    #[serde(rename = "behaviourLocked")]
    pub behaviour_locked: bool,
    #[serde(rename = "brokerAttempts")]
    pub broker_attempts: u32,
    pub channels: Vec<ChannelStatus>,
}
