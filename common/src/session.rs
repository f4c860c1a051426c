use log::{error, info, warn};

use crate::{
    channel::ChannelRegistry,
    config::{RetryPolicy, RuntimeConfig},
    ports::MqttLink,
    topics::{TopicScheme, COMMAND_WILDCARD},
    types::{QoS, SessionState},
};

/// What one [`BrokerSession::poll`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Subscribed and still connected; inbound traffic may be serviced.
    Online,
    /// The link came up this tick. Subscriptions and discovery are due.
    Established,
    /// An attempt is in flight.
    Pending,
    /// Disconnected and the retry deadline has not passed yet.
    Waiting,
    /// An attempt failed or timed out.
    Failed,
    /// The link dropped while subscribed.
    Lost,
    /// Retries are exhausted; only a reset brings the session back.
    Stopped,
}

/// Reconnect protocol for the broker link.
///
/// An attempt is only started once `now >= next_retry`, and the deadline is
/// pushed out by the retry interval before the attempt is made, so a link that
/// keeps failing is never tried more often than once per interval.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    client_id: String,
    state: SessionState,
    policy: RetryPolicy,
    retry_interval_ms: u64,
    connect_timeout_ms: u64,
    qos: QoS,
    next_retry_ms: u64,
    attempt_started_ms: u64,
    attempts: u32,
    consecutive_failures: u32,
}

impl BrokerSession {
    pub fn new(client_id: &str, config: &RuntimeConfig) -> Self {
        Self {
            client_id: client_id.to_string(),
            state: SessionState::Disconnected,
            policy: config.retry_policy,
            retry_interval_ms: config.broker_retry_interval_ms,
            connect_timeout_ms: config.broker_connect_timeout_ms,
            qos: QoS::from_level(config.subscribe_qos),
            next_retry_ms: 0,
            attempt_started_ms: 0,
            attempts: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == SessionState::Subscribed
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Total connect attempts since boot.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_retry_ms(&self) -> u64 {
        self.next_retry_ms
    }

    pub fn poll(&mut self, now_ms: u64, link: &mut impl MqttLink) -> LinkEvent {
        match self.state {
            SessionState::FailStopped => LinkEvent::Stopped,
            SessionState::Subscribed => {
                if link.is_connected() {
                    LinkEvent::Online
                } else {
                    warn!("broker link lost");
                    self.state = SessionState::Disconnected;
                    LinkEvent::Lost
                }
            }
            SessionState::Connecting => {
                if link.is_connected() {
                    self.establish();
                    LinkEvent::Established
                } else if now_ms.saturating_sub(self.attempt_started_ms) >= self.connect_timeout_ms {
                    warn!("broker connect attempt {} timed out", self.attempts);
                    self.record_failure()
                } else {
                    LinkEvent::Pending
                }
            }
            SessionState::Disconnected => {
                if now_ms < self.next_retry_ms {
                    return LinkEvent::Waiting;
                }
                self.next_retry_ms = now_ms.saturating_add(self.retry_interval_ms);
                self.attempts = self.attempts.saturating_add(1);
                info!(
                    "connecting to broker as `{}` (attempt {})",
                    self.client_id, self.attempts
                );

                if let Err(err) = link.connect(&self.client_id) {
                    warn!("broker connect failed: {err}");
                    return self.record_failure();
                }
                self.attempt_started_ms = now_ms;
                self.state = SessionState::Connecting;
                if link.is_connected() {
                    self.establish();
                    LinkEvent::Established
                } else {
                    LinkEvent::Pending
                }
            }
        }
    }

    /// Station command wildcard first, then one wildcard per channel. A
    /// refused filter is logged and skipped; returns how many were refused.
    pub fn subscribe_all(
        &self,
        link: &mut impl MqttLink,
        topics: &TopicScheme,
        registry: &ChannelRegistry,
    ) -> usize {
        let filters = std::iter::once(topics.station_topic(COMMAND_WILDCARD)).chain(
            registry
                .iter()
                .map(|channel| topics.channel_topic(channel.name(), COMMAND_WILDCARD)),
        );
        let mut refused = 0;
        for filter in filters {
            if let Err(err) = link.subscribe(&filter, self.qos) {
                warn!("subscribe `{filter}` failed: {err}");
                refused += 1;
            }
        }
        refused
    }

    fn establish(&mut self) {
        info!("broker connected after {} attempt(s)", self.consecutive_failures + 1);
        self.state = SessionState::Subscribed;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) -> LinkEvent {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.policy {
            RetryPolicy::Bounded { max_attempts } if self.consecutive_failures >= max_attempts => {
                error!(
                    "giving up on broker after {} consecutive failures",
                    self.consecutive_failures
                );
                self.state = SessionState::FailStopped;
                LinkEvent::Stopped
            }
            _ => {
                self.state = SessionState::Disconnected;
                LinkEvent::Failed
            }
        }
    }
}
