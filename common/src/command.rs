use log::debug;

use crate::{
    channel::ChannelRegistry,
    error::{CommandError, LinkError},
    ports::{GpioPort, MqttLink},
    topics::{
        TopicScheme, CMD_ENABLE, CMD_HARD_RESET, CMD_RENAME, CMD_SOFT_RESET, CMD_STATE, CMD_TIMER,
        COMMAND_WILDCARD, FEEDBACK_ENABLED, FEEDBACK_STATE, FEEDBACK_TIMER,
    },
    types::QoS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCommand {
    Enable,
    Timer,
    Rename,
    State,
}

impl ChannelCommand {
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            CMD_ENABLE => Some(Self::Enable),
            CMD_TIMER => Some(Self::Timer),
            CMD_RENAME => Some(Self::Rename),
            CMD_STATE => Some(Self::State),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    HardReset,
    SoftReset,
    Channel {
        index: usize,
        command: ChannelCommand,
    },
    Unmatched,
}

pub fn route_message(topics: &TopicScheme, registry: &ChannelRegistry, topic: &str) -> Route {
    if topic == topics.station_topic(CMD_HARD_RESET) {
        return Route::HardReset;
    }
    if topic == topics.station_topic(CMD_SOFT_RESET) {
        return Route::SoftReset;
    }

    let Some((channel_name, verb)) = topics.parse_channel_command(topic) else {
        return Route::Unmatched;
    };
    match (
        registry.position_by_name(channel_name),
        ChannelCommand::from_verb(verb),
    ) {
        (Some(index), Some(command)) => Route::Channel { index, command },
        _ => Route::Unmatched,
    }
}

pub fn decode_flag(payload: &[u8]) -> Result<bool, CommandError> {
    match payload {
        [] => Err(CommandError::Empty),
        [b'0'] => Ok(false),
        [b'1'] => Ok(true),
        [other] => Err(CommandError::Flag(*other)),
        _ => Err(CommandError::Length(payload.len())),
    }
}

fn decode_integer(payload: &[u8]) -> Result<u64, CommandError> {
    let text = std::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(CommandError::Empty);
    }
    text.parse::<u64>().map_err(|_| CommandError::NotNumeric)
}

/// Timer payloads are whole seconds; the channel keeps milliseconds.
pub fn decode_timer_ms(payload: &[u8]) -> Result<u64, CommandError> {
    decode_integer(payload).map(|secs| secs.saturating_mul(1_000))
}

/// Names become topic levels, so separators, wildcards and control
/// characters are refused.
pub fn decode_name(payload: &[u8]) -> Result<&str, CommandError> {
    if payload.is_empty() {
        return Err(CommandError::Empty);
    }
    let name = std::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
    if name
        .chars()
        .any(|ch| matches!(ch, '/' | '+' | '#') || ch.is_control())
    {
        return Err(CommandError::InvalidName);
    }
    Ok(name)
}

pub fn decode_state(payload: &[u8], analog: bool) -> Result<u16, CommandError> {
    if analog {
        decode_integer(payload).map(|value| value.min(u64::from(u16::MAX)) as u16)
    } else {
        decode_flag(payload).map(u16::from)
    }
}

/// What a command did, so the caller knows whether to persist or re-announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub changed: bool,
    pub persist: bool,
    pub renamed: bool,
}

/// Applies decoded channel commands and echoes the result.
pub struct CommandExecutor<'a, L: MqttLink, G: GpioPort> {
    pub link: &'a mut L,
    pub gpio: &'a mut G,
    pub registry: &'a mut ChannelRegistry,
    pub topics: &'a TopicScheme,
    pub qos: QoS,
}

impl<L: MqttLink, G: GpioPort> CommandExecutor<'_, L, G> {
    /// A decode failure leaves the channel, the store and the broker
    /// untouched. Feedback is published after every applied command, changed
    /// or not.
    pub fn execute(
        &mut self,
        index: usize,
        command: ChannelCommand,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<CommandOutcome, CommandError> {
        if command == ChannelCommand::Rename {
            let name = decode_name(payload)?;
            if self.registry.name_taken(name, index) {
                return Err(CommandError::NameTaken);
            }
        }
        let Some(channel) = self.registry.get_mut(index) else {
            return Ok(CommandOutcome::default());
        };

        match command {
            ChannelCommand::Enable => {
                let enabled = decode_flag(payload)?;
                let changed = channel.set_enabled(enabled);
                let topic = self.topics.channel_topic(channel.name(), FEEDBACK_ENABLED);
                publish_echo(self.link, &topic, if enabled { "1" } else { "0" });
                Ok(CommandOutcome {
                    changed,
                    persist: changed,
                    renamed: false,
                })
            }
            ChannelCommand::Timer => {
                let timer_ms = decode_timer_ms(payload)?;
                let changed = channel.set_timer(timer_ms);
                let topic = self.topics.channel_topic(channel.name(), FEEDBACK_TIMER);
                publish_echo(self.link, &topic, &(timer_ms / 1_000).to_string());
                Ok(CommandOutcome {
                    changed,
                    persist: changed,
                    renamed: false,
                })
            }
            ChannelCommand::Rename => {
                let name = decode_name(payload)?;
                let old_topic = self.topics.channel_topic(channel.name(), COMMAND_WILDCARD);
                if !channel.rename(name) {
                    return Ok(CommandOutcome::default());
                }
                let new_topic = self.topics.channel_topic(channel.name(), COMMAND_WILDCARD);
                if let Err(err) = self.link.unsubscribe(&old_topic) {
                    debug!("unsubscribe `{old_topic}` failed: {err}");
                }
                if let Err(err) = self.link.subscribe(&new_topic, self.qos) {
                    log::warn!("subscribe `{new_topic}` failed: {err}");
                }
                Ok(CommandOutcome {
                    changed: true,
                    persist: true,
                    renamed: true,
                })
            }
            ChannelCommand::State => {
                if !channel.is_output() {
                    return Err(CommandError::NotWritable);
                }
                let value = decode_state(payload, channel.is_analog())?;
                let changed = channel.write(value, now_ms, self.gpio);
                let topic = self.topics.channel_topic(channel.name(), FEEDBACK_STATE);
                publish_echo(self.link, &topic, &channel.state().to_string());
                Ok(CommandOutcome {
                    changed,
                    persist: false,
                    renamed: false,
                })
            }
        }
    }
}

pub fn publish_echo(link: &mut impl MqttLink, topic: &str, payload: &str) {
    if let Err(err) = link.publish(topic, payload.as_bytes(), true) {
        log_publish_failure(topic, &err);
    }
}

fn log_publish_failure(topic: &str, err: &LinkError) {
    log::warn!("publish to `{topic}` failed: {err}");
}
