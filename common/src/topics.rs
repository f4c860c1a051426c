use crate::config::ModuleConfig;

pub const COMMAND_WILDCARD: &str = "command/+";
pub const CMD_HARD_RESET: &str = "command/hrst";
pub const CMD_SOFT_RESET: &str = "command/rst";

pub const COMMAND_SEGMENT: &str = "command";
pub const CMD_ENABLE: &str = "enable";
pub const CMD_TIMER: &str = "timer";
pub const CMD_RENAME: &str = "rename";
pub const CMD_STATE: &str = "state";

pub const FEEDBACK_ENABLED: &str = "feedback/enabled";
pub const FEEDBACK_STATE: &str = "feedback/state";
pub const FEEDBACK_TIMER: &str = "feedback/timer";

pub const HOMIE_ROOT: &str = "homie";

/// `<moduleType>/<location>/<name>` namespace of one provisioned node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    base: String,
    station_name: String,
}

impl TopicScheme {
    pub fn new(module_type: &str, config: &ModuleConfig) -> Self {
        Self {
            base: format!(
                "{module_type}/{}/{}",
                config.module_location, config.module_name
            ),
            station_name: format!(
                "{module_type}_{}_{}",
                config.module_location, config.module_name
            ),
        }
    }

    /// Also the MQTT client id.
    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn station_topic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base)
    }

    /// Channel topics use the display name, so they move when a channel is
    /// renamed.
    pub fn channel_topic(&self, channel_name: &str, suffix: &str) -> String {
        format!("{}/{channel_name}/{suffix}", self.base)
    }

    /// Splits `<base>/<channelName>/command/<verb>` into name and verb.
    pub fn parse_channel_command<'t>(&self, topic: &'t str) -> Option<(&'t str, &'t str)> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let (channel_name, verb) = rest.rsplit_once('/')?;
        let channel_name = channel_name
            .strip_suffix(COMMAND_SEGMENT)?
            .strip_suffix('/')?;
        if channel_name.is_empty() {
            return None;
        }
        Some((channel_name, verb))
    }

    /// Homie device id: station name lowercased, anything outside
    /// `[a-z0-9-]` replaced with `-`.
    pub fn device_id(&self) -> String {
        self.station_name
            .chars()
            .map(|ch| {
                let ch = ch.to_ascii_lowercase();
                if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
                    ch
                } else {
                    '-'
                }
            })
            .collect()
    }

    pub fn homie_topic(&self, suffix: &str) -> String {
        format!("{HOMIE_ROOT}/{}/{suffix}", self.device_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::new(
            "irrigation",
            &ModuleConfig {
                module_name: "Front Yard".to_string(),
                module_location: "garden".to_string(),
                ..ModuleConfig::default()
            },
        )
    }

    #[test]
    fn builds_station_and_channel_topics() {
        let topics = scheme();

        assert_eq!(topics.station_name(), "irrigation_garden_Front Yard");
        assert_eq!(
            topics.station_topic(CMD_HARD_RESET),
            "irrigation/garden/Front Yard/command/hrst"
        );
        assert_eq!(
            topics.channel_topic("roses", FEEDBACK_STATE),
            "irrigation/garden/Front Yard/roses/feedback/state"
        );
    }

    #[test]
    fn parses_channel_commands_only_under_own_base() {
        let topics = scheme();

        assert_eq!(
            topics.parse_channel_command("irrigation/garden/Front Yard/roses/command/state"),
            Some(("roses", "state"))
        );
        assert_eq!(
            topics.parse_channel_command("irrigation/garden/Front Yard/command/hrst"),
            None
        );
        assert_eq!(
            topics.parse_channel_command("irrigation/garden/Back/roses/command/state"),
            None
        );
        assert_eq!(
            topics.parse_channel_command("irrigation/garden/Front Yard/roses/feedback/state"),
            None
        );
    }

    #[test]
    fn device_id_is_homie_safe() {
        assert_eq!(scheme().device_id(), "irrigation-garden-front-yard");
        assert_eq!(
            scheme().homie_topic("$homie"),
            "homie/irrigation-garden-front-yard/$homie"
        );
    }
}
