use std::net::Ipv4Addr;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{Channel, ChannelRegistry},
    types::Direction,
};

pub const PARAM_MQTT_HOST: &str = "mqttHost";
pub const PARAM_MQTT_PORT: &str = "mqttPort";
pub const PARAM_MODULE_NAME: &str = "moduleName";
pub const PARAM_MODULE_LOCATION: &str = "moduleLocation";

pub const PARAM_VALUE_MAX_LEN: usize = 20;
pub const PARAM_HOST_MAX_LEN: usize = 16;
pub const PARAM_PORT_MAX_LEN: usize = 6;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// One free-form text field rendered on the provisioning form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalParam {
    pub id: &'static str,
    pub label: &'static str,
    pub max_len: usize,
    pub required: bool,
}

pub static PORTAL_PARAMS: [PortalParam; 4] = [
    PortalParam {
        id: PARAM_MODULE_LOCATION,
        label: "Module location",
        max_len: PARAM_VALUE_MAX_LEN,
        required: true,
    },
    PortalParam {
        id: PARAM_MODULE_NAME,
        label: "Module name",
        max_len: PARAM_VALUE_MAX_LEN,
        required: true,
    },
    PortalParam {
        id: PARAM_MQTT_HOST,
        label: "MQTT host",
        max_len: PARAM_HOST_MAX_LEN,
        required: true,
    },
    PortalParam {
        id: PARAM_MQTT_PORT,
        label: "MQTT port",
        max_len: PARAM_PORT_MAX_LEN,
        required: true,
    },
];

/// Parameters collected by the portal and persisted in `/config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "mqttHost", default)]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort", default)]
    pub mqtt_port: String,
    #[serde(rename = "moduleName", default)]
    pub module_name: String,
    #[serde(rename = "moduleLocation", default)]
    pub module_location: String,
}

impl ModuleConfig {
    pub fn sanitize(&mut self) {
        for param in PORTAL_PARAMS.iter() {
            if let Some(value) = self.param_mut(param.id) {
                *value = truncate_to(value, param.max_len);
            }
        }
    }

    pub fn param(&self, id: &str) -> Option<&str> {
        match id {
            PARAM_MQTT_HOST => Some(&self.mqtt_host),
            PARAM_MQTT_PORT => Some(&self.mqtt_port),
            PARAM_MODULE_NAME => Some(&self.module_name),
            PARAM_MODULE_LOCATION => Some(&self.module_location),
            _ => None,
        }
    }

    fn param_mut(&mut self, id: &str) -> Option<&mut String> {
        match id {
            PARAM_MQTT_HOST => Some(&mut self.mqtt_host),
            PARAM_MQTT_PORT => Some(&mut self.mqtt_port),
            PARAM_MODULE_NAME => Some(&mut self.module_name),
            PARAM_MODULE_LOCATION => Some(&mut self.module_location),
            _ => None,
        }
    }

    /// Stores a form value, truncated to the parameter's bound. Unknown ids
    /// are ignored.
    pub fn set_param(&mut self, id: &str, value: &str) {
        let Some(max_len) = PORTAL_PARAMS
            .iter()
            .find(|param| param.id == id)
            .map(|param| param.max_len)
        else {
            return;
        };
        if let Some(slot) = self.param_mut(id) {
            *slot = truncate_to(value, max_len);
        }
    }

    /// First required parameter that is still blank.
    pub fn missing_required(&self) -> Option<&'static PortalParam> {
        PORTAL_PARAMS
            .iter()
            .find(|param| param.required && self.param(param.id).map_or(true, str::is_empty))
    }

    pub fn mqtt_port_number(&self) -> u16 {
        match self.mqtt_port.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                warn!(
                    "invalid mqtt port `{}`, falling back to {DEFAULT_MQTT_PORT}",
                    self.mqtt_port
                );
                DEFAULT_MQTT_PORT
            }
        }
    }
}

/// Cuts `value` to at most `max_len` bytes without splitting a character.
pub fn truncate_to(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RetryPolicy {
    Forever,
    Bounded {
        #[serde(rename = "maxAttempts")]
        max_attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackPattern {
    pub period_ms: u32,
    pub cycles: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub wifi_connect_timeout_ms: u64,
    /// Zero keeps the portal open until credentials arrive.
    pub config_portal_timeout_ms: u64,
    pub broker_retry_interval_ms: u64,
    pub broker_connect_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub min_signal_quality: u8,
    pub feedback_blink_ms: u64,
    pub success_pattern: FeedbackPattern,
    pub failure_pattern: FeedbackPattern,
    pub ap_address: [u8; 4],
    pub subscribe_qos: u8,
    pub max_messages_per_tick: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wifi_connect_timeout_ms: 30_000,
            config_portal_timeout_ms: 60_000,
            broker_retry_interval_ms: 5_000,
            broker_connect_timeout_ms: 10_000,
            retry_policy: RetryPolicy::Forever,
            min_signal_quality: 30,
            feedback_blink_ms: 250,
            success_pattern: FeedbackPattern {
                period_ms: 100,
                cycles: 10,
            },
            failure_pattern: FeedbackPattern {
                period_ms: 2_000,
                cycles: 1,
            },
            ap_address: [10, 10, 10, 10],
            subscribe_qos: 1,
            max_messages_per_tick: 16,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.max(1_000);
        self.broker_retry_interval_ms = self.broker_retry_interval_ms.max(100);
        self.broker_connect_timeout_ms = self.broker_connect_timeout_ms.max(1_000);
        self.min_signal_quality = self.min_signal_quality.min(100);
        self.feedback_blink_ms = self.feedback_blink_ms.max(50);
        self.subscribe_qos = self.subscribe_qos.min(2);
        self.max_messages_per_tick = self.max_messages_per_tick.max(1);

        if let RetryPolicy::Bounded { max_attempts } = &mut self.retry_policy {
            *max_attempts = (*max_attempts).max(1);
        }
    }

    pub fn ap_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ap_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub name: String,
    pub version: String,
    #[serde(default = "default_implementation")]
    pub implementation: String,
}

fn default_implementation() -> String {
    "esp32".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub settable: Option<bool>,
    #[serde(default)]
    pub retained: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: String,
    pub name: String,
    pub pin: u8,
    pub direction: Direction,
    #[serde(default)]
    pub analog: bool,
    #[serde(default)]
    pub inverted: bool,
    #[serde(rename = "timerMs", default)]
    pub timer_ms: u64,
    #[serde(default)]
    pub state: u16,
    #[serde(default)]
    pub property: Option<PropertySpec>,
}

/// Static description of a node build: what it is and which lines it drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(rename = "moduleType")]
    pub module_type: String,
    #[serde(default)]
    pub firmware: Option<FirmwareInfo>,
    #[serde(rename = "portalSsid", default)]
    pub portal_ssid: Option<String>,
    #[serde(rename = "feedbackPin", default)]
    pub feedback_pin: Option<u8>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            module_type: "generic".to_string(),
            firmware: None,
            portal_ssid: None,
            feedback_pin: None,
            runtime: RuntimeConfig::default(),
            channels: Vec::new(),
        }
    }
}

impl DeviceProfile {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let mut profile: Self = serde_json::from_str(raw)?;
        profile.runtime.sanitize();
        Ok(profile)
    }

    pub fn portal_ssid(&self, chip_id: u32) -> String {
        self.portal_ssid
            .clone()
            .unwrap_or_else(|| format!("Proeza domotic {chip_id}"))
    }

    /// Registers every declared channel. Rejected specs are logged and
    /// skipped so the node still runs with the ones that fit.
    pub fn build_registry(&self) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        for spec in &self.channels {
            if let Err(err) = registry.add(channel_from_spec(spec)) {
                warn!("skipping channel `{}`: {err}", spec.id);
            }
        }
        registry
    }
}

pub fn channel_from_spec(spec: &ChannelSpec) -> Channel {
    let mut channel = Channel::new(&spec.id, &spec.name, spec.pin, spec.direction)
        .with_analog(spec.analog)
        .with_inverted(spec.inverted)
        .with_timer_ms(spec.timer_ms)
        .with_initial_state(spec.state);

    if let Some(property) = &spec.property {
        let mut custom = channel
            .property()
            .with_id(&property.id)
            .with_name(property.name.as_deref().unwrap_or(&spec.name));
        if let Some(datatype) = &property.datatype {
            custom = custom.with_datatype(datatype);
        }
        if let Some(unit) = &property.unit {
            custom = custom.with_unit(unit);
        }
        if let Some(format) = &property.format {
            custom = custom.with_format(format);
        }
        if let Some(settable) = property.settable {
            custom = custom.with_settable(settable);
        }
        if let Some(retained) = property.retained {
            custom = custom.with_retained(retained);
        }
        channel = channel.with_property(custom);
    }

    channel
}
