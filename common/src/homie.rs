//! Homie 3.1.0 device announcement.

use std::net::Ipv4Addr;

use log::{info, warn};

use crate::{
    channel::{Channel, ChannelRegistry},
    config::FirmwareInfo,
    error::LinkError,
    ports::MqttLink,
    topics::TopicScheme,
};

pub const HOMIE_VERSION: &str = "3.1.0";

#[derive(Debug, Clone)]
pub struct DeviceIdentity<'a> {
    pub friendly_name: &'a str,
    pub module_type: &'a str,
    pub local_ip: Option<Ipv4Addr>,
    pub mac: String,
    pub firmware: &'a FirmwareInfo,
}

/// Every retained `(topic, payload)` pair describing the device, in publish
/// order.
pub fn discovery_messages(
    topics: &TopicScheme,
    identity: &DeviceIdentity<'_>,
    registry: &ChannelRegistry,
) -> Vec<(String, String)> {
    let nodes = registry
        .iter()
        .map(Channel::id)
        .collect::<Vec<_>>()
        .join(",");
    let local_ip = identity
        .local_ip
        .map(|ip| ip.to_string())
        .unwrap_or_default();

    let mut messages = vec![
        (topics.homie_topic("$homie"), HOMIE_VERSION.to_string()),
        (topics.homie_topic("$name"), identity.friendly_name.to_string()),
        (topics.homie_topic("$localip"), local_ip),
        (topics.homie_topic("$mac"), identity.mac.clone()),
        (topics.homie_topic("$fw/name"), identity.firmware.name.clone()),
        (
            topics.homie_topic("$fw/version"),
            identity.firmware.version.clone(),
        ),
        (topics.homie_topic("$nodes"), nodes),
        (
            topics.homie_topic("$implementation"),
            identity.firmware.implementation.clone(),
        ),
        (topics.homie_topic("$state"), "init".to_string()),
    ];

    for channel in registry.iter() {
        let node = channel.id();
        let property = channel.property();
        messages.push(node_name_message(topics, channel));
        messages.push((
            topics.homie_topic(&format!("{node}/$type")),
            identity.module_type.to_string(),
        ));
        messages.push((
            topics.homie_topic(&format!("{node}/$properties")),
            property.id.clone(),
        ));

        let prefix = format!("{node}/{}", property.id);
        messages.push((
            topics.homie_topic(&format!("{prefix}/$name")),
            property.name.clone(),
        ));
        messages.push((
            topics.homie_topic(&format!("{prefix}/$settable")),
            property.settable.to_string(),
        ));
        messages.push((
            topics.homie_topic(&format!("{prefix}/$retained")),
            property.retained.to_string(),
        ));
        messages.push((
            topics.homie_topic(&format!("{prefix}/$datatype")),
            property.datatype.clone(),
        ));
        if let Some(unit) = &property.unit {
            messages.push((topics.homie_topic(&format!("{prefix}/$unit")), unit.clone()));
        }
        if let Some(format) = &property.format {
            messages.push((
                topics.homie_topic(&format!("{prefix}/$format")),
                format.clone(),
            ));
        }
    }

    messages.push((topics.homie_topic("$state"), "ready".to_string()));
    messages
}

pub fn node_name_message(topics: &TopicScheme, channel: &Channel) -> (String, String) {
    (
        topics.homie_topic(&format!("{}/$name", channel.id())),
        channel.name().to_string(),
    )
}

/// Publishes the announcement. Devices without firmware identity stay
/// unannounced.
pub fn announce(
    link: &mut impl MqttLink,
    topics: &TopicScheme,
    identity: Option<&DeviceIdentity<'_>>,
    registry: &ChannelRegistry,
) -> Result<(), LinkError> {
    let Some(identity) = identity else {
        warn!("firmware identity not set, skipping homie announcement");
        return Ok(());
    };

    let messages = discovery_messages(topics, identity, registry);
    info!(
        "announcing homie device `{}` ({} messages)",
        topics.device_id(),
        messages.len()
    );
    for (topic, payload) in messages {
        link.publish(&topic, payload.as_bytes(), true)?;
    }
    Ok(())
}
