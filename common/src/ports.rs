//! Capability traits the node core is written against.
//!
//! Board glue (ESP-IDF drivers or the host simulator) implements these; the
//! runtime only ever sees the traits, so every state machine in this crate can
//! be driven tick by tick from tests.

use std::net::{Ipv4Addr, SocketAddr};

use crate::{
    config::ModuleConfig,
    error::{FsError, LinkError, RadioError},
    scan::AccessPoint,
    types::{Direction, QoS, StationStatus},
};

pub const SSID_MAX_LEN: usize = 32;
pub const PASSWORD_MAX_LEN: usize = 64;

/// Pin access. Driver failures are logged by the adapter, never surfaced.
pub trait GpioPort {
    fn configure(&mut self, pin: u8, direction: Direction);
    fn digital_write(&mut self, pin: u8, high: bool);
    fn digital_read(&mut self, pin: u8) -> bool;
    fn analog_write(&mut self, pin: u8, value: u16);
    fn analog_read(&mut self, pin: u8) -> u16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    pub password: heapless::String<PASSWORD_MAX_LEN>,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, RadioError> {
        let ssid = ssid
            .try_into()
            .map_err(|_| RadioError::CredentialTooLong("ssid"))?;
        let password = password
            .try_into()
            .map_err(|_| RadioError::CredentialTooLong("password"))?;
        Ok(Self { ssid, password })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRequest {
    /// Rejoin with whatever the radio persisted from the last successful join.
    Stored,
    New(Credentials),
}

pub trait WifiRadio {
    fn has_stored_credentials(&self) -> bool;
    /// Starts a station join and returns immediately; progress is observed
    /// through [`WifiRadio::station_status`].
    fn begin_join(&mut self, request: JoinRequest) -> Result<(), RadioError>;
    fn station_status(&mut self) -> StationStatus;
    /// Brings up the provisioning access point alongside the station (AP+STA).
    fn start_access_point(&mut self, ssid: &str, address: Ipv4Addr) -> Result<(), RadioError>;
    fn stop_access_point(&mut self) -> Result<(), RadioError>;
    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError>;
    fn local_ip(&self) -> Option<Ipv4Addr>;
    fn mac_address(&self) -> String;
    fn disconnect(&mut self);
    fn erase_credentials(&mut self) -> Result<(), RadioError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MqttLink {
    fn set_server(&mut self, host: &str, port: u16);
    /// Starts a connection attempt. `Ok` means the attempt is under way, not
    /// that the broker accepted it; see [`MqttLink::is_connected`].
    fn connect(&mut self, client_id: &str) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), LinkError>;
    fn poll_message(&mut self) -> Option<InboundMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub id: u64,
    pub method: HttpMethod,
    /// Path plus optional `?query`.
    pub uri: String,
    pub host: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn path(&self) -> &str {
        self.uri
            .split_once('?')
            .map_or(self.uri.as_str(), |(path, _)| path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            location: None,
            body: body.into_bytes(),
        }
    }

    pub fn json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json; charset=utf-8",
            location: None,
            body,
        }
    }

    pub fn redirect(location: String) -> Self {
        Self {
            status: 302,
            content_type: "text/plain; charset=utf-8",
            location: Some(location),
            body: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain; charset=utf-8",
            location: None,
            body: b"not found".to_vec(),
        }
    }
}

pub trait HttpPort {
    fn next_request(&mut self) -> Option<HttpRequest>;
    fn respond(&mut self, id: u64, response: HttpResponse);
}

/// Non-blocking UDP socket used by the captive DNS responder.
pub trait DatagramPort {
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;
    fn send(&mut self, data: &[u8], to: SocketAddr);
}

pub trait FileSystem {
    /// `Ok(None)` when the file does not exist.
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, FsError>;
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError>;
    fn format(&mut self) -> Result<(), FsError>;
}

impl<F: FileSystem + ?Sized> FileSystem for &mut F {
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, FsError> {
        (**self).read(path)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        (**self).write(path, data)
    }

    fn format(&mut self) -> Result<(), FsError> {
        (**self).format()
    }
}

pub trait SystemControl {
    fn restart(&mut self);
    fn delay_ms(&mut self, ms: u32);
    fn chip_id(&self) -> u32;
}

/// Device-wide switches the integrator may flip from a message hook.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeControl {
    behaviour_locked: bool,
}

impl RuntimeControl {
    pub fn lock_behaviour(&mut self) {
        self.behaviour_locked = true;
    }

    pub fn unlock_behaviour(&mut self) {
        self.behaviour_locked = false;
    }

    pub fn is_behaviour_locked(&self) -> bool {
        self.behaviour_locked
    }
}

/// Integrator extension points. Every method defaults to a no-op.
pub trait RuntimeHooks {
    /// Called after the node's own subscriptions and discovery publish.
    fn on_connected(&mut self, _link: &mut dyn MqttLink) {}

    /// Called for every inbound message, after internal routing.
    fn on_message(&mut self, _topic: &str, _payload: &[u8], _control: &mut RuntimeControl) {}

    /// Called once freshly provisioned parameters have been persisted.
    fn on_save(&mut self, _config: &ModuleConfig) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl RuntimeHooks for NoHooks {}

/// Binds one concrete adapter per port so the runtime takes a single type
/// parameter.
pub trait Platform {
    type Gpio: GpioPort;
    type Radio: WifiRadio;
    type Link: MqttLink;
    type Http: HttpPort;
    type Dns: DatagramPort;
    type Fs: FileSystem;
    type System: SystemControl;
    type Hooks: RuntimeHooks;
}

pub struct Board<P: Platform> {
    pub gpio: P::Gpio,
    pub radio: P::Radio,
    pub link: P::Link,
    pub http: P::Http,
    pub dns: P::Dns,
    pub fs: P::Fs,
    pub system: P::System,
    pub hooks: P::Hooks,
}
