//! In-memory port fakes for unit tests.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};

use crate::{
    config::ModuleConfig,
    error::{FsError, LinkError, RadioError},
    ports::{
        Board, DatagramPort, FileSystem, GpioPort, HttpMethod, HttpPort, HttpRequest,
        HttpResponse, InboundMessage, JoinRequest, MqttLink, Platform, RuntimeControl,
        RuntimeHooks, SystemControl, WifiRadio,
    },
    scan::AccessPoint,
    types::{Direction, QoS, StationStatus},
};

#[derive(Debug, Default)]
pub struct RecordingGpio {
    pub configured: Vec<(u8, Direction)>,
    /// Digital writes are recorded as `0`/`1`.
    pub writes: Vec<(u8, u16)>,
    pub levels: HashMap<u8, u16>,
}

impl GpioPort for RecordingGpio {
    fn configure(&mut self, pin: u8, direction: Direction) {
        self.configured.push((pin, direction));
    }

    fn digital_write(&mut self, pin: u8, high: bool) {
        self.writes.push((pin, u16::from(high)));
    }

    fn digital_read(&mut self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(0) != 0
    }

    fn analog_write(&mut self, pin: u8, value: u16) {
        self.writes.push((pin, value));
    }

    fn analog_read(&mut self, pin: u8) -> u16 {
        self.levels.get(&pin).copied().unwrap_or(0)
    }
}

/// Radio whose join result is whatever `join_outcome` says.
#[derive(Debug)]
pub struct ScriptedRadio {
    pub stored: bool,
    pub status: StationStatus,
    pub join_outcome: StationStatus,
    pub joins: Vec<JoinRequest>,
    pub access_point: Option<(String, Ipv4Addr)>,
    pub ap_starts: usize,
    pub networks: Vec<AccessPoint>,
    pub scans: usize,
    pub erased: bool,
    pub disconnects: usize,
}

impl Default for ScriptedRadio {
    fn default() -> Self {
        Self {
            stored: false,
            status: StationStatus::Idle,
            join_outcome: StationStatus::Connecting,
            joins: Vec::new(),
            access_point: None,
            ap_starts: 0,
            networks: Vec::new(),
            scans: 0,
            erased: false,
            disconnects: 0,
        }
    }
}

impl WifiRadio for ScriptedRadio {
    fn has_stored_credentials(&self) -> bool {
        self.stored
    }

    fn begin_join(&mut self, request: JoinRequest) -> Result<(), RadioError> {
        if matches!(request, JoinRequest::New(_)) {
            self.stored = true;
        }
        self.joins.push(request);
        self.status = self.join_outcome;
        Ok(())
    }

    fn station_status(&mut self) -> StationStatus {
        self.status
    }

    fn start_access_point(&mut self, ssid: &str, address: Ipv4Addr) -> Result<(), RadioError> {
        self.ap_starts += 1;
        self.access_point = Some((ssid.to_string(), address));
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), RadioError> {
        self.access_point = None;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        self.scans += 1;
        Ok(self.networks.clone())
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        (self.status == StationStatus::Connected).then(|| Ipv4Addr::new(192, 168, 1, 50))
    }

    fn mac_address(&self) -> String {
        "24:0A:C4:00:11:22".to_string()
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.status = StationStatus::Idle;
    }

    fn erase_credentials(&mut self) -> Result<(), RadioError> {
        self.stored = false;
        self.erased = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

#[derive(Debug, Default)]
pub struct MemoryLink {
    pub server: Option<(String, u16)>,
    /// Whether the broker accepts the next connect.
    pub accept: bool,
    pub connected: bool,
    pub client_ids: Vec<String>,
    pub subscribed: Vec<String>,
    pub subscribed_qos: Vec<QoS>,
    /// Filters the broker refuses to subscribe.
    pub refuse_filters: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub published: Vec<PublishedMessage>,
    pub inbound: VecDeque<InboundMessage>,
}

impl MemoryLink {
    pub fn connected() -> Self {
        Self {
            accept: true,
            connected: true,
            ..Self::default()
        }
    }

    pub fn accepting() -> Self {
        Self {
            accept: true,
            ..Self::default()
        }
    }

    pub fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn drop_connection(&mut self) {
        self.connected = false;
    }

    pub fn payloads_on(&self, topic: &str) -> Vec<&str> {
        self.published
            .iter()
            .filter(|message| message.topic == topic)
            .map(|message| message.payload.as_str())
            .collect()
    }
}

impl MqttLink for MemoryLink {
    fn set_server(&mut self, host: &str, port: u16) {
        self.server = Some((host.to_string(), port));
    }

    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.client_ids.push(client_id.to_string());
        self.connected = self.accept;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        if self.refuse_filters.iter().any(|filter| filter == topic) {
            return Err(LinkError::Rejected(topic.to_string()));
        }
        self.subscribed.push(topic.to_string());
        self.subscribed_qos.push(qos);
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.unsubscribed.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            retained,
        });
        Ok(())
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        if !self.connected {
            return None;
        }
        self.inbound.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct MemoryHttp {
    pub pending: VecDeque<HttpRequest>,
    pub responses: Vec<(u64, HttpResponse)>,
    next_id: u64,
}

impl MemoryHttp {
    pub fn request(&mut self, method: HttpMethod, uri: &str, host: Option<&str>, body: &[u8]) {
        self.next_id += 1;
        self.pending.push_back(HttpRequest {
            id: self.next_id,
            method,
            uri: uri.to_string(),
            host: host.map(str::to_string),
            body: body.to_vec(),
        });
    }

    pub fn get(&mut self, uri: &str) {
        self.request(HttpMethod::Get, uri, Some("10.10.10.10"), b"");
    }

    pub fn post(&mut self, uri: &str, body: &str) {
        self.request(HttpMethod::Post, uri, Some("10.10.10.10"), body.as_bytes());
    }

    pub fn last_response(&self) -> Option<&HttpResponse> {
        self.responses.last().map(|(_, response)| response)
    }

    pub fn last_body(&self) -> String {
        self.last_response()
            .map(|response| String::from_utf8_lossy(&response.body).into_owned())
            .unwrap_or_default()
    }
}

impl HttpPort for MemoryHttp {
    fn next_request(&mut self) -> Option<HttpRequest> {
        self.pending.pop_front()
    }

    fn respond(&mut self, id: u64, response: HttpResponse) {
        self.responses.push((id, response));
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatagram {
    pub inbound: VecDeque<(Vec<u8>, SocketAddr)>,
    pub sent: Vec<(Vec<u8>, SocketAddr)>,
}

impl DatagramPort for MemoryDatagram {
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        let (data, from) = self.inbound.pop_front()?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Some((len, from))
    }

    fn send(&mut self, data: &[u8], to: SocketAddr) {
        self.sent.push((data.to_vec(), to));
    }
}

#[derive(Debug, Default)]
pub struct MemoryFs {
    pub files: HashMap<String, Vec<u8>>,
    pub fail_writes: bool,
    pub formats: usize,
}

impl FileSystem for MemoryFs {
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, FsError> {
        Ok(self.files.get(path).cloned())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        if self.fail_writes {
            return Err(FsError::Io {
                path: path.to_string(),
                message: "read-only".to_string(),
            });
        }
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn format(&mut self) -> Result<(), FsError> {
        self.formats += 1;
        self.files.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingSystem {
    pub restarts: usize,
    pub delays: Vec<u32>,
    pub chip: u32,
}

impl SystemControl for RecordingSystem {
    fn restart(&mut self) {
        self.restarts += 1;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delays.push(ms);
    }

    fn chip_id(&self) -> u32 {
        self.chip
    }
}

#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub connects: usize,
    pub extra_subscription: Option<String>,
    pub messages: Vec<(String, Vec<u8>)>,
    pub saved: Vec<ModuleConfig>,
    /// Messages on this topic lock (`1`) or unlock (`0`) behaviour.
    pub lock_topic: Option<String>,
}

impl RuntimeHooks for RecordingHooks {
    fn on_connected(&mut self, link: &mut dyn MqttLink) {
        self.connects += 1;
        if let Some(topic) = &self.extra_subscription {
            let _ = link.subscribe(topic, QoS::AtMostOnce);
        }
    }

    fn on_message(&mut self, topic: &str, payload: &[u8], control: &mut RuntimeControl) {
        self.messages.push((topic.to_string(), payload.to_vec()));
        if self.lock_topic.as_deref() == Some(topic) {
            match payload {
                b"1" => control.lock_behaviour(),
                b"0" => control.unlock_behaviour(),
                _ => {}
            }
        }
    }

    fn on_save(&mut self, config: &ModuleConfig) {
        self.saved.push(config.clone());
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Gpio = RecordingGpio;
    type Radio = ScriptedRadio;
    type Link = MemoryLink;
    type Http = MemoryHttp;
    type Dns = MemoryDatagram;
    type Fs = MemoryFs;
    type System = RecordingSystem;
    type Hooks = RecordingHooks;
}

pub fn test_board() -> Board<TestPlatform> {
    Board {
        gpio: RecordingGpio::default(),
        radio: ScriptedRadio::default(),
        link: MemoryLink::accepting(),
        http: MemoryHttp::default(),
        dns: MemoryDatagram::default(),
        fs: MemoryFs::default(),
        system: RecordingSystem::default(),
        hooks: RecordingHooks::default(),
    }
}
