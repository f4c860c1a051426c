use core::convert::TryInto;
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use domotic_common::{
    channel::ANALOG_MAX, store::PERSISTED_PATHS, AccessPoint, Board, DatagramPort, DeviceProfile,
    DeviceRuntime, Direction, FileSystem, FsError, GpioPort, HttpMethod, HttpPort, HttpRequest,
    HttpResponse, InboundMessage, JoinRequest, LinkError, MqttLink, NoHooks, Platform, QoS,
    RadioError, StationStatus, SystemControl, WifiRadio,
};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS as MqttQoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyInputPin, AnyOutputPin, Input, Level, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvs, EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{debug, info, warn};

const PROFILE: &str = include_str!("../profile.json");
const NVS_NAMESPACE: &str = "domotic";
const NVS_VALUE_MAX: usize = 4096;
const MAX_HTTP_BODY: usize = 2048;
const HTTP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_PORT: u16 = 53;
const TICK_INTERVAL: Duration = Duration::from_millis(10);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let profile = DeviceProfile::from_json(PROFILE).context("invalid bundled profile")?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition.clone()))
        .context("failed to bring up the wifi driver")?;
    let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;

    let (requests_tx, requests) = mpsc::channel();
    // Dropping the server unregisters every handler.
    let _server = create_http_server(requests_tx)?;

    let board = Board::<EspPlatform> {
        gpio: EspGpio::default(),
        radio: EspRadio::new(wifi),
        link: EspLink::new(),
        http: EspHttp {
            requests,
            waiting: HashMap::new(),
        },
        dns: EspDns::bind(DNS_PORT)?,
        fs: NvsFs { nvs },
        system: EspSystem::new(),
        hooks: NoHooks,
    };

    let mut runtime = DeviceRuntime::new(board, profile);
    runtime.init(monotonic_ms());
    loop {
        runtime.tick(monotonic_ms());
        thread::sleep(TICK_INTERVAL);
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    type Gpio = EspGpio;
    type Radio = EspRadio;
    type Link = EspLink;
    type Http = EspHttp;
    type Dns = EspDns;
    type Fs = NvsFs;
    type System = EspSystem;
    type Hooks = NoHooks;
}

enum Line {
    Input(PinDriver<'static, AnyInputPin, Input>),
    Output(PinDriver<'static, AnyOutputPin, Output>),
}

/// No ADC or PWM wiring yet: analog channels are driven and sampled as
/// digital lines scaled to the analog range.
#[derive(Default)]
struct EspGpio {
    lines: HashMap<u8, Line>,
}

impl GpioPort for EspGpio {
    fn configure(&mut self, pin: u8, direction: Direction) {
        let gpio = i32::from(pin);
        let line = match direction {
            Direction::Output => {
                unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }.map(Line::Output)
            }
            Direction::Input => unsafe { PinDriver::input(AnyInputPin::new(gpio)) }.map(Line::Input),
        };
        match line {
            Ok(line) => {
                self.lines.insert(pin, line);
            }
            Err(err) => warn!("GPIO{pin} unavailable as {}: {err}", direction.as_str()),
        }
    }

    fn digital_write(&mut self, pin: u8, high: bool) {
        match self.lines.get_mut(&pin) {
            Some(Line::Output(driver)) => {
                if let Err(err) = driver.set_level(Level::from(high)) {
                    warn!("failed to drive GPIO{pin}: {err}");
                }
            }
            _ => debug!("GPIO{pin} is not configured as an output"),
        }
    }

    fn digital_read(&mut self, pin: u8) -> bool {
        match self.lines.get(&pin) {
            Some(Line::Input(driver)) => driver.is_high(),
            Some(Line::Output(driver)) => driver.is_set_high(),
            None => false,
        }
    }

    fn analog_write(&mut self, pin: u8, value: u16) {
        self.digital_write(pin, value > 0);
    }

    fn analog_read(&mut self, pin: u8) -> u16 {
        if self.digital_read(pin) {
            ANALOG_MAX
        } else {
            0
        }
    }
}

fn driver_error(err: EspError) -> RadioError {
    RadioError::Driver(err.to_string())
}

/// Station plus optional provisioning AP on one driver. Joins are started
/// without blocking; the tick loop watches the netif come up.
struct EspRadio {
    wifi: EspWifi<'static>,
    access_point: Option<AccessPointConfiguration>,
    ap_address: Option<Ipv4Addr>,
    joining: bool,
}

impl EspRadio {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            access_point: None,
            ap_address: None,
            joining: false,
        }
    }

    fn current_client(&self) -> ClientConfiguration {
        match self.wifi.get_configuration() {
            Ok(Configuration::Client(client)) | Ok(Configuration::Mixed(client, _)) => client,
            _ => ClientConfiguration::default(),
        }
    }

    fn apply(&mut self, client: ClientConfiguration) -> Result<(), RadioError> {
        let configuration = match &self.access_point {
            Some(access_point) => Configuration::Mixed(client, access_point.clone()),
            None => Configuration::Client(client),
        };
        self.wifi
            .set_configuration(&configuration)
            .map_err(driver_error)?;
        if !self.wifi.is_started().map_err(driver_error)? {
            self.wifi.start().map_err(driver_error)?;
        }
        Ok(())
    }

    fn use_ap_address(&mut self, address: Ipv4Addr) -> Result<(), RadioError> {
        if self.ap_address == Some(address) {
            return Ok(());
        }
        let conf = NetifConfiguration {
            ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: address,
                    mask: Mask(24),
                },
                dhcp_enabled: true,
                dns: Some(address),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        };
        let netif = EspNetif::new_with_conf(&conf).map_err(driver_error)?;
        self.wifi.swap_netif_ap(netif).map_err(driver_error)?;
        self.ap_address = Some(address);
        Ok(())
    }
}

impl WifiRadio for EspRadio {
    fn has_stored_credentials(&self) -> bool {
        !self.current_client().ssid.is_empty()
    }

    fn begin_join(&mut self, request: JoinRequest) -> Result<(), RadioError> {
        let client = match request {
            JoinRequest::Stored => self.current_client(),
            JoinRequest::New(credentials) => ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError::CredentialTooLong("ssid"))?,
                auth_method: if credentials.password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPAWPA2Personal
                },
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| RadioError::CredentialTooLong("password"))?,
                ..Default::default()
            },
        };
        info!("joining `{}`", client.ssid);
        self.apply(client)?;
        self.wifi.connect().map_err(driver_error)?;
        self.joining = true;
        Ok(())
    }

    fn station_status(&mut self) -> StationStatus {
        let connected = self.wifi.is_connected().unwrap_or(false)
            && self.wifi.sta_netif().is_up().unwrap_or(false);
        if connected {
            self.joining = false;
            StationStatus::Connected
        } else if self.joining {
            StationStatus::Connecting
        } else {
            StationStatus::Idle
        }
    }

    fn start_access_point(&mut self, ssid: &str, address: Ipv4Addr) -> Result<(), RadioError> {
        self.use_ap_address(address)?;
        self.access_point = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::CredentialTooLong("ssid"))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        });
        let client = self.current_client();
        self.apply(client)?;
        info!("provisioning AP `{ssid}` up at {address}");
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), RadioError> {
        if self.access_point.take().is_some() {
            let client = self.current_client();
            self.apply(client)?;
            info!("provisioning AP stopped");
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        let found = self.wifi.scan().map_err(driver_error)?;
        Ok(found
            .iter()
            .map(|info| {
                let mut network = AccessPoint::new(info.ssid.as_str(), info.signal_strength);
                network.channel = info.channel;
                network.secured = !matches!(info.auth_method, None | Some(AuthMethod::None));
                network
            })
            .collect())
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        if !self.wifi.is_connected().unwrap_or(false) {
            return None;
        }
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn mac_address(&self) -> String {
        match self.wifi.sta_netif().get_mac() {
            Ok(mac) => mac
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
            Err(err) => {
                warn!("failed to read station MAC: {err}");
                String::new()
            }
        }
    }

    fn disconnect(&mut self) {
        self.joining = false;
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err}");
        }
    }

    fn erase_credentials(&mut self) -> Result<(), RadioError> {
        self.access_point = None;
        self.apply(ClientConfiguration::default())
    }
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

fn transport_error(err: EspError) -> LinkError {
    LinkError::Transport(err.to_string())
}

/// Each connection gets its own `connected` flag so a dying receiver thread
/// cannot clear the state of its replacement.
struct EspLink {
    url: Option<String>,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound: mpsc::Receiver<InboundMessage>,
}

impl EspLink {
    fn new() -> Self {
        let (inbound_tx, inbound) = mpsc::channel();
        Self {
            url: None,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound,
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, LinkError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(LinkError::NotConnected);
        }
        self.client.as_mut().ok_or(LinkError::NotConnected)
    }
}

impl MqttLink for EspLink {
    fn set_server(&mut self, host: &str, port: u16) {
        self.url = Some(format!("mqtt://{host}:{port}"));
    }

    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.client = None;
        self.connected = Arc::new(AtomicBool::new(false));

        let url = self
            .url
            .clone()
            .ok_or_else(|| LinkError::Rejected("no broker configured".to_string()))?;
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            ..Default::default()
        };
        let (client, conn) = EspMqttClient::new(url.as_str(), &conf).map_err(transport_error)?;
        spawn_mqtt_receiver(conn, self.connected.clone(), self.inbound_tx.clone())
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client()?
            .subscribe(topic, to_mqtt_qos(qos))
            .map(|_| ())
            .map_err(transport_error)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client()?
            .unsubscribe(topic)
            .map(|_| ())
            .map_err(transport_error)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), LinkError> {
        self.client()?
            .publish(topic, MqttQoS::AtMostOnce, retained, payload)
            .map(|_| ())
            .map_err(transport_error)
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.inbound.try_recv().ok()
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    connected: Arc<AtomicBool>,
    inbound: mpsc::Sender<InboundMessage>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        let message = InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    EventPayload::Received { .. } => {
                        warn!("dropping fragmented mqtt message");
                    }
                    _ => {}
                }
            }
            connected.store(false, Ordering::Relaxed);
        })
        .map(|_| ())
}

struct PendingRequest {
    request: HttpRequest,
    reply: mpsc::SyncSender<HttpResponse>,
}

struct EspHttp {
    requests: mpsc::Receiver<PendingRequest>,
    waiting: HashMap<u64, mpsc::SyncSender<HttpResponse>>,
}

impl HttpPort for EspHttp {
    fn next_request(&mut self) -> Option<HttpRequest> {
        let pending = self.requests.try_recv().ok()?;
        self.waiting.insert(pending.request.id, pending.reply);
        Some(pending.request)
    }

    fn respond(&mut self, id: u64, response: HttpResponse) {
        if let Some(reply) = self.waiting.remove(&id) {
            // The handler may have timed out already.
            let _ = reply.try_send(response);
        }
    }
}

/// Every GET and POST is parked on a channel until the tick loop answers it.
fn create_http_server(
    requests: mpsc::Sender<PendingRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;
    let next_id = Arc::new(AtomicU32::new(1));

    for (method, mapped) in [(Method::Get, HttpMethod::Get), (Method::Post, HttpMethod::Post)] {
        let requests = requests.clone();
        let next_id = next_id.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request = HttpRequest {
                id: u64::from(next_id.fetch_add(1, Ordering::Relaxed)),
                method: mapped,
                uri: req.uri().to_string(),
                host: req
                    .header("Host")
                    .map(|host| host.split(':').next().unwrap_or(host).to_string()),
                body,
            };

            let (reply, response) = mpsc::sync_channel(1);
            requests
                .send(PendingRequest { request, reply })
                .map_err(|_| anyhow!("node loop stopped"))?;
            match response.recv_timeout(HTTP_REPLY_TIMEOUT) {
                Ok(response) => write_response(req, &response),
                Err(_) => write_response(
                    req,
                    &HttpResponse {
                        status: 503,
                        content_type: "text/plain; charset=utf-8",
                        location: None,
                        body: b"node is not serving http".to_vec(),
                    },
                ),
            }
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: &HttpResponse,
) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(location) = response.location.as_deref() {
        headers.push(("Location", location));
    }
    req.into_response(response.status, None, &headers)?
        .write_all(&response.body)?;
    Ok(())
}

struct EspDns {
    socket: UdpSocket,
}

impl EspDns {
    fn bind(port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .with_context(|| format!("failed to bind dns socket on port {port}"))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl DatagramPort for EspDns {
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok(received) => Some(received),
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) => {
                debug!("dns receive failed: {err}");
                None
            }
        }
    }

    fn send(&mut self, data: &[u8], to: SocketAddr) {
        if let Err(err) = self.socket.send_to(data, to) {
            warn!("dns reply to {to} failed: {err}");
        }
    }
}

/// Settings documents stored as NVS strings, one key per device path.
struct NvsFs {
    nvs: EspDefaultNvs,
}

fn nvs_key(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches(".json")
}

fn nvs_error(path: &str, err: impl std::fmt::Display) -> FsError {
    FsError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

impl FileSystem for NvsFs {
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, FsError> {
        let mut buffer = vec![0_u8; NVS_VALUE_MAX];
        let value = self
            .nvs
            .get_str(nvs_key(path), &mut buffer)
            .map_err(|err| nvs_error(path, err))?;
        Ok(value.map(|value| value.as_bytes().to_vec()))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let value = std::str::from_utf8(data).map_err(|err| nvs_error(path, err))?;
        self.nvs
            .set_str(nvs_key(path), value)
            .map_err(|err| nvs_error(path, err))
    }

    fn format(&mut self) -> Result<(), FsError> {
        for path in PERSISTED_PATHS {
            self.nvs
                .remove(nvs_key(path))
                .map_err(|err| nvs_error(path, err))?;
        }
        Ok(())
    }
}

struct EspSystem {
    chip_id: u32,
}

impl EspSystem {
    fn new() -> Self {
        let mut mac = [0_u8; 6];
        let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("failed to read factory MAC: esp_err_t={rc}");
        }
        Self {
            chip_id: u32::from_be_bytes([0, mac[3], mac[4], mac[5]]),
        }
    }
}

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("restarting");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn chip_id(&self) -> u32 {
        self.chip_id
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
