use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use domotic_common::{
    AccessPoint, Board, Credentials, DatagramPort, DeviceProfile, DeviceRuntime, Direction,
    FileSystem, FsError, GpioPort, HttpMethod, HttpPort, HttpRequest, HttpResponse,
    InboundMessage, JoinRequest, LinkError, ModuleConfig, MqttLink, Platform, QoS, RadioError,
    RuntimeControl, RuntimeHooks, RuntimePhase, StationStatus, SystemControl, WifiRadio,
};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const DEFAULT_PROFILE: &str = include_str!("../profile.json");
const TICK_INTERVAL: Duration = Duration::from_millis(10);
const HTTP_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const WIFI_CREDENTIALS_FILE: &str = "wifi.json";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let profile = load_profile()?;
    let data_dir = std::env::var("DOMOTIC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.domotic"));

    let (bridge, http) = http_bridge();
    let app = Router::new()
        .fallback(forward_request)
        .layer(TraceLayer::new_for_http())
        .with_state(bridge);

    let http_port = env_port("DOMOTIC_HTTP_PORT", 8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node server at {addr}"))?;
    info!("node listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("http server stopped: {err}");
        }
    });

    let dns_port = env_port("DOMOTIC_DNS_PORT", 5353);
    let dns = HostDns::bind(dns_port)?;

    let board = Board::<HostPlatform> {
        gpio: LoggingGpio::default(),
        radio: SimulatedRadio::new(data_dir.join(WIFI_CREDENTIALS_FILE)),
        link: HostLink::new(Handle::current()),
        http,
        dns,
        fs: DirFs::new(data_dir),
        system: HostSystem,
        hooks: HostHooks,
    };

    let node = tokio::task::spawn_blocking(move || run_node(profile, board));
    tokio::select! {
        result = node => result.context("node loop panicked")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn load_profile() -> anyhow::Result<DeviceProfile> {
    match std::env::var("DOMOTIC_PROFILE") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read profile {path}"))?;
            DeviceProfile::from_json(&raw).with_context(|| format!("invalid profile {path}"))
        }
        Err(_) => DeviceProfile::from_json(DEFAULT_PROFILE).context("invalid bundled profile"),
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

/// Drives the node until it asks for a restart, then rebuilds it on the same
/// board the way a reboot would.
fn run_node(profile: DeviceProfile, mut board: Board<HostPlatform>) {
    loop {
        let mut runtime = DeviceRuntime::new(board, profile.clone());
        for host in ["localhost", "127.0.0.1"] {
            runtime.allow_portal_host(host);
        }
        runtime.init(monotonic_ms());

        while runtime.phase() != RuntimePhase::Restarting {
            runtime.tick(monotonic_ms());
            thread::sleep(TICK_INTERVAL);
        }

        info!("simulated restart");
        board = runtime.into_board();
        board.link.shutdown();
        board.radio.power_cycle();
    }
}

struct HostPlatform;

impl Platform for HostPlatform {
    type Gpio = LoggingGpio;
    type Radio = SimulatedRadio;
    type Link = HostLink;
    type Http = HostHttp;
    type Dns = HostDns;
    type Fs = DirFs;
    type System = HostSystem;
    type Hooks = HostHooks;
}

struct PendingRequest {
    request: HttpRequest,
    reply: oneshot::Sender<HttpResponse>,
}

#[derive(Clone)]
struct HttpBridge {
    requests: mpsc::UnboundedSender<PendingRequest>,
    next_id: Arc<AtomicU64>,
}

/// Hands axum requests to the tick loop and parks the replies until the
/// runtime answers them.
struct HostHttp {
    requests: mpsc::UnboundedReceiver<PendingRequest>,
    waiting: HashMap<u64, oneshot::Sender<HttpResponse>>,
}

fn http_bridge() -> (HttpBridge, HostHttp) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        HttpBridge {
            requests: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        HostHttp {
            requests: rx,
            waiting: HashMap::new(),
        },
    )
}

impl HttpPort for HostHttp {
    fn next_request(&mut self) -> Option<HttpRequest> {
        let pending = self.requests.try_recv().ok()?;
        self.waiting.insert(pending.request.id, pending.reply);
        Some(pending.request)
    }

    fn respond(&mut self, id: u64, response: HttpResponse) {
        if let Some(reply) = self.waiting.remove(&id) {
            // The client may have given up already.
            let _ = reply.send(response);
        }
    }
}

async fn forward_request(
    State(bridge): State<HttpBridge>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = HttpRequest {
        id: bridge.next_id.fetch_add(1, Ordering::Relaxed),
        method: match method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            _ => HttpMethod::Other,
        },
        uri: uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |value| value.to_string()),
        host: headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(':').next().unwrap_or(value).to_string()),
        body: body.to_vec(),
    };

    let (reply, response) = oneshot::channel();
    if bridge
        .requests
        .send(PendingRequest { request, reply })
        .is_err()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, "node stopped").into_response();
    }

    match tokio::time::timeout(HTTP_REPLY_TIMEOUT, response).await {
        Ok(Ok(response)) => into_axum(response),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "node is not serving http").into_response(),
    }
}

fn into_axum(response: HttpResponse) -> Response {
    let mut builder = Response::builder()
        .status(response.status)
        .header(header::CONTENT_TYPE, response.content_type);
    if let Some(location) = &response.location {
        builder = builder.header(header::LOCATION, location);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|err| {
            warn!("failed to build http response: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

struct HostDns {
    socket: UdpSocket,
}

impl HostDns {
    fn bind(port: u16) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("failed to bind dns socket at {addr}"))?;
        socket
            .set_nonblocking(true)
            .context("failed to make dns socket non-blocking")?;
        info!("captive dns listening on udp://{addr}");
        Ok(Self { socket })
    }
}

impl DatagramPort for HostDns {
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

/// rumqttc client whose event loop runs on the tokio runtime while the node
/// polls it from the blocking tick thread.
struct HostLink {
    handle: Handle,
    server: Option<(String, u16)>,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

impl HostLink {
    fn new(handle: Handle) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        Self {
            handle,
            server: None,
            client: None,
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound,
        }
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn client(&self) -> Result<&AsyncClient, LinkError> {
        match &self.client {
            Some(client) if self.is_connected() => Ok(client),
            _ => Err(LinkError::NotConnected),
        }
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

impl MqttLink for HostLink {
    fn set_server(&mut self, host: &str, port: u16) {
        self.server = Some((host.to_string(), port));
    }

    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.shutdown();

        let (host, port) = self
            .server
            .clone()
            .ok_or_else(|| LinkError::Rejected("no broker configured".to_string()))?;
        let host = std::env::var("MQTT_HOST").unwrap_or(host);
        let port = env_port("MQTT_PORT", port);

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let connected = self.connected.clone();
        let inbound = self.inbound_tx.clone();
        let task = self.handle.spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("mqtt connected");
                            connected.store(true, Ordering::SeqCst);
                        } else {
                            warn!("mqtt connection refused: {:?}", ack.code);
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        let message = InboundMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        };
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        self.client = Some(client);
        self.task = Some(task);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.client()?
            .try_subscribe(topic, to_rumqttc(qos))
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.client()?
            .try_unsubscribe(topic)
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> Result<(), LinkError> {
        self.client()?
            .try_publish(topic, rumqttc::QoS::AtMostOnce, retained, payload.to_vec())
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.inbound.try_recv().ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredentials {
    ssid: String,
}

/// Stand-in radio: joins succeed at once and the last credentials survive
/// restarts in a file next to the settings.
struct SimulatedRadio {
    credentials_path: PathBuf,
    status: StationStatus,
    access_point: Option<String>,
}

impl SimulatedRadio {
    fn new(credentials_path: PathBuf) -> Self {
        Self {
            credentials_path,
            status: StationStatus::Idle,
            access_point: None,
        }
    }

    fn power_cycle(&mut self) {
        self.status = StationStatus::Idle;
        self.access_point = None;
    }

    fn stored_ssid(&self) -> Option<String> {
        let raw = std::fs::read(&self.credentials_path).ok()?;
        serde_json::from_slice::<StoredCredentials>(&raw)
            .inspect_err(|err| warn!("ignoring unreadable wifi credentials: {err}"))
            .ok()
            .map(|stored| stored.ssid)
    }

    fn store(&self, credentials: &Credentials) -> Result<(), RadioError> {
        let stored = StoredCredentials {
            ssid: credentials.ssid.to_string(),
        };
        let raw =
            serde_json::to_vec_pretty(&stored).map_err(|err| RadioError::Driver(err.to_string()))?;
        if let Some(parent) = self.credentials_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| RadioError::Driver(err.to_string()))?;
        }
        std::fs::write(&self.credentials_path, raw).map_err(|err| RadioError::Driver(err.to_string()))
    }
}

impl WifiRadio for SimulatedRadio {
    fn has_stored_credentials(&self) -> bool {
        self.stored_ssid().is_some()
    }

    fn begin_join(&mut self, request: JoinRequest) -> Result<(), RadioError> {
        let ssid = match request {
            JoinRequest::Stored => self.stored_ssid(),
            JoinRequest::New(credentials) => {
                self.store(&credentials)?;
                Some(credentials.ssid.to_string())
            }
        };
        self.status = match ssid {
            Some(ssid) => {
                info!("joined simulated network `{ssid}`");
                StationStatus::Connected
            }
            None => StationStatus::Failed,
        };
        Ok(())
    }

    fn station_status(&mut self) -> StationStatus {
        self.status
    }

    fn start_access_point(&mut self, ssid: &str, address: Ipv4Addr) -> Result<(), RadioError> {
        info!("simulated access point `{ssid}` at {address}");
        self.access_point = Some(ssid.to_string());
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), RadioError> {
        if let Some(ssid) = self.access_point.take() {
            info!("simulated access point `{ssid}` stopped");
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<AccessPoint>, RadioError> {
        let mut open = AccessPoint::new("cafe-guest", -82);
        open.secured = false;
        Ok(vec![
            AccessPoint::new("home", -48),
            AccessPoint::new("home", -63),
            AccessPoint::new("neighbour", -71),
            open,
            AccessPoint::new("far-away", -97),
        ])
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        (self.status == StationStatus::Connected).then_some(Ipv4Addr::LOCALHOST)
    }

    fn mac_address(&self) -> String {
        "02:00:00:00:00:01".to_string()
    }

    fn disconnect(&mut self) {
        self.status = StationStatus::Idle;
    }

    fn erase_credentials(&mut self) -> Result<(), RadioError> {
        match std::fs::remove_file(&self.credentials_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RadioError::Driver(err.to_string())),
        }
    }
}

/// Settings files live under the data directory, keyed by their device path.
struct DirFs {
    root: PathBuf,
}

impl DirFs {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn io_error(path: &str, err: std::io::Error) -> FsError {
    FsError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

impl FileSystem for DirFs {
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, FsError> {
        match std::fs::read(self.resolve(path)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        std::fs::create_dir_all(&self.root).map_err(|err| io_error(path, err))?;
        std::fs::write(self.resolve(path), data).map_err(|err| io_error(path, err))
    }

    fn format(&mut self) -> Result<(), FsError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error("/", err)),
        }
        std::fs::create_dir_all(&self.root).map_err(|err| io_error("/", err))
    }
}

#[derive(Default)]
struct LoggingGpio {
    levels: HashMap<u8, u16>,
}

impl GpioPort for LoggingGpio {
    fn configure(&mut self, pin: u8, direction: Direction) {
        debug!("gpio {pin} configured as {}", direction.as_str());
        self.levels.entry(pin).or_insert(0);
    }

    fn digital_write(&mut self, pin: u8, high: bool) {
        let level = u16::from(high);
        if self.levels.insert(pin, level) != Some(level) {
            info!("gpio {pin} -> {level}");
        }
    }

    fn digital_read(&mut self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(0) > 0
    }

    fn analog_write(&mut self, pin: u8, value: u16) {
        if self.levels.insert(pin, value) != Some(value) {
            info!("gpio {pin} -> {value} (analog)");
        }
    }

    fn analog_read(&mut self, pin: u8) -> u16 {
        self.levels.get(&pin).copied().unwrap_or(0)
    }
}

struct HostSystem;

impl SystemControl for HostSystem {
    fn restart(&mut self) {
        info!("restart requested");
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn chip_id(&self) -> u32 {
        std::process::id()
    }
}

struct HostHooks;

impl RuntimeHooks for HostHooks {
    fn on_connected(&mut self, _link: &mut dyn MqttLink) {
        info!("node online");
    }

    fn on_message(&mut self, topic: &str, payload: &[u8], _control: &mut RuntimeControl) {
        debug!("mqtt {topic} <- {}", String::from_utf8_lossy(payload));
    }

    fn on_save(&mut self, config: &ModuleConfig) {
        info!(
            "saved configuration for {}/{} via {}:{}",
            config.module_location, config.module_name, config.mqtt_host, config.mqtt_port
        );
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
