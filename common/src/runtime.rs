//! Tick-driven composition of provisioning, broker session and channels.

use log::{debug, error, info, warn};

use crate::{
    channel::{Channel, ChannelRegistry},
    command::{publish_echo, route_message, CommandExecutor, Route},
    config::{DeviceProfile, ModuleConfig},
    error::RegistryError,
    homie::{self, DeviceIdentity},
    ports::{
        Board, FileSystem, HttpMethod, HttpPort, HttpRequest, HttpResponse, MqttLink, Platform,
        RuntimeControl, RuntimeHooks, SystemControl, WifiRadio,
    },
    session::{BrokerSession, LinkEvent},
    store::SettingsStore,
    supervisor::{ConnectionSupervisor, SupervisorOutcome},
    topics::{TopicScheme, FEEDBACK_STATE},
    types::{ChannelStatus, NodeStatus, QoS, RuntimePhase, SessionState},
};

pub const STATUS_PATH: &str = "/api/status";

/// Pause between the filesystem format and the reboot on a hard reset.
const HARD_RESET_SETTLE_MS: u32 = 200;

/// One node, owned by the application loop and advanced through
/// [`DeviceRuntime::tick`].
pub struct DeviceRuntime<P: Platform> {
    board: Board<P>,
    profile: DeviceProfile,
    registry: ChannelRegistry,
    supervisor: ConnectionSupervisor,
    phase: RuntimePhase,
    config: Option<ModuleConfig>,
    topics: Option<TopicScheme>,
    session: Option<BrokerSession>,
    control: RuntimeControl,
}

impl<P: Platform> DeviceRuntime<P> {
    pub fn new(board: Board<P>, profile: DeviceProfile) -> Self {
        let registry = profile.build_registry();
        let ap_ssid = profile.portal_ssid(board.system.chip_id());
        let supervisor =
            ConnectionSupervisor::new(&ap_ssid, profile.feedback_pin, &profile.runtime);
        Self {
            board,
            profile,
            registry,
            supervisor,
            phase: RuntimePhase::Booting,
            config: None,
            topics: None,
            session: None,
            control: RuntimeControl::default(),
        }
    }

    /// Registers a channel beyond those in the profile. Only meaningful
    /// before [`DeviceRuntime::init`].
    pub fn add_channel(&mut self, channel: Channel) -> Result<usize, RegistryError> {
        self.registry.add(channel).inspect_err(|err| {
            warn!("channel rejected: {err}");
        })
    }

    /// Extra `Host` header the portal serves locally.
    pub fn allow_portal_host(&mut self, host: &str) {
        self.supervisor.portal_mut().allow_host(host);
    }

    pub fn phase(&self) -> RuntimePhase {
        self.phase
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn board(&self) -> &Board<P> {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board<P> {
        &mut self.board
    }

    pub fn into_board(self) -> Board<P> {
        self.board
    }

    pub fn module_config(&self) -> Option<&ModuleConfig> {
        self.config.as_ref()
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Disconnected, BrokerSession::state)
    }

    pub fn is_behaviour_locked(&self) -> bool {
        self.control.is_behaviour_locked()
    }

    /// Restores channel settings, drives every pin to its logical state and
    /// starts connecting.
    pub fn init(&mut self, now_ms: u64) {
        let mut store = SettingsStore::new(&mut self.board.fs);
        match store.load_channel_settings(&mut self.registry) {
            Ok(true) => info!("restored settings for {} channels", self.registry.len()),
            Ok(false) => debug!("no stored channel settings"),
            Err(err) => warn!("channel settings unreadable, using defaults: {err}"),
        }
        let stored = store.load_config().unwrap_or_else(|err| {
            warn!("module config unreadable, treating as absent: {err}");
            None
        });

        for channel in self.registry.iter_mut() {
            channel.init_pin(&mut self.board.gpio);
        }

        self.phase = RuntimePhase::Provisioning;
        self.supervisor
            .start(now_ms, stored, &mut self.board.radio, &mut self.board.gpio);
    }

    pub fn tick(&mut self, now_ms: u64) {
        match self.phase {
            RuntimePhase::Booting | RuntimePhase::Restarting => self.serve_pending(),
            RuntimePhase::Provisioning => self.tick_provisioning(now_ms),
            RuntimePhase::Networked => self.tick_networked(now_ms),
            RuntimePhase::Standalone => {
                self.serve_pending();
                self.step_channels(now_ms, false);
            }
        }
    }

    /// The portal owns the HTTP port while provisioning; every other phase
    /// answers queued requests here so the bridge never backs up.
    fn serve_pending(&mut self) {
        while let Some(request) = self.board.http.next_request() {
            let response = self.serve(&request);
            self.board.http.respond(request.id, response);
        }
    }

    fn tick_provisioning(&mut self, now_ms: u64) {
        let outcome = self.supervisor.poll(
            now_ms,
            &mut self.board.radio,
            &mut self.board.http,
            &mut self.board.dns,
            &mut self.board.gpio,
            &mut self.board.system,
        );
        match outcome {
            SupervisorOutcome::Pending => {}
            SupervisorOutcome::Networked {
                config,
                provisioned,
            } => self.enter_networked(config, provisioned),
            SupervisorOutcome::Standalone => {
                warn!("running standalone without network features");
                self.phase = RuntimePhase::Standalone;
            }
        }
    }

    fn enter_networked(&mut self, config: ModuleConfig, provisioned: bool) {
        if provisioned {
            if let Err(err) = SettingsStore::new(&mut self.board.fs).save_config(&config) {
                warn!("could not persist module config: {err}");
            }
            self.board.hooks.on_save(&config);
        }

        let topics = TopicScheme::new(&self.profile.module_type, &config);
        self.board
            .link
            .set_server(&config.mqtt_host, config.mqtt_port_number());
        info!(
            "networked as `{}` at {:?}, broker {}:{}",
            topics.station_name(),
            self.board.radio.local_ip(),
            config.mqtt_host,
            config.mqtt_port
        );
        self.session = Some(BrokerSession::new(
            topics.station_name(),
            &self.profile.runtime,
        ));
        self.topics = Some(topics);
        self.config = Some(config);
        self.phase = RuntimePhase::Networked;
    }

    fn tick_networked(&mut self, now_ms: u64) {
        self.serve_pending();

        let event = match self.session.as_mut() {
            Some(session) => session.poll(now_ms, &mut self.board.link),
            None => LinkEvent::Stopped,
        };
        match event {
            LinkEvent::Established => {
                self.on_established();
                self.service_inbound(now_ms);
            }
            LinkEvent::Online => self.service_inbound(now_ms),
            LinkEvent::Lost
            | LinkEvent::Failed
            | LinkEvent::Pending
            | LinkEvent::Waiting
            | LinkEvent::Stopped => {}
        }
        if self.phase == RuntimePhase::Restarting {
            return;
        }

        let online = self.session.as_ref().is_some_and(BrokerSession::is_online);
        self.step_channels(now_ms, online);
    }

    fn on_established(&mut self) {
        let (Some(session), Some(topics)) = (self.session.as_ref(), self.topics.as_ref()) else {
            return;
        };
        session.subscribe_all(&mut self.board.link, topics, &self.registry);

        let identity = self.profile.firmware.as_ref().map(|firmware| DeviceIdentity {
            friendly_name: self
                .config
                .as_ref()
                .map_or("", |config| config.module_name.as_str()),
            module_type: &self.profile.module_type,
            local_ip: self.board.radio.local_ip(),
            mac: self.board.radio.mac_address(),
            firmware,
        });
        if let Err(err) = homie::announce(
            &mut self.board.link,
            topics,
            identity.as_ref(),
            &self.registry,
        ) {
            warn!("homie announcement failed: {err}");
        }

        self.board.hooks.on_connected(&mut self.board.link);
    }

    fn service_inbound(&mut self, now_ms: u64) {
        for _ in 0..self.profile.runtime.max_messages_per_tick {
            let Some(message) = self.board.link.poll_message() else {
                break;
            };
            self.handle_message(now_ms, &message.topic, &message.payload);
            if self.phase == RuntimePhase::Restarting {
                break;
            }
        }
    }

    /// Internal routing first, then the integrator hook sees every message.
    pub fn handle_message(&mut self, now_ms: u64, topic: &str, payload: &[u8]) {
        let Some(topics) = self.topics.as_ref() else {
            return;
        };

        match route_message(topics, &self.registry, topic) {
            Route::HardReset => {
                self.hard_reset();
                return;
            }
            Route::SoftReset => {
                self.soft_reset();
                return;
            }
            Route::Channel { index, command } => {
                let qos = self
                    .session
                    .as_ref()
                    .map_or(QoS::AtLeastOnce, BrokerSession::qos);
                let result = CommandExecutor {
                    link: &mut self.board.link,
                    gpio: &mut self.board.gpio,
                    registry: &mut self.registry,
                    topics,
                    qos,
                }
                .execute(index, command, payload, now_ms);

                match result {
                    Ok(outcome) => {
                        if outcome.persist {
                            persist_channels(&mut self.board.fs, &self.registry);
                        }
                        if outcome.renamed {
                            if let Some(channel) = self.registry.get(index) {
                                let (name_topic, name) = homie::node_name_message(topics, channel);
                                publish_echo(&mut self.board.link, &name_topic, &name);
                            }
                        }
                    }
                    Err(err) => warn!("dropping command on `{topic}`: {err}"),
                }
            }
            Route::Unmatched => debug!("no internal route for `{topic}`"),
        }

        self.board
            .hooks
            .on_message(topic, payload, &mut self.control);
    }

    /// Auto-revert for outputs (skipped while behaviour is locked) and rate
    /// limited sampling for inputs.
    fn step_channels(&mut self, now_ms: u64, publish: bool) {
        let locked = self.control.is_behaviour_locked();
        for channel in self.registry.iter_mut() {
            let report = if channel.is_output() {
                if locked || !channel.time_is_up(now_ms) {
                    continue;
                }
                debug!("timer elapsed on `{}`, reverting", channel.id());
                channel.revert(now_ms, &mut self.board.gpio);
                true
            } else {
                channel.read(now_ms, &mut self.board.gpio)
            };

            if !(report && publish) {
                continue;
            }
            if let Some(topics) = self.topics.as_ref() {
                let topic = topics.channel_topic(channel.name(), FEEDBACK_STATE);
                publish_echo(&mut self.board.link, &topic, &channel.state().to_string());
            }
        }
    }

    /// Erases persisted files and radio credentials, then reboots.
    pub fn hard_reset(&mut self) {
        warn!("hard reset requested");
        if let Err(err) = SettingsStore::new(&mut self.board.fs).format() {
            error!("filesystem format failed: {err}");
        }
        if let Err(err) = self.board.radio.erase_credentials() {
            error!("erasing wifi credentials failed: {err}");
        }
        self.board.radio.disconnect();
        self.board.system.delay_ms(HARD_RESET_SETTLE_MS);
        self.phase = RuntimePhase::Restarting;
        self.board.system.restart();
    }

    pub fn soft_reset(&mut self) {
        info!("soft reset requested");
        self.phase = RuntimePhase::Restarting;
        self.board.system.restart();
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            station_name: self
                .topics
                .as_ref()
                .map(|topics| topics.station_name().to_string())
                .unwrap_or_default(),
            phase: self.phase.as_str(),
            session: self.session_state().as_str(),
            behaviour_locked: self.control.is_behaviour_locked(),
            broker_attempts: self.session.as_ref().map_or(0, BrokerSession::attempts),
            channels: self
                .registry
                .iter()
                .map(|channel| ChannelStatus {
                    id: channel.id().to_string(),
                    name: channel.name().to_string(),
                    direction: channel.direction().as_str(),
                    analog: channel.is_analog(),
                    state: channel.state(),
                    enabled: channel.is_enabled(),
                    timer_ms: channel.timer_ms(),
                    revert_pending: channel.revert_deadline_ms().is_some(),
                })
                .collect(),
        }
    }

    fn serve(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method, request.path()) {
            (HttpMethod::Get, STATUS_PATH) => match serde_json::to_vec(&self.status()) {
                Ok(body) => HttpResponse::json(body),
                Err(err) => {
                    error!("status encoding failed: {err}");
                    HttpResponse {
                        status: 500,
                        ..HttpResponse::not_found()
                    }
                }
            },
            _ => HttpResponse::not_found(),
        }
    }
}

fn persist_channels(fs: &mut impl FileSystem, registry: &ChannelRegistry) {
    if let Err(err) = SettingsStore::new(fs).save_channel_settings(registry) {
        warn!("channel settings not saved: {err}");
    }
}
