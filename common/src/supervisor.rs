use log::info;

use crate::{
    config::{FeedbackPattern, ModuleConfig, RuntimeConfig},
    feedback::FeedbackBlinker,
    ports::{DatagramPort, GpioPort, HttpPort, SystemControl, WifiRadio},
    provisioning::{CredentialSource, PortalOutcome, ProvisioningPortal},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    Pending,
    /// `provisioned` is set when the parameters came from the portal form and
    /// still need to be persisted.
    Networked {
        config: ModuleConfig,
        provisioned: bool,
    },
    Standalone,
}

/// Startup decision between the stored network and the captive portal.
///
/// The outcome is settled once; only a reset runs the supervisor again.
pub struct ConnectionSupervisor {
    portal: ProvisioningPortal,
    blinker: FeedbackBlinker,
    success_pattern: FeedbackPattern,
    failure_pattern: FeedbackPattern,
}

impl ConnectionSupervisor {
    pub fn new(ap_ssid: &str, feedback_pin: Option<u8>, runtime: &RuntimeConfig) -> Self {
        Self {
            portal: ProvisioningPortal::new(ap_ssid, runtime),
            blinker: FeedbackBlinker::new(feedback_pin, runtime.feedback_blink_ms),
            success_pattern: runtime.success_pattern,
            failure_pattern: runtime.failure_pattern,
        }
    }

    pub fn portal(&self) -> &ProvisioningPortal {
        &self.portal
    }

    pub fn portal_mut(&mut self) -> &mut ProvisioningPortal {
        &mut self.portal
    }

    /// A complete stored config plus radio credentials goes straight to a
    /// station join; anything less opens the portal.
    pub fn start(
        &mut self,
        now_ms: u64,
        stored: Option<ModuleConfig>,
        radio: &mut impl WifiRadio,
        gpio: &mut impl GpioPort,
    ) {
        self.blinker.configure(gpio);
        let complete = stored
            .as_ref()
            .is_some_and(|config| config.missing_required().is_none());
        if let Some(config) = stored {
            self.portal.prefill(config);
        }

        if complete && radio.has_stored_credentials() {
            self.portal.begin_stored(now_ms, radio);
        } else {
            info!("no usable stored configuration, opening config portal");
            self.portal.open(now_ms, radio);
        }
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        radio: &mut impl WifiRadio,
        http: &mut impl HttpPort,
        dns: &mut impl DatagramPort,
        gpio: &mut impl GpioPort,
        system: &mut impl SystemControl,
    ) -> SupervisorOutcome {
        self.blinker.tick(now_ms, gpio);
        match self.portal.poll(now_ms, radio, http, dns) {
            PortalOutcome::Pending => SupervisorOutcome::Pending,
            PortalOutcome::Connected { config, source } => {
                self.blinker.play(self.success_pattern, gpio, system);
                SupervisorOutcome::Networked {
                    config,
                    provisioned: source == CredentialSource::Portal,
                }
            }
            PortalOutcome::TimedOut => {
                info!("provisioning gave up, running standalone");
                self.blinker.play(self.failure_pattern, gpio, system);
                SupervisorOutcome::Standalone
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ports::JoinRequest,
        testing::{MemoryDatagram, MemoryHttp, RecordingGpio, RecordingSystem, ScriptedRadio},
        types::StationStatus,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        supervisor: ConnectionSupervisor,
        radio: ScriptedRadio,
        http: MemoryHttp,
        dns: MemoryDatagram,
        gpio: RecordingGpio,
        system: RecordingSystem,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                supervisor: ConnectionSupervisor::new(
                    "Proeza domotic 7",
                    Some(2),
                    &RuntimeConfig::default(),
                ),
                radio: ScriptedRadio::default(),
                http: MemoryHttp::default(),
                dns: MemoryDatagram::default(),
                gpio: RecordingGpio::default(),
                system: RecordingSystem::default(),
            }
        }

        fn start(&mut self, stored: Option<ModuleConfig>) {
            self.supervisor
                .start(0, stored, &mut self.radio, &mut self.gpio);
        }

        fn poll(&mut self, now_ms: u64) -> SupervisorOutcome {
            self.supervisor.poll(
                now_ms,
                &mut self.radio,
                &mut self.http,
                &mut self.dns,
                &mut self.gpio,
                &mut self.system,
            )
        }
    }

    fn stored_config() -> ModuleConfig {
        ModuleConfig {
            mqtt_host: "192.168.1.2".to_string(),
            mqtt_port: "1883".to_string(),
            module_name: "pump".to_string(),
            module_location: "garden".to_string(),
        }
    }

    #[test]
    fn stored_config_joins_without_portal() {
        let mut fixture = Fixture::new();
        fixture.radio.stored = true;
        fixture.radio.join_outcome = StationStatus::Connected;

        fixture.start(Some(stored_config()));
        let outcome = fixture.poll(10);

        assert_eq!(
            outcome,
            SupervisorOutcome::Networked {
                config: stored_config(),
                provisioned: false,
            }
        );
        assert_eq!(fixture.radio.joins, vec![JoinRequest::Stored]);
        assert_eq!(fixture.radio.ap_starts, 0);
        assert_eq!(fixture.system.delays, vec![100; 20]);
    }

    #[test]
    fn missing_config_opens_portal() {
        let mut fixture = Fixture::new();
        fixture.radio.stored = true;

        fixture.start(None);

        assert_eq!(fixture.radio.ap_starts, 1);
        assert!(fixture.radio.joins.is_empty());
        assert_eq!(fixture.poll(10), SupervisorOutcome::Pending);
    }

    #[test]
    fn incomplete_config_opens_portal_with_prefilled_values() {
        let mut fixture = Fixture::new();
        fixture.radio.stored = true;
        let partial = ModuleConfig {
            mqtt_host: String::new(),
            ..stored_config()
        };

        fixture.start(Some(partial));
        fixture.http.get("/config");
        fixture.poll(10);

        assert_eq!(fixture.radio.ap_starts, 1);
        assert!(fixture.http.last_body().contains("value=\"garden\""));
    }

    #[test]
    fn portal_timeout_plays_failure_pattern_and_runs_standalone() {
        let mut fixture = Fixture::new();
        fixture.start(None);

        assert_eq!(fixture.poll(59_999), SupervisorOutcome::Pending);
        assert_eq!(fixture.poll(60_000), SupervisorOutcome::Standalone);
        assert_eq!(fixture.system.delays, vec![2_000, 2_000]);
    }

    #[test]
    fn indicator_blinks_while_waiting() {
        let mut fixture = Fixture::new();
        fixture.start(None);
        let configured_writes = fixture.gpio.writes.len();

        for now in [0, 100, 300, 600] {
            fixture.poll(now);
        }

        let toggles: Vec<_> = fixture.gpio.writes[configured_writes..].to_vec();
        assert_eq!(toggles, vec![(2, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn portal_credentials_are_reported_for_saving() {
        let mut fixture = Fixture::new();
        fixture.radio.join_outcome = StationStatus::Connected;
        fixture.start(None);
        fixture.http.post(
            "/wifisave",
            "s=Home&p=pw&moduleLocation=garden&moduleName=pump&mqttHost=192.168.1.2&mqttPort=1883",
        );

        fixture.poll(10);
        let outcome = fixture.poll(20);

        assert_eq!(
            outcome,
            SupervisorOutcome::Networked {
                config: stored_config(),
                provisioned: true,
            }
        );
    }
}
