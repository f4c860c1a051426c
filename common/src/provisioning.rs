//! Captive configuration portal.
//!
//! The portal is a sub-state machine advanced by [`ProvisioningPortal::poll`]
//! once per tick: it answers captive DNS queries, serves the form, and
//! watches a pending station join until it resolves or times out.

use std::net::Ipv4Addr;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    config::{ModuleConfig, RuntimeConfig, PORTAL_PARAMS},
    dns::CaptiveDns,
    ports::{
        Credentials, DatagramPort, HttpMethod, HttpPort, HttpRequest, HttpResponse, JoinRequest,
        WifiRadio,
    },
    scan::{rank_networks, AccessPoint},
    types::StationStatus,
};

/// OS connectivity checks that should land on the portal page.
pub const CAPTIVE_PROBE_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

const FIELD_SSID: &str = "s";
const FIELD_PASSWORD: &str = "p";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Credentials the radio persisted from an earlier join.
    Stored,
    /// Credentials submitted through the portal form.
    Portal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Idle,
    ScanAndServe,
    AwaitingCredentials,
    Connecting {
        source: CredentialSource,
        deadline_ms: u64,
    },
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalOutcome {
    Pending,
    Connected {
        config: ModuleConfig,
        source: CredentialSource,
    },
    /// Nobody completed the form before the portal timeout.
    TimedOut,
}

#[derive(Debug, Serialize)]
struct ScanEntry<'a> {
    ssid: &'a str,
    rssi: i8,
    quality: u8,
    secured: bool,
}

pub struct ProvisioningPortal {
    state: PortalState,
    ap_ssid: String,
    address: Ipv4Addr,
    allowed_hosts: Vec<String>,
    dns: CaptiveDns,
    networks: Vec<AccessPoint>,
    min_quality: u8,
    join_timeout_ms: u64,
    portal_timeout_ms: u64,
    idle_deadline_ms: Option<u64>,
    ap_active: bool,
    config: ModuleConfig,
    notice: Option<String>,
}

impl ProvisioningPortal {
    pub fn new(ap_ssid: &str, runtime: &RuntimeConfig) -> Self {
        let address = runtime.ap_address();
        Self {
            state: PortalState::Idle,
            ap_ssid: ap_ssid.to_string(),
            address,
            allowed_hosts: vec![address.to_string()],
            dns: CaptiveDns::new(address),
            networks: Vec::new(),
            min_quality: runtime.min_signal_quality,
            join_timeout_ms: runtime.wifi_connect_timeout_ms,
            portal_timeout_ms: runtime.config_portal_timeout_ms,
            idle_deadline_ms: None,
            ap_active: false,
            config: ModuleConfig::default(),
            notice: None,
        }
    }

    /// Extra `Host` values answered locally instead of redirected.
    pub fn allow_host(&mut self, host: &str) {
        self.allowed_hosts.push(host.to_ascii_lowercase());
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    pub fn networks(&self) -> &[AccessPoint] {
        &self.networks
    }

    pub fn is_serving(&self) -> bool {
        self.ap_active
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Values shown on the form and handed back on success.
    pub fn prefill(&mut self, config: ModuleConfig) {
        self.config = config;
    }

    /// Rejoins with the radio's stored credentials. A failed join falls back
    /// to the portal.
    pub fn begin_stored(&mut self, now_ms: u64, radio: &mut impl WifiRadio) {
        match radio.begin_join(JoinRequest::Stored) {
            Ok(()) => {
                info!("joining stored network");
                self.state = PortalState::Connecting {
                    source: CredentialSource::Stored,
                    deadline_ms: now_ms.saturating_add(self.join_timeout_ms),
                };
            }
            Err(err) => {
                warn!("stored join could not start: {err}");
                self.open(now_ms, radio);
            }
        }
    }

    /// Brings up the access point, scans, and starts serving the form.
    pub fn open(&mut self, now_ms: u64, radio: &mut impl WifiRadio) {
        if !self.ap_active {
            if let Err(err) = radio.start_access_point(&self.ap_ssid, self.address) {
                warn!("config portal access point failed: {err}");
                self.state = PortalState::Failed;
                self.idle_deadline_ms = Some(now_ms);
                return;
            }
            self.ap_active = true;
            info!("config portal `{}` up at {}", self.ap_ssid, self.address);
        }
        self.rescan(radio);
        self.state = PortalState::ScanAndServe;
        self.touch(now_ms);
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        radio: &mut impl WifiRadio,
        http: &mut impl HttpPort,
        dns: &mut impl DatagramPort,
    ) -> PortalOutcome {
        if let PortalState::Connecting {
            source,
            deadline_ms,
        } = self.state
        {
            match radio.station_status() {
                StationStatus::Connected => return self.finish(source, radio),
                StationStatus::Failed => {
                    warn!("station join failed");
                    self.join_failed(source, now_ms, radio);
                }
                _ if now_ms >= deadline_ms => {
                    warn!("station join timed out after {} ms", self.join_timeout_ms);
                    radio.disconnect();
                    self.join_failed(source, now_ms, radio);
                }
                _ => {}
            }
        }

        if !self.ap_active {
            return match self.state {
                PortalState::Failed => PortalOutcome::TimedOut,
                _ => PortalOutcome::Pending,
            };
        }

        self.dns.poll(dns);
        while let Some(request) = http.next_request() {
            let id = request.id;
            let response = self.handle(&request, now_ms, radio);
            http.respond(id, response);
        }

        let connecting = matches!(self.state, PortalState::Connecting { .. });
        if !connecting
            && self.portal_timeout_ms > 0
            && self.idle_deadline_ms.is_some_and(|deadline| now_ms >= deadline)
        {
            info!("config portal timed out");
            self.close(radio);
            self.state = PortalState::Failed;
            return PortalOutcome::TimedOut;
        }
        PortalOutcome::Pending
    }

    fn finish(&mut self, source: CredentialSource, radio: &mut impl WifiRadio) -> PortalOutcome {
        info!("station connected ({source:?} credentials)");
        self.close(radio);
        self.state = PortalState::Connected;
        PortalOutcome::Connected {
            config: self.config.clone(),
            source,
        }
    }

    fn join_failed(&mut self, source: CredentialSource, now_ms: u64, radio: &mut impl WifiRadio) {
        match source {
            CredentialSource::Stored => self.open(now_ms, radio),
            CredentialSource::Portal => {
                self.notice = Some("Could not join the network, check the password.".to_string());
                self.state = PortalState::Failed;
                self.touch(now_ms);
            }
        }
    }

    fn close(&mut self, radio: &mut impl WifiRadio) {
        if self.ap_active {
            if let Err(err) = radio.stop_access_point() {
                warn!("stopping config portal access point failed: {err}");
            }
            self.ap_active = false;
        }
        self.idle_deadline_ms = None;
    }

    fn touch(&mut self, now_ms: u64) {
        self.idle_deadline_ms = Some(now_ms.saturating_add(self.portal_timeout_ms));
    }

    fn rescan(&mut self, radio: &mut impl WifiRadio) {
        match radio.scan() {
            Ok(found) => {
                let seen = found.len();
                self.networks = rank_networks(found, self.min_quality);
                debug!("scan found {seen} networks, {} listed", self.networks.len());
            }
            Err(err) => warn!("network scan failed: {err}"),
        }
    }

    fn is_local_host(&self, host: Option<&str>) -> bool {
        let Some(host) = host else {
            return true;
        };
        let host = host.rsplit_once(':').map_or(host, |(name, _)| name);
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| *allowed == host)
    }

    fn handle(
        &mut self,
        request: &HttpRequest,
        now_ms: u64,
        radio: &mut impl WifiRadio,
    ) -> HttpResponse {
        self.touch(now_ms);
        let portal_root = format!("http://{}/", self.address);
        if !self.is_local_host(request.host.as_deref()) {
            debug!("captive redirect for host {:?}", request.host);
            return HttpResponse::redirect(portal_root);
        }

        match request.path() {
            "/" => {
                self.await_credentials();
                HttpResponse::html(self.render_root())
            }
            "/config" => {
                self.await_credentials();
                HttpResponse::html(self.render_form())
            }
            "/scan" => {
                self.rescan(radio);
                self.render_scan()
            }
            "/wifisave" => self.save(request, now_ms, radio),
            path if CAPTIVE_PROBE_PATHS.contains(&path) => HttpResponse::redirect(portal_root),
            _ => HttpResponse::not_found(),
        }
    }

    fn await_credentials(&mut self) {
        if self.state == PortalState::ScanAndServe {
            self.state = PortalState::AwaitingCredentials;
        }
    }

    fn save(
        &mut self,
        request: &HttpRequest,
        now_ms: u64,
        radio: &mut impl WifiRadio,
    ) -> HttpResponse {
        let form = match request.method {
            HttpMethod::Post => String::from_utf8_lossy(&request.body).into_owned(),
            _ => request
                .uri
                .split_once('?')
                .map(|(_, query)| query.to_string())
                .unwrap_or_default(),
        };
        let fields = form_pairs(&form);
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        let mut submitted = self.config.clone();
        for param in PORTAL_PARAMS.iter() {
            if let Some(value) = field(param.id) {
                submitted.set_param(param.id, value);
            }
        }
        self.config = submitted;

        let ssid = field(FIELD_SSID).unwrap_or_default();
        if ssid.is_empty() {
            return self.reject("Choose a network.");
        }
        if let Some(param) = self.config.missing_required() {
            let message = format!("{} is required.", param.label);
            return self.reject(&message);
        }
        let credentials = match Credentials::new(ssid, field(FIELD_PASSWORD).unwrap_or_default())
        {
            Ok(credentials) => credentials,
            Err(err) => return self.reject(&err.to_string()),
        };

        if let Err(err) = radio.begin_join(JoinRequest::New(credentials)) {
            warn!("station join could not start: {err}");
            self.state = PortalState::Failed;
            return self.reject("The radio refused the join request.");
        }
        info!("joining `{ssid}` with portal credentials");
        self.notice = None;
        self.state = PortalState::Connecting {
            source: CredentialSource::Portal,
            deadline_ms: now_ms.saturating_add(self.join_timeout_ms),
        };
        HttpResponse::html(page(
            "Saved",
            &format!(
                "<p>Credentials saved. Connecting to <b>{}</b>&hellip;</p>\
                 <p>If the node does not join, reconnect to <b>{}</b> and try again.</p>",
                html_escape(ssid),
                html_escape(&self.ap_ssid)
            ),
        ))
    }

    fn reject(&mut self, message: &str) -> HttpResponse {
        debug!("portal form rejected: {message}");
        self.notice = Some(message.to_string());
        HttpResponse::html(self.render_form())
    }

    fn render_root(&self) -> String {
        page(
            &self.ap_ssid,
            "<form action=\"/config\" method=\"get\"><button>Configure WiFi</button></form>\
             <form action=\"/scan\" method=\"get\"><button>Scan networks</button></form>",
        )
    }

    fn render_form(&self) -> String {
        let mut body = String::new();
        if let Some(notice) = &self.notice {
            body.push_str(&format!("<p class=\"notice\">{}</p>", html_escape(notice)));
        }
        body.push_str("<ul>");
        for network in &self.networks {
            let ssid = html_escape(&network.ssid);
            body.push_str(&format!(
                "<li><a href=\"#p\" onclick=\"document.getElementById('s').value=this.innerText\">{ssid}</a> {}%{}</li>",
                network.quality(),
                if network.secured { " &#128274;" } else { "" }
            ));
        }
        if self.networks.is_empty() {
            body.push_str("<li>No networks found. Refresh to scan again.</li>");
        }
        body.push_str("</ul><form method=\"post\" action=\"/wifisave\">");
        body.push_str(&format!(
            "<input id=\"{FIELD_SSID}\" name=\"{FIELD_SSID}\" maxlength=\"32\" placeholder=\"SSID\">\
             <input id=\"{FIELD_PASSWORD}\" name=\"{FIELD_PASSWORD}\" maxlength=\"64\" type=\"password\" placeholder=\"password\">"
        ));
        for param in PORTAL_PARAMS.iter() {
            let value = self.config.param(param.id).unwrap_or_default();
            body.push_str(&format!(
                "<label for=\"{id}\">{label}</label>\
                 <input id=\"{id}\" name=\"{id}\" maxlength=\"{max}\" value=\"{value}\"{required}>",
                id = param.id,
                label = html_escape(param.label),
                max = param.max_len,
                value = html_escape(value),
                required = if param.required { " required" } else { "" },
            ));
        }
        body.push_str("<button type=\"submit\">Save</button></form>");
        page("Config", &body)
    }

    fn render_scan(&self) -> HttpResponse {
        let entries: Vec<ScanEntry<'_>> = self
            .networks
            .iter()
            .map(|network| ScanEntry {
                ssid: &network.ssid,
                rssi: network.rssi,
                quality: network.quality(),
                secured: network.secured,
            })
            .collect();
        match serde_json::to_vec(&entries) {
            Ok(body) => HttpResponse::json(body),
            Err(err) => {
                warn!("scan encoding failed: {err}");
                HttpResponse::json(b"[]".to_vec())
            }
        }
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\
         <title>{title}</title></head><body><h1>{title}</h1>{body}</body></html>",
        title = html_escape(title)
    )
}

pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Decodes `application/x-www-form-urlencoded` text. Invalid escapes are
/// kept literally.
pub fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => out.push(b' '),
            b'%' if index + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[index + 1..index + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        index += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn form_pairs(form: &str) -> Vec<(String, String)> {
    form.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key), url_decode(value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PARAM_MODULE_LOCATION, PARAM_MODULE_NAME, PARAM_MQTT_HOST, PARAM_MQTT_PORT},
        testing::{MemoryDatagram, MemoryHttp, ScriptedRadio},
    };
    use pretty_assertions::assert_eq;

    const FORM: &str = "s=Home+Net&p=s%3Dcret&moduleLocation=garden&moduleName=pump\
                        &mqttHost=192.168.1.2&mqttPort=1883";

    struct Fixture {
        portal: ProvisioningPortal,
        radio: ScriptedRadio,
        http: MemoryHttp,
        dns: MemoryDatagram,
    }

    impl Fixture {
        fn new() -> Self {
            let runtime = RuntimeConfig {
                wifi_connect_timeout_ms: 30_000,
                config_portal_timeout_ms: 60_000,
                ..RuntimeConfig::default()
            };
            let mut radio = ScriptedRadio::default();
            radio.networks = vec![
                AccessPoint::new("Home Net", -40),
                AccessPoint::new("Home Net", -70),
                AccessPoint::new("Far", -90),
            ];
            Self {
                portal: ProvisioningPortal::new("Proeza domotic 42", &runtime),
                radio,
                http: MemoryHttp::default(),
                dns: MemoryDatagram::default(),
            }
        }

        fn poll(&mut self, now_ms: u64) -> PortalOutcome {
            self.portal
                .poll(now_ms, &mut self.radio, &mut self.http, &mut self.dns)
        }
    }

    #[test]
    fn opening_starts_access_point_with_ranked_scan() {
        let mut fixture = Fixture::new();

        fixture.portal.open(0, &mut fixture.radio);

        assert_eq!(fixture.portal.state(), PortalState::ScanAndServe);
        assert_eq!(
            fixture.radio.access_point,
            Some(("Proeza domotic 42".to_string(), Ipv4Addr::new(10, 10, 10, 10)))
        );
        let listed: Vec<_> = fixture
            .portal
            .networks()
            .iter()
            .map(|network| (network.ssid.as_str(), network.rssi))
            .collect();
        assert_eq!(listed, vec![("Home Net", -40)]);
    }

    #[test]
    fn foreign_hosts_are_redirected_to_the_portal() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);
        fixture
            .http
            .request(HttpMethod::Get, "/", Some("connectivitycheck.gstatic.com"), b"");
        fixture.http.get("/generate_204");
        fixture.http.get("/nope");

        fixture.poll(10);

        let statuses: Vec<_> = fixture
            .http
            .responses
            .iter()
            .map(|(_, response)| (response.status, response.location.clone()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (302, Some("http://10.10.10.10/".to_string())),
                (302, Some("http://10.10.10.10/".to_string())),
                (404, None),
            ]
        );
    }

    #[test]
    fn config_page_lists_networks_and_parameters() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);
        fixture.http.get("/config");

        fixture.poll(10);

        let body = fixture.http.last_body();
        assert!(body.contains("Home Net"));
        assert!(!body.contains("Far"));
        assert!(body.contains("name=\"mqttHost\""));
        assert_eq!(fixture.portal.state(), PortalState::AwaitingCredentials);
    }

    #[test]
    fn missing_required_field_rerenders_form() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);
        fixture.http.post("/wifisave", "s=Home+Net&p=x&moduleName=pump");

        assert_eq!(fixture.poll(10), PortalOutcome::Pending);

        assert!(fixture.radio.joins.is_empty());
        assert!(fixture.http.last_body().contains("Module location is required."));
        assert_eq!(fixture.http.last_response().map(|r| r.status), Some(200));
    }

    #[test]
    fn submitted_credentials_connect_and_return_parameters() {
        let mut fixture = Fixture::new();
        fixture.radio.join_outcome = StationStatus::Connected;
        fixture.portal.open(0, &mut fixture.radio);
        fixture.http.post("/wifisave", FORM);

        assert_eq!(fixture.poll(10), PortalOutcome::Pending);
        let outcome = fixture.poll(20);

        assert_eq!(
            fixture.radio.joins,
            vec![JoinRequest::New(Credentials::new("Home Net", "s=cret").unwrap())]
        );
        let PortalOutcome::Connected { config, source } = outcome else {
            panic!("expected connection, got {outcome:?}");
        };
        assert_eq!(source, CredentialSource::Portal);
        assert_eq!(config.param(PARAM_MODULE_LOCATION), Some("garden"));
        assert_eq!(config.param(PARAM_MODULE_NAME), Some("pump"));
        assert_eq!(config.param(PARAM_MQTT_HOST), Some("192.168.1.2"));
        assert_eq!(config.param(PARAM_MQTT_PORT), Some("1883"));
        assert_eq!(fixture.radio.access_point, None);
    }

    #[test]
    fn submitted_values_keep_edge_whitespace() {
        let mut fixture = Fixture::new();
        fixture.radio.join_outcome = StationStatus::Connected;
        fixture.portal.open(0, &mut fixture.radio);
        fixture.http.post(
            "/wifisave",
            "s=+Home+&p=x&moduleLocation=garden&moduleName=+pump&mqttHost=broker&mqttPort=1883",
        );

        fixture.poll(10);
        let outcome = fixture.poll(20);

        assert_eq!(
            fixture.radio.joins,
            vec![JoinRequest::New(Credentials::new(" Home ", "x").unwrap())]
        );
        let PortalOutcome::Connected { config, .. } = outcome else {
            panic!("expected connection, got {outcome:?}");
        };
        assert_eq!(config.param(PARAM_MODULE_NAME), Some(" pump"));
    }

    #[test]
    fn failed_portal_join_keeps_access_point_for_retry() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);
        fixture.http.post("/wifisave", FORM);
        fixture.poll(10);

        assert_eq!(fixture.poll(30_010), PortalOutcome::Pending);

        assert_eq!(fixture.portal.state(), PortalState::Failed);
        assert!(fixture.portal.is_serving());
        assert!(fixture.radio.access_point.is_some());

        fixture.radio.join_outcome = StationStatus::Connected;
        fixture.http.post("/wifisave", FORM);
        fixture.poll(30_020);
        assert!(matches!(
            fixture.poll(30_030),
            PortalOutcome::Connected { .. }
        ));
    }

    #[test]
    fn failed_stored_join_falls_back_to_portal() {
        let mut fixture = Fixture::new();
        fixture.radio.stored = true;
        fixture.radio.join_outcome = StationStatus::Failed;

        fixture.portal.begin_stored(0, &mut fixture.radio);
        assert_eq!(fixture.radio.access_point, None);
        fixture.poll(100);

        assert_eq!(fixture.radio.joins, vec![JoinRequest::Stored]);
        assert_eq!(fixture.portal.state(), PortalState::ScanAndServe);
        assert!(fixture.radio.access_point.is_some());
    }

    #[test]
    fn stored_join_that_never_resolves_times_out() {
        let mut fixture = Fixture::new();
        fixture.radio.stored = true;

        fixture.portal.begin_stored(0, &mut fixture.radio);
        assert_eq!(fixture.poll(29_999), PortalOutcome::Pending);
        assert_eq!(fixture.radio.ap_starts, 0);
        fixture.poll(30_000);

        assert_eq!(fixture.radio.ap_starts, 1);
        assert_eq!(fixture.radio.disconnects, 1);
    }

    #[test]
    fn idle_portal_times_out_and_activity_extends_it() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);

        fixture.http.get("/");
        assert_eq!(fixture.poll(50_000), PortalOutcome::Pending);
        assert_eq!(fixture.poll(100_000), PortalOutcome::Pending);
        assert_eq!(fixture.poll(110_000), PortalOutcome::TimedOut);

        assert_eq!(fixture.radio.access_point, None);
        assert_eq!(fixture.poll(120_000), PortalOutcome::TimedOut);
    }

    #[test]
    fn scan_endpoint_rescans_and_reports_json() {
        let mut fixture = Fixture::new();
        fixture.portal.open(0, &mut fixture.radio);
        fixture.radio.networks.push(AccessPoint::new("Neighbour", -55));
        fixture.http.get("/scan");

        fixture.poll(10);

        let listed: serde_json::Value = serde_json::from_str(&fixture.http.last_body()).unwrap();
        assert_eq!(listed[0]["ssid"], "Home Net");
        assert_eq!(listed[1]["ssid"], "Neighbour");
        assert_eq!(listed[1]["quality"], 90);
        assert_eq!(fixture.radio.scans, 2);
    }

    #[test]
    fn form_decoding_handles_escapes() {
        assert_eq!(url_decode("a+b%21%zz%4"), "a b!%zz%4");
        assert_eq!(
            form_pairs("s=My%20Net&&p="),
            vec![
                ("s".to_string(), "My Net".to_string()),
                ("p".to_string(), String::new()),
            ]
        );
        assert_eq!(html_escape("<a href=\"x\">"), "&lt;a href=&quot;x&quot;&gt;");
    }
}
