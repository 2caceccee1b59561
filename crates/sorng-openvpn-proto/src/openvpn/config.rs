//! `Configuration` values, connection timing, and the option grammar shared by
//! `.ovpn` profiles and server `PUSH_REPLY` messages.

use crate::openvpn::dns::{parse_dhcp_option, DhcpOption};
use crate::openvpn::routing::*;
use crate::openvpn::types::*;
use crate::openvpn::xor::XorMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection timing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Protocol timers and bounds used by the control channel, negotiator and session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// How often the session loop wakes up to flush and check timers.
    pub tick_interval: Duration,
    pub retransmission_interval: Duration,
    /// Consecutive resends of one packet before the channel reports `Timeout`.
    pub max_retransmits: u32,
    pub push_request_interval: Duration,
    pub max_push_requests: u32,
    pub hard_reset_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub soft_negotiation_timeout: Duration,
    pub ping_timeout_check_interval: Duration,
    pub ping_timeout: Duration,
    pub write_timeout: Duration,
    pub min_data_count_interval: Duration,
    /// Largest control payload carried by one packet.
    pub max_packet_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            retransmission_interval: Duration::from_millis(100),
            max_retransmits: 50,
            push_request_interval: Duration::from_secs(2),
            max_push_requests: 10,
            hard_reset_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            soft_negotiation_timeout: Duration::from_secs(120),
            ping_timeout_check_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(5),
            min_data_count_interval: Duration::from_secs(3),
            max_packet_size: 1000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `static-challenge` prompt shown to the user before authenticating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticChallenge {
    pub text: String,
    pub echo: bool,
}

/// One side's settings. Every field is optional so that "not set" stays
/// distinguishable from a value when local and remote settings are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    // ── Crypto ──
    pub cipher: Option<Cipher>,
    pub data_ciphers: Option<Vec<Cipher>>,
    pub digest: Option<Digest>,
    pub compression_framing: Option<CompressionFraming>,
    pub compression_algorithm: Option<CompressionAlgorithm>,

    // ── TLS ──
    pub ca: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub checks_eku: Option<bool>,
    pub checks_san_host: Option<bool>,
    pub san_host: Option<String>,
    pub tls_wrap: Option<TlsWrap>,

    // ── Timing ──
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub renegotiates_after: Option<Duration>,

    // ── Endpoints ──
    pub remotes: Option<Vec<RemoteEndpoint>>,
    pub randomize_endpoint: Option<bool>,
    pub randomize_hostnames: Option<bool>,
    pub mtu: Option<u16>,

    // ── Authentication ──
    pub authentication_required: Option<bool>,
    pub static_challenge: Option<StaticChallenge>,
    pub auth_token: Option<String>,
    pub peer_id: Option<u32>,

    // ── Addresses / routes ──
    pub ipv4: Option<IpSettings>,
    pub ipv6: Option<IpSettings>,
    pub routes4: Option<Vec<Route>>,
    pub routes6: Option<Vec<Route>>,
    pub routing_policies: Option<Vec<RoutingPolicy>>,

    // ── DNS ──
    pub dns_servers: Option<Vec<IpAddr>>,
    pub dns_domain: Option<String>,
    pub search_domains: Option<Vec<String>>,

    // ── Proxy ──
    pub http_proxy: Option<ProxyEndpoint>,
    pub https_proxy: Option<ProxyEndpoint>,
    pub proxy_auto_configuration_url: Option<String>,
    pub proxy_bypass_domains: Option<Vec<String>>,

    // ── Policy ──
    pub no_pull_mask: Option<Vec<PullCategory>>,
    pub xor_method: Option<XorMethod>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Start a builder from a copy of this value.
    pub fn to_builder(&self) -> ConfigurationBuilder {
        ConfigurationBuilder {
            config: self.clone(),
        }
    }

    pub fn fallback_cipher(&self) -> Cipher {
        self.cipher.unwrap_or_default()
    }

    pub fn fallback_digest(&self) -> Digest {
        self.digest.unwrap_or_default()
    }

    pub fn fallback_compression_framing(&self) -> CompressionFraming {
        self.compression_framing.unwrap_or_default()
    }

    pub fn fallback_compression_algorithm(&self) -> CompressionAlgorithm {
        self.compression_algorithm.unwrap_or_default()
    }

    /// Whether the server may supply settings of `category`.
    pub fn pulls(&self, category: PullCategory) -> bool {
        !self
            .no_pull_mask
            .as_ref()
            .map(|mask| mask.contains(&category))
            .unwrap_or(false)
    }

    /// Ciphers announced to the server in `IV_CIPHERS`.
    pub fn announced_ciphers(&self) -> Vec<Cipher> {
        match &self.data_ciphers {
            Some(list) if !list.is_empty() => list.clone(),
            _ => vec![self.fallback_cipher()],
        }
    }

    pub fn tls_options(&self) -> crate::openvpn::crypto::TlsOptions {
        crate::openvpn::crypto::TlsOptions {
            ca_pem: self.ca.clone().unwrap_or_default(),
            client_cert_pem: self.client_certificate.clone(),
            client_key_pem: self.client_key.clone(),
            checks_eku: self.checks_eku.unwrap_or(false),
            checks_san_host: self.checks_san_host.unwrap_or(false),
            san_host: self.san_host.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates settings; `build()` freezes them into a `Configuration`.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    config: Configuration,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = Some(value);
            self
        }
    };
}

impl ConfigurationBuilder {
    setter!(cipher, Cipher);
    setter!(data_ciphers, Vec<Cipher>);
    setter!(digest, Digest);
    setter!(compression_framing, CompressionFraming);
    setter!(compression_algorithm, CompressionAlgorithm);
    setter!(ca, String);
    setter!(client_certificate, String);
    setter!(client_key, String);
    setter!(checks_eku, bool);
    setter!(tls_wrap, TlsWrap);
    setter!(keep_alive_interval, Duration);
    setter!(keep_alive_timeout, Duration);
    setter!(renegotiates_after, Duration);
    setter!(remotes, Vec<RemoteEndpoint>);
    setter!(mtu, u16);
    setter!(authentication_required, bool);
    setter!(auth_token, String);
    setter!(peer_id, u32);
    setter!(ipv4, IpSettings);
    setter!(ipv6, IpSettings);
    setter!(routes4, Vec<Route>);
    setter!(routes6, Vec<Route>);
    setter!(routing_policies, Vec<RoutingPolicy>);
    setter!(dns_servers, Vec<IpAddr>);
    setter!(dns_domain, String);
    setter!(search_domains, Vec<String>);
    setter!(http_proxy, ProxyEndpoint);
    setter!(https_proxy, ProxyEndpoint);
    setter!(proxy_auto_configuration_url, String);
    setter!(proxy_bypass_domains, Vec<String>);
    setter!(no_pull_mask, Vec<PullCategory>);
    setter!(xor_method, XorMethod);

    pub fn san_host(mut self, host: impl Into<String>) -> Self {
        self.config.checks_san_host = Some(true);
        self.config.san_host = Some(host.into());
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Option grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_PORT: u16 = 1194;

const REDIRECT_GATEWAY_FLAGS: &[&str] = &[
    "def1",
    "!ipv4",
    "ipv6",
    "local",
    "autolocal",
    "block-local",
    "bypass-dhcp",
    "bypass-dns",
];

fn unsupported(option: &str) -> OpenVpnError {
    OpenVpnError::parse("unsupported option").with_detail(option.to_string())
}

fn number<T: FromStr>(directive: &str, arg: Option<&&str>) -> Result<T, OpenVpnError> {
    let arg = arg.ok_or_else(|| OpenVpnError::parse(format!("{} requires a value", directive)))?;
    arg.parse().map_err(|_| {
        OpenVpnError::parse(format!("{} has malformed value", directive)).with_detail(arg.to_string())
    })
}

fn seconds(directive: &str, arg: Option<&&str>) -> Result<Duration, OpenVpnError> {
    number::<u64>(directive, arg).map(Duration::from_secs)
}

/// Split a directive into words, honouring double quotes.
fn split_args(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_token = false;
    for c in raw.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                has_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}

/// Remote as written; defaults are applied once the whole input is read.
struct PendingRemote {
    host: String,
    port: Option<u16>,
    protocol: Option<VpnProtocol>,
}

/// Line-at-a-time option parser. Some directives depend on others that may
/// come later (`key-direction`, `route-gateway`, `topology`), so resolution
/// happens in `finish`.
#[derive(Default)]
struct OptionParser {
    config: Configuration,
    recognised: bool,
    remotes: Vec<PendingRemote>,
    default_protocol: Option<VpnProtocol>,
    default_port: Option<u16>,
    topology: Option<String>,
    ifconfig4: Option<(String, String)>,
    route_gateway: Option<String>,
    ifconfig6: Option<(Subnet, IpAddr)>,
    routes4: Vec<Route>,
    routes6: Vec<Route>,
    dns_servers: Vec<IpAddr>,
    search_domains: Vec<String>,
    bypass_domains: Vec<String>,
    key_direction: Option<KeyDirection>,
    tls_wrap_block: Option<(TlsWrapStrategy, String)>,
}

impl OptionParser {
    fn apply(&mut self, raw: &str) -> Result<(), OpenVpnError> {
        let words = split_args(raw);
        let Some((directive, rest)) = words.split_first() else {
            return Ok(());
        };
        let args: Vec<&str> = rest.iter().map(String::as_str).collect();
        let directive = directive.to_lowercase();

        match directive.as_str() {
            // ── Unsupported ───────────────────────────────────
            "fragment" | "socks-proxy" | "http-proxy-option" | "http-proxy-retry" => {
                return Err(unsupported(&directive));
            }
            "ca" | "cert" | "key" | "tls-auth" | "tls-crypt" => {
                return Err(OpenVpnError::parse("external file references are not supported")
                    .with_detail(directive));
            }
            "push-continuation" => {
                if args.first() == Some(&"2") {
                    return Err(OpenVpnError::new(
                        OpenVpnErrorKind::ContinuationPushReply,
                        "multi-part PUSH_REPLY is not supported",
                    ));
                }
            }

            // ── Cipher / auth ─────────────────────────────────
            "cipher" | "data-ciphers-fallback" => {
                let name = args.first().ok_or_else(|| {
                    OpenVpnError::parse(format!("{} requires a value", directive))
                })?;
                let cipher = Cipher::from_str_loose(name).ok_or_else(|| {
                    OpenVpnError::new(OpenVpnErrorKind::UnsupportedAlgorithm, "unsupported cipher")
                        .with_detail(name.to_string())
                })?;
                self.config.cipher = Some(cipher);
            }
            "data-ciphers" | "ncp-ciphers" => {
                let list = args.first().ok_or_else(|| {
                    OpenVpnError::parse(format!("{} requires a value", directive))
                })?;
                let ciphers: Vec<Cipher> =
                    list.split(':').filter_map(Cipher::from_str_loose).collect();
                self.config.data_ciphers = Some(ciphers);
            }
            "auth" => {
                let name = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("auth requires a value"))?;
                let digest = Digest::from_str_loose(name).ok_or_else(|| {
                    OpenVpnError::new(OpenVpnErrorKind::UnsupportedAlgorithm, "unsupported digest")
                        .with_detail(name.to_string())
                })?;
                self.config.digest = Some(digest);
            }

            // ── Compression ───────────────────────────────────
            "comp-lzo" => {
                self.config.compression_framing = Some(CompressionFraming::CompLzo);
                self.config.compression_algorithm = Some(if args.last() == Some(&"no") {
                    CompressionAlgorithm::Disabled
                } else {
                    CompressionAlgorithm::Lzo
                });
            }
            "compress" => {
                let mut framing = CompressionFraming::Compress;
                let algorithm = match args.as_slice() {
                    [] => CompressionAlgorithm::Disabled,
                    ["lzo"] => CompressionAlgorithm::Lzo,
                    ["stub"] => CompressionAlgorithm::Disabled,
                    ["stub-v2"] => {
                        framing = CompressionFraming::CompressV2;
                        CompressionAlgorithm::Disabled
                    }
                    _ => CompressionAlgorithm::Other,
                };
                self.config.compression_framing = Some(framing);
                self.config.compression_algorithm = Some(algorithm);
            }

            // ── TLS ───────────────────────────────────────────
            "key-direction" => {
                let index: u8 = number(&directive, args.first())?;
                let dir = KeyDirection::from_index(index).ok_or_else(|| {
                    OpenVpnError::parse("key-direction must be 0 or 1").with_detail(index.to_string())
                })?;
                self.key_direction = Some(dir);
            }
            "remote-cert-tls" => {
                self.config.checks_eku = Some(args.first() == Some(&"server"));
            }
            "verify-x509-name" => {
                let name = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("verify-x509-name requires a name"))?;
                self.config.checks_san_host = Some(true);
                self.config.san_host = Some(name.to_string());
            }

            // ── Keep-alive / renegotiation ────────────────────
            "ping" => self.config.keep_alive_interval = Some(seconds(&directive, args.first())?),
            "ping-restart" => {
                self.config.keep_alive_timeout = Some(seconds(&directive, args.first())?)
            }
            "keepalive" => {
                if args.len() != 2 {
                    return Err(OpenVpnError::parse("keepalive takes 2 arguments"));
                }
                self.config.keep_alive_interval = Some(seconds(&directive, args.first())?);
                self.config.keep_alive_timeout = Some(seconds(&directive, args.get(1))?);
            }
            "reneg-sec" => {
                self.config.renegotiates_after = Some(seconds(&directive, args.first())?)
            }

            // ── Remote endpoints ──────────────────────────────
            "proto" => {
                let name = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("proto requires a value"))?;
                let proto = VpnProtocol::from_str_loose(name).ok_or_else(|| {
                    OpenVpnError::parse("unknown proto").with_detail(name.to_string())
                })?;
                self.default_protocol = Some(proto);
            }
            "port" => self.default_port = Some(number(&directive, args.first())?),
            "remote" => {
                let host = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("remote requires a host"))?;
                let port = match args.get(1) {
                    Some(_) => Some(number(&directive, args.get(1))?),
                    None => None,
                };
                let protocol = match args.get(2) {
                    Some(p) => Some(VpnProtocol::from_str_loose(p).ok_or_else(|| {
                        OpenVpnError::parse("unknown remote proto").with_detail(p.to_string())
                    })?),
                    None => None,
                };
                self.remotes.push(PendingRemote {
                    host: host.to_string(),
                    port,
                    protocol,
                });
            }
            "remote-random" => self.config.randomize_endpoint = Some(true),
            "remote-random-hostname" => self.config.randomize_hostnames = Some(true),
            "tun-mtu" => self.config.mtu = Some(number(&directive, args.first())?),

            // ── Authentication ────────────────────────────────
            "auth-user-pass" => self.config.authentication_required = Some(true),
            "static-challenge" => {
                let (text, echo) = match args.as_slice() {
                    [text, echo] => (text, echo),
                    _ => return Err(OpenVpnError::parse("static-challenge takes 2 arguments")),
                };
                self.config.static_challenge = Some(StaticChallenge {
                    text: text.to_string(),
                    echo: *echo == "1",
                });
            }
            "auth-token" => {
                if let [token] = args.as_slice() {
                    self.config.auth_token = Some(token.to_string());
                }
            }
            "peer-id" => self.config.peer_id = Some(number(&directive, args.first())?),

            // ── Addresses / routes ────────────────────────────
            "topology" => self.topology = args.first().map(|t| t.to_string()),
            "ifconfig" => {
                let [addr, second] = args.as_slice() else {
                    return Err(OpenVpnError::parse("ifconfig takes 2 arguments"));
                };
                self.ifconfig4 = Some((addr.to_string(), second.to_string()));
            }
            "route-gateway" => {
                let [gw] = args.as_slice() else {
                    return Err(OpenVpnError::parse("route-gateway takes 1 argument"));
                };
                self.route_gateway = Some(gw.to_string());
            }
            "ifconfig-ipv6" => {
                let [cidr, gw] = args.as_slice() else {
                    return Err(OpenVpnError::parse("ifconfig-ipv6 takes 2 arguments"));
                };
                let subnet = Subnet::from_cidr(cidr)?;
                let gw = parse_gateway(Some(gw))?
                    .ok_or_else(|| OpenVpnError::parse("ifconfig-ipv6 requires a gateway"))?;
                self.ifconfig6 = Some((subnet, gw));
            }
            "route" => {
                let addr = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("route requires a destination"))?;
                let mask = args.get(1).copied().unwrap_or("255.255.255.255");
                let subnet = Subnet::with_mask(addr, mask)?;
                let gateway = parse_gateway(args.get(2).copied())?;
                self.routes4.push(Route::new(subnet, gateway));
            }
            "route-ipv6" => {
                let cidr = args
                    .first()
                    .ok_or_else(|| OpenVpnError::parse("route-ipv6 requires a destination"))?;
                let subnet = Subnet::from_cidr(cidr)?;
                let gateway = parse_gateway(args.get(1).copied())?;
                self.routes6.push(Route::new(subnet, gateway));
            }
            "redirect-gateway" => {
                let mut flags: BTreeSet<&str> = BTreeSet::from(["def1"]);
                for arg in &args {
                    match REDIRECT_GATEWAY_FLAGS.iter().find(|f| **f == *arg) {
                        Some(flag) => {
                            flags.insert(*flag);
                        }
                        None => log::debug!("redirect-gateway: ignoring flag {}", arg),
                    }
                }
                let mut policies = Vec::new();
                if !flags.contains("!ipv4") {
                    policies.push(RoutingPolicy::Ipv4);
                }
                if flags.contains("ipv6") {
                    policies.push(RoutingPolicy::Ipv6);
                }
                if flags.contains("block-local") {
                    policies.push(RoutingPolicy::BlockLocal);
                }
                self.config.routing_policies = Some(policies);
            }
            "route-nopull" => self.config.no_pull_mask = Some(PullCategory::all()),

            // ── DNS / proxy ───────────────────────────────────
            "dhcp-option" => match parse_dhcp_option(&args)? {
                DhcpOption::Dns(ip) => self.dns_servers.push(ip),
                DhcpOption::Domain(d) => self.config.dns_domain = Some(d),
                DhcpOption::DomainSearch(d) => self.search_domains.push(d),
                DhcpOption::ProxyHttp(p) => self.config.http_proxy = Some(p),
                DhcpOption::ProxyHttps(p) => self.config.https_proxy = Some(p),
                DhcpOption::ProxyAutoConfigUrl(u) => {
                    self.config.proxy_auto_configuration_url = Some(u)
                }
                DhcpOption::ProxyBypass(list) => self.bypass_domains.extend(list),
                DhcpOption::Ignored(kind) => log::debug!("dhcp-option {} ignored", kind),
            },
            "http-proxy" | "https-proxy" => {
                let (host, port) = match args.as_slice() {
                    [host, port, ..] => (host, port),
                    _ => {
                        return Err(OpenVpnError::parse(format!(
                            "{} takes host and port",
                            directive
                        )))
                    }
                };
                let port: u16 = number(&directive, Some(port))?;
                let endpoint = ProxyEndpoint::new(*host, port);
                if directive == "http-proxy" {
                    self.config.http_proxy = Some(endpoint);
                } else {
                    self.config.https_proxy = Some(endpoint);
                }
            }

            // ── Obfuscation ───────────────────────────────────
            "scramble" | "xor" => self.config.xor_method = Some(XorMethod::from_args(&args)?),

            _ => {
                log::trace!("ignoring option {}", directive);
                return Ok(());
            }
        }

        self.recognised = true;
        Ok(())
    }

    fn finish(mut self) -> Result<Configuration, OpenVpnError> {
        if !self.recognised {
            return Err(OpenVpnError::parse("invalid format"));
        }

        // ── Remotes ──
        if !self.remotes.is_empty() {
            let default_port = self.default_port.unwrap_or(DEFAULT_PORT);
            let default_protocol = self.default_protocol.unwrap_or_default();
            self.config.remotes = Some(
                self.remotes
                    .drain(..)
                    .map(|r| RemoteEndpoint {
                        host: r.host,
                        port: r.port.unwrap_or(default_port),
                        protocol: r.protocol.unwrap_or(default_protocol),
                    })
                    .collect(),
            );
        }

        // ── IPv4 ──
        let mut default_gateway4: Option<IpAddr> = match &self.route_gateway {
            Some(gw) => parse_gateway(Some(gw))?,
            None => None,
        };
        if let Some((addr, second)) = &self.ifconfig4 {
            let subnet_topology = self.topology.as_deref() == Some("subnet");
            let subnet = if subnet_topology {
                if default_gateway4.is_none() {
                    return Err(OpenVpnError::parse("route-gateway takes 1 argument"));
                }
                Subnet::with_mask(addr, second)?
            } else {
                let peer = parse_gateway(Some(second))?;
                default_gateway4 = default_gateway4.or(peer);
                Subnet::with_mask(addr, "255.255.255.255")?
            };
            let mut settings = IpSettings::new(subnet);
            if let Some(gw) = default_gateway4 {
                settings = settings.including([Route::default_with_gateway(gw)]);
            }
            self.config.ipv4 = Some(settings);
        }
        if !self.routes4.is_empty() {
            self.config.routes4 = Some(
                self.routes4
                    .into_iter()
                    .map(|r| Route {
                        gateway: r.gateway.or(default_gateway4),
                        ..r
                    })
                    .collect(),
            );
        }

        // ── IPv6 ──
        let default_gateway6 = self.ifconfig6.as_ref().map(|(_, gw)| *gw);
        if let Some((subnet, gw)) = self.ifconfig6 {
            self.config.ipv6 =
                Some(IpSettings::new(subnet).including([Route::default_with_gateway(gw)]));
        }
        if !self.routes6.is_empty() {
            self.config.routes6 = Some(
                self.routes6
                    .into_iter()
                    .map(|r| Route {
                        gateway: r.gateway.or(default_gateway6),
                        ..r
                    })
                    .collect(),
            );
        }

        // ── DNS / proxy lists ──
        if !self.dns_servers.is_empty() {
            self.config.dns_servers = Some(self.dns_servers);
        }
        if !self.search_domains.is_empty() {
            self.config.search_domains = Some(self.search_domains);
        }
        if !self.bypass_domains.is_empty() {
            self.config.proxy_bypass_domains = Some(self.bypass_domains);
        }

        // ── TLS wrapping ──
        if let Some((strategy, block)) = self.tls_wrap_block {
            let direction = match strategy {
                TlsWrapStrategy::Auth => self.key_direction,
                TlsWrapStrategy::Crypt => Some(KeyDirection::Client),
            };
            let lines: Vec<&str> = block.lines().collect();
            let key = StaticKey::from_lines(&lines, direction)?;
            self.config.tls_wrap = Some(TlsWrap { strategy, key });
        }

        Ok(self.config)
    }
}

/// Collect lines between the current position and the closing tag.
fn collect_inline_block(
    lines: &[&str],
    i: &mut usize,
    end_tag: &str,
) -> Result<String, OpenVpnError> {
    let mut buf = String::new();
    *i += 1;
    while *i < lines.len() && lines[*i].trim() != end_tag {
        buf.push_str(lines[*i].trim());
        buf.push('\n');
        *i += 1;
    }
    if *i >= lines.len() {
        return Err(
            OpenVpnError::parse("unterminated inline block").with_detail(end_tag.to_string())
        );
    }
    Ok(buf)
}

/// Parse the contents of an `.ovpn` profile.
pub fn parse_ovpn(content: &str) -> Result<Configuration, OpenVpnError> {
    let lines: Vec<&str> = content.lines().collect();
    let mut parser = OptionParser::default();
    let mut i = 0;

    while i < lines.len() {
        let raw = lines[i].trim();
        if raw.is_empty() || raw.starts_with('#') || raw.starts_with(';') {
            i += 1;
            continue;
        }

        match raw {
            // ── Inline blocks ─────────────────────────────────
            "<ca>" => {
                parser.config.ca = Some(collect_inline_block(&lines, &mut i, "</ca>")?);
                parser.recognised = true;
            }
            "<cert>" => {
                parser.config.client_certificate =
                    Some(collect_inline_block(&lines, &mut i, "</cert>")?);
                parser.recognised = true;
            }
            "<key>" => {
                parser.config.client_key = Some(collect_inline_block(&lines, &mut i, "</key>")?);
                parser.recognised = true;
            }
            "<tls-auth>" => {
                let block = collect_inline_block(&lines, &mut i, "</tls-auth>")?;
                parser.tls_wrap_block = Some((TlsWrapStrategy::Auth, block));
                parser.recognised = true;
            }
            "<tls-crypt>" => {
                let block = collect_inline_block(&lines, &mut i, "</tls-crypt>")?;
                parser.tls_wrap_block = Some((TlsWrapStrategy::Crypt, block));
                parser.recognised = true;
            }
            "<connection>" => return Err(unsupported("<connection>")),
            _ => parser.apply(raw)?,
        }

        i += 1;
    }

    parser.finish()
}

/// Parse comma-separated `PUSH_REPLY` directives (prefix already removed).
pub(crate) fn parse_push_options<'a, I>(tokens: I) -> Result<Configuration, OpenVpnError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parser = OptionParser::default();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        parser.apply(token).map_err(|e| {
            if e.detail.is_none() && e.kind == OpenVpnErrorKind::ParseError {
                e.with_detail(token.split_whitespace().next().unwrap_or_default().to_string())
            } else {
                e
            }
        })?;
    }
    parser.finish()
}
