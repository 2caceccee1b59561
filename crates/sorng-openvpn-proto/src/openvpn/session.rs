//! Session orchestrator: owns the link, the control channel, one negotiator
//! per live key and the data channels, and turns link/tunnel traffic and
//! timer ticks into protocol actions.
//!
//! [`Session`] is driven by explicit calls and is easy to test step by
//! step. [`SessionHandle::spawn`] runs one inside a tokio task that owns
//! all mutable state; commands go in and [`SessionEvent`]s come out over
//! `mpsc` channels.

use crate::openvpn::auth::Credentials;
use crate::openvpn::clock::{Clock, SystemClock};
use crate::openvpn::config::{Configuration, ConnectionOptions};
use crate::openvpn::control::{ControlChannel, SessionId};
use crate::openvpn::crypto::{CryptoProvider, DataCrypto, OsPrng, Prng};
use crate::openvpn::link::{Link, Tunnel};
use crate::openvpn::negotiator::{Established, Negotiator, NegotiatorOptions};
use crate::openvpn::network_settings::{ModuleSet, NetworkSettingsBuilder};
use crate::openvpn::packet::{is_ping, occ_exit_payload, parse_header_byte, Opcode, PING_MAGIC};
use crate::openvpn::push_reply::PushReply;
use crate::openvpn::serializer;
use crate::openvpn::types::*;
use crate::openvpn::xor::XorLink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Consecutive undecodable control packets tolerated before giving up.
const MAX_CONSECUTIVE_MALFORMED: u32 = 16;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start a client-initiated renegotiation now.
    Renegotiate,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    Started { remote: String, modules: ModuleSet },
    Renegotiated { key: u8 },
    DataCount { inbound: u64, outbound: u64 },
    Stopped { error: Option<OpenVpnError> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Session {
    id: Uuid,
    configuration: Arc<Configuration>,
    credentials: Option<Credentials>,
    connection: ConnectionOptions,
    provider: Arc<dyn CryptoProvider>,
    prng: Arc<dyn Prng>,
    clock: Arc<dyn Clock>,

    state: SessionState,
    link: Option<Arc<dyn Link>>,
    channel: Option<ControlChannel>,
    negotiators: BTreeMap<u8, Negotiator>,
    data_channels: BTreeMap<u8, Box<dyn DataCrypto>>,
    /// Key whose negotiator owns the control channel.
    current_key: Option<u8>,
    /// Key used for outbound data.
    data_key: Option<u8>,
    previous_data_key: Option<u8>,
    with_local_options: bool,
    push_reply: Option<PushReply>,
    modules: Option<ModuleSet>,
    renegotiation: RenegotiationState,
    renegotiation_generation: u64,

    last_data_in: Instant,
    last_ping_out: Instant,
    last_ping_check: Instant,
    bytes_in: u64,
    bytes_out: u64,
    last_data_count: Option<(Instant, u64, u64)>,
    malformed_packets: u32,

    pending_events: Vec<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_key", &self.current_key)
            .field("data_key", &self.data_key)
            .field("renegotiation", &self.renegotiation)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        configuration: Configuration,
        credentials: Option<Credentials>,
        provider: Arc<dyn CryptoProvider>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        Self {
            id: Uuid::new_v4(),
            configuration: Arc::new(configuration),
            credentials,
            connection: ConnectionOptions::default(),
            provider,
            prng: Arc::new(OsPrng),
            clock,
            state: SessionState::Stopped,
            link: None,
            channel: None,
            negotiators: BTreeMap::new(),
            data_channels: BTreeMap::new(),
            current_key: None,
            data_key: None,
            previous_data_key: None,
            with_local_options: true,
            push_reply: None,
            modules: None,
            renegotiation: RenegotiationState::None,
            renegotiation_generation: 0,
            last_data_in: now,
            last_ping_out: now,
            last_ping_check: now,
            bytes_in: 0,
            bytes_out: 0,
            last_data_count: None,
            malformed_packets: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn with_connection_options(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prng(mut self, prng: Arc<dyn Prng>) -> Self {
        self.prng = prng;
        self
    }

    // ── accessors ────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Started
    }

    /// The link as used by the session (XOR-wrapped when configured).
    pub fn link(&self) -> Option<Arc<dyn Link>> {
        self.link.clone()
    }

    pub fn current_key(&self) -> Option<u8> {
        self.current_key
    }

    pub fn data_key(&self) -> Option<u8> {
        self.data_key
    }

    pub fn modules(&self) -> Option<&ModuleSet> {
        self.modules.as_ref()
    }

    pub fn push_reply(&self) -> Option<&PushReply> {
        self.push_reply.as_ref()
    }

    pub fn with_local_options(&self) -> bool {
        self.with_local_options
    }

    pub fn renegotiation_state(&self) -> RenegotiationState {
        self.renegotiation
    }

    pub fn tick_interval(&self) -> Duration {
        self.connection.tick_interval
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ── negotiation ──────────────────────────────────────────────

    /// Open the control channel on `link` and send the hard reset.
    pub async fn start_negotiation(&mut self, link: Arc<dyn Link>) -> Result<(), OpenVpnError> {
        if self.state != SessionState::Stopped {
            log::warn!("Session {}: already {:?}, ignoring start", self.id, self.state);
            return Ok(());
        }
        let link = XorLink::wrap(link, self.configuration.xor_method.as_ref());
        log::info!(
            "Session {}: negotiating with {} ({})",
            self.id,
            link.remote_address(),
            if link.is_reliable() { "reliable" } else { "unreliable" }
        );

        let serializer = serializer::for_tls_wrap(
            self.configuration.tls_wrap.as_ref(),
            self.configuration.fallback_digest(),
            self.provider.as_ref(),
        )?;
        let mut channel = ControlChannel::new(
            serializer,
            self.connection.max_packet_size,
            self.connection.max_retransmits,
        );
        let options = Arc::new(NegotiatorOptions {
            configuration: self.configuration.clone(),
            credentials: self.credentials.clone(),
            with_local_options: self.with_local_options,
            connection: self.connection.clone(),
            link_reliable: link.is_reliable(),
        });
        let mut negotiator = Negotiator::new(
            0,
            options,
            self.provider.clone(),
            self.prng.clone(),
            self.clock.clone(),
        )?;
        let raw = negotiator.start(&mut channel)?;

        self.state = SessionState::Starting;
        self.channel = Some(channel);
        self.negotiators.insert(0, negotiator);
        self.current_key = Some(0);
        self.link = Some(link);
        self.reset_timers();
        self.write_link(raw).await
    }

    /// Start a renegotiation on the next key. While one is in flight this
    /// only returns the in-flight key.
    pub async fn start_renegotiation(
        &mut self,
        kind: RenegotiationKind,
    ) -> Result<u8, OpenVpnError> {
        let (key, raw) = self.begin_renegotiation(kind)?;
        self.write_link(raw).await?;
        Ok(key)
    }

    fn begin_renegotiation(
        &mut self,
        kind: RenegotiationKind,
    ) -> Result<(u8, Vec<Vec<u8>>), OpenVpnError> {
        let current = self
            .current_key
            .ok_or_else(|| OpenVpnError::internal("renegotiation without a session"))?;
        if let RenegotiationState::InProgress { generation } = self.renegotiation {
            log::info!(
                "Session {}: renegotiation #{} already in progress on key {}",
                self.id,
                generation,
                current
            );
            return Ok((current, Vec::new()));
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| OpenVpnError::internal("renegotiation without a control channel"))?;
        let negotiator = self
            .negotiators
            .get(&current)
            .ok_or_else(|| OpenVpnError::internal("no negotiator for current key"))?;

        let mut next = negotiator.for_renegotiation(kind)?;
        let key = next.key();
        let raw = next.start(channel)?;
        log::info!(
            "Session {}: renegotiating ({:?}), key {} -> {}",
            self.id,
            kind,
            current,
            key
        );

        self.negotiators.insert(key, next);
        self.current_key = Some(key);
        self.renegotiation_generation += 1;
        self.renegotiation = RenegotiationState::InProgress {
            generation: self.renegotiation_generation,
        };
        self.retain_keys();
        Ok((key, raw))
    }

    /// Install the new key's data channel and rebuild the network modules.
    fn did_negotiate(&mut self, established: Established) {
        let Established {
            key,
            data_channel,
            push_reply,
        } = established;

        self.data_channels.insert(key, data_channel);
        if self.data_key != Some(key) {
            self.previous_data_key = self.data_key;
        }
        self.data_key = Some(key);
        self.retain_keys();
        self.reset_timers();

        let builder = NetworkSettingsBuilder::new(&self.configuration, &push_reply.options);
        let modules = builder.modules();
        if self.modules.as_ref() != Some(&modules) {
            builder.log_negotiated();
        }
        self.modules = Some(modules.clone());

        match self.renegotiation {
            RenegotiationState::InProgress { generation } => {
                log::info!(
                    "Session {}: renegotiation #{} complete, data on key {}",
                    self.id,
                    generation,
                    key
                );
                self.renegotiation = RenegotiationState::None;
                self.emit(SessionEventKind::Renegotiated { key });
            }
            RenegotiationState::None => {
                log::info!("Session {}: started on key {}", self.id, key);
                self.state = SessionState::Started;
                let remote = self
                    .link
                    .as_ref()
                    .map(|l| l.remote_address())
                    .unwrap_or_default();
                self.emit(SessionEventKind::Started { remote, modules });
            }
        }
        self.push_reply = Some(push_reply);
    }

    /// Keep the negotiating key, the data key and the one before it.
    fn retain_keys(&mut self) {
        let keep: Vec<u8> = [self.current_key, self.data_key, self.previous_data_key]
            .into_iter()
            .flatten()
            .collect();
        self.negotiators.retain(|k, _| keep.contains(k));
        self.data_channels.retain(|k, _| keep.contains(k));
    }

    // ── link input ───────────────────────────────────────────────

    /// Drop outbound control packets acknowledged by the peer.
    pub fn handle_acks(
        &mut self,
        ack_ids: &[u32],
        ack_remote_session_id: Option<SessionId>,
    ) -> Result<(), OpenVpnError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| OpenVpnError::internal("acks without a control channel"))?;
        channel.read_acks(ack_ids, ack_remote_session_id)
    }

    /// Process packets read from the link. Returns decrypted tunnel packets.
    pub async fn receive_link(
        &mut self,
        packets: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        if self.channel.is_none() {
            log::debug!("Session {}: not started, dropping {} packets", self.id, packets.len());
            return Ok(Vec::new());
        }
        let mut data_by_key: BTreeMap<u8, Vec<Vec<u8>>> = BTreeMap::new();
        let mut outbound = Vec::new();

        for raw in packets {
            let Some(&first) = raw.first() else {
                self.note_malformed(OpenVpnError::format("empty packet"))?;
                continue;
            };
            match parse_header_byte(first) {
                (Some(code), key) if code.is_data() => {
                    data_by_key.entry(key).or_default().push(raw);
                }
                (Some(_), _) => self.handle_control_raw(&raw, &mut outbound)?,
                (None, _) => {
                    self.note_malformed(
                        OpenVpnError::format("unknown opcode").with_detail(format!("{:#04x}", first)),
                    )?;
                }
            }
        }

        let mut plain = Vec::new();
        for (key, packets) in data_by_key {
            let Some(data_channel) = self.data_channels.get_mut(&key) else {
                log::warn!("Session {}: no data channel for key {}, dropping", self.id, key);
                continue;
            };
            self.bytes_in += packets.iter().map(|p| p.len() as u64).sum::<u64>();
            self.last_data_in = self.clock.now();
            let decrypted = data_channel.decrypt(&packets)?;
            plain.extend(decrypted.into_iter().filter(|p| !is_ping(p)));
        }

        self.write_link(outbound).await?;
        Ok(plain)
    }

    fn handle_control_raw(
        &mut self,
        raw: &[u8],
        outbound: &mut Vec<Vec<u8>>,
    ) -> Result<(), OpenVpnError> {
        let decoded = match self.channel.as_mut() {
            Some(channel) => channel.read_inbound(raw),
            None => return Err(OpenVpnError::internal("no control channel")),
        };
        let packet = match decoded {
            Ok(p) => p,
            Err(e) => return self.note_malformed(e),
        };
        if !packet.ack_ids.is_empty() {
            if let Err(e) = self.handle_acks(&packet.ack_ids, packet.ack_remote_session_id) {
                return self.note_malformed(e);
            }
        }
        self.malformed_packets = 0;
        if packet.is_ack() {
            return Ok(());
        }

        match packet.code {
            Opcode::HardResetServerV2 if self.state == SessionState::Started => {
                return Err(OpenVpnError::new(
                    OpenVpnErrorKind::StaleSession,
                    "server reset the session",
                ));
            }
            Opcode::SoftResetV1
                if self.state == SessionState::Started
                    && Some(packet.key) != self.current_key
                    && self.renegotiation == RenegotiationState::None =>
            {
                let (key, raw) = self.begin_renegotiation(RenegotiationKind::Server)?;
                if key != packet.key {
                    log::warn!(
                        "Session {}: server renegotiates key {}, expected {}",
                        self.id,
                        packet.key,
                        key
                    );
                }
                outbound.extend(raw);
            }
            _ => {}
        }

        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| OpenVpnError::internal("no control channel"))?;
        let key = packet.key;
        if Some(key) == self.current_key && !channel.in_receive_window(packet.packet_id) {
            log::warn!(
                "Session {}: pid {} outside receive window, not acked",
                self.id,
                packet.packet_id
            );
            return Ok(());
        }
        outbound.push(channel.write_acks(packet.key, vec![packet.packet_id], packet.session_id)?);

        if Some(key) != self.current_key {
            log::debug!("Session {}: acked packet for retired key {}", self.id, key);
            return Ok(());
        }
        for delivered in channel.enqueue_inbound(packet) {
            let negotiator = self
                .negotiators
                .get_mut(&key)
                .ok_or_else(|| OpenVpnError::internal("no negotiator for current key"))?;
            outbound.extend(negotiator.handle_control_packet(channel, delivered)?);
        }

        if let Some(established) = self
            .negotiators
            .get_mut(&key)
            .and_then(Negotiator::take_established)
        {
            self.did_negotiate(established);
        }
        Ok(())
    }

    fn note_malformed(&mut self, error: OpenVpnError) -> Result<(), OpenVpnError> {
        self.malformed_packets += 1;
        log::warn!(
            "Session {}: dropping malformed packet ({}/{}): {}",
            self.id,
            self.malformed_packets,
            MAX_CONSECUTIVE_MALFORMED,
            error
        );
        if self.malformed_packets >= MAX_CONSECUTIVE_MALFORMED {
            return Err(OpenVpnError::link("too many malformed packets").with_detail(error.to_string()));
        }
        Ok(())
    }

    // ── tunnel input ─────────────────────────────────────────────

    /// Encrypt packets read from the tunnel and send them.
    pub async fn receive_tunnel(&mut self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        let Some(data_channel) = self.data_key.and_then(|k| self.data_channels.get_mut(&k)) else {
            log::debug!("Session {}: no data channel yet, dropping {} packets", self.id, packets.len());
            return Ok(());
        };
        let encrypted = data_channel.encrypt(&packets)?;
        self.bytes_out += encrypted.iter().map(|p| p.len() as u64).sum::<u64>();
        self.write_link(encrypted).await
    }

    // ── timers ───────────────────────────────────────────────────

    /// Drive negotiator timers, keep-alive, renegotiation and data counts.
    pub async fn tick(&mut self) -> Result<(), OpenVpnError> {
        if matches!(self.state, SessionState::Stopped | SessionState::Stopping) {
            return Ok(());
        }
        let now = self.clock.now();
        let mut outbound = Vec::new();

        if let (Some(channel), Some(key)) = (self.channel.as_mut(), self.current_key) {
            if let Some(negotiator) = self.negotiators.get_mut(&key) {
                outbound.extend(negotiator.check(channel)?);
            }
        }

        if self.state == SessionState::Started {
            let due = self.renegotiation == RenegotiationState::None
                && self
                    .current_key
                    .and_then(|k| self.negotiators.get(&k))
                    .map(Negotiator::should_renegotiate)
                    .unwrap_or(false);
            if due {
                let (_, raw) = self.begin_renegotiation(RenegotiationKind::Client)?;
                outbound.extend(raw);
            }
            outbound.extend(self.ping_if_due(now)?);
            self.check_ping_timeout(now)?;
            self.report_data_count(now);
        }

        self.write_link(outbound).await
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        self.push_reply
            .as_ref()
            .and_then(|r| r.options.keep_alive_interval)
            .or(self.configuration.keep_alive_interval)
            .filter(|d| !d.is_zero())
    }

    fn keep_alive_timeout(&self) -> Duration {
        self.push_reply
            .as_ref()
            .and_then(|r| r.options.keep_alive_timeout)
            .or(self.configuration.keep_alive_timeout)
            .filter(|d| !d.is_zero())
            .unwrap_or(self.connection.ping_timeout)
    }

    fn ping_if_due(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let Some(interval) = self.keep_alive_interval() else {
            return Ok(Vec::new());
        };
        if now.saturating_duration_since(self.last_ping_out) < interval {
            return Ok(Vec::new());
        }
        let Some(data_channel) = self.data_key.and_then(|k| self.data_channels.get_mut(&k)) else {
            return Ok(Vec::new());
        };
        log::debug!("Session {}: sending ping", self.id);
        self.last_ping_out = now;
        data_channel.encrypt(&[PING_MAGIC.to_vec()])
    }

    fn check_ping_timeout(&mut self, now: Instant) -> Result<(), OpenVpnError> {
        if now.saturating_duration_since(self.last_ping_check)
            < self.connection.ping_timeout_check_interval
        {
            return Ok(());
        }
        self.last_ping_check = now;
        let timeout = self.keep_alive_timeout();
        let silent = now.saturating_duration_since(self.last_data_in);
        if silent > timeout {
            return Err(OpenVpnError::new(OpenVpnErrorKind::Timeout, "ping timeout")
                .with_detail(format!("no data for {}s", silent.as_secs())));
        }
        Ok(())
    }

    fn report_data_count(&mut self, now: Instant) {
        let due = match self.last_data_count {
            None => true,
            Some((at, inbound, outbound)) => {
                (inbound, outbound) != (self.bytes_in, self.bytes_out)
                    && now.saturating_duration_since(at) >= self.connection.min_data_count_interval
            }
        };
        if due {
            self.last_data_count = Some((now, self.bytes_in, self.bytes_out));
            self.emit(SessionEventKind::DataCount {
                inbound: self.bytes_in,
                outbound: self.bytes_out,
            });
        }
    }

    fn reset_timers(&mut self) {
        let now = self.clock.now();
        self.last_data_in = now;
        self.last_ping_out = now;
        self.last_ping_check = now;
    }

    // ── shutdown ─────────────────────────────────────────────────

    /// Stop the session. Without an error and over an unreliable link the
    /// server is told with an OCC exit first.
    pub async fn shutdown(&mut self, error: Option<OpenVpnError>) {
        if self.state == SessionState::Stopped && self.link.is_none() {
            log::debug!("Session {}: already stopped", self.id);
            return;
        }
        self.state = SessionState::Stopping;
        match &error {
            Some(e) => log::info!("Session {}: stopping on error: {}", self.id, e),
            None => log::info!("Session {}: stopping", self.id),
        }

        if let Some(link) = self.link.clone() {
            if error.is_none() && !link.is_reliable() {
                self.send_occ_exit(link.as_ref()).await;
            }
            if let Err(e) = link.shutdown().await {
                log::warn!("Session {}: link shutdown failed: {}", self.id, e);
            }
        }

        if let Some(e) = &error {
            if e.kind == OpenVpnErrorKind::AuthenticationLocalOptions {
                log::info!("Session {}: next attempt withholds local options", self.id);
                self.with_local_options = false;
            }
        }

        self.negotiators.clear();
        self.data_channels.clear();
        self.channel = None;
        self.link = None;
        self.current_key = None;
        self.data_key = None;
        self.previous_data_key = None;
        self.renegotiation = RenegotiationState::None;
        self.push_reply = None;
        self.modules = None;
        self.malformed_packets = 0;
        self.state = SessionState::Stopped;
        self.emit(SessionEventKind::Stopped { error });
    }

    async fn send_occ_exit(&mut self, link: &dyn Link) {
        let Some(data_channel) = self.data_key.and_then(|k| self.data_channels.get_mut(&k)) else {
            return;
        };
        let packets = match data_channel.encrypt(&[occ_exit_payload()]) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Session {}: cannot encrypt OCC exit: {}", self.id, e);
                return;
            }
        };
        log::debug!("Session {}: sending OCC exit", self.id);
        match tokio::time::timeout(self.connection.write_timeout, link.write_packets(packets)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Session {}: OCC exit not sent: {}", self.id, e),
            Err(_) => log::warn!("Session {}: OCC exit timed out", self.id),
        }
    }

    // ── helpers ──────────────────────────────────────────────────

    async fn write_link(&mut self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        if packets.is_empty() {
            return Ok(());
        }
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| OpenVpnError::link("no link"))?;
        link.write_packets(packets).await
    }

    fn emit(&mut self, kind: SessionEventKind) {
        self.pending_events.push(SessionEvent {
            session_id: self.id,
            at: Utc::now(),
            kind,
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Spawned task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control handle for a session running in its own task.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(
        session: Session,
        link: Arc<dyn Link>,
        tunnel: Arc<dyn Tunnel>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(256);
        let id = session.id();
        let task = tokio::spawn(run(session, link, tunnel, command_rx, event_tx));
        (
            Self {
                id,
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn renegotiate(&self) -> Result<(), OpenVpnError> {
        self.send(SessionCommand::Renegotiate).await
    }

    pub async fn shutdown(&self) -> Result<(), OpenVpnError> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Wait for the task to finish.
    pub async fn join(self) -> Result<(), OpenVpnError> {
        self.task
            .await
            .map_err(|e| OpenVpnError::internal("session task failed").with_detail(e.to_string()))
    }

    async fn send(&self, command: SessionCommand) -> Result<(), OpenVpnError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OpenVpnError::internal("session task has stopped"))
    }
}

async fn run(
    mut session: Session,
    link: Arc<dyn Link>,
    tunnel: Arc<dyn Tunnel>,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
) {
    let error = match session.start_negotiation(link).await {
        Ok(()) => event_loop(&mut session, tunnel, &mut commands, &events).await,
        Err(e) => Some(e),
    };
    if let Some(e) = &error {
        log::error!("Session {}: {}", session.id(), e);
    }
    session.shutdown(error).await;
    forward_events(&mut session, &events).await;
}

async fn event_loop(
    session: &mut Session,
    tunnel: Arc<dyn Tunnel>,
    commands: &mut mpsc::Receiver<SessionCommand>,
    events: &mpsc::Sender<SessionEvent>,
) -> Option<OpenVpnError> {
    let Some(link) = session.link() else {
        return Some(OpenVpnError::internal("session has no link"));
    };
    let mut ticker = tokio::time::interval(session.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        forward_events(session, events).await;
        let result = tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Renegotiate) => session
                    .start_renegotiation(RenegotiationKind::Client)
                    .await
                    .map(|_| ()),
                Some(SessionCommand::Shutdown) | None => return None,
            },
            packets = link.read_packets() => match packets {
                Ok(packets) => match session.receive_link(packets).await {
                    Ok(plain) if plain.is_empty() => Ok(()),
                    Ok(plain) => tunnel.write_packets(plain).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
            packets = tunnel.read_packets() => match packets {
                Ok(packets) => session.receive_tunnel(packets).await,
                Err(e) => Err(e),
            },
            _ = ticker.tick() => session.tick().await,
        };
        if let Err(e) = result {
            return Some(e);
        }
    }
}

async fn forward_events(session: &mut Session, events: &mpsc::Sender<SessionEvent>) {
    for event in session.take_events() {
        if events.send(event).await.is_err() {
            log::debug!("Session {}: event receiver dropped", session.id());
        }
    }
}
