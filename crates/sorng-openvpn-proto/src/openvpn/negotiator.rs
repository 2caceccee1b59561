//! One key negotiation: reset handshake, TLS, key-method 2 auth, then
//! `PUSH_REQUEST` until the server answers with its settings.
//!
//! The negotiator is sans-IO. Every entry point takes the session's
//! [`ControlChannel`] and returns the raw datagrams to put on the link; the
//! session owns the link and the timers that call [`Negotiator::check`].
//!
//! ```text
//! Idle ─start─▶ SentHardReset ─reset ack─▶ TlsHandshaking ─TLS up─▶ TlsEstablished
//!      ─auth sent─▶ SentAuth ─auth reply─▶ SentPushRequest ─PUSH_REPLY─▶ Established
//! any ─error─▶ Failed
//! ```
//!
//! A renegotiation skips `PUSH_REQUEST` and reuses the last push reply.

use crate::openvpn::auth::{Authenticator, Credentials};
use crate::openvpn::clock::Clock;
use crate::openvpn::config::{Configuration, ConnectionOptions};
use crate::openvpn::control::ControlChannel;
use crate::openvpn::crypto::{CryptoProvider, DataChannelParams, DataCrypto, Prng, Tls};
use crate::openvpn::packet::{next_key_id, ControlPacket, Opcode, PEER_ID_DISABLED};
use crate::openvpn::push_reply::PushReply;
use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PUSH_REQUEST: &[u8] = b"PUSH_REQUEST\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiatorState {
    Idle,
    SentHardReset,
    TlsHandshaking,
    TlsEstablished,
    SentAuth,
    SentPushRequest,
    Established,
    Failed,
}

impl fmt::Display for NegotiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::SentHardReset => "sent-hard-reset",
            Self::TlsHandshaking => "tls-handshaking",
            Self::TlsEstablished => "tls-established",
            Self::SentAuth => "sent-auth",
            Self::SentPushRequest => "sent-push-request",
            Self::Established => "established",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Inputs shared by every negotiator of one session.
#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    pub configuration: Arc<Configuration>,
    pub credentials: Option<Credentials>,
    pub with_local_options: bool,
    pub connection: ConnectionOptions,
    pub link_reliable: bool,
}

/// What a successful negotiation hands to the session.
pub struct Established {
    pub key: u8,
    pub data_channel: Box<dyn DataCrypto>,
    pub push_reply: PushReply,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("key", &self.key)
            .field("push_reply", &self.push_reply)
            .finish_non_exhaustive()
    }
}

pub struct Negotiator {
    key: u8,
    state: NegotiatorState,
    /// Every state entered, in order.
    transitions: Vec<NegotiatorState>,
    renegotiation: Option<RenegotiationKind>,
    history: Option<PushReply>,

    options: Arc<NegotiatorOptions>,
    provider: Arc<dyn CryptoProvider>,
    prng: Arc<dyn Prng>,
    clock: Arc<dyn Clock>,

    tls: Box<dyn Tls>,
    authenticator: Option<Authenticator>,

    started_at: Instant,
    negotiation_timeout: Duration,
    next_push_request: Option<Instant>,
    push_requests_sent: u32,
    established: Option<Established>,
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("renegotiation", &self.renegotiation)
            .finish_non_exhaustive()
    }
}

impl Negotiator {
    pub fn new(
        key: u8,
        options: Arc<NegotiatorOptions>,
        provider: Arc<dyn CryptoProvider>,
        prng: Arc<dyn Prng>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OpenVpnError> {
        let tls = provider.new_tls(&options.configuration.tls_options())?;
        let negotiation_timeout = options.connection.negotiation_timeout;
        let started_at = clock.now();
        Ok(Self {
            key,
            state: NegotiatorState::Idle,
            transitions: vec![NegotiatorState::Idle],
            renegotiation: None,
            history: None,
            options,
            provider,
            prng,
            clock,
            tls,
            authenticator: None,
            started_at,
            negotiation_timeout,
            next_push_request: None,
            push_requests_sent: 0,
            established: None,
        })
    }

    /// A fresh negotiator for the next key id, carrying the last push reply.
    pub fn for_renegotiation(&self, kind: RenegotiationKind) -> Result<Self, OpenVpnError> {
        let history = self.history.clone().ok_or_else(|| {
            OpenVpnError::internal("renegotiation before first negotiation completed")
        })?;
        let mut next = Self::new(
            next_key_id(self.key),
            self.options.clone(),
            self.provider.clone(),
            self.prng.clone(),
            self.clock.clone(),
        )?;
        next.renegotiation = Some(kind);
        next.history = Some(history);
        next.negotiation_timeout = self.options.connection.soft_negotiation_timeout;
        Ok(next)
    }

    // ── accessors ────────────────────────────────────────────────

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn transitions(&self) -> &[NegotiatorState] {
        &self.transitions
    }

    pub fn renegotiation(&self) -> Option<RenegotiationKind> {
        self.renegotiation
    }

    pub fn history(&self) -> Option<&PushReply> {
        self.history.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiatorState::Established
    }

    pub fn is_renegotiating(&self) -> bool {
        self.renegotiation.is_some() && !self.is_connected()
    }

    /// Hand over the data channel once, after the negotiation completed.
    pub fn take_established(&mut self) -> Option<Established> {
        self.established.take()
    }

    /// `reneg-sec` elapsed since this key was negotiated.
    pub fn should_renegotiate(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let period = self
            .history
            .as_ref()
            .and_then(|h| h.options.renegotiates_after)
            .or(self.options.configuration.renegotiates_after);
        match period {
            Some(p) if !p.is_zero() => self.clock.elapsed_since(self.started_at) >= p,
            _ => false,
        }
    }

    // ── entry points ─────────────────────────────────────────────

    /// Reset the channel and send the opening reset packet.
    pub fn start(&mut self, channel: &mut ControlChannel) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let result = self.do_start(channel);
        self.guard(result)
    }

    /// Timers: reset and negotiation deadlines, push-request retries and
    /// retransmission of unacknowledged packets.
    pub fn check(&mut self, channel: &mut ControlChannel) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        if self.state == NegotiatorState::Failed {
            return Ok(Vec::new());
        }
        let result = self.do_check(channel);
        self.guard(result)
    }

    /// Process an in-order control packet addressed to this key.
    pub fn handle_control_packet(
        &mut self,
        channel: &mut ControlChannel,
        packet: ControlPacket,
    ) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        if self.state == NegotiatorState::Failed {
            log::debug!("Negotiator[{}]: failed, dropping {:?}", self.key, packet);
            return Ok(Vec::new());
        }
        let result = self.do_handle_control_packet(channel, packet);
        self.guard(result)
    }

    // ── internals ────────────────────────────────────────────────

    fn guard<T>(&mut self, result: Result<T, OpenVpnError>) -> Result<T, OpenVpnError> {
        if let Err(e) = &result {
            log::error!("Negotiator[{}]: {}", self.key, e);
            self.set_state(NegotiatorState::Failed);
        }
        result
    }

    fn set_state(&mut self, state: NegotiatorState) {
        if self.state != state {
            log::info!("Negotiator[{}]: {} -> {}", self.key, self.state, state);
            self.state = state;
            self.transitions.push(state);
        }
    }

    fn flush(&mut self, channel: &mut ControlChannel) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let resend_after = if self.options.link_reliable {
            Duration::MAX
        } else {
            self.options.connection.retransmission_interval
        };
        channel.write_outbound(self.clock.now(), resend_after)
    }

    fn do_start(&mut self, channel: &mut ControlChannel) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        channel.reset(self.prng.as_ref(), self.renegotiation.is_none())?;
        match self.renegotiation {
            Some(RenegotiationKind::Client) => {
                log::info!("Negotiator[{}]: renegotiating (client)", self.key);
                channel.enqueue_outbound(Opcode::SoftResetV1, self.key, &[])?;
            }
            Some(RenegotiationKind::Server) => {
                log::info!("Negotiator[{}]: renegotiating (server)", self.key);
            }
            None => {
                channel.enqueue_outbound(Opcode::HardResetClientV2, self.key, &[])?;
            }
        }
        self.started_at = self.clock.now();
        self.set_state(NegotiatorState::SentHardReset);
        self.flush(channel)
    }

    fn do_check(&mut self, channel: &mut ControlChannel) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.started_at);

        if self.state == NegotiatorState::SentHardReset
            && self.renegotiation.is_none()
            && elapsed > self.options.connection.hard_reset_timeout
        {
            return Err(OpenVpnError::new(OpenVpnErrorKind::Timeout, "negotiation timed out")
                .with_detail(OpenVpnError::HARD_RESET_DETAIL));
        }
        if !self.is_connected() && elapsed > self.negotiation_timeout {
            return Err(OpenVpnError::new(OpenVpnErrorKind::Timeout, "negotiation timed out")
                .with_detail(format!("state {}", self.state)));
        }
        if self.state == NegotiatorState::SentPushRequest
            && self.next_push_request.map(|t| now >= t).unwrap_or(false)
        {
            self.send_push_request(channel)?;
        }
        self.flush(channel)
    }

    fn do_handle_control_packet(
        &mut self,
        channel: &mut ControlChannel,
        packet: ControlPacket,
    ) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        if packet.key != self.key {
            log::error!(
                "Negotiator[{}]: packet for key {}, ignoring",
                self.key,
                packet.key
            );
            return Ok(Vec::new());
        }

        match self.state {
            NegotiatorState::Idle => {
                log::debug!("Negotiator[{}]: not started, dropping {:?}", self.key, packet);
                return Ok(Vec::new());
            }
            NegotiatorState::SentHardReset => {
                match packet.code {
                    Opcode::HardResetServerV2 => channel.set_remote_session_id(packet.session_id),
                    Opcode::SoftResetV1 => self.check_remote_session(channel, &packet)?,
                    other => {
                        log::debug!("Negotiator[{}]: waiting for reset, got {}", self.key, other);
                        return Ok(Vec::new());
                    }
                }
                self.set_state(NegotiatorState::TlsHandshaking);
                self.tls.start()?;
                self.pull_cipher_text(channel)?;
            }
            NegotiatorState::TlsHandshaking
            | NegotiatorState::TlsEstablished
            | NegotiatorState::SentAuth
            | NegotiatorState::SentPushRequest
            | NegotiatorState::Established => {
                if packet.code != Opcode::ControlV1 {
                    log::debug!("Negotiator[{}]: ignoring {}", self.key, packet.code);
                    return Ok(Vec::new());
                }
                self.check_remote_session(channel, &packet)?;
                self.tls.put_cipher_text(&packet.payload)?;
                self.pull_cipher_text(channel)?;

                if self.state == NegotiatorState::TlsHandshaking && self.tls.is_connected() {
                    self.on_tls_connect(channel)?;
                }
                while let Some(data) = self.tls.pull_plain_text()? {
                    self.handle_control_data(channel, &data)?;
                }
            }
            NegotiatorState::Failed => return Ok(Vec::new()),
        }
        self.flush(channel)
    }

    fn check_remote_session(
        &self,
        channel: &ControlChannel,
        packet: &ControlPacket,
    ) -> Result<(), OpenVpnError> {
        if channel.remote_session_id() != Some(packet.session_id) {
            return Err(OpenVpnError::link("packet from unexpected remote session").with_detail(
                format!(
                    "expected {}, got {}",
                    channel.remote_session_id().map(hex::encode).unwrap_or_default(),
                    hex::encode(packet.session_id)
                ),
            ));
        }
        Ok(())
    }

    fn pull_cipher_text(&mut self, channel: &mut ControlChannel) -> Result<(), OpenVpnError> {
        while let Some(cipher_text) = self.tls.pull_cipher_text()? {
            channel.enqueue_outbound(Opcode::ControlV1, self.key, &cipher_text)?;
        }
        Ok(())
    }

    fn on_tls_connect(&mut self, channel: &mut ControlChannel) -> Result<(), OpenVpnError> {
        self.set_state(NegotiatorState::TlsEstablished);
        let credentials = self.options.credentials.as_ref();
        let username = credentials.map(|c| c.username.clone());
        let password = self
            .history
            .as_ref()
            .and_then(|h| h.options.auth_token.clone())
            .or_else(|| credentials.map(Credentials::auth_password));

        let mut authenticator = Authenticator::new(self.prng.as_ref(), username, password)?;
        authenticator.with_local_options = self.options.with_local_options;
        let request = authenticator.request(&self.options.configuration)?;
        self.tls.put_plain_text(&request)?;
        self.pull_cipher_text(channel)?;
        self.authenticator = Some(authenticator);
        self.set_state(NegotiatorState::SentAuth);
        Ok(())
    }

    fn handle_control_data(
        &mut self,
        channel: &mut ControlChannel,
        data: &[u8],
    ) -> Result<(), OpenVpnError> {
        let mut reply_parsed = false;
        let messages = {
            let Some(authenticator) = self.authenticator.as_mut() else {
                log::warn!("Negotiator[{}]: control data before auth, dropping", self.key);
                return Ok(());
            };
            authenticator.append_control_data(data);
            if self.state == NegotiatorState::SentAuth {
                if !authenticator.parse_auth_reply()? {
                    return Ok(());
                }
                reply_parsed = true;
            }
            authenticator.parse_messages()
        };

        if reply_parsed {
            if self.renegotiation.is_some() {
                let reply = self.history.clone().ok_or_else(|| {
                    OpenVpnError::internal("renegotiation without a previous push reply")
                })?;
                self.set_state(NegotiatorState::Established);
                return self.complete(channel, reply);
            }
            self.set_state(NegotiatorState::SentPushRequest);
            self.send_push_request(channel)?;
        }

        for message in messages {
            self.handle_control_message(channel, &message)?;
        }
        Ok(())
    }

    fn handle_control_message(
        &mut self,
        channel: &mut ControlChannel,
        message: &str,
    ) -> Result<(), OpenVpnError> {
        if message.starts_with("AUTH_FAILED") {
            let kind = if self.options.with_local_options {
                OpenVpnErrorKind::AuthenticationLocalOptions
            } else {
                OpenVpnErrorKind::Authentication
            };
            return Err(OpenVpnError::new(kind, "server rejected authentication")
                .with_detail(message.to_string()));
        }
        if message.starts_with("RESTART") {
            return Err(OpenVpnError::new(
                OpenVpnErrorKind::ServerShutdown,
                "server requested restart",
            )
            .with_detail(message.to_string()));
        }
        if self.state != NegotiatorState::SentPushRequest || !PushReply::is_push_reply(message) {
            log::debug!(
                "Negotiator[{}]: ignoring control message in state {}",
                self.key,
                self.state
            );
            return Ok(());
        }

        let reply = PushReply::parse(message)?;
        log::info!("Negotiator[{}]: received PUSH_REPLY: \"{}\"", self.key, reply);

        match reply.options.compression_algorithm {
            Some(CompressionAlgorithm::Lzo) if !self.provider.supports_lzo() => {
                return Err(OpenVpnError::new(
                    OpenVpnErrorKind::CompressionMismatch,
                    "server requires LZO compression",
                ));
            }
            Some(CompressionAlgorithm::Other) => {
                return Err(OpenVpnError::new(
                    OpenVpnErrorKind::CompressionMismatch,
                    "server requires unsupported compression",
                ));
            }
            _ => {}
        }
        if reply.options.ipv4.is_none() && reply.options.ipv6.is_none() {
            return Err(OpenVpnError::new(
                OpenVpnErrorKind::NoRouting,
                "PUSH_REPLY assigns no address",
            ));
        }

        self.set_state(NegotiatorState::Established);
        self.complete(channel, reply)
    }

    fn send_push_request(&mut self, channel: &mut ControlChannel) -> Result<(), OpenVpnError> {
        let max = self.options.connection.max_push_requests;
        if self.push_requests_sent >= max {
            return Err(OpenVpnError::new(OpenVpnErrorKind::Timeout, "no PUSH_REPLY from server")
                .with_detail(format!("{} requests sent", max)));
        }
        log::debug!(
            "Negotiator[{}]: sending PUSH_REQUEST ({}/{})",
            self.key,
            self.push_requests_sent + 1,
            max
        );
        self.tls.put_plain_text(PUSH_REQUEST)?;
        self.pull_cipher_text(channel)?;
        self.push_requests_sent += 1;
        self.next_push_request =
            Some(self.clock.now() + self.options.connection.push_request_interval);
        Ok(())
    }

    fn complete(
        &mut self,
        channel: &ControlChannel,
        reply: PushReply,
    ) -> Result<(), OpenVpnError> {
        let authenticator = self
            .authenticator
            .as_mut()
            .ok_or_else(|| OpenVpnError::internal("no authenticator at completion"))?;
        let auth = authenticator
            .response()
            .ok_or_else(|| OpenVpnError::internal("auth response incomplete"))?;
        let session_id = channel
            .session_id()
            .ok_or_else(|| OpenVpnError::internal("no session id at completion"))?;
        let remote_session_id = channel
            .remote_session_id()
            .ok_or_else(|| OpenVpnError::internal("no remote session id at completion"))?;

        let local = &self.options.configuration;
        let remote = &reply.options;
        let params = DataChannelParams {
            key: self.key,
            cipher: remote.cipher.unwrap_or_else(|| local.fallback_cipher()),
            digest: remote.digest.unwrap_or_else(|| local.fallback_digest()),
            auth,
            session_id: session_id.to_vec(),
            remote_session_id: remote_session_id.to_vec(),
            peer_id: remote.peer_id.unwrap_or(PEER_ID_DISABLED),
            compression_framing: remote
                .compression_framing
                .unwrap_or_else(|| local.fallback_compression_framing()),
            compression_algorithm: remote
                .compression_algorithm
                .or(local.compression_algorithm)
                .unwrap_or(CompressionAlgorithm::Disabled),
        };
        log::info!(
            "Negotiator[{}]: data channel {} / {} peer-id {:#x}",
            self.key,
            params.cipher,
            params.digest,
            params.peer_id
        );
        let data_channel = self.provider.new_data_channel(params)?;
        authenticator.reset();

        self.history = Some(reply.clone());
        self.established = Some(Established {
            key: self.key,
            data_channel,
            push_reply: reply,
        });
        Ok(())
    }
}
