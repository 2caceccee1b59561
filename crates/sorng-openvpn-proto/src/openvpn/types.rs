//! Shared enums, value types and the error taxonomy for the protocol core.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Protocol / transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport protocol for the VPN link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    Udp,
    Udp4,
    Udp6,
    Tcp,
    Tcp4,
    Tcp6,
}

impl Default for VpnProtocol {
    fn default() -> Self {
        Self::Udp
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Udp4 => write!(f, "udp4"),
            Self::Udp6 => write!(f, "udp6"),
            Self::Tcp => write!(f, "tcp"),
            Self::Tcp4 => write!(f, "tcp4"),
            Self::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl VpnProtocol {
    /// Parse from an OpenVPN `proto` argument. Unknown values are rejected.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "udp4" => Some(Self::Udp4),
            "udp6" => Some(Self::Udp6),
            "tcp" | "tcp-client" => Some(Self::Tcp),
            "tcp4" | "tcp4-client" => Some(Self::Tcp4),
            "tcp6" | "tcp6-client" => Some(Self::Tcp6),
            _ => None,
        }
    }

    /// Stream transports deliver in order and never drop.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Tcp | Self::Tcp4 | Self::Tcp6)
    }
}

/// A remote endpoint entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: VpnProtocol,
}

impl Default for RemoteEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1194,
            protocol: VpnProtocol::Udp,
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.protocol)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Cipher / digest / compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Data-channel cipher algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Default for Cipher {
    fn default() -> Self {
        Self::Aes128Cbc
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes128Cbc => write!(f, "AES-128-CBC"),
            Self::Aes192Cbc => write!(f, "AES-192-CBC"),
            Self::Aes256Cbc => write!(f, "AES-256-CBC"),
            Self::Aes128Gcm => write!(f, "AES-128-GCM"),
            Self::Aes192Gcm => write!(f, "AES-192-GCM"),
            Self::Aes256Gcm => write!(f, "AES-256-GCM"),
            Self::ChaCha20Poly1305 => write!(f, "CHACHA20-POLY1305"),
        }
    }
}

impl Cipher {
    /// Parse from config string. `None` for ciphers this build does not carry.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "AES-128-CBC" => Some(Self::Aes128Cbc),
            "AES-192-CBC" => Some(Self::Aes192Cbc),
            "AES-256-CBC" => Some(Self::Aes256Cbc),
            "AES-128-GCM" => Some(Self::Aes128Gcm),
            "AES-192-GCM" => Some(Self::Aes192Gcm),
            "AES-256-GCM" => Some(Self::Aes256Gcm),
            "CHACHA20-POLY1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Whether this cipher uses AEAD (no separate HMAC needed).
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Self::Aes128Gcm | Self::Aes192Gcm | Self::Aes256Gcm | Self::ChaCha20Poly1305
        )
    }

    /// Key size in bits, as advertised in the `keysize` local option.
    pub fn key_size(&self) -> u32 {
        match self {
            Self::Aes128Cbc | Self::Aes128Gcm => 128,
            Self::Aes192Cbc | Self::Aes192Gcm => 192,
            Self::Aes256Cbc | Self::Aes256Gcm | Self::ChaCha20Poly1305 => 256,
        }
    }
}

/// HMAC digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Digest {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Default for Digest {
    fn default() -> Self {
        Self::Sha1
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "SHA1"),
            Self::Sha224 => write!(f, "SHA224"),
            Self::Sha256 => write!(f, "SHA256"),
            Self::Sha384 => write!(f, "SHA384"),
            Self::Sha512 => write!(f, "SHA512"),
        }
    }
}

impl Digest {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SHA1" | "SHA" => Some(Self::Sha1),
            "SHA224" => Some(Self::Sha224),
            "SHA256" => Some(Self::Sha256),
            "SHA384" => Some(Self::Sha384),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// HMAC output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// How compression is framed on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionFraming {
    Disabled,
    /// `comp-lzo`
    CompLzo,
    /// `compress`
    Compress,
    /// `compress stub-v2`
    CompressV2,
}

impl Default for CompressionFraming {
    fn default() -> Self {
        Self::Disabled
    }
}

impl fmt::Display for CompressionFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::CompLzo => write!(f, "comp-lzo"),
            Self::Compress => write!(f, "compress"),
            Self::CompressV2 => write!(f, "compress-v2"),
        }
    }
}

/// Compression algorithm actually applied to payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Disabled,
    Lzo,
    /// Anything else the server may announce (lz4, …).
    Other,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        Self::Disabled
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Lzo => write!(f, "lzo"),
            Self::Other => write!(f, "other"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  TLS wrapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// TLS wrapping strategy for the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsWrapStrategy {
    /// `--tls-auth`
    Auth,
    /// `--tls-crypt`
    Crypt,
}

impl fmt::Display for TlsWrapStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Crypt => write!(f, "crypt"),
        }
    }
}

/// `key-direction` of a static key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDirection {
    Server,
    Client,
}

impl KeyDirection {
    pub fn from_index(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Server),
            1 => Some(Self::Client),
            _ => None,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            Self::Server => 0,
            Self::Client => 1,
        }
    }
}

/// OpenVPN static key (2048 bits), split into four 512-bit slots.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticKey {
    pub data: Vec<u8>,
    pub direction: Option<KeyDirection>,
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("len", &self.data.len())
            .field("direction", &self.direction)
            .finish()
    }
}

impl StaticKey {
    pub const LENGTH: usize = 256;
    const SLOT: usize = 64;

    pub fn new(data: Vec<u8>, direction: Option<KeyDirection>) -> Result<Self, OpenVpnError> {
        if data.len() != Self::LENGTH {
            return Err(OpenVpnError::new(
                OpenVpnErrorKind::ParseError,
                format!("static key must be {} bytes, got {}", Self::LENGTH, data.len()),
            ));
        }
        Ok(Self { data, direction })
    }

    /// Parse the body of an inline `<tls-auth>`/`<tls-crypt>` block.
    pub fn from_lines<S: AsRef<str>>(
        lines: &[S],
        direction: Option<KeyDirection>,
    ) -> Result<Self, OpenVpnError> {
        let hex_body: String = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("-----"))
            .collect();
        let data = hex::decode(&hex_body).map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::ParseError, "static key is not valid hex")
                .with_detail(e.to_string())
        })?;
        Self::new(data, direction)
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.data[index * Self::SLOT..(index + 1) * Self::SLOT]
    }

    pub fn cipher_encrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(0),
            Some(KeyDirection::Client) => self.slot(2),
        }
    }

    pub fn cipher_decrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(0),
            Some(KeyDirection::Server) => self.slot(2),
        }
    }

    pub fn hmac_send_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Server) => self.slot(1),
            Some(KeyDirection::Client) => self.slot(3),
        }
    }

    pub fn hmac_receive_key(&self) -> &[u8] {
        match self.direction {
            None | Some(KeyDirection::Client) => self.slot(1),
            Some(KeyDirection::Server) => self.slot(3),
        }
    }
}

/// Control channel wrapping: strategy plus the shared static key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsWrap {
    pub strategy: TlsWrapStrategy,
    pub key: StaticKey,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Routing policy / pull mask / proxies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway policies derived from `redirect-gateway`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    Ipv4,
    Ipv6,
    BlockLocal,
}

/// Categories of server-pushed settings the client may refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullCategory {
    Routes,
    Dns,
    Proxy,
}

impl PullCategory {
    pub fn all() -> Vec<Self> {
        vec![Self::Routes, Self::Dns, Self::Proxy]
    }
}

/// HTTP/HTTPS proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Renegotiation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who asked for a renegotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenegotiationKind {
    /// Local `reneg-sec` expiry; we send SOFT_RESET.
    Client,
    /// The server sent SOFT_RESET.
    Server,
}

/// Whether a renegotiation is in flight, tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenegotiationState {
    None,
    InProgress { generation: u64 },
}

impl Default for RenegotiationState {
    fn default() -> Self {
        Self::None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenVpnErrorKind {
    /// Negotiation, ping, or control-channel delivery exceeded its deadline.
    Timeout,
    /// Server rejected credentials.
    Authentication,
    /// Server rejected the auth request carrying local options.
    AuthenticationLocalOptions,
    /// Certificate validation, handshake, or EKU check failed.
    TlsFailure,
    /// Cipher/HMAC/random-generator failure.
    Crypto,
    /// Cipher or digest not supported by this build.
    UnsupportedAlgorithm,
    /// Server compression incompatible with this client.
    CompressionMismatch,
    /// Negotiated settings yield no usable address.
    NoRouting,
    /// Server explicitly closed the session.
    ServerShutdown,
    /// Underlying transport read/write failed.
    LinkFailure,
    /// Malformed PUSH_REPLY or local configuration.
    ParseError,
    /// Malformed control packet.
    FormatError,
    /// Multi-part push reply this client does not reassemble.
    ContinuationPushReply,
    /// Server hard-reset while we were connected.
    StaleSession,
    Internal,
}

/// Crate-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnError {
    pub kind: OpenVpnErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for OpenVpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for OpenVpnError {}

impl OpenVpnError {
    pub const HARD_RESET_DETAIL: &'static str = "no hard reset from server";

    pub fn new(kind: OpenVpnErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::new(OpenVpnErrorKind::FormatError, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(OpenVpnErrorKind::ParseError, msg)
    }

    pub fn link(msg: impl Into<String>) -> Self {
        Self::new(OpenVpnErrorKind::LinkFailure, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(OpenVpnErrorKind::Internal, msg)
    }

    /// The caller may retry right away (e.g. next remote) without user input.
    pub fn is_recoverable(&self) -> bool {
        match self.kind {
            OpenVpnErrorKind::StaleSession => true,
            OpenVpnErrorKind::Timeout => {
                self.detail.as_deref() == Some(Self::HARD_RESET_DETAIL)
            }
            _ => false,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self.kind,
            OpenVpnErrorKind::Authentication | OpenVpnErrorKind::AuthenticationLocalOptions
        )
    }
}

impl From<OpenVpnError> for String {
    fn from(e: OpenVpnError) -> String {
        e.to_string()
    }
}
