//! Credentials and the key-method 2 exchange that follows the TLS handshake.
//!
//! Request (client → server, over TLS):
//!
//! ```text
//! 00 00 00 00 02 | pre-master (48) | random1 (32) | random2 (32)
//!   | len|options\0 | len|username\0 | len|password\0 | len|peer-info\0
//! ```
//!
//! Reply (server → client): the same prefix, two 32-byte randoms, then a
//! sized options string. Everything after that is a stream of
//! NUL-terminated control messages (`PUSH_REPLY,…`, `AUTH_FAILED`, …).

use crate::openvpn::config::Configuration;
use crate::openvpn::crypto::{AuthResponse, Prng};
use crate::openvpn::types::*;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TLS_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x02];
pub const PRE_MASTER_LEN: usize = 48;
pub const RANDOM_LEN: usize = 32;

/// `IV_VER` announced in peer info.
const PEER_INFO_VERSION: &str = "2.4";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a one-time password is combined with the static password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpMethod {
    #[default]
    None,
    /// `password + otp`
    Append,
    /// `SCRV1:base64(password):base64(otp)`, used by `static-challenge`.
    Encode,
}

/// Username/password pair (passwords are never serialized).
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub otp_method: OtpMethod,
    #[serde(skip_serializing, default)]
    pub otp: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("otp_method", &self.otp_method)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            otp_method: OtpMethod::None,
            otp: None,
        }
    }

    pub fn with_otp(mut self, method: OtpMethod, otp: impl Into<String>) -> Self {
        self.otp_method = method;
        self.otp = Some(otp.into());
        self
    }

    /// The password actually sent to the server.
    pub fn auth_password(&self) -> String {
        match (self.otp_method, &self.otp) {
            (OtpMethod::Append, Some(otp)) => format!("{}{}", self.password, otp),
            (OtpMethod::Encode, Some(otp)) => format!(
                "SCRV1:{}:{}",
                B64.encode(self.password.as_bytes()),
                B64.encode(otp.as_bytes())
            ),
            _ => self.password.clone(),
        }
    }

    /// Erase secrets (best-effort).
    pub fn wipe(&mut self) {
        self.password = String::new();
        self.otp = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Options string / peer info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Options string announced to the server, or `V0 UNDEF` when local
/// options are withheld.
pub fn options_string(options: &Configuration, with_local_options: bool) -> String {
    if !with_local_options {
        return "V0 UNDEF".into();
    }
    let mut opts: Vec<String> = vec!["V4".into(), "dev-type tun".into()];
    match options.compression_framing {
        Some(CompressionFraming::CompLzo) => opts.push("comp-lzo".into()),
        Some(CompressionFraming::Compress) => opts.push("compress".into()),
        _ => {}
    }
    if let Some(direction) = options.tls_wrap.as_ref().and_then(|w| w.key.direction) {
        opts.push(format!("keydir {}", direction.index()));
    }
    let cipher = options.fallback_cipher();
    opts.push(format!("cipher {}", cipher));
    opts.push(format!("auth {}", options.fallback_digest()));
    opts.push(format!("keysize {}", cipher.key_size()));
    if let Some(wrap) = &options.tls_wrap {
        opts.push(format!("tls-{}", wrap.strategy));
    }
    opts.push("key-method 2".into());
    opts.push("tls-client".into());
    opts.join(",")
}

fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        "windows" => "win",
        other => other,
    }
}

/// `IV_*` lines sent after the credentials.
pub fn peer_info(options: &Configuration, tls_version: Option<&str>) -> String {
    let ciphers: Vec<String> = options
        .announced_ciphers()
        .iter()
        .map(|c| c.to_string())
        .collect();
    let mut lines = vec![
        format!("IV_VER={}", PEER_INFO_VERSION),
        format!("IV_PLAT={}", platform()),
        "IV_PROTO=2".to_string(),
        "IV_NCP=2".to_string(),
        format!("IV_CIPHERS={}", ciphers.join(":")),
        "IV_LZO_STUB=1".to_string(),
    ];
    if let Some(v) = tls_version {
        lines.push(format!("IV_SSL={}", v));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Append `u16 length | bytes | NUL`, the length counting the NUL.
fn put_sized_string(buf: &mut BytesMut, value: &str) -> Result<(), OpenVpnError> {
    let len = u16::try_from(value.len() + 1)
        .map_err(|_| OpenVpnError::internal("auth string too long"))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Authenticator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Authenticator {
    control_buffer: BytesMut,
    pre_master: Vec<u8>,
    random1: Vec<u8>,
    random2: Vec<u8>,
    server_random1: Option<Vec<u8>>,
    server_random2: Option<Vec<u8>>,
    username: Option<String>,
    password: Option<String>,
    pub with_local_options: bool,
    pub tls_version: Option<String>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("buffered", &self.control_buffer.len())
            .field("has_credentials", &self.username.is_some())
            .field("with_local_options", &self.with_local_options)
            .finish()
    }
}

impl Authenticator {
    pub fn new(
        prng: &dyn Prng,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, OpenVpnError> {
        let (username, password) = match (username, password) {
            (Some(u), Some(p)) => (Some(u), Some(p)),
            _ => (None, None),
        };
        Ok(Self {
            control_buffer: BytesMut::new(),
            pre_master: prng.bytes(PRE_MASTER_LEN)?,
            random1: prng.bytes(RANDOM_LEN)?,
            random2: prng.bytes(RANDOM_LEN)?,
            server_random1: None,
            server_random2: None,
            username,
            password,
            with_local_options: true,
            tls_version: None,
        })
    }

    /// Plaintext auth request to write into the TLS tunnel.
    pub fn request(&self, options: &Configuration) -> Result<Vec<u8>, OpenVpnError> {
        let mut raw = BytesMut::new();
        raw.put_slice(&TLS_PREFIX);
        raw.put_slice(&self.pre_master);
        raw.put_slice(&self.random1);
        raw.put_slice(&self.random2);

        let opts = options_string(options, self.with_local_options);
        log::info!("TLS.auth: local options: {}", opts);
        put_sized_string(&mut raw, &opts)?;

        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                put_sized_string(&mut raw, u)?;
                put_sized_string(&mut raw, p)?;
            }
            _ => {
                raw.put_u16(0);
                raw.put_u16(0);
            }
        }

        put_sized_string(&mut raw, &peer_info(options, self.tls_version.as_deref()))?;
        crate::openvpn::logging::trace_packet("out", "auth request", &raw);
        Ok(raw.to_vec())
    }

    pub fn append_control_data(&mut self, data: &[u8]) {
        self.control_buffer.extend_from_slice(data);
    }

    /// Consume the server's auth reply. `Ok(false)` means more data is needed.
    pub fn parse_auth_reply(&mut self) -> Result<bool, OpenVpnError> {
        let header_len = TLS_PREFIX.len() + 2 * RANDOM_LEN + 2;
        if self.control_buffer.len() < header_len {
            return Ok(false);
        }
        if self.control_buffer[..TLS_PREFIX.len()] != TLS_PREFIX {
            return Err(OpenVpnError::format("wrong control data prefix").with_detail(
                crate::openvpn::logging::hex_preview(&self.control_buffer[..TLS_PREFIX.len()]),
            ));
        }

        let mut cursor = &self.control_buffer[TLS_PREFIX.len()..];
        let server_random1 = cursor[..RANDOM_LEN].to_vec();
        cursor.advance(RANDOM_LEN);
        let server_random2 = cursor[..RANDOM_LEN].to_vec();
        cursor.advance(RANDOM_LEN);
        let opts_len = cursor.get_u16() as usize;
        if cursor.remaining() < opts_len {
            return Ok(false);
        }
        let server_opts = &cursor[..opts_len];
        let server_opts = server_opts.split(|b| *b == 0).next().unwrap_or_default();
        log::info!(
            "TLS.auth: server options: \"{}\"",
            String::from_utf8_lossy(server_opts)
        );

        self.server_random1 = Some(server_random1);
        self.server_random2 = Some(server_random2);
        self.control_buffer.advance(header_len + opts_len);
        Ok(true)
    }

    /// Drain every complete NUL-terminated message from the buffer.
    pub fn parse_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(end) = self.control_buffer.iter().position(|b| *b == 0) {
            let msg = self.control_buffer.split_to(end + 1);
            messages.push(String::from_utf8_lossy(&msg[..end]).into_owned());
        }
        messages
    }

    pub fn response(&self) -> Option<AuthResponse> {
        Some(AuthResponse {
            pre_master: self.pre_master.clone(),
            random1: self.random1.clone(),
            random2: self.random2.clone(),
            server_random1: self.server_random1.clone()?,
            server_random2: self.server_random2.clone()?,
        })
    }

    /// Zero key material and forget credentials.
    pub fn reset(&mut self) {
        for buf in [
            &mut self.pre_master,
            &mut self.random1,
            &mut self.random2,
        ] {
            buf.iter_mut().for_each(|b| *b = 0);
        }
        self.control_buffer.clear();
        self.server_random1 = None;
        self.server_random2 = None;
        self.username = None;
        self.password = None;
    }
}
