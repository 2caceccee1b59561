//! Capability traits for everything cryptographic the protocol core drives
//! but does not implement: the TLS engine, the data-channel cipher, the
//! tls-crypt control cipher, and random bytes.

use crate::openvpn::types::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Randomness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait Prng: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), OpenVpnError>;

    fn bytes(&self, len: usize) -> Result<Vec<u8>, OpenVpnError> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(buf)
    }
}

/// Operating-system randomness through `rand`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPrng;

impl Prng for OsPrng {
    fn fill(&self, buf: &mut [u8]) -> Result<(), OpenVpnError> {
        rand::rngs::OsRng.try_fill_bytes(buf).map_err(|e| {
            OpenVpnError::new(OpenVpnErrorKind::Crypto, "random generator failed")
                .with_detail(e.to_string())
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  TLS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the TLS engine needs to verify the server and present ourselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub ca_pem: String,
    pub client_cert_pem: Option<String>,
    pub client_key_pem: Option<String>,
    /// `remote-cert-tls server`
    pub checks_eku: bool,
    /// `verify-x509-name`
    pub checks_san_host: bool,
    pub san_host: Option<String>,
}

/// A memory-BIO style TLS client: ciphertext in/out on one side, plaintext
/// in/out on the other. Handshake and certificate failures surface as
/// [`OpenVpnErrorKind::TlsFailure`].
pub trait Tls: Send {
    fn start(&mut self) -> Result<(), OpenVpnError>;
    fn put_cipher_text(&mut self, data: &[u8]) -> Result<(), OpenVpnError>;
    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>, OpenVpnError>;
    fn put_plain_text(&mut self, data: &[u8]) -> Result<(), OpenVpnError>;
    fn pull_plain_text(&mut self) -> Result<Option<Vec<u8>>, OpenVpnError>;
    fn is_connected(&self) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Data channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Key material exchanged by the key-method-2 handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub pre_master: Vec<u8>,
    pub random1: Vec<u8>,
    pub random2: Vec<u8>,
    pub server_random1: Vec<u8>,
    pub server_random2: Vec<u8>,
}

impl fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthResponse { .. }")
    }
}

/// Everything a data channel needs to derive keys and frame packets.
#[derive(Debug, Clone)]
pub struct DataChannelParams {
    pub key: u8,
    pub cipher: Cipher,
    pub digest: Digest,
    pub auth: AuthResponse,
    pub session_id: Vec<u8>,
    pub remote_session_id: Vec<u8>,
    pub peer_id: u32,
    pub compression_framing: CompressionFraming,
    pub compression_algorithm: CompressionAlgorithm,
}

/// Encrypts tunnel packets into full data-channel datagrams and back.
pub trait DataCrypto: Send {
    fn encrypt(&mut self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, OpenVpnError>;
    fn decrypt(&mut self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, OpenVpnError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  tls-crypt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Authenticated encryption of control packets for `--tls-crypt`.
/// `seal` returns `tag || ciphertext`; `open` takes the same layout.
pub trait ControlCipher: Send {
    fn tag_len(&self) -> usize;
    fn seal(&mut self, ad: &[u8], plain: &[u8]) -> Result<Vec<u8>, OpenVpnError>;
    fn open(&mut self, ad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, OpenVpnError>;
}

/// Factory for the crypto capabilities of one session.
pub trait CryptoProvider: Send + Sync {
    fn new_tls(&self, options: &TlsOptions) -> Result<Box<dyn Tls>, OpenVpnError>;
    fn new_data_channel(
        &self,
        params: DataChannelParams,
    ) -> Result<Box<dyn DataCrypto>, OpenVpnError>;
    fn new_control_cipher(&self, key: &StaticKey)
        -> Result<Box<dyn ControlCipher>, OpenVpnError>;

    /// Whether data channels from this provider can decompress LZO.
    fn supports_lzo(&self) -> bool {
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  In-memory fakes for unit tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    // ── Prng ─────────────────────────────────────────────────────

    #[test]
    fn os_prng_fills_requested_length() {
        let bytes = OsPrng.bytes(48).unwrap();
        assert_eq!(bytes.len(), 48);
    }

    #[test]
    fn os_prng_differs_between_calls() {
        assert_ne!(OsPrng.bytes(32).unwrap(), OsPrng.bytes(32).unwrap());
    }

    #[test]
    fn counting_prng_is_deterministic() {
        let p = CountingPrng::default();
        assert_eq!(p.bytes(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(p.bytes(2).unwrap(), vec![3, 4]);
    }

    // ── Debug redaction ──────────────────────────────────────────

    #[test]
    fn auth_response_debug_hides_keys() {
        let a = AuthResponse {
            pre_master: vec![0xaa; 48],
            random1: vec![1; 32],
            random2: vec![2; 32],
            server_random1: vec![3; 32],
            server_random2: vec![4; 32],
        };
        assert_eq!(format!("{:?}", a), "AuthResponse { .. }");
    }

    // ── Fakes ────────────────────────────────────────────────────

    #[test]
    fn fake_tls_handshake_then_passthrough() {
        let mut tls = FakeTls::default();
        tls.start().unwrap();
        assert_eq!(tls.pull_cipher_text().unwrap().unwrap(), CLIENT_HELLO);
        assert!(!tls.is_connected());
        tls.put_cipher_text(SERVER_HELLO).unwrap();
        assert!(tls.is_connected());
        tls.put_cipher_text(b"hi").unwrap();
        assert_eq!(tls.pull_plain_text().unwrap().unwrap(), b"hi");
    }

    #[test]
    fn fake_control_cipher_rejects_bad_tag() {
        let mut c = FakeControlCipher;
        let sealed = c.seal(b"ad", b"body").unwrap();
        assert_eq!(c.open(b"ad", &sealed).unwrap(), b"body");
        assert!(c.open(b"ad", &[1, 2, 3, 4, 5]).is_err());
    }
}
