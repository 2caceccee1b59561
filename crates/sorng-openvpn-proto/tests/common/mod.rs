#![allow(dead_code)]

use sorng_openvpn_proto::openvpn::auth::TLS_PREFIX;
use sorng_openvpn_proto::openvpn::packet::parse_header_byte;
use sorng_openvpn_proto::openvpn::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

pub const CLIENT_HELLO: &[u8] = b"CLIENT_HELLO";
pub const SERVER_HELLO: &[u8] = b"SERVER_HELLO";
pub const SERVER_SID: SessionId = [0xee; 8];

/// One hello each way, then records pass through as-is.
#[derive(Default)]
pub struct ScriptedTls {
    connected: bool,
    cipher_out: VecDeque<Vec<u8>>,
    plain_in: VecDeque<Vec<u8>>,
}

impl Tls for ScriptedTls {
    fn start(&mut self) -> Result<(), OpenVpnError> {
        self.cipher_out.push_back(CLIENT_HELLO.to_vec());
        Ok(())
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<(), OpenVpnError> {
        if !self.connected {
            self.connected = data == SERVER_HELLO;
            return Ok(());
        }
        self.plain_in.push_back(data.to_vec());
        Ok(())
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>, OpenVpnError> {
        Ok(self.cipher_out.pop_front())
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<(), OpenVpnError> {
        self.cipher_out.push_back(data.to_vec());
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Option<Vec<u8>>, OpenVpnError> {
        Ok(self.plain_in.pop_front())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// `DataV2 header | peer id | payload`, no encryption.
pub struct FramingDataCrypto {
    key: u8,
    peer_id: u32,
}

impl DataCrypto for FramingDataCrypto {
    fn encrypt(&mut self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        Ok(packets
            .iter()
            .map(|p| {
                let mut out = vec![(9u8 << 3) | self.key];
                out.extend_from_slice(&self.peer_id.to_be_bytes()[1..]);
                out.extend_from_slice(p);
                out
            })
            .collect())
    }

    fn decrypt(&mut self, packets: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        packets
            .iter()
            .map(|p| {
                p.get(4..)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| OpenVpnError::new(OpenVpnErrorKind::Crypto, "short packet"))
            })
            .collect()
    }
}

pub struct NullControlCipher;

impl ControlCipher for NullControlCipher {
    fn tag_len(&self) -> usize {
        0
    }

    fn seal(&mut self, _ad: &[u8], plain: &[u8]) -> Result<Vec<u8>, OpenVpnError> {
        Ok(plain.to_vec())
    }

    fn open(&mut self, _ad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, OpenVpnError> {
        Ok(sealed.to_vec())
    }
}

#[derive(Default)]
pub struct TestProvider;

impl CryptoProvider for TestProvider {
    fn new_tls(&self, _options: &TlsOptions) -> Result<Box<dyn Tls>, OpenVpnError> {
        Ok(Box::new(ScriptedTls::default()))
    }

    fn new_data_channel(
        &self,
        params: DataChannelParams,
    ) -> Result<Box<dyn DataCrypto>, OpenVpnError> {
        Ok(Box::new(FramingDataCrypto {
            key: params.key,
            peer_id: params.peer_id,
        }))
    }

    fn new_control_cipher(&self, _key: &StaticKey) -> Result<Box<dyn ControlCipher>, OpenVpnError> {
        Ok(Box::new(NullControlCipher))
    }
}

#[derive(Default)]
pub struct SequencePrng {
    next: AtomicU8,
}

impl Prng for SequencePrng {
    fn fill(&self, buf: &mut [u8]) -> Result<(), OpenVpnError> {
        for b in buf.iter_mut() {
            *b = self.next.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

// ── server-side helpers ──────────────────────────────────────────

pub fn control(code: Opcode, key: u8, pid: u32, payload: &[u8]) -> Vec<u8> {
    ControlPacket::new(code, key, SERVER_SID, pid, payload.to_vec()).encode()
}

/// Key-method 2 reply with fixed randoms and an empty options string.
pub fn auth_reply() -> Vec<u8> {
    let mut out = TLS_PREFIX.to_vec();
    out.extend([0x11u8; 64]);
    out.extend(1u16.to_be_bytes());
    out.push(0);
    out
}

pub fn message(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.push(0);
    out
}

/// Whatever the peer has written within a short window.
pub async fn drain(link: &dyn Link) -> Vec<Vec<u8>> {
    match tokio::time::timeout(Duration::from_millis(50), link.read_packets()).await {
        Ok(Ok(packets)) => packets,
        _ => Vec::new(),
    }
}

/// Control packets among `raw`, data packets skipped.
pub fn decode_control(raw: &[Vec<u8>]) -> Vec<ControlPacket> {
    raw.iter()
        .filter(|r| {
            r.first()
                .and_then(|b| parse_header_byte(*b).0)
                .map(|code| code.is_control())
                .unwrap_or(false)
        })
        .filter_map(|r| ControlPacket::decode(r).ok())
        .collect()
}
