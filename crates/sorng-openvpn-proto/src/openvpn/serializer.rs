//! Control packet serializers: plain, `--tls-auth` and `--tls-crypt`.
//!
//! Wrapped layouts:
//!
//! ```text
//! tls-auth:  op | sid | hmac | replay id | timestamp | acks | pid | payload
//!            hmac = HMAC(replay id | timestamp | op | sid | acks | pid | payload)
//! tls-crypt: op | sid | replay id | timestamp | tag | enc(acks | pid | payload)
//!            ad   = op | sid | replay id | timestamp
//! ```

use crate::openvpn::crypto::{ControlCipher, CryptoProvider};
use crate::openvpn::packet::{self, ControlPacket, SESSION_ID_LEN};
use crate::openvpn::types::*;
use bytes::BufMut;
use hmac::{Hmac, Mac};

const PREFIX_LEN: usize = 1 + SESSION_ID_LEN;
const REPLAY_LEN: usize = 4 + 4;

/// Turns control packets into datagrams and back.
pub trait ControlChannelSerializer: Send {
    /// Restart replay ids and refresh the timestamp.
    fn reset(&mut self);
    fn serialize(&mut self, packet: &ControlPacket) -> Result<Vec<u8>, OpenVpnError>;
    fn deserialize(&mut self, bytes: &[u8]) -> Result<ControlPacket, OpenVpnError>;
}

/// Pick the serializer for the configured TLS wrapping.
pub fn for_tls_wrap(
    wrap: Option<&TlsWrap>,
    digest: Digest,
    provider: &dyn CryptoProvider,
) -> Result<Box<dyn ControlChannelSerializer>, OpenVpnError> {
    match wrap {
        None => Ok(Box::new(PlainSerializer)),
        Some(w) => match w.strategy {
            TlsWrapStrategy::Auth => Ok(Box::new(AuthSerializer::new(digest, &w.key)?)),
            TlsWrapStrategy::Crypt => Ok(Box::new(CryptSerializer::new(
                provider.new_control_cipher(&w.key)?,
            ))),
        },
    }
}

fn unix_timestamp() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Plain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct PlainSerializer;

impl ControlChannelSerializer for PlainSerializer {
    fn reset(&mut self) {}

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Vec<u8>, OpenVpnError> {
        Ok(packet.encode())
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<ControlPacket, OpenVpnError> {
        ControlPacket::decode(bytes)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  HMAC
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn new_mac<M: Mac + hmac::digest::KeyInit>(key: &[u8]) -> Result<M, OpenVpnError> {
    <M as Mac>::new_from_slice(key).map_err(|e| {
        OpenVpnError::new(OpenVpnErrorKind::Crypto, "invalid HMAC key").with_detail(e.to_string())
    })
}

fn sign_with<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    parts: &[&[u8]],
) -> Result<Vec<u8>, OpenVpnError> {
    let mut mac: M = new_mac(key)?;
    for p in parts {
        Mac::update(&mut mac, p);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_with<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    parts: &[&[u8]],
    tag: &[u8],
) -> Result<(), OpenVpnError> {
    let mut mac: M = new_mac(key)?;
    for p in parts {
        Mac::update(&mut mac, p);
    }
    mac.verify_slice(tag)
        .map_err(|_| OpenVpnError::new(OpenVpnErrorKind::Crypto, "HMAC verification failed"))
}

/// HMAC over `parts` with the given digest.
pub fn hmac_sign(digest: Digest, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, OpenVpnError> {
    match digest {
        Digest::Sha1 => sign_with::<Hmac<sha1::Sha1>>(key, parts),
        Digest::Sha224 => sign_with::<Hmac<sha2::Sha224>>(key, parts),
        Digest::Sha256 => sign_with::<Hmac<sha2::Sha256>>(key, parts),
        Digest::Sha384 => sign_with::<Hmac<sha2::Sha384>>(key, parts),
        Digest::Sha512 => sign_with::<Hmac<sha2::Sha512>>(key, parts),
    }
}

/// Constant-time HMAC check.
pub fn hmac_verify(
    digest: Digest,
    key: &[u8],
    parts: &[&[u8]],
    tag: &[u8],
) -> Result<(), OpenVpnError> {
    match digest {
        Digest::Sha1 => verify_with::<Hmac<sha1::Sha1>>(key, parts, tag),
        Digest::Sha224 => verify_with::<Hmac<sha2::Sha224>>(key, parts, tag),
        Digest::Sha256 => verify_with::<Hmac<sha2::Sha256>>(key, parts, tag),
        Digest::Sha384 => verify_with::<Hmac<sha2::Sha384>>(key, parts, tag),
        Digest::Sha512 => verify_with::<Hmac<sha2::Sha512>>(key, parts, tag),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  tls-auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AuthSerializer {
    digest: Digest,
    send_key: Vec<u8>,
    receive_key: Vec<u8>,
    replay_id: u32,
    timestamp: u32,
}

impl AuthSerializer {
    /// Only the first digest-length bytes of each HMAC slot are used.
    pub fn new(digest: Digest, key: &StaticKey) -> Result<Self, OpenVpnError> {
        let len = digest.output_len();
        Ok(Self {
            digest,
            send_key: key.hmac_send_key()[..len].to_vec(),
            receive_key: key.hmac_receive_key()[..len].to_vec(),
            replay_id: 1,
            timestamp: unix_timestamp(),
        })
    }
}

impl ControlChannelSerializer for AuthSerializer {
    fn reset(&mut self) {
        self.replay_id = 1;
        self.timestamp = unix_timestamp();
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Vec<u8>, OpenVpnError> {
        let prefix = packet.header_bytes();
        let rest = packet.body_bytes();
        let mut replay = Vec::with_capacity(REPLAY_LEN);
        replay.put_u32(self.replay_id);
        replay.put_u32(self.timestamp);
        self.replay_id = self.replay_id.wrapping_add(1);

        let hmac = hmac_sign(
            self.digest,
            &self.send_key,
            &[replay.as_slice(), prefix.as_slice(), rest.as_slice()],
        )?;
        let mut out = Vec::with_capacity(prefix.len() + hmac.len() + REPLAY_LEN + rest.len());
        out.extend_from_slice(&prefix);
        out.extend_from_slice(&hmac);
        out.extend_from_slice(&replay);
        out.extend_from_slice(&rest);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<ControlPacket, OpenVpnError> {
        let (code, key, session_id) = packet::decode_header(bytes)?;
        let hmac_len = self.digest.output_len();
        let replay_start = PREFIX_LEN + hmac_len;
        if bytes.len() < replay_start + REPLAY_LEN {
            return Err(OpenVpnError::format("Missing HMAC"));
        }
        let prefix = &bytes[..PREFIX_LEN];
        let hmac = &bytes[PREFIX_LEN..replay_start];
        let replay = &bytes[replay_start..replay_start + REPLAY_LEN];
        let rest = &bytes[replay_start + REPLAY_LEN..];

        hmac_verify(self.digest, &self.receive_key, &[replay, prefix, rest], hmac)?;
        ControlPacket::decode_body(code, key, session_id, rest)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  tls-crypt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CryptSerializer {
    cipher: Box<dyn ControlCipher>,
    replay_id: u32,
    timestamp: u32,
}

impl CryptSerializer {
    pub fn new(cipher: Box<dyn ControlCipher>) -> Self {
        Self {
            cipher,
            replay_id: 1,
            timestamp: unix_timestamp(),
        }
    }
}

impl ControlChannelSerializer for CryptSerializer {
    fn reset(&mut self) {
        self.replay_id = 1;
        self.timestamp = unix_timestamp();
    }

    fn serialize(&mut self, packet: &ControlPacket) -> Result<Vec<u8>, OpenVpnError> {
        let mut ad = packet.header_bytes();
        ad.put_u32(self.replay_id);
        ad.put_u32(self.timestamp);
        self.replay_id = self.replay_id.wrapping_add(1);

        let sealed = self.cipher.seal(&ad, &packet.body_bytes())?;
        let mut out = ad;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn deserialize(&mut self, bytes: &[u8]) -> Result<ControlPacket, OpenVpnError> {
        let (code, key, session_id) = packet::decode_header(bytes)?;
        let ad_len = PREFIX_LEN + REPLAY_LEN;
        if bytes.len() < ad_len + self.cipher.tag_len() {
            return Err(OpenVpnError::format("Missing tag"));
        }
        let rest = self.cipher.open(&bytes[..ad_len], &bytes[ad_len..])?;
        ControlPacket::decode_body(code, key, session_id, &rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openvpn::crypto::fakes::{FakeControlCipher, FakeProvider};
    use crate::openvpn::packet::Opcode;

    const SID: [u8; 8] = [1, 1, 2, 2, 3, 3, 4, 4];

    fn static_key(direction: Option<KeyDirection>) -> StaticKey {
        StaticKey::new((0..=255u8).collect(), direction).unwrap()
    }

    fn sample_packet() -> ControlPacket {
        let mut p = ControlPacket::new(Opcode::ControlV1, 2, SID, 9, b"client hello".to_vec());
        p.ack_ids = vec![4, 5];
        p.ack_remote_session_id = Some([7; 8]);
        p
    }

    // ── HMAC ─────────────────────────────────────────────────────

    #[test]
    fn hmac_lengths_follow_digest() {
        for d in [
            Digest::Sha1,
            Digest::Sha224,
            Digest::Sha256,
            Digest::Sha384,
            Digest::Sha512,
        ] {
            let tag = hmac_sign(d, b"key", &[b"a".as_slice(), b"b".as_slice()]).unwrap();
            assert_eq!(tag.len(), d.output_len());
            hmac_verify(d, b"key", &[b"ab".as_slice()], &tag).unwrap();
        }
    }

    #[test]
    fn hmac_sha1_known_vector() {
        // RFC 2202 test case 2
        let tag = hmac_sign(Digest::Sha1, b"Jefe", &[b"what do ya want for nothing?".as_slice()]).unwrap();
        assert_eq!(hex::encode(tag), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[test]
    fn hmac_verify_rejects_tamper() {
        let tag = hmac_sign(Digest::Sha256, b"k", &[b"data".as_slice()]).unwrap();
        let err = hmac_verify(Digest::Sha256, b"k", &[b"dat4".as_slice()], &tag).unwrap_err();
        assert_eq!(err.kind, OpenVpnErrorKind::Crypto);
    }

    // ── plain ────────────────────────────────────────────────────

    #[test]
    fn plain_matches_codec() {
        let mut s = PlainSerializer;
        let p = sample_packet();
        let bytes = s.serialize(&p).unwrap();
        assert_eq!(bytes, p.encode());
        assert_eq!(s.deserialize(&bytes).unwrap(), p);
    }

    // ── tls-auth ─────────────────────────────────────────────────

    #[test]
    fn tls_auth_layout_and_replay_ids() {
        let mut client = AuthSerializer::new(Digest::Sha1, &static_key(Some(KeyDirection::Client))).unwrap();
        let p = sample_packet();
        let first = client.serialize(&p).unwrap();
        let second = client.serialize(&p).unwrap();

        assert_eq!(&first[..9], &p.header_bytes()[..]);
        assert_eq!(&first[29..33], &1u32.to_be_bytes());
        assert_eq!(&second[29..33], &2u32.to_be_bytes());
        assert_eq!(&first[37..], &p.body_bytes()[..]);
        assert_eq!(first.len(), 9 + 20 + 8 + p.body_bytes().len());
    }

    #[test]
    fn tls_auth_peers_with_opposite_directions_interoperate() {
        let mut client = AuthSerializer::new(Digest::Sha256, &static_key(Some(KeyDirection::Client))).unwrap();
        let mut server = AuthSerializer::new(Digest::Sha256, &static_key(Some(KeyDirection::Server))).unwrap();
        let p = sample_packet();
        let wire = client.serialize(&p).unwrap();
        assert_eq!(server.deserialize(&wire).unwrap(), p);
    }

    #[test]
    fn tls_auth_rejects_flipped_bit() {
        let key = static_key(None);
        let mut a = AuthSerializer::new(Digest::Sha1, &key).unwrap();
        let mut b = AuthSerializer::new(Digest::Sha1, &key).unwrap();
        let mut wire = a.serialize(&sample_packet()).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert_eq!(b.deserialize(&wire).unwrap_err().kind, OpenVpnErrorKind::Crypto);
    }

    #[test]
    fn tls_auth_short_packet() {
        let mut s = AuthSerializer::new(Digest::Sha1, &static_key(None)).unwrap();
        let err = s.deserialize(&[0x20, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap_err();
        assert_eq!(err.kind, OpenVpnErrorKind::FormatError);
    }

    #[test]
    fn tls_auth_reset_restarts_replay_ids() {
        let mut s = AuthSerializer::new(Digest::Sha1, &static_key(None)).unwrap();
        s.serialize(&sample_packet()).unwrap();
        s.reset();
        let wire = s.serialize(&sample_packet()).unwrap();
        assert_eq!(&wire[29..33], &1u32.to_be_bytes());
    }

    // ── tls-crypt ────────────────────────────────────────────────

    #[test]
    fn tls_crypt_keeps_header_in_clear() {
        let mut s = CryptSerializer::new(Box::new(FakeControlCipher));
        let p = sample_packet();
        let wire = s.serialize(&p).unwrap();
        assert_eq!(&wire[..9], &p.header_bytes()[..]);
        assert_eq!(&wire[9..13], &1u32.to_be_bytes());
        assert_eq!(s.deserialize(&wire).unwrap(), p);
    }

    #[test]
    fn tls_crypt_short_packet() {
        let mut s = CryptSerializer::new(Box::new(FakeControlCipher));
        let err = s.deserialize(&[0x20, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.message, "Missing tag");
    }

    // ── selection ────────────────────────────────────────────────

    #[test]
    fn for_tls_wrap_picks_strategy() {
        let provider = FakeProvider::default();
        let p = sample_packet();

        let mut plain = for_tls_wrap(None, Digest::Sha1, &provider).unwrap();
        assert_eq!(plain.serialize(&p).unwrap(), p.encode());

        let wrap = TlsWrap {
            strategy: TlsWrapStrategy::Crypt,
            key: static_key(None),
        };
        let mut crypt = for_tls_wrap(Some(&wrap), Digest::Sha1, &provider).unwrap();
        let wire = crypt.serialize(&p).unwrap();
        assert_eq!(crypt.deserialize(&wire).unwrap(), p);
    }
}
