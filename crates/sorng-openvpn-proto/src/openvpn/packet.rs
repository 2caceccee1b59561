//! Wire codec for control packets, plus the small data-path constants
//! (ping magic, OCC exit, peer id) the session needs.
//!
//! Layout of a control packet:
//!
//! ```text
//! opcode<<3|key (1) | session id (8) | ack count (1) | ack ids (4×n)
//!   | remote session id (8, only if n > 0) | packet id (4, not for ACK_V1)
//!   | payload
//! ```

use crate::openvpn::types::*;
use bytes::{Buf, BufMut};
use std::fmt;

pub const SESSION_ID_LEN: usize = 8;
pub const PACKET_ID_LEN: usize = 4;
pub const PEER_ID_LEN: usize = 3;
/// `peer-id` value meaning "no peer id".
pub const PEER_ID_DISABLED: u32 = 0x00ff_ffff;

/// Highest key id; key ids occupy the low three header bits.
pub const MAX_KEY_ID: u8 = 0b111;
/// The ack count is a single byte.
pub const MAX_ACKS_PER_PACKET: usize = u8::MAX as usize;

/// Prefix of every OCC control message carried on the data channel.
pub const OCC_MAGIC: [u8; 16] = [
    0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5, 0x45, 0x9c,
];
pub const OCC_EXIT: u8 = 0x06;

/// Keep-alive payload exchanged on the data channel.
pub const PING_MAGIC: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Opcode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SoftResetV1 = 3,
    ControlV1 = 4,
    AckV1 = 5,
    DataV1 = 6,
    HardResetClientV2 = 7,
    HardResetServerV2 = 8,
    DataV2 = 9,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            3 => Some(Self::SoftResetV1),
            4 => Some(Self::ControlV1),
            5 => Some(Self::AckV1),
            6 => Some(Self::DataV1),
            7 => Some(Self::HardResetClientV2),
            8 => Some(Self::HardResetServerV2),
            9 => Some(Self::DataV2),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::DataV1 | Self::DataV2)
    }

    pub fn is_control(&self) -> bool {
        !self.is_data()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoftResetV1 => write!(f, "SOFT_RESET_V1"),
            Self::ControlV1 => write!(f, "CONTROL_V1"),
            Self::AckV1 => write!(f, "ACK_V1"),
            Self::DataV1 => write!(f, "DATA_V1"),
            Self::HardResetClientV2 => write!(f, "HARD_RESET_CLIENT_V2"),
            Self::HardResetServerV2 => write!(f, "HARD_RESET_SERVER_V2"),
            Self::DataV2 => write!(f, "DATA_V2"),
        }
    }
}

/// Pack opcode and key id into the first byte.
pub fn header_byte(code: Opcode, key: u8) -> u8 {
    ((code as u8) << 3) | (key & MAX_KEY_ID)
}

/// Split the first byte. The opcode is `None` if unknown.
pub fn parse_header_byte(byte: u8) -> (Option<Opcode>, u8) {
    (Opcode::from_u8(byte >> 3), byte & MAX_KEY_ID)
}

/// Next key id after `key`. Zero is reserved for the first negotiation.
pub fn next_key_id(key: u8) -> u8 {
    let next = (key & MAX_KEY_ID).wrapping_add(1) & MAX_KEY_ID;
    if next == 0 {
        1
    } else {
        next
    }
}

/// Peer id of a `DATA_V2` packet, `None` if the packet is too short.
pub fn data_v2_peer_id(packet: &[u8]) -> Option<u32> {
    if packet.len() < 1 + PEER_ID_LEN {
        return None;
    }
    Some(u32::from_be_bytes([0, packet[1], packet[2], packet[3]]))
}

/// Payload of an OCC exit message.
pub fn occ_exit_payload() -> Vec<u8> {
    let mut payload = OCC_MAGIC.to_vec();
    payload.push(OCC_EXIT);
    payload
}

pub fn is_ping(payload: &[u8]) -> bool {
    payload == PING_MAGIC
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control packet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A decoded or to-be-sent control packet. `packet_id` is meaningless for
/// `ACK_V1`.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub code: Opcode,
    pub key: u8,
    pub session_id: [u8; SESSION_ID_LEN],
    pub packet_id: u32,
    pub payload: Vec<u8>,
    pub ack_ids: Vec<u32>,
    pub ack_remote_session_id: Option<[u8; SESSION_ID_LEN]>,
}

impl fmt::Debug for ControlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ControlPacket");
        s.field("code", &self.code)
            .field("key", &self.key)
            .field("sid", &hex::encode(self.session_id));
        if !self.is_ack() {
            s.field("pid", &self.packet_id);
        }
        if !self.ack_ids.is_empty() {
            s.field("acks", &self.ack_ids);
        }
        s.field("payload_len", &self.payload.len()).finish()
    }
}

impl ControlPacket {
    pub fn new(
        code: Opcode,
        key: u8,
        session_id: [u8; SESSION_ID_LEN],
        packet_id: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            code,
            key,
            session_id,
            packet_id,
            payload,
            ack_ids: Vec::new(),
            ack_remote_session_id: None,
        }
    }

    /// A pure `ACK_V1` carrying `ack_ids`.
    pub fn ack(
        key: u8,
        session_id: [u8; SESSION_ID_LEN],
        ack_ids: Vec<u32>,
        ack_remote_session_id: [u8; SESSION_ID_LEN],
    ) -> Self {
        Self {
            code: Opcode::AckV1,
            key,
            session_id,
            packet_id: 0,
            payload: Vec::new(),
            ack_ids,
            ack_remote_session_id: Some(ack_remote_session_id),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.code == Opcode::AckV1
    }

    /// `opcode|key` and session id, always sent in clear.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + SESSION_ID_LEN);
        out.put_u8(header_byte(self.code, self.key));
        out.put_slice(&self.session_id);
        out
    }

    /// Ack block, packet id and payload: everything after the session id.
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + self.ack_ids.len() * 4 + SESSION_ID_LEN + PACKET_ID_LEN + self.payload.len(),
        );
        // Never more ids than the count byte can announce.
        let ack_ids = &self.ack_ids[..self.ack_ids.len().min(MAX_ACKS_PER_PACKET)];
        out.put_u8(ack_ids.len() as u8);
        if !ack_ids.is_empty() {
            for id in ack_ids {
                out.put_u32(*id);
            }
            out.put_slice(&self.ack_remote_session_id.unwrap_or_default());
        }
        if !self.is_ack() {
            out.put_u32(self.packet_id);
        }
        out.put_slice(&self.payload);
        out
    }

    /// Plain (unwrapped) serialization.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.body_bytes());
        out
    }

    /// Decode a plain control packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, OpenVpnError> {
        let (code, key, session_id) = decode_header(bytes)?;
        Self::decode_body(code, key, session_id, &bytes[1 + SESSION_ID_LEN..])
    }

    /// Decode what follows the session id, given an already parsed header.
    pub fn decode_body(
        code: Opcode,
        key: u8,
        session_id: [u8; SESSION_ID_LEN],
        body: &[u8],
    ) -> Result<Self, OpenVpnError> {
        let mut buf = body;
        if buf.remaining() < 1 {
            return Err(OpenVpnError::format("Missing ackSize"));
        }
        let ack_count = buf.get_u8() as usize;
        let mut ack_ids = Vec::with_capacity(ack_count);
        let mut ack_remote_session_id = None;
        if ack_count > 0 {
            if buf.remaining() < ack_count * 4 {
                return Err(OpenVpnError::format("Missing acks"));
            }
            for _ in 0..ack_count {
                ack_ids.push(buf.get_u32());
            }
            if buf.remaining() < SESSION_ID_LEN {
                return Err(OpenVpnError::format("Missing remoteSessionId"));
            }
            let mut remote = [0u8; SESSION_ID_LEN];
            buf.copy_to_slice(&mut remote);
            ack_remote_session_id = Some(remote);
        }
        if code == Opcode::AckV1 {
            if ack_ids.is_empty() {
                return Err(OpenVpnError::format("Ack packet without ids/remoteSessionId"));
            }
            return Ok(Self {
                code,
                key,
                session_id,
                packet_id: 0,
                payload: Vec::new(),
                ack_ids,
                ack_remote_session_id,
            });
        }
        if buf.remaining() < PACKET_ID_LEN {
            return Err(OpenVpnError::format("Missing packetId"));
        }
        let packet_id = buf.get_u32();
        Ok(Self {
            code,
            key,
            session_id,
            packet_id,
            payload: buf.to_vec(),
            ack_ids,
            ack_remote_session_id,
        })
    }
}

/// Parse opcode, key id and session id.
pub fn decode_header(bytes: &[u8]) -> Result<(Opcode, u8, [u8; SESSION_ID_LEN]), OpenVpnError> {
    let first = *bytes
        .first()
        .ok_or_else(|| OpenVpnError::format("Missing opcode"))?;
    let (code, key) = parse_header_byte(first);
    let code = code.ok_or_else(|| {
        OpenVpnError::format("Unknown opcode").with_detail(format!("{:#04x}", first >> 3))
    })?;
    if bytes.len() < 1 + SESSION_ID_LEN {
        return Err(OpenVpnError::format("Missing sessionId"));
    }
    let mut session_id = [0u8; SESSION_ID_LEN];
    session_id.copy_from_slice(&bytes[1..1 + SESSION_ID_LEN]);
    Ok((code, key, session_id))
}
