//! Reliable, ordered delivery of control packets over an unreliable link.
//!
//! The channel owns the packet-id counters, the unacknowledged outbound
//! queue and the reordering buffer for one negotiation. It never touches the
//! network: callers feed it decoded packets and collect raw datagrams to send.

use crate::openvpn::crypto::Prng;
use crate::openvpn::packet::{ControlPacket, Opcode, MAX_ACKS_PER_PACKET, SESSION_ID_LEN};
use crate::openvpn::serializer::ControlChannelSerializer;
use crate::openvpn::types::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

pub type SessionId = [u8; SESSION_ID_LEN];

/// Inbound packet ids buffered ahead of the next expected one.
pub const RECEIVE_WINDOW: u32 = 64;

pub struct ControlChannel {
    serializer: Box<dyn ControlChannelSerializer>,
    max_packet_size: usize,
    max_retransmits: u32,

    session_id: Option<SessionId>,
    remote_session_id: Option<SessionId>,

    queue_out: Vec<ControlPacket>,
    next_packet_id_out: u32,
    sent_dates: HashMap<u32, Instant>,
    retransmits: HashMap<u32, u32>,
    pending_acks: HashSet<u32>,

    queue_in: BTreeMap<u32, ControlPacket>,
    next_packet_id_in: u32,
}

impl ControlChannel {
    pub fn new(
        serializer: Box<dyn ControlChannelSerializer>,
        max_packet_size: usize,
        max_retransmits: u32,
    ) -> Self {
        Self {
            serializer,
            max_packet_size: max_packet_size.max(1),
            max_retransmits,
            session_id: None,
            remote_session_id: None,
            queue_out: Vec::new(),
            next_packet_id_out: 0,
            sent_dates: HashMap::new(),
            retransmits: HashMap::new(),
            pending_acks: HashSet::new(),
            queue_in: BTreeMap::new(),
            next_packet_id_in: 0,
        }
    }

    /// Start over for a new negotiation. A new session also rolls a fresh
    /// local session id and forgets the remote one; a renegotiation keeps both.
    pub fn reset(&mut self, prng: &dyn Prng, new_session: bool) -> Result<(), OpenVpnError> {
        if new_session {
            let mut sid = [0u8; SESSION_ID_LEN];
            prng.fill(&mut sid)?;
            self.session_id = Some(sid);
            self.remote_session_id = None;
            log::debug!(
                "Control: new session id {}",
                crate::openvpn::logging::session_id_hex(&sid)
            );
        }
        self.queue_out.clear();
        self.next_packet_id_out = 0;
        self.sent_dates.clear();
        self.retransmits.clear();
        self.pending_acks.clear();
        self.queue_in.clear();
        self.next_packet_id_in = 0;
        self.serializer.reset();
        Ok(())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn remote_session_id(&self) -> Option<SessionId> {
        self.remote_session_id
    }

    pub fn set_remote_session_id(&mut self, sid: SessionId) {
        log::debug!(
            "Control: remote session id {}",
            crate::openvpn::logging::session_id_hex(&sid)
        );
        self.remote_session_id = Some(sid);
    }

    fn require_session_id(&self) -> Result<SessionId, OpenVpnError> {
        self.session_id
            .ok_or_else(|| OpenVpnError::internal("control channel has no session id"))
    }

    // ── outbound ────────────────────────────────────────────────

    /// Split `payload` into packets of at most `max_packet_size` bytes and
    /// queue them with consecutive packet ids.
    pub fn enqueue_outbound(
        &mut self,
        code: Opcode,
        key: u8,
        payload: &[u8],
    ) -> Result<(), OpenVpnError> {
        let sid = self.require_session_id()?;
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(self.max_packet_size).collect()
        };
        for chunk in chunks {
            let packet = ControlPacket::new(code, key, sid, self.next_packet_id_out, chunk.to_vec());
            log::debug!("Control: enqueue {:?}", packet);
            self.next_packet_id_out = self.next_packet_id_out.wrapping_add(1);
            self.queue_out.push(packet);
        }
        Ok(())
    }

    /// Serialize every queued packet that was never sent or was sent at
    /// least `resend_after` ago. Fails with `Timeout` once a packet has been
    /// retransmitted more than the configured maximum.
    pub fn write_outbound(
        &mut self,
        now: Instant,
        resend_after: Duration,
    ) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let mut raw = Vec::new();
        for packet in &self.queue_out {
            if let Some(sent) = self.sent_dates.get(&packet.packet_id) {
                if now.saturating_duration_since(*sent) < resend_after {
                    continue;
                }
                let count = self.retransmits.entry(packet.packet_id).or_insert(0);
                *count += 1;
                if *count > self.max_retransmits {
                    return Err(OpenVpnError::new(
                        OpenVpnErrorKind::Timeout,
                        "control packet never acknowledged",
                    )
                    .with_detail(format!(
                        "pid {} after {} retransmits",
                        packet.packet_id, self.max_retransmits
                    )));
                }
                log::debug!("Control: retransmit {:?}", packet);
            }
            let bytes = self.serializer.serialize(packet)?;
            crate::openvpn::logging::trace_packet("out", "control", &bytes);
            raw.push(bytes);
            self.sent_dates.insert(packet.packet_id, now);
            self.pending_acks.insert(packet.packet_id);
        }
        Ok(raw)
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn outbound_len(&self) -> usize {
        self.queue_out.len()
    }

    // ── inbound ─────────────────────────────────────────────────

    pub fn read_inbound(&mut self, bytes: &[u8]) -> Result<ControlPacket, OpenVpnError> {
        crate::openvpn::logging::trace_packet("in", "control", bytes);
        self.serializer.deserialize(bytes)
    }

    /// Drop outbound packets the peer acknowledged. The ack must name our
    /// session id.
    pub fn read_acks(
        &mut self,
        ack_ids: &[u32],
        ack_remote_session_id: Option<SessionId>,
    ) -> Result<(), OpenVpnError> {
        let sid = self.require_session_id()?;
        if ack_remote_session_id != Some(sid) {
            return Err(OpenVpnError::format("Ack for another session").with_detail(format!(
                "expected {}, got {}",
                hex::encode(sid),
                ack_remote_session_id.map(hex::encode).unwrap_or_default()
            )));
        }
        self.queue_out.retain(|p| !ack_ids.contains(&p.packet_id));
        for id in ack_ids {
            self.pending_acks.remove(id);
            self.sent_dates.remove(id);
            self.retransmits.remove(id);
        }
        Ok(())
    }

    /// Serialize an `ACK_V1` for `ack_ids` addressed to `remote_session_id`.
    pub fn write_acks(
        &mut self,
        key: u8,
        ack_ids: Vec<u32>,
        remote_session_id: SessionId,
    ) -> Result<Vec<u8>, OpenVpnError> {
        let sid = self.require_session_id()?;
        if ack_ids.len() > MAX_ACKS_PER_PACKET {
            return Err(OpenVpnError::format("too many acks for one packet")
                .with_detail(ack_ids.len().to_string()));
        }
        let ack = ControlPacket::ack(key, sid, ack_ids, remote_session_id);
        log::debug!("Control: send {:?}", ack);
        self.serializer.serialize(&ack)
    }

    /// Whether `packet_id` is either already delivered (a duplicate that
    /// still deserves an ack) or close enough ahead to be buffered.
    pub fn in_receive_window(&self, packet_id: u32) -> bool {
        packet_id.saturating_sub(self.next_packet_id_in) < RECEIVE_WINDOW
    }

    /// Buffer `packet` and return whatever is now deliverable in order.
    /// Ids already delivered, already buffered or beyond the receive window
    /// are dropped.
    pub fn enqueue_inbound(&mut self, packet: ControlPacket) -> Vec<ControlPacket> {
        let pid = packet.packet_id;
        if pid < self.next_packet_id_in {
            log::debug!("Control: drop duplicate pid {}", pid);
            return Vec::new();
        }
        if !self.in_receive_window(pid) {
            log::warn!(
                "Control: drop pid {} outside window (expecting {})",
                pid,
                self.next_packet_id_in
            );
            return Vec::new();
        }
        if self.queue_in.contains_key(&pid) {
            log::debug!("Control: pid {} already buffered", pid);
            return Vec::new();
        }
        self.queue_in.insert(pid, packet);

        let mut delivered = Vec::new();
        while let Some(p) = self.queue_in.remove(&self.next_packet_id_in) {
            self.next_packet_id_in = self.next_packet_id_in.wrapping_add(1);
            delivered.push(p);
        }
        delivered
    }

    pub fn inbound_buffered(&self) -> usize {
        self.queue_in.len()
    }
}
