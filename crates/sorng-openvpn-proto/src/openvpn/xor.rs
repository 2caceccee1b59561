//! XOR obfuscation of datagrams (`scramble` directive), and a [`Link`]
//! decorator that applies it on the way out and reverses it on the way in.

use crate::openvpn::link::Link;
use crate::openvpn::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Obfuscation method. Absence of a method means identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XorMethod {
    /// `scramble xormask M`
    XorMask(Vec<u8>),
    /// `scramble xorptrpos`
    XorPtrPos,
    /// `scramble reverse`
    Reverse,
    /// `scramble obfuscate M`
    Obfuscate(Vec<u8>),
}

impl fmt::Debug for XorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::XorMask(m) => write!(f, "XorMask(len={})", m.len()),
            Self::XorPtrPos => write!(f, "XorPtrPos"),
            Self::Reverse => write!(f, "Reverse"),
            Self::Obfuscate(m) => write!(f, "Obfuscate(len={})", m.len()),
        }
    }
}

impl XorMethod {
    /// Parse `scramble` arguments: method name then optional mask.
    pub fn from_args(args: &[&str]) -> Result<Self, OpenVpnError> {
        let mask = |args: &[&str]| -> Result<Vec<u8>, OpenVpnError> {
            match args.get(1) {
                Some(m) if !m.is_empty() => Ok(m.as_bytes().to_vec()),
                _ => Err(OpenVpnError::parse("scramble: missing mask")),
            }
        };
        match args.first().copied() {
            Some("xormask") => Ok(Self::XorMask(mask(args)?)),
            Some("xorptrpos") => Ok(Self::XorPtrPos),
            Some("reverse") => Ok(Self::Reverse),
            Some("obfuscate") => Ok(Self::Obfuscate(mask(args)?)),
            Some(other) => Err(OpenVpnError::parse("scramble: unknown method")
                .with_detail(other.to_string())),
            None => Err(OpenVpnError::parse("scramble: missing method")),
        }
    }

    pub fn encode(&self, packet: &mut [u8]) {
        match self {
            Self::XorMask(mask) => xor_mask(packet, mask),
            Self::XorPtrPos => xor_ptr_pos(packet),
            Self::Reverse => reverse(packet),
            Self::Obfuscate(mask) => {
                xor_ptr_pos(packet);
                reverse(packet);
                xor_ptr_pos(packet);
                xor_mask(packet, mask);
            }
        }
    }

    pub fn decode(&self, packet: &mut [u8]) {
        match self {
            Self::XorMask(mask) => xor_mask(packet, mask),
            Self::XorPtrPos => xor_ptr_pos(packet),
            Self::Reverse => reverse(packet),
            Self::Obfuscate(mask) => {
                xor_mask(packet, mask);
                xor_ptr_pos(packet);
                reverse(packet);
                xor_ptr_pos(packet);
            }
        }
    }
}

fn xor_mask(packet: &mut [u8], mask: &[u8]) {
    if mask.is_empty() {
        return;
    }
    for (i, b) in packet.iter_mut().enumerate() {
        *b ^= mask[i % mask.len()];
    }
}

fn xor_ptr_pos(packet: &mut [u8]) {
    for (i, b) in packet.iter_mut().enumerate() {
        *b ^= (i + 1) as u8;
    }
}

/// Reverse everything but the first byte.
fn reverse(packet: &mut [u8]) {
    if packet.len() > 1 {
        packet[1..].reverse();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Link decorator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps another link and obfuscates each packet before it is framed.
pub struct XorLink {
    inner: Arc<dyn Link>,
    method: XorMethod,
}

impl XorLink {
    pub fn new(inner: Arc<dyn Link>, method: XorMethod) -> Self {
        Self { inner, method }
    }

    /// Wrap only if a method is configured.
    pub fn wrap(inner: Arc<dyn Link>, method: Option<&XorMethod>) -> Arc<dyn Link> {
        match method {
            Some(m) => Arc::new(Self::new(inner, m.clone())),
            None => inner,
        }
    }
}

#[async_trait]
impl Link for XorLink {
    fn is_reliable(&self) -> bool {
        self.inner.is_reliable()
    }

    fn remote_address(&self) -> String {
        self.inner.remote_address()
    }

    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let mut packets = self.inner.read_packets().await?;
        for p in packets.iter_mut() {
            self.method.decode(p);
        }
        Ok(packets)
    }

    async fn write_packets(&self, mut packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        for p in packets.iter_mut() {
            self.method.encode(p);
        }
        self.inner.write_packets(packets).await
    }

    async fn shutdown(&self) -> Result<(), OpenVpnError> {
        self.inner.shutdown().await
    }
}
