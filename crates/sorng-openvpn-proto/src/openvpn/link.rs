//! Transport links (the socket side) and the tunnel sink (the OS side).
//!
//! A [`Link`] moves whole OpenVPN packets. Datagram transports map one packet
//! to one datagram; stream transports prefix each packet with its length as
//! a big-endian `u16`.

use crate::openvpn::types::*;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

/// Largest datagram we try to receive.
const MAX_DATAGRAM: usize = 65_535;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Socket-side transport carrying OpenVPN packets.
#[async_trait]
pub trait Link: Send + Sync {
    /// Stream transports never drop or reorder.
    fn is_reliable(&self) -> bool;
    fn remote_address(&self) -> String;
    /// Wait for at least one packet.
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError>;
    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError>;
    async fn shutdown(&self) -> Result<(), OpenVpnError>;
}

/// OS-side packet sink/source (the TUN device).
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError>;
    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError>;
}

fn io_error(context: &str, e: std::io::Error) -> OpenVpnError {
    OpenVpnError::link(context.to_string()).with_detail(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Stream framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Concatenate packets, each prefixed with its `u16` BE length.
pub fn frame_packets(packets: &[Vec<u8>]) -> Result<Vec<u8>, OpenVpnError> {
    let mut out = Vec::with_capacity(packets.iter().map(|p| p.len() + 2).sum());
    for p in packets {
        let len = u16::try_from(p.len())
            .map_err(|_| OpenVpnError::link("packet too large for stream framing"))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(p);
    }
    Ok(out)
}

/// Reassembles length-prefixed packets from arbitrary stream chunks.
#[derive(Debug, Default)]
pub struct StreamDeframer {
    buf: Vec<u8>,
}

impl StreamDeframer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut packets = Vec::new();
        let mut offset = 0;
        while self.buf.len() - offset >= 2 {
            let len = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]) as usize;
            if self.buf.len() - offset - 2 < len {
                break;
            }
            packets.push(self.buf[offset + 2..offset + 2 + len].to_vec());
            offset += 2 + len;
        }
        self.buf.drain(..offset);
        packets
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  UDP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UdpLink {
    socket: UdpSocket,
    remote: String,
}

impl UdpLink {
    pub async fn connect(host: &str, port: u16) -> Result<Self, OpenVpnError> {
        let remote = format!("{}:{}", host, port);
        let bind = if host.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| io_error("cannot bind UDP socket", e))?;
        socket
            .connect(&remote)
            .await
            .map_err(|e| io_error("cannot connect UDP socket", e))?;
        log::info!("UDP link to {}", remote);
        Ok(Self { socket, remote })
    }
}

#[async_trait]
impl Link for UdpLink {
    fn is_reliable(&self) -> bool {
        false
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self
            .socket
            .recv(&mut buf)
            .await
            .map_err(|e| io_error("UDP receive failed", e))?;
        buf.truncate(n);
        let mut packets = vec![buf];
        let mut more = vec![0u8; MAX_DATAGRAM];
        while let Ok(n) = self.socket.try_recv(&mut more) {
            packets.push(more[..n].to_vec());
        }
        Ok(packets)
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        for p in packets {
            self.socket
                .send(&p)
                .await
                .map_err(|e| io_error("UDP send failed", e))?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), OpenVpnError> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  TCP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TcpLink {
    reader: Mutex<(ReadHalf<TcpStream>, StreamDeframer)>,
    writer: Mutex<WriteHalf<TcpStream>>,
    remote: String,
}

impl TcpLink {
    pub async fn connect(host: &str, port: u16) -> Result<Self, OpenVpnError> {
        let remote = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&remote)
            .await
            .map_err(|e| io_error("cannot connect TCP link", e))?;
        log::info!("TCP link to {}", remote);
        Ok(Self::from_stream(stream, remote))
    }

    pub fn from_stream(stream: TcpStream, remote: String) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new((reader, StreamDeframer::default())),
            writer: Mutex::new(writer),
            remote,
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    fn is_reliable(&self) -> bool {
        true
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let mut guard = self.reader.lock().await;
        let (reader, deframer) = &mut *guard;
        let mut chunk = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(|e| io_error("TCP receive failed", e))?;
            if n == 0 {
                return Err(OpenVpnError::link("TCP link closed by peer"));
            }
            let packets = deframer.push(&chunk[..n]);
            if !packets.is_empty() {
                return Ok(packets);
            }
        }
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        let framed = frame_packets(&packets)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .map_err(|e| io_error("TCP send failed", e))
    }

    async fn shutdown(&self) -> Result<(), OpenVpnError> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| io_error("TCP shutdown failed", e))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  In-memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One end of an in-process packet pipe. Serves as a [`Link`] or a
/// [`Tunnel`] when a real socket or TUN device is not wanted.
pub struct MemoryLink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    reliable: bool,
}

impl MemoryLink {
    pub fn pair(reliable: bool) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(a_rx),
                reliable,
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(b_rx),
                reliable,
            },
        )
    }

    async fn recv_batch(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        let mut rx = self.rx.lock().await;
        let first = rx
            .recv()
            .await
            .ok_or_else(|| OpenVpnError::link("memory link closed"))?;
        let mut packets = vec![first];
        while let Ok(p) = rx.try_recv() {
            packets.push(p);
        }
        Ok(packets)
    }

    fn send_batch(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        for p in packets {
            self.tx
                .send(p)
                .map_err(|_| OpenVpnError::link("memory link closed"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn remote_address(&self) -> String {
        "memory".to_string()
    }

    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        self.recv_batch().await
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        self.send_batch(packets)
    }

    async fn shutdown(&self) -> Result<(), OpenVpnError> {
        self.rx.lock().await.close();
        Ok(())
    }
}

#[async_trait]
impl Tunnel for MemoryLink {
    async fn read_packets(&self) -> Result<Vec<Vec<u8>>, OpenVpnError> {
        self.recv_batch().await
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>) -> Result<(), OpenVpnError> {
        self.send_batch(packets)
    }
}
