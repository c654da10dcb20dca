//! Channel Adapter Contract (C3): a uniform open/close/send/recv interface
//! over serial KISS TNCs, KISS-over-TCP, AGW, and an in-process mock used by
//! tests. Every adapter speaks raw AX.25 frame bytes to its caller; whether
//! the physical wire underneath is KISS-framed or AGW-framed is entirely
//! internal to the adapter implementation -- the Channel Manager never
//! touches KISS or AGW framing itself.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;

use crate::kiss::KissDecoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    NotOpen,
    Io(String),
    Timeout,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::NotOpen => write!(f, "adapter not open"),
            AdapterError::Io(msg) => write!(f, "adapter I/O error: {msg}"),
            AdapterError::Timeout => write!(f, "adapter probe timed out"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Lifecycle/data events an adapter reports to its owner (the Channel
/// Manager). `Data` carries fully-unwrapped AX.25 frame bytes.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Open,
    Close,
    Data(Vec<u8>),
    Error(String),
}

/// Probe timeout for adapter connect attempts (§5).
pub const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait ChannelAdapter: Send {
    async fn open(&mut self) -> Result<(), AdapterError>;
    async fn close(&mut self);

    /// Send raw AX.25 frame bytes. Adapters never propagate a disconnected
    /// link as a panic or a fatal error: serial links buffer up to one
    /// packet, TCP links drop and report it as an `Error` event.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), AdapterError>;

    /// Block until the next lifecycle/data event is available.
    async fn recv(&mut self) -> AdapterEvent;
}

/// In-process loopback adapter: echoes whatever is sent back as received
/// data. Used by tests and by mock channels in a running node.
pub struct MockAdapter {
    open: bool,
    loopback: mpsc::UnboundedReceiver<Vec<u8>>,
    loopback_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockAdapter {
            open: false,
            loopback: rx,
            loopback_tx: tx,
        }
    }

    /// Inject bytes as if they arrived from the remote end, without going
    /// through the loopback-of-sends path. Useful for tests that want to
    /// simulate an inbound frame from "someone else".
    pub fn inject(&self, bytes: Vec<u8>) {
        let _ = self.loopback_tx.send(bytes);
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for MockAdapter {
    async fn open(&mut self) -> Result<(), AdapterError> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        if !self.open {
            return Err(AdapterError::NotOpen);
        }
        let _ = self.loopback_tx.send(bytes.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> AdapterEvent {
        match self.loopback.recv().await {
            Some(bytes) => AdapterEvent::Data(bytes),
            None => AdapterEvent::Close,
        }
    }
}

/// Serial KISS TNC adapter: opens a tty/COM port at a fixed baud rate and
/// speaks KISS framing in both directions, buffering at most one packet
/// while disconnected rather than throwing from `send`.
pub struct SerialAdapter {
    path: String,
    baud: u32,
    port: Option<tokio_serial::SerialStream>,
    decoder: KissDecoder,
    read_buf: [u8; 1024],
    buffered_send: Option<Vec<u8>>,
}

impl SerialAdapter {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        SerialAdapter {
            path: path.into(),
            baud,
            port: None,
            decoder: KissDecoder::new(),
            read_buf: [0u8; 1024],
            buffered_send: None,
        }
    }
}

#[async_trait]
impl ChannelAdapter for SerialAdapter {
    async fn open(&mut self) -> Result<(), AdapterError> {
        match tokio_serial::new(&self.path, self.baud).open_native_async() {
            Ok(port) => {
                self.port = Some(port);
                if let Some(pending) = self.buffered_send.take() {
                    let _ = self.send(&pending).await;
                }
                Ok(())
            }
            Err(e) => Err(AdapterError::Io(e.to_string())),
        }
    }

    async fn close(&mut self) {
        self.port = None;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        let framed = crate::kiss::encode(0, bytes);
        match &mut self.port {
            Some(port) => port
                .write_all(&framed)
                .await
                .map_err(|e| AdapterError::Io(e.to_string())),
            None => {
                // Disconnected: buffer a single packet rather than failing loudly.
                self.buffered_send = Some(bytes.to_vec());
                Ok(())
            }
        }
    }

    async fn recv(&mut self) -> AdapterEvent {
        loop {
            if let Some(port) = &mut self.port {
                match port.read(&mut self.read_buf).await {
                    Ok(0) => return AdapterEvent::Close,
                    Ok(n) => {
                        let packets = self.decoder.feed(&self.read_buf[..n]);
                        if let Some(p) = packets.into_iter().next() {
                            return AdapterEvent::Data(p.data);
                        }
                        continue;
                    }
                    Err(e) => return AdapterEvent::Error(e.to_string()),
                }
            } else {
                return AdapterEvent::Error("serial port not open".into());
            }
        }
    }
}

/// KISS-over-TCP client adapter with exponential reconnect backoff: 1s
/// initial delay, x1.5 growth, capped at 30s, giving up after 10 attempts
/// (after which the caller should treat the channel as idle until a manual
/// reconnect is requested).
pub struct KissTcpAdapter {
    addr: String,
    stream: Option<TcpStream>,
    decoder: KissDecoder,
    read_buf: [u8; 4096],
}

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const RECONNECT_MAX_TRIES: u32 = 10;

impl KissTcpAdapter {
    pub fn new(addr: impl Into<String>) -> Self {
        KissTcpAdapter {
            addr: addr.into(),
            stream: None,
            decoder: KissDecoder::new(),
            read_buf: [0u8; 4096],
        }
    }

    /// Attempt to (re)connect with the documented backoff schedule. Returns
    /// `Ok(())` once connected, or `Err` after exhausting `RECONNECT_MAX_TRIES`.
    async fn reconnect(&mut self) -> Result<(), AdapterError> {
        let mut delay = RECONNECT_INITIAL;
        for attempt in 0..RECONNECT_MAX_TRIES {
            match tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(&self.addr)).await
            {
                Ok(Ok(stream)) => {
                    self.stream = Some(stream);
                    return Ok(());
                }
                _ => {
                    log::warn!(
                        "KISS-TCP {}: connect attempt {} failed, retrying in {:?}",
                        self.addr,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay.mul_f64(1.5), RECONNECT_MAX);
                }
            }
        }
        Err(AdapterError::Io(format!(
            "giving up reconnecting to {} after {RECONNECT_MAX_TRIES} tries",
            self.addr
        )))
    }
}

#[async_trait]
impl ChannelAdapter for KissTcpAdapter {
    async fn open(&mut self) -> Result<(), AdapterError> {
        self.reconnect().await
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        let framed = crate::kiss::encode(0, bytes);
        match &mut self.stream {
            Some(stream) => match stream.write_all(&framed).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.stream = None;
                    Err(AdapterError::Io(e.to_string()))
                }
            },
            // TCP links drop outbound traffic while disconnected rather than
            // buffering, per the spec's adapter failure policy.
            None => Err(AdapterError::NotOpen),
        }
    }

    async fn recv(&mut self) -> AdapterEvent {
        loop {
            match &mut self.stream {
                Some(stream) => match stream.read(&mut self.read_buf).await {
                    Ok(0) => {
                        self.stream = None;
                        return AdapterEvent::Close;
                    }
                    Ok(n) => {
                        let packets = self.decoder.feed(&self.read_buf[..n]);
                        if let Some(p) = packets.into_iter().next() {
                            return AdapterEvent::Data(p.data);
                        }
                        continue;
                    }
                    Err(e) => {
                        self.stream = None;
                        return AdapterEvent::Error(e.to_string());
                    }
                },
                None => match self.reconnect().await {
                    Ok(()) => return AdapterEvent::Open,
                    Err(e) => return AdapterEvent::Error(e.to_string()),
                },
            }
        }
    }
}

/// AGW text-command TCP adapter, kept for completeness. AGW is not a KISS
/// transport: frames travel inside AGW's own command envelope, so this
/// adapter performs that (de)serialization itself rather than relying on
/// the shared KISS byte-stuffing codec.
pub struct AgwAdapter {
    addr: String,
    stream: Option<TcpStream>,
    read_buf: [u8; 4096],
    pending: Vec<u8>,
}

impl AgwAdapter {
    pub fn new(addr: impl Into<String>) -> Self {
        AgwAdapter {
            addr: addr.into(),
            stream: None,
            read_buf: [0u8; 4096],
            pending: Vec::new(),
        }
    }

    /// AGW 'K' (raw KISS-like data) frame header: 4 call fields + kind byte +
    /// 4-byte little-endian data length, used symmetrically here for both
    /// directions since the CORE only needs a transparent pass-through of
    /// AX.25 bytes, not the full AGW command set.
    fn encode_agw(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 36);
        out.extend_from_slice(&[0u8; 4]); // port/reserved
        out.push(b'K');
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&[0u8; 20]); // call from/to, unused by the CORE
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn try_decode_agw(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
        const HEADER_LEN: usize = 4 + 1 + 3 + 20 + 4;
        if buf.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_le_bytes(buf[32..36].try_into().ok()?) as usize;
        if buf.len() < HEADER_LEN + len {
            return None;
        }
        let data = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        buf.drain(..HEADER_LEN + len);
        Some(data)
    }
}

#[async_trait]
impl ChannelAdapter for AgwAdapter {
    async fn open(&mut self) -> Result<(), AdapterError> {
        match tokio::time::timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(AdapterError::Io(e.to_string())),
            Err(_) => Err(AdapterError::Timeout),
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        let framed = Self::encode_agw(bytes);
        match &mut self.stream {
            Some(stream) => stream
                .write_all(&framed)
                .await
                .map_err(|e| AdapterError::Io(e.to_string())),
            None => Err(AdapterError::NotOpen),
        }
    }

    async fn recv(&mut self) -> AdapterEvent {
        loop {
            if let Some(data) = Self::try_decode_agw(&mut self.pending) {
                return AdapterEvent::Data(data);
            }
            match &mut self.stream {
                Some(stream) => match stream.read(&mut self.read_buf).await {
                    Ok(0) => {
                        self.stream = None;
                        return AdapterEvent::Close;
                    }
                    Ok(n) => {
                        self.pending.extend_from_slice(&self.read_buf[..n]);
                    }
                    Err(e) => {
                        self.stream = None;
                        return AdapterEvent::Error(e.to_string());
                    }
                },
                None => return AdapterEvent::Error("AGW socket not open".into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_adapter_echoes_sent_bytes() {
        let mut adapter = MockAdapter::new();
        adapter.open().await.unwrap();
        adapter.send(b"hello").await.unwrap();
        match adapter.recv().await {
            AdapterEvent::Data(d) => assert_eq!(d, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_adapter_rejects_send_before_open() {
        let mut adapter = MockAdapter::new();
        assert_eq!(adapter.send(b"x").await, Err(AdapterError::NotOpen));
    }

    #[test]
    fn agw_round_trips_framing() {
        let encoded = AgwAdapter::encode_agw(b"ax25-bytes");
        let mut buf = encoded;
        let decoded = AgwAdapter::try_decode_agw(&mut buf).unwrap();
        assert_eq!(decoded, b"ax25-bytes");
        assert!(buf.is_empty());
    }
}
