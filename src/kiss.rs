//! KISS framing (C1): bytes <-> framed packets.
//!
//! FEND=0xC0 delimits packets, FESC=0xDB escapes FEND/FESC inside the payload
//! as TFEND=0xDC / TFESC=0xDD. The decoder is stream-oriented: feed it
//! arbitrary chunks and drain complete packets as they appear.

use std::fmt;

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

/// Error raised by the KISS layer. Per the spec, a standalone FESC followed by a
/// non-escape byte is the only case that warrants surfacing an error; the decoder
/// still recovers by passing the offending bytes through unaltered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KissError {
    MalformedFraming(String),
}

impl fmt::Display for KissError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KissError::MalformedFraming(msg) => write!(f, "malformed KISS framing: {msg}"),
        }
    }
}

impl std::error::Error for KissError {}

/// Streaming KISS decoder. Owns a per-stream buffer so callers can feed
/// arbitrarily-sized chunks from a serial port or TCP socket.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

/// A decoded KISS packet: the port/command nibble pair and the data frame bytes
/// (port byte already stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissPacket {
    pub port: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning zero or more complete packets.
    /// Empty packets between FENDs are discarded. Malformed framing (a
    /// standalone FESC not followed by an escape byte) is logged and the
    /// offending byte is passed through unescaped rather than dropping data.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<KissPacket> {
        let mut out = Vec::new();
        for &byte in chunk {
            match byte {
                FEND => {
                    if self.in_frame && !self.buffer.is_empty() {
                        if let Some(packet) = Self::finish_packet(&self.buffer) {
                            out.push(packet);
                        }
                    }
                    self.buffer.clear();
                    self.escaped = false;
                    self.in_frame = true;
                }
                FESC if self.in_frame => {
                    self.escaped = true;
                }
                other if self.in_frame && self.escaped => {
                    self.escaped = false;
                    match other {
                        TFEND => self.buffer.push(FEND),
                        TFESC => self.buffer.push(FESC),
                        _ => {
                            log::warn!(
                                "KISS: standalone FESC followed by non-escape byte 0x{other:02X}, passing through"
                            );
                            self.buffer.push(other);
                        }
                    }
                }
                other if self.in_frame => self.buffer.push(other),
                _ => {
                    // Bytes before the first FEND are discarded.
                }
            }
        }
        out
    }

    fn finish_packet(buffer: &[u8]) -> Option<KissPacket> {
        let (&first, data) = buffer.split_first()?;
        Some(KissPacket {
            port: first >> 4,
            command: first & 0x0F,
            data: data.to_vec(),
        })
    }
}

/// Encode a data-frame packet (command nibble = 0) on the given port, escaping
/// interior FEND/FESC bytes and wrapping the result in FEND delimiters.
pub fn encode(port: u8, data: &[u8]) -> Vec<u8> {
    encode_with_command(port, 0x00, data)
}

/// Encode a KISS packet with an explicit command nibble (0 = data frame; other
/// values are TNC control commands such as TXDELAY which the CORE never emits
/// itself but may need to pass through from a collaborator).
pub fn encode_with_command(port: u8, command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(FEND);
    out.push((port << 4) | (command & 0x0F));
    for &b in data {
        match b {
            FEND => {
                out.push(FESC);
                out.push(TFEND);
            }
            FESC => {
                out.push(FESC);
                out.push(TFESC);
            }
            _ => out.push(b),
        }
    }
    out.push(FEND);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_frame() {
        let encoded = encode(0, b"hello");
        let mut dec = KissDecoder::new();
        let packets = dec.feed(&encoded);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].port, 0);
        assert_eq!(packets[0].data, b"hello");
    }

    #[test]
    fn escapes_fend_and_fesc_in_payload() {
        let payload = vec![0x01, FEND, 0x02, FESC, 0x03];
        let encoded = encode(1, &payload);
        // Encoded form must not contain a bare FEND/FESC in the middle.
        assert_eq!(encoded[0], FEND);
        assert_eq!(*encoded.last().unwrap(), FEND);

        let mut dec = KissDecoder::new();
        let packets = dec.feed(&encoded);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, payload);
        assert_eq!(packets[0].port, 1);
    }

    #[test]
    fn ignores_empty_packets_between_fends() {
        let mut dec = KissDecoder::new();
        let mut bytes = vec![FEND, FEND];
        bytes.extend(encode(0, b"x"));
        let packets = dec.feed(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, b"x");
    }

    #[test]
    fn handles_split_chunks() {
        let encoded = encode(2, b"abcdef");
        let mut dec = KissDecoder::new();
        let mid = encoded.len() / 2;
        let mut packets = dec.feed(&encoded[..mid]);
        assert!(packets.is_empty());
        packets = dec.feed(&encoded[mid..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, b"abcdef");
    }

    #[test]
    fn standalone_fesc_passes_through_unaltered() {
        // FESC followed by a non-escape byte: recover by emitting the byte as-is.
        let mut dec = KissDecoder::new();
        let bytes = vec![FEND, 0x00, FESC, 0x41, FEND];
        let packets = dec.feed(&bytes);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![0x41]);
    }
}
