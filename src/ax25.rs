//! AX.25 link-layer codec (C2): address list, control byte, PID and payload.
//!
//! Wire layout of one address: 6 bytes of space-padded callsign shifted left
//! by one bit, followed by a 7th byte packing the C/H bit, two reserved bits
//! (always 1 on the wire), a 4-bit SSID, and the end-of-address (EA) bit.

use std::fmt;

use crate::callsign::{Callsign, CallsignError};

const MAX_ADDRESSES: usize = 10; // dest + src + up to 8 digis

/// Errors the codec can return. Never panics; always a `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ax25Error {
    Truncated(String),
    BadAddress(String),
}

impl fmt::Display for Ax25Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ax25Error::Truncated(m) => write!(f, "truncated AX.25 frame: {m}"),
            Ax25Error::BadAddress(m) => write!(f, "bad AX.25 address: {m}"),
        }
    }
}

impl std::error::Error for Ax25Error {}

impl From<CallsignError> for Ax25Error {
    fn from(e: CallsignError) -> Self {
        Ax25Error::BadAddress(e.to_string())
    }
}

/// One address-field entry. For `dest`/`src` the `ch_bit` is the command/
/// response (C) bit; for digipeater entries it is the has-been-repeated (H)
/// bit. Both share the same wire position, so a single field suffices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub callsign: Callsign,
    pub ch_bit: bool,
}

impl Address {
    pub fn new(callsign: Callsign, ch_bit: bool) -> Self {
        Address { callsign, ch_bit }
    }
}

/// Command vs. response direction, carried by the dest/src C bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Command,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryKind {
    RR,
    RNR,
    REJ,
    SREJ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnnumberedKind {
    SABM,
    UA,
    DISC,
    DM,
    UI,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Info {
        ns: u8,
        nr: u8,
        poll_final: bool,
    },
    Supervisory {
        kind: SupervisoryKind,
        nr: u8,
        poll_final: bool,
    },
    Unnumbered {
        kind: UnnumberedKind,
        poll_final: bool,
    },
}

impl Control {
    fn carries_pid(&self) -> bool {
        matches!(
            self,
            Control::Info { .. } | Control::Unnumbered { kind: UnnumberedKind::UI, .. }
        )
    }

    fn to_byte(self) -> u8 {
        match self {
            Control::Info { ns, nr, poll_final } => {
                ((nr & 0x07) << 5) | ((poll_final as u8) << 4) | ((ns & 0x07) << 1)
            }
            Control::Supervisory { kind, nr, poll_final } => {
                let subtype = match kind {
                    SupervisoryKind::RR => 0,
                    SupervisoryKind::RNR => 1,
                    SupervisoryKind::REJ => 2,
                    SupervisoryKind::SREJ => 3,
                };
                ((nr & 0x07) << 5) | ((poll_final as u8) << 4) | (subtype << 2) | 0b01
            }
            Control::Unnumbered { kind, poll_final } => {
                let base = match kind {
                    UnnumberedKind::SABM => 0x2F,
                    UnnumberedKind::UA => 0x63,
                    UnnumberedKind::DISC => 0x43,
                    UnnumberedKind::DM => 0x0F,
                    UnnumberedKind::UI => 0x03,
                };
                base | ((poll_final as u8) << 4)
            }
        }
    }

    fn from_byte(byte: u8) -> Option<Control> {
        if byte & 0x01 == 0 {
            let ns = (byte >> 1) & 0x07;
            let nr = (byte >> 5) & 0x07;
            let poll_final = (byte >> 4) & 0x01 != 0;
            return Some(Control::Info { ns, nr, poll_final });
        }
        if byte & 0x03 == 0b01 {
            let subtype = (byte >> 2) & 0x03;
            let nr = (byte >> 5) & 0x07;
            let poll_final = (byte >> 4) & 0x01 != 0;
            let kind = match subtype {
                0 => SupervisoryKind::RR,
                1 => SupervisoryKind::RNR,
                2 => SupervisoryKind::REJ,
                _ => SupervisoryKind::SREJ,
            };
            return Some(Control::Supervisory { kind, nr, poll_final });
        }
        // U-frame: low two bits are 11.
        let poll_final = (byte >> 4) & 0x01 != 0;
        let base = byte & !0x10;
        let kind = match base {
            0x2F => UnnumberedKind::SABM,
            0x63 => UnnumberedKind::UA,
            0x43 => UnnumberedKind::DISC,
            0x0F => UnnumberedKind::DM,
            0x03 => UnnumberedKind::UI,
            _ => return None,
        };
        Some(Control::Unnumbered { kind, poll_final })
    }
}

/// A fully parsed AX.25 frame. `addresses[0]` is the destination, `[1]` the
/// source, and any remainder (up to 8) are digipeater hops in path order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub addresses: Vec<Address>,
    pub direction: Direction,
    pub control: Control,
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn dest(&self) -> &Address {
        &self.addresses[0]
    }

    pub fn src(&self) -> &Address {
        &self.addresses[1]
    }

    pub fn digis(&self) -> &[Address] {
        &self.addresses[2..]
    }

    pub fn digis_mut(&mut self) -> &mut [Address] {
        &mut self.addresses[2..]
    }

    /// True once every digi in the path has its H bit set (fully repeated).
    pub fn fully_repeated(&self) -> bool {
        self.digis().iter().all(|a| a.ch_bit)
    }
}

fn shift_callsign(base: &str) -> [u8; 6] {
    let mut out = [0x40; 6]; // space, shifted left 1, pre-filled
    let padded = format!("{base:<6}");
    for (i, ch) in padded.bytes().take(6).enumerate() {
        out[i] = ch << 1;
    }
    out
}

fn build_address_bytes(addr: &Address, ea: bool) -> [u8; 7] {
    let mut bytes = [0u8; 7];
    bytes[..6].copy_from_slice(&shift_callsign(addr.callsign.base()));
    let ssid_byte = ((addr.ch_bit as u8) << 7)
        | 0b0110_0000 // reserved bits, conventionally 1
        | ((addr.callsign.ssid() & 0x0F) << 1)
        | (ea as u8);
    bytes[6] = ssid_byte;
    bytes
}

fn parse_address_bytes(bytes: &[u8; 7]) -> Result<(Address, bool), Ax25Error> {
    let mut base = String::with_capacity(6);
    for &b in &bytes[..6] {
        let unshifted = b >> 1;
        let ch = unshifted as char;
        if !(ch.is_ascii_alphanumeric() || ch == ' ') {
            return Err(Ax25Error::BadAddress(format!(
                "non-alphanumeric byte 0x{b:02X} in address"
            )));
        }
        base.push(ch);
    }
    let base = base.trim_end().to_string();
    let ssid_byte = bytes[6];
    let ssid = (ssid_byte >> 1) & 0x0F;
    let ch_bit = (ssid_byte >> 7) & 0x01 != 0;
    let ea = ssid_byte & 0x01 != 0;
    let callsign = Callsign::new(&base, ssid)?;
    Ok((Address::new(callsign, ch_bit), ea))
}

/// Parse raw AX.25 bytes (as delivered by the KISS layer, port nibble already
/// stripped) into a `Frame`.
pub fn parse(bytes: &[u8]) -> Result<Frame, Ax25Error> {
    let mut addresses = Vec::new();
    let mut offset = 0;
    let mut saw_ea = false;

    while !saw_ea {
        if addresses.len() >= MAX_ADDRESSES {
            return Err(Ax25Error::Truncated(
                "address list exceeds maximum of 10 entries".into(),
            ));
        }
        if bytes.len() < offset + 7 {
            return Err(Ax25Error::Truncated(format!(
                "need 7 bytes for address {}, have {}",
                addresses.len(),
                bytes.len() - offset
            )));
        }
        let mut block = [0u8; 7];
        block.copy_from_slice(&bytes[offset..offset + 7]);
        let (addr, ea) = parse_address_bytes(&block)?;
        addresses.push(addr);
        offset += 7;
        saw_ea = ea;
    }

    if addresses.len() < 2 {
        return Err(Ax25Error::Truncated("need at least dest and src".into()));
    }

    if bytes.len() <= offset {
        return Err(Ax25Error::Truncated("missing control byte".into()));
    }
    let control_byte = bytes[offset];
    let control = Control::from_byte(control_byte).ok_or_else(|| {
        Ax25Error::Truncated(format!("unrecognized control byte 0x{control_byte:02X}"))
    })?;
    offset += 1;

    let pid = if control.carries_pid() {
        if bytes.len() <= offset {
            return Err(Ax25Error::Truncated("missing PID byte".into()));
        }
        let p = bytes[offset];
        offset += 1;
        Some(p)
    } else {
        None
    };

    let payload = bytes[offset..].to_vec();

    // Direction: dest C=1,src C=0 => command; dest C=0,src C=1 => response.
    let direction = if addresses[0].ch_bit && !addresses[1].ch_bit {
        Direction::Command
    } else {
        Direction::Response
    };

    Ok(Frame {
        addresses,
        direction,
        control,
        pid,
        payload,
    })
}

/// Deterministic inverse of `parse`: rebuilds wire bytes from a `Frame`.
/// Sets EA only on the final address, and sets the dest/src C bits from
/// `frame.direction` (digi H bits are taken as-is from each `Address`).
pub fn build(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::new();
    let last = frame.addresses.len() - 1;
    for (i, addr) in frame.addresses.iter().enumerate() {
        let mut addr = addr.clone();
        if i == 0 {
            addr.ch_bit = matches!(frame.direction, Direction::Command);
        } else if i == 1 {
            addr.ch_bit = matches!(frame.direction, Direction::Response);
        }
        let ea = i == last;
        out.extend_from_slice(&build_address_bytes(&addr, ea));
    }
    out.push(frame.control.to_byte());
    if let Some(pid) = frame.pid {
        out.push(pid);
    }
    out.extend_from_slice(&frame.payload);
    out
}

/// Parse the trailing digit of a `WIDEn` base callsign (e.g. "WIDE2" -> 2).
fn wide_generation(base: &str) -> Option<u8> {
    let digits = base.strip_prefix("WIDE")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u8>().ok()
}

/// Selector passed to [`service_address_in_buffer`]: which digi slots a
/// channel is willing to service.
#[derive(Debug, Default)]
pub struct DigiMatcher<'a> {
    pub explicit: &'a [Callsign],
    pub accept_wide: bool,
}

/// Outcome of servicing one frame against a digi's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub slot: usize,
    /// True once this slot's H bit was set as a result (WIDE count hit zero,
    /// or an explicit-callsign match, which is always fully serviced).
    pub fully_repeated: bool,
}

/// Locate the next unrepeated digi slot whose textual path entry matches the
/// matcher (an explicit callsign, or a `WIDEn-N` entry when wide service is
/// enabled), and mutate it in place: for `WIDEn-N`, decrement the SSID
/// (N-count) nibble, setting the H bit when it reaches zero; for an explicit
/// match, set the H bit directly. Idempotent (no mutation) when nothing
/// matches; always preserves the EA invariant since only digi slots are
/// touched.
pub fn service_address_in_buffer(frame: &mut Frame, matcher: &DigiMatcher) -> Option<ServiceOutcome> {
    let digis = frame.digis_mut();
    for (idx, addr) in digis.iter_mut().enumerate() {
        if addr.ch_bit {
            continue; // already repeated, skip to the next unrepeated slot
        }
        if matcher.explicit.iter().any(|c| *c == addr.callsign) {
            addr.ch_bit = true;
            return Some(ServiceOutcome {
                slot: idx,
                fully_repeated: true,
            });
        }
        if matcher.accept_wide {
            if let Some(n) = wide_generation(addr.callsign.base()) {
                let remaining = addr.callsign.ssid();
                if remaining == 0 {
                    continue;
                }
                let new_remaining = remaining - 1;
                let rebuilt = Callsign::new(&format!("WIDE{n}"), new_remaining)
                    .expect("WIDEn base and 0..=15 ssid are always valid");
                addr.callsign = rebuilt;
                if new_remaining == 0 {
                    addr.ch_bit = true;
                }
                return Some(ServiceOutcome {
                    slot: idx,
                    fully_repeated: new_remaining == 0,
                });
            }
        }
    }
    None
}

/// Returns `Some((slot_index, n))` for the first unrepeated `WIDEn-N` slot in
/// the path, regardless of whether wide service is currently permitted --
/// used by the Channel Manager's WIDE-fallback step.
pub fn first_unrepeated_wide(frame: &Frame) -> Option<(usize, u8, u8)> {
    frame.digis().iter().enumerate().find_map(|(idx, addr)| {
        if addr.ch_bit {
            return None;
        }
        wide_generation(addr.callsign.base()).map(|n| (idx, n, addr.callsign.ssid()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> Callsign {
        s.parse().unwrap()
    }

    fn ui_frame(dest: &str, src: &str, digis: &[&str], payload: &[u8]) -> Frame {
        let mut addresses = vec![Address::new(cs(dest), false), Address::new(cs(src), false)];
        for d in digis {
            addresses.push(Address::new(cs(d), false));
        }
        Frame {
            addresses,
            direction: Direction::Command,
            control: Control::Unnumbered {
                kind: UnnumberedKind::UI,
                poll_final: false,
            },
            pid: Some(0xF0),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trip_ui_frame() {
        let frame = ui_frame("APRS", "N0CALL-7", &["WIDE2-2"], b"Hello");
        let bytes = build(&frame);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(build(&parsed), bytes);
    }

    #[test]
    fn control_byte_for_ui_is_0x03() {
        let frame = ui_frame("DEST", "SRC", &[], b"Hello");
        let bytes = build(&frame);
        // addresses: dest(7) + src(7) = 14, then control
        assert_eq!(bytes[14], 0x03);
    }

    #[test]
    fn sabm_ua_disc_dm_control_bytes() {
        for (kind, base) in [
            (UnnumberedKind::SABM, 0x2Fu8),
            (UnnumberedKind::UA, 0x63),
            (UnnumberedKind::DISC, 0x43),
            (UnnumberedKind::DM, 0x0F),
        ] {
            let c = Control::Unnumbered { kind, poll_final: false };
            assert_eq!(c.to_byte(), base);
            let c_pf = Control::Unnumbered { kind, poll_final: true };
            assert_eq!(c_pf.to_byte(), base | 0x10);
        }
    }

    #[test]
    fn i_frame_sequence_numbers() {
        let control = Control::Info { ns: 3, nr: 5, poll_final: true };
        let byte = control.to_byte();
        let back = Control::from_byte(byte).unwrap();
        assert_eq!(back, control);
    }

    #[test]
    fn truncated_address_list_errors() {
        let bytes = vec![0u8; 5];
        assert!(matches!(parse(&bytes), Err(Ax25Error::Truncated(_))));
    }

    #[test]
    fn bad_address_non_alphanumeric() {
        let mut bytes = build(&ui_frame("DEST", "SRC", &[], b"x"));
        bytes[0] = 0x01; // unshifted -> control char, not alnum/space
        assert!(matches!(parse(&bytes), Err(Ax25Error::BadAddress(_))));
    }

    #[test]
    fn services_wide2_2_then_blocks_third_hop() {
        let mut frame = ui_frame("APRS", "N0CALL", &["WIDE2-2"], b"x");
        let matcher = DigiMatcher {
            explicit: &[],
            accept_wide: true,
        };

        let outcome = service_address_in_buffer(&mut frame, &matcher).unwrap();
        assert_eq!(outcome.slot, 0);
        assert!(!outcome.fully_repeated);
        assert_eq!(frame.digis()[0].callsign.base(), "WIDE2");
        assert_eq!(frame.digis()[0].callsign.ssid(), 1);
        assert!(!frame.digis()[0].ch_bit);

        let outcome2 = service_address_in_buffer(&mut frame, &matcher).unwrap();
        assert!(outcome2.fully_repeated);
        assert!(frame.digis()[0].ch_bit);
        assert_eq!(frame.digis()[0].callsign.ssid(), 0);

        // Third hop: nothing left to service.
        assert!(service_address_in_buffer(&mut frame, &matcher).is_none());
        assert!(frame.fully_repeated());
    }

    #[test]
    fn services_explicit_callsign() {
        let mut frame = ui_frame("APRS", "N0CALL", &["W1AW-1"], b"x");
        let matcher = DigiMatcher {
            explicit: &[cs("W1AW-1")],
            accept_wide: false,
        };
        let outcome = service_address_in_buffer(&mut frame, &matcher).unwrap();
        assert!(outcome.fully_repeated);
        assert!(frame.digis()[0].ch_bit);
    }

    #[test]
    fn idempotent_when_no_match() {
        let mut frame = ui_frame("APRS", "N0CALL", &["W1AW-1"], b"x");
        let before = frame.clone();
        let matcher = DigiMatcher {
            explicit: &[cs("KC1ABC")],
            accept_wide: false,
        };
        assert!(service_address_in_buffer(&mut frame, &matcher).is_none());
        assert_eq!(frame, before);
    }
}
