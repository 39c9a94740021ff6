use std::fmt::Display;

use anyhow::{anyhow, bail};
use tracing::warn;
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// Bytes counted by the length field besides the fields themselves: the
/// header after STX plus the two checksum digits.
const LEN_OVERHEAD: usize = 16;

/// Field positions of operation 01 (call input).
pub mod e01 {
    pub const ADC: usize = 0;
    pub const OADC: usize = 1;
    pub const AC: usize = 2;
    pub const MT: usize = 3;
    pub const AMSG: usize = 4;
    pub(super) const SIZE: usize = 5;
}

/// Field positions of the 50 series (51 submit, 52 deliver, 53 notification).
pub mod e50 {
    pub const ADC: usize = 0;
    pub const OADC: usize = 1;
    pub const AC: usize = 2;
    pub const NRQ: usize = 3;
    pub const NADC: usize = 4;
    pub const NT: usize = 5;
    pub const NPID: usize = 6;
    pub const LRQ: usize = 7;
    pub const LRAD: usize = 8;
    pub const LPID: usize = 9;
    pub const DD: usize = 10;
    pub const DDT: usize = 11;
    pub const VP: usize = 12;
    pub const RPID: usize = 13;
    pub const SCTS: usize = 14;
    pub const DST: usize = 15;
    pub const RSN: usize = 16;
    pub const DSCTS: usize = 17;
    pub const MT: usize = 18;
    pub const NB: usize = 19;
    /// Shared by AMSG, TMSG and NMSG depending on MT.
    pub const MSG: usize = 20;
    pub const MMS: usize = 21;
    pub const PR: usize = 22;
    pub const DCS: usize = 23;
    pub const MCLS: usize = 24;
    pub const RPI: usize = 25;
    pub const CPG: usize = 26;
    pub const RPLY: usize = 27;
    pub const OTOA: usize = 28;
    pub const HPLMN: usize = 29;
    pub const XSER: usize = 30;
    pub const RES4: usize = 31;
    pub const RES5: usize = 32;
    pub(super) const SIZE: usize = 33;
}

/// Field positions of operation 60 (session management).
pub mod e60 {
    pub const OADC: usize = 0;
    pub const OTON: usize = 1;
    pub const ONPI: usize = 2;
    pub const STYP: usize = 3;
    pub const PWD: usize = 4;
    pub const NPWD: usize = 5;
    pub const VERS: usize = 6;
    pub const LADC: usize = 7;
    pub const LTON: usize = 8;
    pub const LNPI: usize = 9;
    pub const OPID: usize = 10;
    pub const RES1: usize = 11;
    pub(super) const SIZE: usize = 12;
}

/// Field positions of a reply.
pub mod reply {
    /// `A` or `N`.
    pub const ACK: usize = 0;
    /// Error code of a negative reply.
    pub const EC: usize = 1;
    /// System message of a 50 series reply, positive or negative.
    pub const SM: usize = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
#[repr(u8)]
enum Start {
    Stx = STX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
#[repr(u8)]
enum Separator {
    Slash = b'/',
}

/// Operation or reply, the `O`/`R` header field.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
pub enum EmiKind {
    Operation = b'O',
    Reply = b'R',
}

#[derive(Clone, Debug, PartialEq, Eq, IntoBytes, KnownLayout, Immutable, TryFromBytes)]
#[repr(C, packed)]
struct EmiHeader {
    stx: Start,
    trn: [u8; 2],
    _s1: Separator,
    len: [u8; 5],
    _s2: Separator,
    kind: EmiKind,
    _s3: Separator,
    ot: [u8; 2],
    _s4: Separator,
}

fn ascii_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(
        digits
            .iter()
            .fold(0, |acc, d| acc * 10 + usize::from(d - b'0')),
    )
}

/// Zero padded decimal, keeping the lowest `N` digits.
fn decimal_digits<const N: usize>(mut value: usize) -> [u8; N] {
    let mut out = [b'0'; N];
    for digit in out.iter_mut().rev() {
        *digit = b'0' + u8::try_from(value % 10).unwrap_or_default();
        value /= 10;
    }
    out
}

/// Sum of everything between STX and the checksum digits.
fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn operation_fields(ot: u8) -> anyhow::Result<usize> {
    Ok(match ot {
        1 => e01::SIZE,
        31 => 2,
        51..=53 => e50::SIZE,
        60 => e60::SIZE,
        _ => bail!("Unsupported EMI operation request type {ot}"),
    })
}

fn reply_fields(ot: u8, positive: bool) -> anyhow::Result<usize> {
    Ok(match ot {
        1 | 31 | 60 if positive => 2,
        1 | 31 | 60 | 51..=53 => 3,
        _ => bail!("Unsupported EMI operation reply type {ot}"),
    })
}

/// Text for the error code of a negative reply.
#[must_use]
pub fn error_text(code: u32) -> &'static str {
    match code {
        1 => "Checksum error",
        2 => "Syntax error",
        3 => "Operation not supported by system",
        4 => "Operation not allowed",
        5 => "Call barring active",
        6 => "AdC invalid",
        7 => "Authentication failure",
        8 => "Legitimisation code for all calls, failure",
        9 => "GA not valid",
        10 => "Repetition not allowed",
        11 => "Legitimisation code for repetition, failure",
        12 => "Priority call not allowed",
        13 => "Legitimisation code for priority call, failure",
        14 => "Urgent message not allowed",
        15 => "Legitimisation code for urgent message, failure",
        16 => "Reverse charging not allowed",
        17 => "Legitimisation code for reverse charging, failure",
        18 => "Deferred delivery not allowed",
        19 => "New AC not valid",
        20 => "New legitimisation code not valid",
        21 => "Standard text not valid",
        22 => "Time period not valid",
        23 => "Message type not supported by system",
        24 => "Message too long",
        25 => "Requested standard text not valid",
        26 => "Message type not valid for the pager type",
        27 => "Message not found in smsc",
        30 => "Subscriber hang-up",
        31 => "Fax group not supported",
        32 => "Fax message type not supported",
        33 => "Address already in list (60 series)",
        34 => "Address not in list (60 series)",
        35 => "List full, cannot add address to list (60 series)",
        36 => "RPID already in use",
        37 => "Delivery in progress",
        38 => "Message forwarded",
        _ => "!UNRECOGNIZED ERROR CODE!",
    }
}

/// Longest packet the five digit length field allows, STX and ETX included.
pub const MAX_PACKET: usize = 99_999 + 2;

/// Cuts the next complete `STX ... ETX` packet off the front of `buf`.
///
/// Bytes before the STX are discarded. Returns `None` until the ETX arrived;
/// an unterminated packet longer than [`MAX_PACKET`] is dropped.
pub fn take_packet(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = buf.iter().position(|b| *b == STX) else {
        buf.clear();
        return None;
    };
    buf.drain(..start);
    let Some(end) = buf.iter().position(|b| *b == ETX) else {
        if buf.len() > MAX_PACKET {
            warn!("dropping {} bytes of input without ETX", buf.len());
            buf.clear();
        }
        return None;
    };
    Some(buf.drain(..=end).collect())
}

/// One EMI/UCP operation or reply.
///
/// Fields are kept as text; an unset field is written as an empty one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmiMessage {
    pub trn: u8,
    pub kind: EmiKind,
    pub ot: u8,
    fields: Vec<Option<String>>,
}

impl EmiMessage {
    /// An operation of type `ot` with every field unset.
    pub fn operation(ot: u8, trn: u8) -> anyhow::Result<Self> {
        Ok(Self {
            trn,
            kind: EmiKind::Operation,
            ot,
            fields: vec![None; operation_fields(ot)?],
        })
    }

    /// A reply to operation `ot`, acknowledging it if `positive`.
    pub fn reply(ot: u8, trn: u8, positive: bool) -> anyhow::Result<Self> {
        let mut msg = Self {
            trn,
            kind: EmiKind::Reply,
            ot,
            fields: vec![None; reply_fields(ot, positive)?],
        };
        msg.set(reply::ACK, if positive { "A" } else { "N" });
        Ok(msg)
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).and_then(Option::as_deref)
    }

    /// Sets field `index`; indexes past the operation's field count are
    /// ignored.
    pub fn set(&mut self, index: usize, value: impl Into<String>) {
        if let Some(field) = self.fields.get_mut(index) {
            *field = Some(value.into());
        }
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_operation(&self) -> bool {
        self.kind == EmiKind::Operation
    }

    /// A reply carrying `A`.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.kind == EmiKind::Reply && self.field(reply::ACK).is_some_and(|f| f.starts_with('A'))
    }

    /// Error code of a negative reply.
    #[must_use]
    pub fn error_code(&self) -> Option<u32> {
        if self.kind != EmiKind::Reply || self.is_positive() {
            return None;
        }
        self.field(reply::EC)
            .and_then(|ec| ascii_decimal(ec.as_bytes()))
            .and_then(|ec| u32::try_from(ec).ok())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for field in &self.fields {
            if let Some(field) = field {
                data.extend(field.as_bytes());
            }
            data.push(b'/');
        }
        let header = EmiHeader {
            stx: Start::Stx,
            trn: decimal_digits(usize::from(self.trn)),
            _s1: Separator::Slash,
            len: decimal_digits(data.len() + LEN_OVERHEAD),
            _s2: Separator::Slash,
            kind: self.kind,
            _s3: Separator::Slash,
            ot: decimal_digits(usize::from(self.ot)),
            _s4: Separator::Slash,
        };
        let mut packet = header.as_bytes().to_owned();
        packet.extend(data);
        let sum = checksum(&packet[1..]);
        packet.extend(format!("{sum:02X}").as_bytes());
        packet.push(ETX);
        packet
    }

    /// Parses one complete packet, STX and ETX included.
    ///
    /// Fields beyond the operation's field count are ignored. A negative
    /// reply must carry a two digit error code.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let (header, _) = EmiHeader::try_ref_from_prefix(bytes)
            .map_err(|e| anyhow!("Could not decode EMI header: {e}"))?;
        if bytes.last() != Some(&ETX) {
            bail!("missing ETX");
        }
        let trn = ascii_decimal(&header.trn).ok_or_else(|| anyhow!("invalid TRN"))?;
        let len = ascii_decimal(&header.len).ok_or_else(|| anyhow!("invalid length"))?;
        if bytes.len() != len + 2 {
            bail!("length {len} does not match packet size {}", bytes.len());
        }
        let ot = ascii_decimal(&header.ot).ok_or_else(|| anyhow!("invalid operation type"))?;
        #[expect(clippy::cast_possible_truncation, reason = "two decimal digits")]
        let (trn, ot) = (trn as u8, ot as u8);

        let size = size_of::<EmiHeader>();
        let body = &bytes[size..bytes.len() - 1];
        let kind = header.kind;
        let count = match kind {
            EmiKind::Operation => operation_fields(ot)?,
            EmiKind::Reply => match body.first() {
                Some(b'A') => reply_fields(ot, true)?,
                Some(b'N') => reply_fields(ot, false)?,
                _ => bail!("reply is neither positive nor negative"),
            },
        };

        let mut fields = Vec::with_capacity(count);
        let mut rest = body;
        for _ in 0..count {
            let Some(end) = rest.iter().position(|b| *b == b'/') else {
                bail!("expected {count} fields, found {}", fields.len());
            };
            let field = &rest[..end];
            fields.push((!field.is_empty()).then(|| String::from_utf8_lossy(field).into_owned()));
            rest = &rest[end + 1..];
        }
        let extra = rest.iter().filter(|b| **b == b'/').count();
        if extra > 0 {
            warn!(
                "EMI message of type {ot}/{} has {extra} more fields than expected.",
                char::from(kind as u8)
            );
        }
        let (fields_end, digits) = match rest.iter().rposition(|b| *b == b'/') {
            Some(pos) => (bytes.len() - 1 - rest.len() + pos + 1, &rest[pos + 1..]),
            None => (bytes.len() - 1 - rest.len(), rest),
        };
        let expected = std::str::from_utf8(digits)
            .ok()
            .filter(|d| !d.is_empty())
            .and_then(|d| u32::from_str_radix(d, 16).ok())
            .ok_or_else(|| anyhow!("invalid checksum field"))?;
        let actual = checksum(&bytes[1..fields_end]);
        if expected != u32::from(actual) {
            bail!("checksum {expected:02X} does not match {actual:02X}");
        }

        let msg = Self {
            trn,
            kind,
            ot,
            fields,
        };
        if kind == EmiKind::Reply && !msg.is_positive() && msg.error_code().is_none() {
            bail!("negative reply without error code");
        }
        Ok(msg)
    }
}

impl Display for EmiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}
