//! SMS PDU codec, 3GPP TS 23.040.

use anyhow::{Context as _, anyhow, bail};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, warn};

use crate::{
    Coding, DlrMask, Sms, SmsType, charset,
    dcs::{dcs_to_fields, fields_to_dcs},
    septet,
};

const SMS_7BIT_MAX_LEN: usize = 160;
const SMS_8BIT_MAX_LEN: usize = 140;
/// Relative validity used when neither the message nor the modem sets one.
const DEFAULT_VALIDITY: u8 = 167;

const MTI_DELIVER: u8 = 0;
const MTI_STATUS_REPORT: u8 = 2;

/// A PDU cut out of a `+CMT`/`+CDS`/`+CMGR` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedPdu {
    /// Hex digits of the TPDU, the SMSC address removed.
    pub pdu: String,
    pub smsc_number: Option<String>,
}

/// A decoded inbound PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Deliver(Sms),
    StatusReport {
        /// TP-MR of the submit this report is about.
        reference: u8,
        receiver: String,
        status: DlrMask,
    },
}

impl Decoded {
    /// Text stored as the message body of a report.
    #[must_use]
    pub fn status_text(status: DlrMask) -> &'static str {
        if status == DlrMask::SUCCESS {
            "Success"
        } else if status == DlrMask::BUFFERED {
            "Buffered"
        } else {
            "Failed"
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).and_then(|d| u8::try_from(d).ok())
}

/// Finds the PDU in `buffer`, the header line and the PDU line joined.
///
/// `no_smsc` modems do not prefix the PDU with the SMSC address, `broken`
/// ones omit the comma before the length and may deliver short PDUs.
#[must_use]
pub fn pdu_extract(buffer: &str, no_smsc: bool, broken: bool) -> Option<ExtractedPdu> {
    let bytes = buffer.as_bytes();
    let mut pos = if let Some(p) = buffer.find("+CDS:") {
        p + 5
    } else {
        let p = if let Some(p) = buffer.find("+CMT:") {
            p + 5
        } else if let Some(p) = buffer.find("+CMGR:") {
            // skip the status field
            p + 6 + buffer[p + 6..].find(',')? + 1
        } else {
            return None;
        };
        match buffer[p..].find(',') {
            Some(comma) => p + comma + 1,
            None if broken => p,
            None => return None,
        }
    };

    while bytes.get(pos).is_some_and(u8::is_ascii_whitespace) {
        pos += 1;
    }
    let digits = bytes[pos..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    let len: usize = buffer[pos..pos + digits].parse().ok()?;
    if len == 0 {
        return None;
    }
    pos += digits;
    while bytes.get(pos).is_some_and(u8::is_ascii_whitespace) {
        pos += 1;
    }

    let mut smsc_number = None;
    if !no_smsc {
        let hi = hex_value(*bytes.get(pos)?)?;
        let lo = hex_value(*bytes.get(pos + 1)?)?;
        let n = usize::from(hi * 16 + lo);
        let address = hex::decode(buffer.get(pos + 2..pos + 2 + n * 2)?).ok()?;
        let number = gsm2number(&address);
        debug!("received message from SMSC: {number}");
        smsc_number = Some(number);
        pos += 2 + n * 2;
    }

    if !broken && buffer.len() < len * 2 + pos {
        return None;
    }
    if broken && buffer.len() < len * 2 {
        return None;
    }
    let end = (pos + len * 2).min(buffer.len());
    Some(ExtractedPdu {
        pdu: buffer.get(pos..end)?.to_owned(),
        smsc_number,
    })
}

/// Decodes an SMSC address field (type of address followed by BCD digits).
#[must_use]
pub fn gsm2number(address: &[u8]) -> String {
    let Some((&toa, digits)) = address.split_first() else {
        return String::new();
    };
    let mut number = String::from(match (toa >> 4) & 0x07 {
        1 => "+",
        2 => "0",
        _ => "",
    });
    let nibble = |n: u8| char::from_digit(u32::from(n), 16).map_or('?', |c| c.to_ascii_uppercase());
    for (i, &b) in digits.iter().enumerate() {
        number.push(nibble(b & 0x0F));
        if b >> 4 != 0x0F || i + 1 < digits.len() {
            number.push(nibble(b >> 4));
        }
    }
    number
}

/// Encodes a destination address: length in digits, type of address and
/// swapped BCD digits.
///
/// A leading `+` or `00` marks an international number.
pub fn format_address_field(msisdn: &str) -> anyhow::Result<Vec<u8>> {
    let trimmed = msisdn.trim();
    let (international, digits) = if let Some(rest) = trimmed.strip_prefix('+') {
        (true, rest)
    } else if let Some(rest) = trimmed.strip_prefix("00") {
        (true, rest)
    } else {
        (false, trimmed)
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid character in address '{msisdn}'");
    }
    let len = u8::try_from(digits.len()).map_err(|_| anyhow!("address '{msisdn}' too long"))?;
    let mut out = vec![len, 0x81 | if international { 0x10 } else { 0x00 }];
    out.extend(digits.as_bytes().chunks(2).map(|pair| {
        let d1 = pair[0] - b'0';
        let d2 = pair.get(1).map_or(0x0F, |d| d - b'0');
        (d2 << 4) | d1
    }));
    Ok(out)
}

/// Relative TP-VP octet for a validity `minutes` from now.
#[must_use]
pub fn validity_period(minutes: i64) -> u8 {
    let value = match minutes {
        i64::MIN..5 => 0,
        5..=720 => (minutes - 1) / 5,
        721..750 => 144,
        750..=1440 => (minutes - 720 - 1) / 30 + 144,
        1441..2880 => 168,
        2880..=43200 => (minutes - 1) / 24 / 60 + 167,
        43201..50400 => 197,
        50400..=635_040 => (minutes - 1) / 7 / 24 / 60 + 193,
        _ => 255,
    };
    u8::try_from(value).unwrap_or(u8::MAX)
}

fn log_validity(vp: u8) {
    match vp {
        0..=143 => debug!("TP-Validity-Period: {} minutes", (u32::from(vp) + 1) * 5),
        144..=167 => debug!(
            "TP-Validity-Period: {:.1} hours",
            f32::from(vp - 143) / 2.0 + 12.0
        ),
        168..=196 => debug!("TP-Validity-Period: {} days", vp - 166),
        _ => debug!("TP-Validity-Period: {} weeks", vp - 192),
    }
}

/// Builds the hex SMS-SUBMIT PDU for `sms`, without the SMSC prefix.
///
/// `alt_dcs` applies when the message does not choose a coding group itself,
/// `validity` when it carries no validity time.
pub fn encode(
    sms: &Sms,
    alt_dcs: bool,
    validity: Option<u8>,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let udh = &sms.udhdata;
    let mut pdu = vec![
        (u8::from(sms.rpi.is_some_and(|r| r > 0)) << 7)
            | (u8::from(!udh.is_empty()) << 6)
            | (u8::from(sms.dlr_mask.is_enabled_device()) << 5)
            | 0x10
            | 0x01,
        // message reference, assigned by the modem
        0,
    ];
    pdu.extend(format_address_field(&sms.receiver)?);
    pdu.push(sms.pid.unwrap_or(0));
    pdu.push(fields_to_dcs(sms, Some(sms.alt_dcs.unwrap_or(alt_dcs))));

    let vp = match sms.validity {
        Some(validity) => validity_period((validity - now).num_minutes()),
        None => validity.unwrap_or(DEFAULT_VALIDITY),
    };
    log_validity(vp);
    pdu.push(vp);

    if udh.len() > SMS_8BIT_MAX_LEN {
        bail!("UDH of {} octets does not fit", udh.len());
    }
    if sms.effective_coding().is_binary() {
        let room = SMS_8BIT_MAX_LEN - udh.len();
        let data = &sms.msgdata[..sms.msgdata.len().min(room)];
        pdu.push(u8::try_from(udh.len() + data.len())?);
        pdu.extend(udh);
        pdu.extend(data);
    } else {
        let (header, offset) = if udh.is_empty() {
            (0, 0)
        } else {
            (septet::header_septets(udh.len()), septet::fill_bits(udh.len()))
        };
        let mut gsm = charset::utf8_to_gsm(&sms.text());
        if charset::gsm_truncate(&mut gsm, SMS_7BIT_MAX_LEN.saturating_sub(header)) {
            warn!("message to {} truncated to fit", sms.receiver);
        }
        pdu.push(u8::try_from(header + gsm.len())?);
        pdu.extend(udh);
        pdu.extend(septet::pack(&gsm, offset));
    }

    Ok(hex::encode_upper(pdu))
}

/// Decodes a hex TPDU received from the modem.
pub fn decode(pdu: &str, now: DateTime<Utc>) -> anyhow::Result<Decoded> {
    let pdu = hex::decode(pdu.trim()).context("PDU is not hex")?;
    let first = *pdu.first().ok_or_else(|| anyhow!("empty PDU"))?;
    match first & 0x03 {
        MTI_DELIVER => decode_deliver(&pdu, now).map(Decoded::Deliver),
        MTI_STATUS_REPORT => decode_report(&pdu),
        other => bail!("unsupported PDU type {other}"),
    }
}

struct Reader<'a> {
    pdu: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> anyhow::Result<u8> {
        let b = self
            .pdu
            .get(self.pos)
            .copied()
            .ok_or_else(|| anyhow!("PDU truncated at octet {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn rest(&self) -> &[u8] {
        self.pdu.get(self.pos..).unwrap_or_default()
    }

    /// Address in semi-octets as used for originator and recipient.
    fn address(&mut self) -> anyhow::Result<String> {
        let len = usize::from(self.byte()?);
        if len > 20 {
            bail!("address of {len} digits");
        }
        let ntype = self.byte()?;
        let octets = self
            .pdu
            .get(self.pos..self.pos + len.div_ceil(2))
            .ok_or_else(|| anyhow!("PDU truncated in address"))?;
        self.pos += octets.len();

        if ntype & 0xD0 == 0xD0 {
            let septets = ((len * 4).saturating_sub(7) / 7 + 1).min(len);
            let address = charset::gsm_to_utf8(&septet::unpack(octets, 0, septets));
            debug!("Alphanumeric address <{address}>");
            return Ok(address);
        }
        let international = ntype & 0x90 == 0x90;
        let mut address = String::from(if international { "+" } else { "" });
        for (i, b) in octets.iter().enumerate() {
            address.push(char::from(b'0' + (b & 0x0F)));
            if i * 2 + 1 < len {
                address.push(char::from(b'0' + (b >> 4)));
            }
        }
        debug!(
            "Numeric address {}<{address}>",
            if international { "(international) " } else { "" }
        );
        Ok(address)
    }
}

fn swap_nibbles(b: u8) -> u32 {
    u32::from(b & 0x0F) * 10 + u32::from(b >> 4)
}

/// Service centre time stamp, normalised to UTC.
fn timestamp(fields: [u8; 7], now: DateTime<Utc>) -> DateTime<Utc> {
    let [year, month, day, hour, minute, second, tz] = fields;
    let year = swap_nibbles(year);
    let year = if year < 70 { 2000 + year } else { 1900 + year };
    let quarters = i64::from(swap_nibbles(tz & 0xF7));
    let offset = if tz & 0x08 == 0 { quarters } else { -quarters };

    let local = i32::try_from(year).ok().and_then(|year| {
        NaiveDate::from_ymd_opt(year, swap_nibbles(month), swap_nibbles(day))?.and_hms_opt(
            swap_nibbles(hour),
            swap_nibbles(minute),
            swap_nibbles(second),
        )
    });
    let Some(local) = local else {
        warn!("invalid service centre time stamp {fields:02X?}, using current time");
        return now;
    };
    (local - Duration::minutes(offset * 15)).and_utc()
}

fn decode_deliver(pdu: &[u8], now: DateTime<Utc>) -> anyhow::Result<Sms> {
    let mut r = Reader { pdu, pos: 0 };
    let first = r.byte()?;
    let mut udhi = first & 0x40 != 0;
    let origin = r.address()?;
    let pid = r.byte()?;
    let dcs = r.byte()?;
    let mut scts = [0u8; 7];
    for b in &mut scts {
        *b = r.byte()?;
    }
    let time = timestamp(scts, now);

    let mut len = usize::from(r.byte()?);
    debug!("User data length read as ({len})");

    let mut udh = Vec::new();
    if udhi && len > 0 {
        let udhl = usize::from(r.byte()?);
        if udhl + 1 > len {
            bail!("UDH length {udhl} exceeds user data length {len}");
        }
        let header = r
            .pdu
            .get(r.pos - 1..r.pos + udhl)
            .ok_or_else(|| anyhow!("PDU truncated in UDH"))?;
        udh = header.to_vec();
        r.pos += udhl;
        len -= udhl + 1;
    } else if len == 0 {
        udhi = false;
    }
    debug!("Udh decoding done len={len} udhi={udhi} udh={}", hex::encode(&udh));

    let mut sms = Sms::new(SmsType::Mo, origin, "", Vec::new());
    if let Err(e) = dcs_to_fields(&mut sms, dcs) {
        error!("Invalid DCS (0x{dcs:02x}): {e}");
        dcs_to_fields(&mut sms, 0)?;
    }
    sms.pid = Some(pid);

    let data = r.rest();
    sms.msgdata = if sms.coding == Some(Coding::SevenBit) {
        let (offset, septets) = if udhi {
            let octets = udh.len();
            (
                septet::fill_bits(octets),
                (len + octets).saturating_sub(septet::header_septets(octets)),
            )
        } else {
            (0, len)
        };
        charset::gsm_to_utf8(&septet::unpack(data, offset, septets)).into_bytes()
    } else {
        data[..len.min(data.len())].to_vec()
    };
    sms.udhdata = udh;
    sms.time = time;
    Ok(sms)
}

fn decode_report(pdu: &[u8]) -> anyhow::Result<Decoded> {
    let mut r = Reader { pdu, pos: 1 };
    let reference = r.byte()?;
    debug!("got STATUS-REPORT for message <{reference}>");
    let receiver = r.address()?;
    // service centre time stamp and discharge time
    r.pos += 14;
    let status = r
        .byte()
        .context("STATUS-REPORT pdu too short to have TP-Status field")?;
    let status = match status & 0xE0 {
        0x00 => DlrMask::SUCCESS,
        0x20 => DlrMask::BUFFERED,
        _ => DlrMask::FAIL,
    };
    Ok(Decoded::StatusReport {
        reference,
        receiver,
        status,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    const HELLO: &str = "040B912120550521F300004230512103540005C82293F904";

    fn hello() -> String {
        HELLO.to_owned()
    }

    #[test]
    fn extract_cmt() {
        let buffer = format!("+CMT: ,24\n07919471000000F0{}", hello());
        let extracted = pdu_extract(&buffer, false, false).unwrap();
        assert_eq!(extracted.pdu, hello());
        assert_eq!(extracted.smsc_number.as_deref(), Some("+49170000000"));

        assert_eq!(pdu_extract(&format!("+CMT: 24\n{}", hello()), true, false), None);
        let broken = pdu_extract(&format!("+CMT: 24\n{}", hello()), true, true).unwrap();
        assert_eq!(broken.pdu, hello());
    }

    #[test]
    fn extract_cmgr_and_short_buffers() {
        let buffer = format!("+CMGR: 1,,24\n00{}", hello());
        let extracted = pdu_extract(&buffer, false, false).unwrap();
        assert_eq!(extracted.pdu, hello());
        assert_eq!(extracted.smsc_number.as_deref(), Some(""));

        assert_eq!(pdu_extract("+CMT: ,24\n00040B91", false, false), None);
        assert_eq!(pdu_extract("+CMT: ,0\n00", false, false), None);
        assert_eq!(pdu_extract("OK", false, false), None);
    }

    #[test]
    fn decode_hello() {
        let now = Utc::now();
        let Decoded::Deliver(sms) = decode(&hello(), now).unwrap() else {
            panic!("not a deliver");
        };
        assert_eq!(sms.sender, "+12025550123");
        assert_eq!(sms.coding, Some(Coding::SevenBit));
        assert_eq!(sms.msgdata, b"HELLO");
        assert!(sms.udhdata.is_empty());
        assert_eq!(
            sms.time,
            Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 45).unwrap()
        );
    }

    #[test]
    fn decode_with_udh() {
        let pdu = "440B912120550521F300004230512103548009050003AB0201D069";
        let Decoded::Deliver(sms) = decode(pdu, Utc::now()).unwrap() else {
            panic!("not a deliver");
        };
        assert_eq!(sms.udhdata, [0x05, 0x00, 0x03, 0xAB, 0x02, 0x01]);
        assert_eq!(sms.msgdata, b"hi");
        // +8 quarters
        assert_eq!(
            sms.time,
            Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap()
        );
    }

    #[test]
    fn malformed_deliver_is_rejected() {
        // UDH longer than the user data
        assert!(decode("440B912120550521F300004230512103540002070003AB0201", Utc::now()).is_err());
        // truncated before the time stamp
        assert!(decode("040B912120550521F30000", Utc::now()).is_err());
        assert!(decode("zz", Utc::now()).is_err());
    }

    #[test]
    fn invalid_time_stamp_uses_now() {
        let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let pdu = "040B912120550521F300004299992103540000";
        let Decoded::Deliver(sms) = decode(pdu, now).unwrap() else {
            panic!("not a deliver");
        };
        assert_eq!(sms.time, now);
        assert!(sms.msgdata.is_empty());
    }

    #[test]
    fn status_report_buckets() {
        let base = "062A0B912120550521F34230512103540042305121035400";
        for (status, expected) in [
            ("00", DlrMask::SUCCESS),
            ("20", DlrMask::BUFFERED),
            ("40", DlrMask::FAIL),
            ("60", DlrMask::FAIL),
            ("E0", DlrMask::FAIL),
        ] {
            let pdu = format!("{base}{status}");
            assert_eq!(
                decode(&pdu, Utc::now()).unwrap(),
                Decoded::StatusReport {
                    reference: 42,
                    receiver: "+12025550123".to_owned(),
                    status: expected,
                }
            );
        }
        assert!(decode(base, Utc::now()).is_err());
        assert_eq!(Decoded::status_text(DlrMask::BUFFERED), "Buffered");
    }

    #[test]
    fn address_fields() {
        assert_eq!(
            format_address_field("+491761234567").unwrap(),
            [0x0C, 0x91, 0x94, 0x71, 0x16, 0x32, 0x54, 0x76]
        );
        assert_eq!(
            format_address_field("0049123").unwrap(),
            [0x05, 0x91, 0x94, 0x21, 0xF3]
        );
        assert_eq!(format_address_field("12345").unwrap(), [0x05, 0x81, 0x21, 0x43, 0xF5]);
        assert!(format_address_field("+49abc").is_err());
        assert_eq!(gsm2number(&[0x91, 0x94, 0x71, 0xF0]), "+49170");
        assert_eq!(gsm2number(&[0xA1, 0x21, 0x43]), "01234");
        assert_eq!(gsm2number(&[]), "");
    }

    #[test]
    fn international_address_round_trip() {
        for number in ["+1", "+12", "+12025550123", "+491761234567"] {
            let field = format_address_field(number).unwrap();
            let mut r = Reader {
                pdu: &field,
                pos: 0,
            };
            assert_eq!(r.address().unwrap(), number);
        }
    }

    #[test]
    fn alphanumeric_originator() {
        // "Test" packed, 7 semi-octets
        let mut pdu = vec![0x07, 0xD0];
        pdu.extend(septet::pack(b"Test", 0));
        let mut r = Reader { pdu: &pdu, pos: 0 };
        assert_eq!(r.address().unwrap(), "Test");
    }

    #[test]
    fn encode_plain_text() {
        let sms = Sms::mt("", "+491761234567", "hello");
        assert_eq!(
            encode(&sms, false, None, Utc::now()).unwrap(),
            "11000C919471163254760000A705E8329BFD06"
        );
    }

    #[test]
    fn encode_flags_and_validity() {
        let now = Utc::now();
        let mut sms = Sms::mt("", "12345", "hello");
        sms.dlr_mask = DlrMask::SUCCESS | DlrMask::FAIL;
        sms.rpi = Some(1);
        sms.validity = Some(now + Duration::minutes(60));
        let pdu = encode(&sms, false, Some(10), now).unwrap();
        assert!(pdu.starts_with("B10005812143F50000"), "{pdu}");
        // 60 minutes
        assert_eq!(&pdu[18..20], "0B");
        sms.validity = None;
        let pdu = encode(&sms, false, Some(10), now).unwrap();
        assert_eq!(&pdu[18..20], "0A");
    }

    #[test]
    fn encode_udh_and_binary() {
        let mut sms = Sms::mt("", "12345", "hi");
        sms.udhdata = vec![0x05, 0x00, 0x03, 0xAB, 0x02, 0x01];
        sms.coding = Some(Coding::SevenBit);
        let pdu = encode(&sms, false, None, Utc::now()).unwrap();
        assert!(pdu.starts_with("51"), "{pdu}");
        assert!(pdu.ends_with("A709050003AB0201D069"), "{pdu}");

        sms.coding = Some(Coding::EightBit);
        sms.msgdata = vec![0xAA; 200];
        let pdu = encode(&sms, false, None, Utc::now()).unwrap();
        let octets = hex::decode(pdu).unwrap();
        // UDL counts header and data in octets
        assert_eq!(octets[10], 140);
        assert_eq!(octets.len(), 11 + 140);
    }

    #[test]
    fn encode_rejects_bad_receiver() {
        assert!(encode(&Sms::mt("", "hello", "x"), false, None, Utc::now()).is_err());
    }

    #[test]
    fn validity_table() {
        assert_eq!(validity_period(-10), 0);
        assert_eq!(validity_period(5), 0);
        assert_eq!(validity_period(720), 143);
        assert_eq!(validity_period(730), 144);
        assert_eq!(validity_period(1440), 167);
        assert_eq!(validity_period(2000), 168);
        assert_eq!(validity_period(2880), 168);
        assert_eq!(validity_period(43200), 196);
        assert_eq!(validity_period(45000), 197);
        assert_eq!(validity_period(50400), 197);
        assert_eq!(validity_period(635_040), 255);
        assert_eq!(validity_period(1_000_000), 255);
    }
}
