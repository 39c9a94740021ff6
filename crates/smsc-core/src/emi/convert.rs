//! Mapping between [`Sms`] and EMI operations.

use chrono::{DateTime, TimeZone, Utc};
use tracing::{error, info, warn};

use crate::{
    Coding, Dlr, DlrMask, EmiConfig, Sms, SmsType, charset,
    dcs::{dcs_to_fields, fields_to_dcs},
    emi::frame::{EmiMessage, e01, e50, e60},
    septet,
};

/// Validity and deferred delivery times, `DDMMYYHHmm` in UTC.
const EMI_TIME_FORMAT: &str = "%d%m%y%H%M";

const OTOA_ALPHANUMERIC: &str = "5039";
const OTOA_INTERNATIONAL: &str = "1139";

const MAX_ALPHANUMERIC_OADC: usize = 11;
const MAX_NUMERIC_OADC: usize = 22;
const MAX_ADC: usize = 16;
const MAX_SEPTETS: usize = 160;

const XSER_UDH: u8 = 0x01;
const XSER_DCS: u8 = 0x02;
const XSER_BILLING: u8 = 0x0C;
const XSER_SINGLE_SHOT: u8 = 0x0D;

/// Alert (operation 31) identifying us by username or own number.
///
/// `None` if neither is configured.
#[must_use]
pub fn alert(config: &EmiConfig, trn: u8) -> Option<EmiMessage> {
    let address = config
        .username
        .as_ref()
        .or(config.my_number.as_ref())
        .filter(|a| !a.is_empty())?;
    let mut msg = EmiMessage::operation(31, trn).ok()?;
    msg.set(0, address.as_str());
    msg.set(1, "0539");
    Some(msg)
}

/// Session management (operation 60) opening an authenticated session.
///
/// `None` without username and password.
#[must_use]
pub fn login(config: &EmiConfig) -> Option<EmiMessage> {
    let (Some(username), Some(password)) = (&config.username, &config.password) else {
        return None;
    };
    let mut msg = EmiMessage::operation(60, 0).ok()?;
    msg.set(e60::OADC, username.as_str());
    msg.set(e60::OTON, "6");
    msg.set(e60::ONPI, "5");
    msg.set(e60::STYP, "1");
    msg.set(e60::PWD, hex::encode_upper(password));
    msg.set(e60::VERS, "0100");
    Some(msg)
}

/// Packs an alphanumeric address: a length octet counting semi-octets, then
/// the GSM septets, hex encoded.
#[must_use]
pub fn pack_alphanumeric(gsm: &[u8]) -> String {
    let semi_octets = u8::try_from((gsm.len() * 7 + 3) / 4).unwrap_or(u8::MAX);
    let mut packed = vec![semi_octets];
    packed.extend(septet::pack(gsm, 0));
    hex::encode_upper(packed)
}

fn alphanumeric_oadc(sender: &str) -> String {
    let mut gsm = charset::utf8_to_gsm(sender);
    charset::gsm_truncate(&mut gsm, MAX_ALPHANUMERIC_OADC);
    pack_alphanumeric(&gsm)
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

fn xser(typ: u8, data: &[u8]) -> String {
    let mut tlv = vec![typ, u8::try_from(data.len()).unwrap_or(u8::MAX)];
    tlv.extend(data);
    hex::encode_upper(tlv)
}

/// Submit (operation 51) for `sms`.
///
/// Fails only if the operation cannot be built.
pub fn submit(name: &str, config: &EmiConfig, sms: &Sms, trn: u8) -> anyhow::Result<EmiMessage> {
    let mut msg = EmiMessage::operation(51, trn)?;

    let sender = &sms.sender;
    let oadc = if let Some(number) = sender.strip_prefix('+') {
        if all_digits(number) {
            msg.set(e50::OTOA, OTOA_INTERNATIONAL);
            number.chars().take(MAX_NUMERIC_OADC).collect()
        } else {
            msg.set(e50::OTOA, OTOA_ALPHANUMERIC);
            alphanumeric_oadc(sender)
        }
    } else if all_digits(sender) {
        sender.clone()
    } else {
        msg.set(e50::OTOA, OTOA_ALPHANUMERIC);
        alphanumeric_oadc(sender)
    };
    msg.set(e50::OADC, oadc);

    if let Some(pid) = sms.pid {
        msg.set(e50::RPID, format!("{pid:04}"));
    }
    match sms.rpi {
        Some(2) => msg.set(e50::RPI, "2"),
        Some(rpi) if rpi > 0 => msg.set(e50::RPI, "1"),
        _ => (),
    }

    let receiver = match sms.receiver.strip_prefix('+') {
        Some(number) => format!("00{number}"),
        None => sms.receiver.clone(),
    };
    msg.set(e50::ADC, receiver.chars().take(MAX_ADC).collect::<String>());

    let mut xsers = String::new();
    if !sms.udhdata.is_empty() {
        xsers.push_str(&xser(XSER_UDH, &sms.udhdata));
    }
    let dcs = fields_to_dcs(sms, sms.alt_dcs);
    if dcs != 0 && dcs != 4 {
        xsers.push_str(&xser(XSER_DCS, &[dcs]));
    }
    if !sms.binfo.is_empty() {
        xsers.push_str(&xser(XSER_BILLING, &sms.binfo));
    }
    msg.set(e50::XSER, xsers);

    if sms.effective_coding().is_binary() {
        msg.set(e50::MT, "4");
        msg.set(e50::MCLS, "1");
        msg.set(e50::NB, format!("{:04}", 8 * sms.msgdata.len()));
        msg.set(e50::MSG, hex::encode_upper(&sms.msgdata));
    } else {
        msg.set(e50::MT, "3");
        let mut gsm = charset::utf8_to_gsm(&sms.text());
        if config.alt_charset {
            charset::gsm_to_nrc_iso_21_german(&mut gsm);
        }
        if charset::gsm_truncate(&mut gsm, MAX_SEPTETS) {
            error!("EMI2[{name}]: Message to send is longer than {MAX_SEPTETS} gsm characters");
        }
        msg.set(e50::MSG, hex::encode_upper(gsm));
    }

    if let Some(validity) = sms.validity {
        msg.set(e50::VP, validity.format(EMI_TIME_FORMAT).to_string());
    }
    if let Some(deferred) = sms.deferred {
        msg.set(e50::DD, "1");
        msg.set(e50::DDT, deferred.format(EMI_TIME_FORMAT).to_string());
    }

    // reports are needed to clear the correlation entry, whatever the mask
    if sms.dlr_mask.is_enabled_device() {
        msg.set(e50::NRQ, "1");
        let nt = 3 + if sms.dlr_mask.intersects(DlrMask::BUFFERED) { 4 } else { 0 };
        msg.set(e50::NT, nt.to_string());
        if let Some(npid) = &config.notification_pid {
            msg.set(e50::NPID, npid.as_str());
        }
        if let Some(nadc) = &config.notification_addr {
            msg.set(e50::NADC, nadc.as_str());
        }
    }
    Ok(msg)
}

fn hex_field(name: &str, field: Option<&str>) -> Vec<u8> {
    let Some(field) = field else {
        return Vec::new();
    };
    hex::decode(field).unwrap_or_else(|_| {
        warn!("EMI2[{name}]: Couldn't decode message text");
        field.as_bytes().to_vec()
    })
}

fn gsm_text(config: &EmiConfig, mut gsm: Vec<u8>) -> Vec<u8> {
    if config.alt_charset {
        charset::nrc_iso_21_german_to_gsm(&mut gsm);
    }
    charset::gsm_to_utf8(&gsm).into_bytes()
}

fn message_type<'a>(name: &str, msg: &'a EmiMessage, index: usize) -> &'a str {
    msg.field(index).unwrap_or_else(|| {
        warn!("EMI2[{name}]: required field MT missing");
        "3"
    })
}

fn inbound(
    name: &str,
    config: &EmiConfig,
    smsc_id: &str,
    msg: &EmiMessage,
    (oadc, adc): (usize, usize),
    msgdata: Vec<u8>,
) -> Sms {
    let sender = msg.field(oadc).unwrap_or_else(|| {
        warn!("EMI2[{name}]: Empty sender field in received message");
        ""
    });
    let receiver = match config.my_number.as_deref().filter(|n| !n.is_empty()) {
        Some(number) => number,
        None => msg.field(adc).unwrap_or_else(|| {
            warn!("EMI2[{name}]: Empty receiver field in received message");
            ""
        }),
    };
    let mut sms = Sms::new(SmsType::Mo, sender, receiver, msgdata);
    sms.smsc_id = Some(smsc_id.to_owned());
    sms
}

/// Message carried by a call input (operation 01).
#[must_use]
pub fn call_input(name: &str, config: &EmiConfig, smsc_id: &str, msg: &EmiMessage) -> Sms {
    let amsg = hex_field(name, msg.field(e01::AMSG));
    let mt = message_type(name, msg, e01::MT);
    let msgdata = if mt.starts_with('3') {
        gsm_text(config, amsg)
    } else {
        error!("EMI2[{name}]: MT == {mt} isn't supported for operation type 01");
        Vec::new()
    };
    // no time stamp in operation 01, the message keeps its creation time
    inbound(name, config, smsc_id, msg, (e01::OADC, e01::ADC), msgdata)
}

/// Applies the XSER TLVs of a delivered message to `sms`.
fn apply_xser(name: &str, sms: &mut Sms, xser: &str) {
    let mut rest = xser;
    while !rest.is_empty() {
        let Some(Ok([typ, len])) = rest
            .get(..4)
            .map(|head| hex::decode(head).map(|h| [h[0], h[1]]))
        else {
            error!("EMI2[{name}]: Invalid XSer");
            return;
        };
        let end = (4 + 2 * usize::from(len)).min(rest.len());
        let value = rest.get(4..end).unwrap_or_default();
        match typ {
            XSER_UDH => match hex::decode(value) {
                Ok(udh) => sms.udhdata = udh,
                Err(_) => error!("EMI2[{name}]: Invalid UDH contents"),
            },
            XSER_DCS => {
                let dcs = value
                    .get(..2)
                    .and_then(|v| u8::from_str_radix(v, 16).ok())
                    .unwrap_or_default();
                if let Err(e) = dcs_to_fields(sms, dcs) {
                    error!("EMI2[{name}]: Invalid DCS received: {e}");
                    dcs_to_fields(sms, 0).ok();
                }
            }
            XSER_BILLING => match hex::decode(value) {
                Ok(binfo) => sms.binfo = binfo,
                Err(_) => {
                    error!("EMI2[{name}] Invalid XSer 0c billing identifier <{value}>");
                }
            },
            XSER_SINGLE_SHOT => {
                if value.get(..2).is_some_and(|v| v != "00") {
                    info!("EMI2[{name}]: Single shot indicator set.");
                }
            }
            _ => warn!("EMI2[{name}]: Unsupported EMI XSer field {typ}"),
        }
        rest = rest.get(end..).unwrap_or_default();
    }
}

/// Parses a `DDMMYYhhmmss` service centre time stamp.
#[must_use]
pub fn parse_scts(scts: &str) -> Option<DateTime<Utc>> {
    if scts.len() != 12 || !all_digits(scts) {
        return None;
    }
    let pair = |i: usize| scts.get(i..i + 2).and_then(|d| d.parse::<u32>().ok());
    let year = 2000 + i32::try_from(pair(4)?).ok()?;
    Utc.with_ymd_and_hms(year, pair(2)?, pair(0)?, pair(6)?, pair(8)?, pair(10)?)
        .single()
}

/// Message carried by a deliver short message (operation 52).
#[must_use]
pub fn deliver(name: &str, config: &EmiConfig, smsc_id: &str, msg: &EmiMessage) -> Sms {
    let body = hex_field(name, msg.field(e50::MSG));
    let mut sms = inbound(name, config, smsc_id, msg, (e50::OADC, e50::ADC), Vec::new());
    if let Some(xser) = msg.field(e50::XSER) {
        apply_xser(name, &mut sms, xser);
    }

    let mt = message_type(name, msg, e50::MT);
    sms.msgdata = if mt.starts_with('3') {
        gsm_text(config, body)
    } else if mt.starts_with('4') {
        if sms.coding.is_none() {
            sms.coding = Some(Coding::EightBit);
        }
        body
    } else {
        error!("EMI2[{name}]: MT == {mt} isn't supported yet");
        Vec::new()
    };

    match msg.field(e50::SCTS) {
        None => warn!("EMI2[{name}]: Received EMI message doesn't have required timestamp"),
        Some(scts) if scts.len() != 12 => warn!(
            "EMI2[{name}]: EMI SCTS field must have length 12, now {}",
            scts.len()
        ),
        Some(scts) => match parse_scts(scts) {
            Some(time) => sms.time = time,
            None => error!("EMI2[{name}]: EMI delivery time stamp looks malformed"),
        },
    }
    sms
}

/// Delivery report for a delivery notification (operation 53), if one was
/// requested for the message it refers to.
#[must_use]
pub fn notification(
    name: &str,
    config: &EmiConfig,
    smsc_id: &str,
    dlr: &Dlr,
    msg: &EmiMessage,
) -> Option<Sms> {
    let typ = match msg.field(e50::DST) {
        Some("0") => DlrMask::SUCCESS,
        Some("1") => DlrMask::BUFFERED,
        Some("2") => DlrMask::FAIL,
        other => {
            warn!("EMI2[{name}]: unknown delivery status {other:?}");
            return None;
        }
    };
    let mut report = dlr.find(
        smsc_id,
        msg.field(e50::SCTS).unwrap_or_default(),
        msg.field(e50::OADC),
        typ,
        true,
    )?;
    let text = match msg.field(e50::MSG) {
        Some(_) => hex_field(name, msg.field(e50::MSG)),
        None => b"Delivery Report without text".to_vec(),
    };
    report.msgdata = if msg.field(e50::MT).is_some_and(|mt| mt.starts_with('3')) {
        gsm_text(config, text)
    } else {
        text
    };
    Some(report)
}
