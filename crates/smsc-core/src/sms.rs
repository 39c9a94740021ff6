use std::{borrow::Cow, fmt::Display};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::DlrMask;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SmsType {
    /// Mobile originated, received from the SMSC.
    Mo,
    MtReply,
    MtPush,
    /// Delivery report built from a status notification.
    ReportMo,
}

/// Data coding as carried in bits 3-2 of a general data coding scheme.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Coding {
    SevenBit = 0,
    EightBit = 1,
    Ucs2 = 2,
}
impl Coding {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::SevenBit),
            1 => Some(Self::EightBit),
            2 => Some(Self::Ucs2),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Self::EightBit | Self::Ucs2)
    }
}

/// Reason codes for `send_failed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    Temporarily,
    Rejected,
    Malformed,
    Shutdown,
}

/// One short message as it travels between the gateway core and a connector.
///
/// `msgdata` holds UTF-8 text for 7-bit messages and raw octets for 8-bit and
/// UCS-2 messages. `udhdata` includes the leading UDHL octet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sms {
    pub id: Uuid,
    pub sms_type: SmsType,
    pub sender: String,
    pub receiver: String,
    pub msgdata: Vec<u8>,
    pub udhdata: Vec<u8>,
    pub coding: Option<Coding>,
    pub mclass: Option<u8>,
    pub mwi: Option<u8>,
    pub compress: bool,
    /// `Some(true)` selects the `0xFX` data coding group.
    pub alt_dcs: Option<bool>,
    pub pid: Option<u8>,
    pub rpi: Option<u8>,
    pub dlr_mask: DlrMask,
    pub dlr_url: Option<String>,
    pub validity: Option<DateTime<Utc>>,
    pub deferred: Option<DateTime<Utc>>,
    pub priority: u8,
    pub time: DateTime<Utc>,
    pub smsc_id: Option<String>,
    pub smsc_number: Option<String>,
    pub service: Option<String>,
    pub boxc_id: Option<String>,
    pub binfo: Vec<u8>,
    pub foreign_id: Option<String>,
}

impl Sms {
    pub fn new(
        sms_type: SmsType,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        msgdata: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sms_type,
            sender: sender.into(),
            receiver: receiver.into(),
            msgdata: msgdata.into(),
            udhdata: Vec::new(),
            coding: None,
            mclass: None,
            mwi: None,
            compress: false,
            alt_dcs: None,
            pid: None,
            rpi: None,
            dlr_mask: DlrMask::default(),
            dlr_url: None,
            validity: None,
            deferred: None,
            priority: 0,
            time: Utc::now(),
            smsc_id: None,
            smsc_number: None,
            service: None,
            boxc_id: None,
            binfo: Vec::new(),
            foreign_id: None,
        }
    }

    /// Outbound push message with UTF-8 text.
    pub fn mt(sender: impl Into<String>, receiver: impl Into<String>, text: &str) -> Self {
        Self::new(SmsType::MtPush, sender, receiver, text.as_bytes())
    }

    /// Coding used on the wire: an unset coding means 8-bit when a UDH is
    /// present and 7-bit otherwise.
    #[must_use]
    pub fn effective_coding(&self) -> Coding {
        self.coding.unwrap_or(if self.udhdata.is_empty() {
            Coding::SevenBit
        } else {
            Coding::EightBit
        })
    }

    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.msgdata)
    }
}

impl Display for Sms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} -> {} [{}]: ",
            self.sms_type, self.sender, self.receiver, self.id
        )?;
        if self.effective_coding() == Coding::SevenBit {
            write!(f, "{}", self.text())
        } else {
            write!(f, "{}", hex::encode_upper(&self.msgdata))
        }
    }
}
