//! GSM 03.38 data coding scheme mapping.

use anyhow::bail;

use crate::{Coding, Sms};

/// Builds the data coding scheme octet for `sms`.
///
/// `mode` selects the `0xFX` group when `Some(true)`; UCS-2 and compressed
/// messages always fall back to the general group.
#[must_use]
pub fn fields_to_dcs(sms: &Sms, mode: Option<bool>) -> u8 {
    let coding = sms.effective_coding();

    if let Some(mwi) = sms.mwi {
        if mwi & 0x04 != 0 {
            // inactive
            return (mwi & 0x03) | 0xC0;
        }
        let dcs = (mwi & 0x03) | 0x08;
        return if sms.msgdata.is_empty() {
            dcs | 0xC0
        } else if coding == Coding::SevenBit {
            dcs | 0xD0
        } else {
            dcs | 0xE0
        };
    }

    if mode != Some(true) || coding == Coding::Ucs2 || sms.compress {
        let mut dcs = 0;
        if sms.compress {
            dcs |= 0x20;
        }
        if let Some(mclass) = sms.mclass {
            dcs |= 0x10 | (mclass & 0x03);
        }
        dcs | ((coding as u8) << 2)
    } else {
        0xF0 | ((coding as u8) << 2) | sms.mclass.map_or(1, |c| c & 0x03)
    }
}

/// Applies a received data coding scheme octet to `sms`.
///
/// The reserved alphabet `11` of the general group reads as the default
/// alphabet. Fails for the reserved groups `0x40..=0xBF`; callers log and
/// decode with `0`.
pub fn dcs_to_fields(sms: &mut Sms, dcs: u8) -> anyhow::Result<()> {
    if dcs & 0xF0 == 0xF0 {
        sms.coding = Some(if dcs & 0x04 == 0 {
            Coding::SevenBit
        } else {
            Coding::EightBit
        });
        sms.mclass = Some(dcs & 0x03);
        sms.alt_dcs = Some(true);
    } else if dcs & 0xC0 == 0x00 {
        let coding = Coding::from_bits((dcs & 0x0C) >> 2).unwrap_or(Coding::SevenBit);
        sms.alt_dcs = Some(false);
        sms.compress = dcs & 0x20 != 0;
        sms.mclass = (dcs & 0x10 != 0).then_some(dcs & 0x03);
        sms.coding = Some(coding);
    } else if dcs & 0xC0 == 0xC0 {
        sms.alt_dcs = Some(false);
        sms.coding = Some(if dcs & 0x30 == 0x30 {
            Coding::Ucs2
        } else {
            Coding::SevenBit
        });
        let mut mwi = dcs;
        if mwi & 0x08 == 0 {
            mwi |= 0x04;
        }
        sms.mwi = Some(mwi & 0x07);
    } else {
        bail!("unsupported DCS 0x{dcs:02X}");
    }
    Ok(())
}
