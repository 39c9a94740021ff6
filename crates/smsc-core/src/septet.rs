//! GSM 7-bit septet packing.
//!
//! Septets are laid out as a little-endian bit stream: septet `i` occupies
//! bits `offset + 7 * i ..` of the output, least significant bit first.

/// Padding bits needed after a user data header of `udh_octets` octets
/// (including the length octet) so the first septet starts on a septet
/// boundary.
#[must_use]
pub fn fill_bits(udh_octets: usize) -> usize {
    (7 - (udh_octets * 8) % 7) % 7
}

/// Number of septets a header of `udh_octets` octets occupies, padding
/// included.
#[must_use]
pub fn header_septets(udh_octets: usize) -> usize {
    (udh_octets * 8 + 6) / 7
}

#[must_use]
pub fn pack(septets: &[u8], offset: usize) -> Vec<u8> {
    let mut out = vec![0u8; (septets.len() * 7 + offset).div_ceil(8)];
    for (i, septet) in septets.iter().enumerate() {
        let bit = offset + i * 7;
        let [lo, hi] = (u16::from(septet & 0x7F) << (bit % 8)).to_le_bytes();
        out[bit / 8] |= lo;
        if hi != 0 {
            out[bit / 8 + 1] |= hi;
        }
    }
    out
}

/// Unpacks up to `count` septets starting `offset` bits into `octets`.
///
/// Stops early if the input runs out.
#[must_use]
pub fn unpack(octets: &[u8], offset: usize, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let bit = offset + i * 7;
        let Some(&lo) = octets.get(bit / 8) else {
            break;
        };
        let hi = octets.get(bit / 8 + 1).copied().unwrap_or(0);
        let value = u16::from_le_bytes([lo, hi]) >> (bit % 8);
        out.push(value.to_le_bytes()[0] & 0x7F);
    }
    out
}
