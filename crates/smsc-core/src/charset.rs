//! GSM 03.38 default alphabet conversion.

use tracing::warn;

pub const ESC: u8 = 0x1B;

#[rustfmt::skip]
const GSM_TO_UNICODE: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '?', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

const GSM_ESCAPES: [(u8, char); 10] = [
    (10, '\x0C'),
    (20, '^'),
    (40, '{'),
    (41, '}'),
    (47, '\\'),
    (60, '['),
    (61, '~'),
    (62, ']'),
    (64, '|'),
    (b'e', '€'),
];

fn escape_to_char(code: u8) -> Option<char> {
    GSM_ESCAPES.iter().find(|(c, _)| *c == code).map(|(_, ch)| *ch)
}

fn char_to_gsm(ch: char, out: &mut Vec<u8>) {
    if let Some(code) = (0u8..128)
        .filter(|&c| c != ESC)
        .find(|&c| GSM_TO_UNICODE[usize::from(c)] == ch)
    {
        out.push(code);
    } else if let Some((code, _)) = GSM_ESCAPES.iter().find(|(_, c)| *c == ch) {
        out.extend([ESC, *code]);
    } else {
        out.push(b'?');
    }
}

/// Decodes unpacked GSM default alphabet octets into a UTF-8 string.
///
/// Octets above 127 are dropped. An unknown escape yields `?` and the octet
/// after the escape is decoded on its own.
#[must_use]
pub fn gsm_to_utf8(gsm: &[u8]) -> String {
    let mut out = String::with_capacity(gsm.len());
    let mut i = 0;
    while i < gsm.len() {
        let code = gsm[i];
        i += 1;
        if code > 127 {
            warn!("Ignoring non-GSM octet 0x{code:02X}");
            continue;
        }
        if code == ESC {
            match gsm.get(i).copied().and_then(escape_to_char) {
                Some(ch) => {
                    out.push(ch);
                    i += 1;
                }
                None => out.push('?'),
            }
            continue;
        }
        out.push(GSM_TO_UNICODE[usize::from(code)]);
    }
    out
}

/// Encodes UTF-8 text as unpacked GSM default alphabet octets.
///
/// Characters outside the alphabet and its extension table become `?`.
#[must_use]
pub fn utf8_to_gsm(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        char_to_gsm(ch, &mut out);
    }
    out
}

/// Truncates GSM octets to `max`, never leaving a dangling escape.
///
/// Returns `true` when anything was cut.
pub fn gsm_truncate(gsm: &mut Vec<u8>, max: usize) -> bool {
    if gsm.len() <= max {
        return false;
    }
    gsm.truncate(max);
    if gsm.last() == Some(&ESC) {
        gsm.pop();
    }
    true
}

/// Maps GSM octets onto the German national replacement set (ISO 21).
pub fn gsm_to_nrc_iso_21_german(gsm: &mut [u8]) {
    for b in gsm {
        *b = match *b {
            0x5E => 0x5D,
            0x7E => 0x7D,
            0x1E => 0x7E,
            0x5F => 0x5E,
            other => other,
        };
    }
}

pub fn nrc_iso_21_german_to_gsm(nrc: &mut [u8]) {
    for b in nrc {
        *b = match *b {
            0x5D => 0x5E,
            0x7D => 0x7E,
            0x7E => 0x1E,
            0x5E => 0x5F,
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_and_extension_table() {
        let gsm = utf8_to_gsm("Hi@€[x]");
        assert_eq!(gsm, [b'H', b'i', 0x00, ESC, b'e', ESC, 60, b'x', ESC, 62]);
        assert_eq!(gsm_to_utf8(&gsm), "Hi@€[x]");
    }

    #[test]
    fn unknown_characters() {
        assert_eq!(utf8_to_gsm("a\u{4e2d}b"), b"a?b");
        assert_eq!(utf8_to_gsm("?"), [0x3F]);
        assert_eq!(gsm_to_utf8(&[ESC, b'A']), "?A");
        assert_eq!(gsm_to_utf8(&[b'A', ESC]), "A?");
        assert_eq!(gsm_to_utf8(&[b'A', 0x80, b'B']), "AB");
    }

    #[test]
    fn national_letters() {
        let text = "ÄÖÜäöüß§¿¡Δ";
        assert_eq!(gsm_to_utf8(&utf8_to_gsm(text)), text);
        assert_eq!(utf8_to_gsm("$"), [0x02]);
        assert_eq!(gsm_to_utf8(&[0x24]), "¤");
    }

    #[test]
    fn truncate_drops_dangling_escape() {
        let mut gsm = utf8_to_gsm("abc€");
        assert!(!gsm_truncate(&mut gsm, 5));
        assert!(gsm_truncate(&mut gsm, 4));
        assert_eq!(gsm, b"abc");
    }

    #[test]
    fn german_nrc() {
        let mut gsm = utf8_to_gsm("ÜüßÄ§");
        let original = gsm.clone();
        gsm_to_nrc_iso_21_german(&mut gsm);
        assert_eq!(gsm, [0x5D, 0x7D, 0x7E, 0x5B, 0x5E]);
        nrc_iso_21_german_to_gsm(&mut gsm);
        assert_eq!(gsm, original);
    }
}
