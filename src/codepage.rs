//! OEM code page translation.
//!
//! Short directory entries store their 11 name bytes in the OEM code page
//! the volume was written with; long entries always store UCS-2. The engine
//! talks UTF-8 (`&str`) at its API and goes through an [`OemCodepage`] for
//! every short-name byte.
//!
//! One problem that is generally true of most OEM code pages is that they
//! map lower to upper case extended characters in a non-unique fashion, so
//! upper-casing happens on the OEM side through a capitalization table, not
//! through Unicode.
//!
//! Only CP437 is built in. Single-byte tables for other code pages, and the
//! full conversion tables for the DBCS pages (CP932/936/949/950), are
//! supplied by the integrator through the same trait; the lead-byte
//! intervals of the DBCS pages are provided here so such implementations
//! only need the mapping tables.

/// A configured OEM code page.
pub trait OemCodepage: Send + Sync {
    /// Numeric code page identifier (437, 932, ...).
    fn id(&self) -> u16;

    /// Translate one OEM byte to Unicode. `None` when the byte is not
    /// defined in the page (callers substitute `_`).
    fn oem_to_unicode(&self, byte: u8) -> Option<char>;

    /// Translate a Unicode scalar to its OEM byte. `None` marks the
    /// character unstorable in a short name (forces a long-name form).
    fn unicode_to_oem(&self, ch: char) -> Option<u8>;

    /// Whether the byte opens a two-byte sequence in this page.
    fn is_dbcs_lead(&self, _byte: u8) -> bool {
        false
    }

    /// Capitalize one OEM byte.
    fn oem_upper(&self, byte: u8) -> u8;
}

/// Upper-case folding for a UCS-2 unit, used when comparing long names.
/// Surrogate halves pass through untouched.
pub fn ucs2_upper(unit: u16) -> u16 {
    match char::from_u32(unit as u32) {
        Some(ch) => {
            let mut it = ch.to_uppercase();
            let up = it.next().unwrap_or(ch);
            // Multi-char expansions (ß -> SS) do not fit one unit; keep the
            // original so comparison stays symmetric.
            if it.next().is_some() || (up as u32) > 0xFFFF {
                unit
            } else {
                up as u16
            }
        }
        None => unit,
    }
}

/// CP437, the default OEM code page (U.S.).
pub struct Cp437;

/// Unicode values of CP437 bytes 0x80..=0xFF.
#[rustfmt::skip]
const CP437_TO_UNICODE: [u16; 128] = [
    0x00C7, 0x00FC, 0x00E9, 0x00E2, 0x00E4, 0x00E0, 0x00E5, 0x00E7,
    0x00EA, 0x00EB, 0x00E8, 0x00EF, 0x00EE, 0x00EC, 0x00C4, 0x00C5,
    0x00C9, 0x00E6, 0x00C6, 0x00F4, 0x00F6, 0x00F2, 0x00FB, 0x00F9,
    0x00FF, 0x00D6, 0x00DC, 0x00A2, 0x00A3, 0x00A5, 0x20A7, 0x0192,
    0x00E1, 0x00ED, 0x00F3, 0x00FA, 0x00F1, 0x00D1, 0x00AA, 0x00BA,
    0x00BF, 0x2310, 0x00AC, 0x00BD, 0x00BC, 0x00A1, 0x00AB, 0x00BB,
    0x2591, 0x2592, 0x2593, 0x2502, 0x2524, 0x2561, 0x2562, 0x2556,
    0x2555, 0x2563, 0x2551, 0x2557, 0x255D, 0x255C, 0x255B, 0x2510,
    0x2514, 0x2534, 0x252C, 0x251C, 0x2500, 0x253C, 0x255E, 0x255F,
    0x255A, 0x2554, 0x2569, 0x2566, 0x2560, 0x2550, 0x256C, 0x2567,
    0x2568, 0x2564, 0x2565, 0x2559, 0x2558, 0x2552, 0x2553, 0x256B,
    0x256A, 0x2518, 0x250C, 0x2588, 0x2584, 0x258C, 0x2590, 0x2580,
    0x03B1, 0x00DF, 0x0393, 0x03C0, 0x03A3, 0x03C3, 0x00B5, 0x03C4,
    0x03A6, 0x0398, 0x03A9, 0x03B4, 0x221E, 0x03C6, 0x03B5, 0x2229,
    0x2261, 0x00B1, 0x2265, 0x2264, 0x2320, 0x2321, 0x00F7, 0x2248,
    0x00B0, 0x2219, 0x00B7, 0x221A, 0x207F, 0x00B2, 0x25A0, 0x00A0,
];

/// CP437 capitalization table for bytes 0x80..=0xFF. Bytes whose upper-case
/// form has no CP437 encoding stay as they are.
#[rustfmt::skip]
const CP437_UPPER: [u8; 128] = [
    0x80, 0x9A, 0x45, 0x41, 0x8E, 0x41, 0x8F, 0x80,
    0x45, 0x45, 0x45, 0x49, 0x49, 0x49, 0x8E, 0x8F,
    0x90, 0x92, 0x92, 0x4F, 0x99, 0x4F, 0x55, 0x55,
    0x59, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F,
    0x41, 0x49, 0x4F, 0x55, 0xA5, 0xA5, 0xA6, 0xA7,
    0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF,
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7,
    0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF,
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7,
    0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF,
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7,
    0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF,
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7,
    0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF,
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7,
    0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

impl OemCodepage for Cp437 {
    fn id(&self) -> u16 {
        437
    }

    fn oem_to_unicode(&self, byte: u8) -> Option<char> {
        if byte < 0x80 {
            Some(byte as char)
        } else {
            char::from_u32(CP437_TO_UNICODE[(byte - 0x80) as usize] as u32)
        }
    }

    fn unicode_to_oem(&self, ch: char) -> Option<u8> {
        let code = ch as u32;
        if code < 0x80 {
            return Some(code as u8);
        }
        if code > 0xFFFF {
            return None;
        }
        CP437_TO_UNICODE
            .iter()
            .position(|&u| u as u32 == code)
            .map(|i| (i + 0x80) as u8)
    }

    fn oem_upper(&self, byte: u8) -> u8 {
        if byte < 0x80 {
            byte.to_ascii_uppercase()
        } else {
            CP437_UPPER[(byte - 0x80) as usize]
        }
    }
}

/// DBCS lead-byte intervals of the CJK code pages, for integrator-supplied
/// implementations of [`OemCodepage::is_dbcs_lead`].
pub fn dbcs_lead_ranges(codepage: u16) -> &'static [(u8, u8)] {
    match codepage {
        932 => &[(0x81, 0x9F), (0xE0, 0xFC)],
        936 | 949 | 950 => &[(0x81, 0xFE)],
        _ => &[],
    }
}
