//! Column collations and their 8-bit character encodings.
//!
//! Non-Unicode character columns (`CHAR`, `VARCHAR`) carry bytes in the code
//! page implied by the column's collation. The collation's locale ID picks
//! the code page; SQL Server 2019 UTF-8 collations set a flag bit instead.

use bytes::Buf;
use encoding_rs::Encoding;

use crate::codec::read_bytes;
use crate::error::ProtocolError;

/// Flag bit marking a UTF-8 collation in the collation info field.
pub const COLLATION_FLAG_UTF8: u32 = 0x0800_0000;

/// Mask extracting the locale ID from the collation info field.
pub const LCID_MASK: u32 = 0x000F_FFFF;

/// Wire size of a collation.
pub const COLLATION_SIZE: usize = 5;

/// SQL Server collation as sent in column metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collation {
    /// Locale ID plus comparison flags and version bits.
    pub info: u32,
    /// SQL sort order ID.
    pub sort_id: u8,
}

impl Collation {
    /// Decode the 5-byte collation structure.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let mut raw = read_bytes(src, COLLATION_SIZE)?;
        Ok(Self {
            info: raw.get_u32_le(),
            sort_id: raw.get_u8(),
        })
    }

    /// Locale ID portion of the collation.
    #[must_use]
    pub const fn lcid(&self) -> u32 {
        self.info & LCID_MASK
    }

    /// Whether character data under this collation is already UTF-8.
    #[must_use]
    pub const fn is_utf8(&self) -> bool {
        self.info & COLLATION_FLAG_UTF8 != 0
    }

    /// Encoding for 8-bit character data under this collation.
    ///
    /// Unknown locales fall back to Windows-1252.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        if self.is_utf8() {
            return encoding_rs::UTF_8;
        }
        encoding_for_lcid(self.lcid()).unwrap_or(encoding_rs::WINDOWS_1252)
    }
}

/// Map a locale ID to its Windows code page encoding.
#[must_use]
pub fn encoding_for_lcid(lcid: u32) -> Option<&'static Encoding> {
    let encoding = match lcid & 0xFFFF {
        0x0411 => encoding_rs::SHIFT_JIS,
        0x0804 | 0x1004 => encoding_rs::GB18030,
        0x0404 | 0x0C04 | 0x1404 => encoding_rs::BIG5,
        0x0412 => encoding_rs::EUC_KR,
        0x041E => encoding_rs::WINDOWS_874,
        0x042A => encoding_rs::WINDOWS_1258,

        // Central European
        0x0405 | 0x0415 | 0x040E | 0x041A | 0x081A | 0x141A | 0x101A | 0x041B | 0x0424 | 0x0418
        | 0x041C => encoding_rs::WINDOWS_1250,

        // Cyrillic
        0x0419 | 0x0422 | 0x0423 | 0x0402 | 0x042F | 0x0C1A | 0x201A | 0x0440 | 0x0843 | 0x0444
        | 0x0450 | 0x0485 => encoding_rs::WINDOWS_1251,

        0x0408 => encoding_rs::WINDOWS_1253,
        0x041F | 0x042C => encoding_rs::WINDOWS_1254,
        0x040D => encoding_rs::WINDOWS_1255,

        // Arabic script
        0x0401 | 0x0801 | 0x0C01 | 0x1001 | 0x1401 | 0x1801 | 0x1C01 | 0x2001 | 0x2401 | 0x2801
        | 0x2C01 | 0x3001 | 0x3401 | 0x3801 | 0x3C01 | 0x4001 | 0x0429 | 0x0420 | 0x048C
        | 0x0463 => encoding_rs::WINDOWS_1256,

        0x0425..=0x0427 => encoding_rs::WINDOWS_1257,

        // Western European
        0x0409 | 0x0809 | 0x0C09 | 0x1009 | 0x1409 | 0x1809 | 0x040C | 0x080C | 0x0C0C | 0x100C
        | 0x140C | 0x0407 | 0x0807 | 0x0C07 | 0x1007 | 0x1407 | 0x040A | 0x080A | 0x0C0A
        | 0x0410 | 0x0810 | 0x0816 | 0x0416 | 0x0413 | 0x0813 | 0x0406 | 0x0414 | 0x0814
        | 0x041D | 0x081D | 0x040B | 0x040F | 0x0403 | 0x0456 | 0x042D | 0x0436 | 0x0421
        | 0x043E | 0x0441 => encoding_rs::WINDOWS_1252,

        _ => return None,
    };
    Some(encoding)
}
