//! LOGIN7 message construction.
//!
//! A LOGIN7 payload is a 94-byte fixed block followed by a variable data
//! section. Strings in the data section are UTF-16LE and are located by
//! (offset, length-in-characters) pairs in the fixed block. The password is
//! obfuscated, not encrypted: only TLS protects it on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{utf16_byte_len, write_utf16_string};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// Size of the fixed portion of a LOGIN7 payload.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags::bitflags! {
    /// OptionFlags1.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags1: u8 {
        /// Warn when the initial database change fails.
        const USE_DB = 0x20;
        /// Failing to switch to the initial database is fatal.
        const INIT_DB_FATAL = 0x40;
        /// Warn on language change.
        const SET_LANG = 0x80;
    }
}

bitflags::bitflags! {
    /// OptionFlags2.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags2: u8 {
        /// Failing to set the initial language is fatal.
        const INIT_LANG_FATAL = 0x01;
        /// Client is an ODBC driver.
        const ODBC = 0x02;
        /// Integrated security.
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags::bitflags! {
    /// TypeFlags.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags::bitflags! {
    /// OptionFlags3.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OptionFlags3: u8 {
        /// Server may send unknown collations.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
    }
}

/// LOGIN7 message builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login7 {
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// OptionFlags1.
    pub option_flags1: OptionFlags1,
    /// OptionFlags2.
    pub option_flags2: OptionFlags2,
    /// TypeFlags.
    pub type_flags: TypeFlags,
    /// OptionFlags3.
    pub option_flags3: OptionFlags3,
    /// Client time zone offset in minutes.
    pub client_timezone: i32,
    /// Client locale ID.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_prog_version: 0,
            client_pid: std::process::id(),
            option_flags1: OptionFlags1::USE_DB | OptionFlags1::INIT_DB_FATAL,
            option_flags2: OptionFlags2::INIT_LANG_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            option_flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("tds-client"),
            server_name: String::new(),
            library_name: String::from("tds-client"),
            language: String::new(),
            database: String::new(),
        }
    }
}

impl Login7 {
    /// Create a new LOGIN7 builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Encode the LOGIN7 payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // Order of the offset/length table in the fixed block.
        let fields: [(&str, bool); 9] = [
            (self.hostname.as_str(), false),
            (self.username.as_str(), false),
            (self.password.as_str(), true),
            (self.app_name.as_str(), false),
            (self.server_name.as_str(), false),
            ("", false), // extension / unused
            (self.library_name.as_str(), false),
            (self.language.as_str(), false),
            (self.database.as_str(), false),
        ];

        let var_size: usize = fields.iter().map(|(s, _)| utf16_byte_len(s)).sum();
        let total_length = LOGIN7_HEADER_SIZE + var_size;

        let mut buf = BytesMut::with_capacity(total_length);
        buf.put_u32_le(total_length as u32);
        buf.put_u32(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(0); // connection id
        buf.put_u8(self.option_flags1.bits());
        buf.put_u8(self.option_flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(self.option_flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);

        let mut var_data = BytesMut::with_capacity(var_size);
        let mut offset = LOGIN7_HEADER_SIZE;
        for (i, (value, obfuscate)) in fields.iter().enumerate() {
            let chars = value.encode_utf16().count();
            buf.put_u16_le(offset as u16);
            buf.put_u16_le(chars as u16);
            if *obfuscate {
                write_obfuscated_password(&mut var_data, value);
            } else {
                write_utf16_string(&mut var_data, value);
            }
            offset += chars * 2;

            if i == 8 {
                buf.put_slice(&[0u8; 6]); // client id
            }
        }

        // SSPI, attach db file and change password: all empty.
        for _ in 0..3 {
            buf.put_u16_le(offset as u16);
            buf.put_u16_le(0);
        }
        buf.put_u32_le(0); // SSPI long

        debug_assert_eq!(buf.len(), LOGIN7_HEADER_SIZE);
        buf.put(var_data);
        buf.freeze()
    }

    /// Decode a LOGIN7 payload, recovering the clear-text password.
    ///
    /// Used by servers and test doubles.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        ProtocolError::ensure(payload.len(), LOGIN7_HEADER_SIZE)?;
        let mut src = payload;

        let _length = src.get_u32_le();
        let tds_version = TdsVersion::new(src.get_u32());
        let packet_size = src.get_u32_le();
        let client_prog_version = src.get_u32_le();
        let client_pid = src.get_u32_le();
        let _connection_id = src.get_u32_le();
        let option_flags1 = OptionFlags1::from_bits_retain(src.get_u8());
        let option_flags2 = OptionFlags2::from_bits_retain(src.get_u8());
        let type_flags = TypeFlags::from_bits_retain(src.get_u8());
        let option_flags3 = OptionFlags3::from_bits_retain(src.get_u8());
        let client_timezone = src.get_i32_le();
        let client_lcid = src.get_u32_le();

        let mut strings: [String; 9] = Default::default();
        for (i, slot) in strings.iter_mut().enumerate() {
            let offset = usize::from(src.get_u16_le());
            let chars = usize::from(src.get_u16_le());
            let raw = payload.get(offset..offset + chars * 2).ok_or_else(|| {
                ProtocolError::Malformed(format!("LOGIN7 field {i} exceeds the payload"))
            })?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|pair| {
                    if i == 2 {
                        u16::from_le_bytes([deobfuscate(pair[0]), deobfuscate(pair[1])])
                    } else {
                        u16::from_le_bytes([pair[0], pair[1]])
                    }
                })
                .collect();
            *slot = String::from_utf16(&units)
                .map_err(|e| ProtocolError::StringEncoding(e.to_string()))?;
        }

        let [hostname, username, password, app_name, server_name, _, library_name, language, database] =
            strings;

        Ok(Self {
            tds_version,
            packet_size,
            client_prog_version,
            client_pid,
            option_flags1,
            option_flags2,
            type_flags,
            option_flags3,
            client_timezone,
            client_lcid,
            hostname,
            username,
            password,
            app_name,
            server_name,
            library_name,
            language,
            database,
        })
    }
}

/// Swap the nibbles of every password byte, then XOR with `0xA5`.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

fn deobfuscate(byte: u8) -> u8 {
    (byte ^ 0xA5).rotate_left(4)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_login7_defaults() {
        let login = Login7::new();
        assert_eq!(login.tds_version, TdsVersion::V7_4);
        assert_eq!(login.packet_size, 4096);
        assert!(login.option_flags2.contains(OptionFlags2::ODBC));
    }

    #[test]
    fn test_login7_fixed_block() {
        let encoded = Login7::new()
            .with_hostname("HOST")
            .with_sql_auth("sa", "secret")
            .with_database("master")
            .encode();

        let length = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len());
        assert_eq!(&encoded[4..8], &[0x74, 0x00, 0x00, 0x04]);

        // Hostname sits right after the fixed block.
        assert_eq!(u16::from_le_bytes([encoded[36], encoded[37]]), 94);
        assert_eq!(u16::from_le_bytes([encoded[38], encoded[39]]), 4);
        assert_eq!(&encoded[94..96], &[b'H', 0]);
    }

    #[test]
    fn test_password_obfuscation() {
        let mut buf = BytesMut::new();
        write_obfuscated_password(&mut buf, "a");
        assert_eq!(&buf[..], &[0xB3, 0xA5]);
        assert_eq!(deobfuscate(0xB3), 0x61);
    }

    #[test]
    fn test_login7_decode_recovers_fields() {
        let original = Login7::new()
            .with_hostname("client-01")
            .with_sql_auth("app_user", "p@ssw0rd")
            .with_app_name("reporting")
            .with_server_name("db.internal")
            .with_database("sales")
            .with_packet_size(8192);

        let decoded = Login7::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_login7_decode_short_payload() {
        assert!(Login7::decode(&[0u8; 20]).unwrap_err().is_incomplete());
    }
}
