//! PRELOGIN message encoding and decoding.
//!
//! PRELOGIN is the first message on a connection. It carries an option table
//! (type, big-endian offset, big-endian length) terminated by `0xFF`,
//! followed by the option data the offsets point into. Offsets are relative
//! to the start of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::version::{SqlServerVersion, TdsVersion};

/// Pre-login option types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name.
    Instance = 0x02,
    /// Client thread ID.
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// Trace ID.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce.
    Nonce = 0x07,
    /// End of the option table.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption setting exchanged in PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login exchange only.
    Off = 0x00,
    /// Encryption is on.
    On = 0x01,
    /// Encryption is not available.
    #[default]
    NotSupported = 0x02,
    /// Encryption is required.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            _ => Err(ProtocolError::Malformed(format!(
                "invalid prelogin encryption value 0x{value:02X}"
            ))),
        }
    }

    /// Whether this side wants the connection encrypted.
    #[must_use]
    pub const fn wants_encryption(&self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// Pre-login message.
///
/// The VERSION option means different things per direction: clients send
/// the TDS version they speak, servers answer with their product version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// TDS version requested by the client.
    pub version: TdsVersion,
    /// Product version, populated when decoding a server response.
    pub server_version: Option<SqlServerVersion>,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name.
    pub instance: Option<String>,
    /// Client thread ID.
    pub thread_id: Option<u32>,
    /// MARS enabled.
    pub mars: bool,
}

const OPTION_ENTRY_SIZE: usize = 5;

impl PreLogin {
    /// Create a new pre-login message with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: TdsVersion::V7_4,
            ..Default::default()
        }
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Enable MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the client thread ID.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Encode the pre-login message payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, Vec<u8>)> = Vec::with_capacity(5);

        let mut version = Vec::with_capacity(6);
        match self.server_version {
            Some(server) => {
                version.extend_from_slice(&server.raw().to_be_bytes());
                version.extend_from_slice(&server.sub_build.to_le_bytes());
            }
            None => {
                version.extend_from_slice(&self.version.raw().to_be_bytes());
                version.extend_from_slice(&[0, 0]);
            }
        }
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));

        let table_size = options.len() * OPTION_ENTRY_SIZE + 1;
        let data_size: usize = options.iter().map(|(_, data)| data.len()).sum();
        let mut buf = BytesMut::with_capacity(table_size + data_size);

        let mut offset = table_size;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }

        buf.freeze()
    }

    /// Decode a pre-login payload.
    ///
    /// Options pointing outside the payload are rejected as malformed.
    /// Options this client does not act on are skipped.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = payload;
        let mut prelogin = Self::default();

        let mut entries = Vec::new();
        loop {
            ProtocolError::ensure(src.remaining(), 1)?;
            let option = PreLoginOption::from_u8(src.get_u8())?;
            if option == PreLoginOption::Terminator {
                break;
            }
            ProtocolError::ensure(src.remaining(), 4)?;
            let offset = usize::from(src.get_u16());
            let length = usize::from(src.get_u16());
            entries.push((option, offset, length));
        }

        for (option, offset, length) in entries {
            let data = payload.get(offset..offset + length).ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "prelogin option {option:?} at {offset}+{length} exceeds payload of {} bytes",
                    payload.len()
                ))
            })?;

            match option {
                PreLoginOption::Version if length >= 4 => {
                    let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let sub_build = if length >= 6 {
                        u16::from_le_bytes([data[4], data[5]])
                    } else {
                        0
                    };
                    prelogin.version = TdsVersion::new(raw);
                    prelogin.server_version = Some(SqlServerVersion::from_raw(raw, sub_build));
                }
                PreLoginOption::Encryption if length >= 1 => {
                    prelogin.encryption = EncryptionLevel::from_u8(data[0])?;
                }
                PreLoginOption::Instance if length > 0 => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    let name = std::str::from_utf8(&data[..end])
                        .map_err(|e| ProtocolError::StringEncoding(e.to_string()))?;
                    if !name.is_empty() {
                        prelogin.instance = Some(name.to_owned());
                    }
                }
                PreLoginOption::ThreadId if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars if length >= 1 => {
                    prelogin.mars = data[0] != 0;
                }
                _ => {}
            }
        }

        Ok(prelogin)
    }
}
