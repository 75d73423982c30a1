//! TDS protocol and server product versions.

use std::fmt;

/// TDS protocol version, as carried in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x7100_0000);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x7209_0002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A_0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B_0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x7400_0004);

    /// Create a TDS version from its raw value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Get the raw version value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Minor version, e.g. `4` for TDS 7.4.
    #[must_use]
    pub const fn minor(self) -> u8 {
        ((self.0 >> 24) & 0x0F) as u8
    }

    /// Whether the DATE, TIME, DATETIME2 and DATETIMEOFFSET types exist.
    #[must_use]
    pub const fn supports_date_time_types(self) -> bool {
        self.0 >= Self::V7_3A.0
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V7_3A => write!(f, "TDS 7.3A"),
            Self::V7_3B => write!(f, "TDS 7.3B"),
            _ => write!(f, "TDS 7.{}", self.minor()),
        }
    }
}

/// SQL Server product version, as sent in the server's PRELOGIN response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SqlServerVersion {
    /// Major version (16 for SQL Server 2022).
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number.
    pub sub_build: u16,
}

impl SqlServerVersion {
    /// Build from the big-endian `UL_VERSION` word and the sub-build.
    #[must_use]
    pub const fn from_raw(raw: u32, sub_build: u16) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            build: raw as u16,
            sub_build,
        }
    }

    /// The `UL_VERSION` word.
    #[must_use]
    pub const fn raw(&self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | self.build as u32
    }
}

impl fmt::Display for SqlServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.sub_build
        )
    }
}
