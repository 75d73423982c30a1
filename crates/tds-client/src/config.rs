//! Client configuration.

use std::time::Duration;

use tds_protocol::EncryptionLevel;
use tds_tls::TlsConfig;

use crate::error::Error;

/// Smallest packet size the client will negotiate.
pub const MIN_PACKET_SIZE: u16 = 512;

/// Largest packet size the client will negotiate.
pub const MAX_PACKET_SIZE: u16 = 32767;

/// Client encryption preference, sent in PRELOGIN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encrypt {
    /// Encrypt only if the server requires it.
    Off,
    /// Encrypt the whole connection.
    #[default]
    On,
    /// Encrypt the whole connection and fail if the server cannot.
    Required,
    /// Never encrypt.
    NotSupported,
}

impl Encrypt {
    /// PRELOGIN encryption level for this preference.
    #[must_use]
    pub fn level(self) -> EncryptionLevel {
        match self {
            Self::Off => EncryptionLevel::Off,
            Self::On => EncryptionLevel::On,
            Self::Required => EncryptionLevel::Required,
            Self::NotSupported => EncryptionLevel::NotSupported,
        }
    }

    /// Whether the client refuses to run without encryption.
    #[must_use]
    pub fn is_required(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "mandatory" => Some(Self::On),
            "strict" | "required" => Some(Self::Required),
            "false" | "no" | "0" | "optional" => Some(Self::Off),
            "notsupported" | "not supported" | "no_tls" => Some(Self::NotSupported),
            _ => None,
        }
    }
}

/// Configuration for a single connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Database name.
    pub database: Option<String>,

    /// SQL authentication user.
    pub user: String,

    /// SQL authentication password.
    pub password: String,

    /// Application name (shown in SQL Server management tools).
    pub application_name: String,

    /// Requested TDS packet size.
    pub packet_size: u16,

    /// Encryption preference.
    pub encrypt: Encrypt,

    /// Whether to trust the server certificate without validation.
    pub trust_server_certificate: bool,

    /// Name to validate the server certificate against, if not `host`.
    pub server_name: Option<String>,

    /// Timeout for TCP connect plus the login handshake.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            database: None,
            user: String::new(),
            password: String::new(),
            application_name: "tds-client".to_string(),
            packet_size: 4096,
            encrypt: Encrypt::default(),
            trust_server_certificate: false,
            server_name: None,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an ADO-style connection string.
    ///
    /// ```text
    /// Server=localhost,1433;Database=mydb;User Id=sa;Password=secret;Encrypt=true;
    /// ```
    ///
    /// Unknown keys are ignored.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "host" => {
                    let value = value.strip_prefix("tcp:").unwrap_or(value);
                    if let Some((host, port)) = value.split_once(',') {
                        config.host = host.trim().to_string();
                        config.port = parse_number(port.trim(), "port")?;
                    } else {
                        config.host = value.to_string();
                    }
                }
                "port" => config.port = parse_number(value, "port")?,
                "database" | "initial catalog" => config.database = Some(value.to_string()),
                "user id" | "uid" | "user" => config.user = value.to_string(),
                "password" | "pwd" => config.password = value.to_string(),
                "application name" | "app" => config.application_name = value.to_string(),
                "connect timeout" | "connection timeout" => {
                    let secs: u64 = parse_number(value, "timeout")?;
                    config.connect_timeout = Duration::from_secs(secs);
                }
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(value)
                        .ok_or_else(|| Error::Config(format!("invalid boolean: {value}")))?;
                }
                "hostnameincertificate" | "host name in certificate" => {
                    config.server_name = Some(value.to_string());
                }
                "encrypt" => {
                    config.encrypt = Encrypt::parse(value)
                        .ok_or_else(|| Error::Config(format!("invalid encrypt value: {value}")))?;
                }
                "packet size" => {
                    let size: u16 = parse_number(value, "packet size")?;
                    config = config.packet_size(size);
                }
                _ => {
                    tracing::debug!(
                        key = key,
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        Ok(config)
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the packet size, clamped to 512..=32767.
    #[must_use]
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        self
    }

    /// Set the encryption preference.
    #[must_use]
    pub fn encrypt(mut self, encrypt: Encrypt) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Skip server certificate validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Validate the server certificate against this name instead of the host.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// TLS settings derived from this configuration.
    #[must_use]
    pub fn tls_config(&self) -> TlsConfig {
        let tls = TlsConfig::new().trust_server_certificate(self.trust_server_certificate);
        match &self.server_name {
            Some(name) => tls.with_server_name(name.clone()),
            None => tls,
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid {what}: {value}")))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
