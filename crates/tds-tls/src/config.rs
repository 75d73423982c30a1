//! TLS configuration options.

use rustls::pki_types::CertificateDer;

/// TLS configuration for the encryption upgrade.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Accept any server certificate.
    ///
    /// **Warning:** This is insecure and should only be used for testing.
    pub trust_server_certificate: bool,

    /// Root certificates to trust. Empty means the webpki root set.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// Name to validate the certificate against instead of the host.
    pub server_name: Option<String>,

    /// Minimum TLS version to accept.
    pub min_protocol_version: TlsVersion,

    /// Maximum TLS version to accept.
    pub max_protocol_version: TlsVersion,
}

impl TlsConfig {
    /// Create a new TLS configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_protocol_version: TlsVersion::Tls13,
            ..Self::default()
        }
    }

    /// Trust the server certificate without validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Add a custom root certificate to trust.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Set the server name for certificate validation.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the minimum TLS version.
    #[must_use]
    pub fn min_protocol_version(mut self, version: TlsVersion) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Set the maximum TLS version.
    #[must_use]
    pub fn max_protocol_version(mut self, version: TlsVersion) -> Self {
        self.max_protocol_version = version;
        self
    }
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Convert to rustls protocol version.
    #[must_use]
    pub fn to_rustls(&self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }

    /// Versions in `min..=max`, falling back to TLS 1.2 for an empty range.
    #[must_use]
    pub fn range(min: Self, max: Self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        let versions: Vec<_> = [Self::Tls12, Self::Tls13]
            .into_iter()
            .filter(|v| (min..=max).contains(v))
            .map(|v| v.to_rustls())
            .collect();
        if versions.is_empty() {
            vec![Self::Tls12.to_rustls()]
        } else {
            versions
        }
    }
}
