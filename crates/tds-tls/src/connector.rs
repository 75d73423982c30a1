//! TLS connector and sans-IO session.
//!
//! The TDS encryption upgrade runs the TLS handshake inside PRELOGIN
//! packets on a connection that is already framing TDS, so the TLS layer
//! cannot own the socket. [`TlsSession`] only moves bytes: ciphertext in,
//! plaintext out, and the other way round.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{TlsConfig, TlsVersion};
use crate::error::TlsError;

/// A certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct DangerousServerCertVerifier;

impl ServerCertVerifier for DangerousServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds [`TlsSession`]s from a [`TlsConfig`].
///
/// The rustls client configuration is built once and shared by every
/// session the connector creates.
#[derive(Clone)]
pub struct TlsConnector {
    config: TlsConfig,
    client_config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Self::build_client_config(&config)?;
        Ok(Self {
            config,
            client_config: Arc::new(client_config),
        })
    }

    fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
        let versions = TlsVersion::range(config.min_protocol_version, config.max_protocol_version);

        if config.trust_server_certificate {
            tracing::warn!(
                "TrustServerCertificate is enabled: server certificate validation is disabled"
            );
            return Ok(ClientConfig::builder_with_protocol_versions(&versions)
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerousServerCertVerifier))
                .with_no_client_auth());
        }

        let mut root_store = RootCertStore::empty();
        if config.root_certificates.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in &config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }

        Ok(ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    /// Start a client session for `host`.
    ///
    /// The configured server name override, if any, wins over `host`.
    pub fn session(&self, host: &str) -> Result<TlsSession, TlsError> {
        let name = self.config.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(name.to_owned()))?;

        tracing::debug!(server_name = %name, "starting TLS session");

        let conn = ClientConnection::new(Arc::clone(&self.client_config), server_name)?;
        Ok(TlsSession { conn })
    }

    /// Get the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One client-side TLS session driven by the caller.
pub struct TlsSession {
    conn: ClientConnection,
}

impl TlsSession {
    /// Whether the handshake is still running.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Feed ciphertext received from the peer and return any plaintext it
    /// unlocked.
    pub fn read_tls(&mut self, mut ciphertext: &[u8]) -> Result<Bytes, TlsError> {
        let mut plaintext = Vec::new();
        while !ciphertext.is_empty() {
            let read = self.conn.read_tls(&mut ciphertext)?;
            if read == 0 {
                return Err(TlsError::Closed);
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let start = plaintext.len();
                plaintext.resize(start + pending, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
            if state.peer_has_closed() {
                break;
            }
        }
        Ok(Bytes::from(plaintext))
    }

    /// Queue plaintext for encryption.
    ///
    /// Data written before the handshake completes is buffered by rustls
    /// and sent once keys are available.
    pub fn write_plaintext(&mut self, plaintext: &[u8]) -> Result<(), TlsError> {
        self.conn.writer().write_all(plaintext)?;
        Ok(())
    }

    /// Drain ciphertext that should be sent to the peer.
    pub fn take_tls(&mut self) -> Result<Bytes, TlsError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(Bytes::from(out))
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}
