//! # tds-tls
//!
//! TLS for the TDS encryption upgrade.
//!
//! After PRELOGIN agrees on encryption, the client runs a TLS handshake
//! whose records travel inside PRELOGIN packets. Once it completes, every
//! TDS packet is encrypted whole. Neither phase lets TLS own the socket,
//! so this crate exposes a sans-IO [`TlsSession`] that the connection
//! pipeline feeds and drains.
//!
//! ```text
//! TCP → PRELOGIN (clear) → TLS handshake in PRELOGIN packets → LOGIN7 (encrypted)
//! ```
//!
//! Server certificates are validated against the webpki roots unless
//! `trust_server_certificate` is set, which logs a warning.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;

pub use config::{TlsConfig, TlsVersion};
pub use connector::{TlsConnector, TlsSession};
pub use error::TlsError;
