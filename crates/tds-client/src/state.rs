//! Connection handshake state.
//!
//! ```text
//! Initial -> PreloginSent -> [TlsHandshakeStarted -> TlsHandshakeComplete] -> LoginSent -> LoggedIn
//! ```
//!
//! The bracketed segment is only entered when encryption is negotiated.
//! Any state may move to `Closed`, which is terminal.

use std::fmt;

use tds_protocol::PacketType;

use crate::error::Error;

/// Handshake state of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing sent yet.
    #[default]
    Initial,
    /// PRELOGIN written, response pending or received.
    PreloginSent,
    /// TLS stages installed, handshake running.
    TlsHandshakeStarted,
    /// TLS handshake finished and framing moved behind the TLS stage.
    TlsHandshakeComplete,
    /// LOGIN7 written.
    LoginSent,
    /// Login acknowledged; SQL batches may flow.
    LoggedIn,
    /// Transport closed; no further requests are accepted.
    Closed,
}

impl ConnectionState {
    /// Whether the connection accepts new requests.
    #[must_use]
    pub fn is_open(self) -> bool {
        self != Self::Closed
    }

    /// State after writing a message of `packet_type` from this state.
    ///
    /// PRELOGIN is only legal from `Initial`; LOGIN7 only from
    /// `PreloginSent` or `TlsHandshakeComplete`. Other message types do not
    /// move the state machine.
    pub fn on_send(self, packet_type: PacketType) -> Result<Self, Error> {
        match (packet_type, self) {
            (_, Self::Closed) => Err(Error::ConnectionClosed),
            (PacketType::PreLogin, Self::Initial) => Ok(Self::PreloginSent),
            (PacketType::PreLogin, state) => Err(Error::sequencing(format!(
                "PRELOGIN must be the first message and is sent once per connection (state: {state})"
            ))),
            (PacketType::Tds7Login, Self::PreloginSent | Self::TlsHandshakeComplete) => {
                Ok(Self::LoginSent)
            }
            (PacketType::Tds7Login, state) => Err(Error::sequencing(format!(
                "LOGIN7 must follow PRELOGIN or the TLS handshake (state: {state})"
            ))),
            (_, state) => Ok(state),
        }
    }

    /// Check that the encryption upgrade may start from this state.
    pub fn check_kickoff(self) -> Result<(), Error> {
        match self {
            Self::PreloginSent => Ok(()),
            state => Err(Error::sequencing(format!(
                "TLS kickoff must immediately follow PRELOGIN (state: {state})"
            ))),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::PreloginSent => "prelogin-sent",
            Self::TlsHandshakeStarted => "tls-handshake-started",
            Self::TlsHandshakeComplete => "tls-handshake-complete",
            Self::LoginSent => "login-sent",
            Self::LoggedIn => "logged-in",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_handshake_order() {
        let state = ConnectionState::Initial
            .on_send(PacketType::PreLogin)
            .unwrap();
        assert_eq!(state, ConnectionState::PreloginSent);
        let state = state.on_send(PacketType::Tds7Login).unwrap();
        assert_eq!(state, ConnectionState::LoginSent);
    }

    #[test]
    fn test_login_before_prelogin_is_rejected() {
        let err = ConnectionState::Initial
            .on_send(PacketType::Tds7Login)
            .unwrap_err();
        assert!(err.is_sequencing_error());
    }

    #[test]
    fn test_second_prelogin_is_rejected() {
        for state in [
            ConnectionState::PreloginSent,
            ConnectionState::TlsHandshakeComplete,
            ConnectionState::LoggedIn,
        ] {
            assert!(state.on_send(PacketType::PreLogin).unwrap_err().is_sequencing_error());
        }
    }

    #[test]
    fn test_login_after_tls() {
        assert_eq!(
            ConnectionState::TlsHandshakeComplete
                .on_send(PacketType::Tds7Login)
                .unwrap(),
            ConnectionState::LoginSent
        );
        assert!(ConnectionState::TlsHandshakeStarted
            .on_send(PacketType::Tds7Login)
            .is_err());
    }

    #[test]
    fn test_kickoff_only_after_prelogin() {
        assert!(ConnectionState::PreloginSent.check_kickoff().is_ok());
        for state in [
            ConnectionState::Initial,
            ConnectionState::TlsHandshakeStarted,
            ConnectionState::TlsHandshakeComplete,
            ConnectionState::LoginSent,
            ConnectionState::LoggedIn,
        ] {
            assert!(state.check_kickoff().unwrap_err().is_sequencing_error());
        }
    }

    #[test]
    fn test_closed_rejects_everything() {
        assert!(matches!(
            ConnectionState::Closed.on_send(PacketType::SqlBatch),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(
            ConnectionState::LoggedIn.on_send(PacketType::SqlBatch).unwrap(),
            ConnectionState::LoggedIn
        );
    }
}
