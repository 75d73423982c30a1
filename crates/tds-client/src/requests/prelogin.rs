//! PRELOGIN exchange and encryption negotiation.

use tds_codec::{Message, MessageAssembler, Packet};
use tds_protocol::{EncryptionLevel, PacketType, PreLogin};
use tokio::sync::oneshot;

use crate::config::Encrypt;
use crate::error::{Error, Result};
use crate::request::{PacketResponse, Request, Session};

/// Opens a connection: sends PRELOGIN and decides whether to encrypt.
#[derive(Debug)]
pub struct PreloginRequest {
    encrypt: Encrypt,
    assembler: MessageAssembler,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl PreloginRequest {
    /// Create the request and the receiver for its completion.
    #[must_use]
    pub fn new(encrypt: Encrypt) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            encrypt,
            assembler: MessageAssembler::new(),
            done: Some(tx),
        };
        (request, rx)
    }
}

/// Whether the connection switches to TLS, given both sides' preferences.
pub fn negotiate(client: Encrypt, server: EncryptionLevel) -> Result<bool> {
    match (client, server) {
        (Encrypt::NotSupported, EncryptionLevel::Required) => Err(Error::Config(
            "server requires encryption but it is disabled on the client".into(),
        )),
        (Encrypt::NotSupported, _) => Ok(false),
        (client, EncryptionLevel::NotSupported) if client.is_required() => {
            Err(Error::EncryptionNotSupported)
        }
        (_, EncryptionLevel::NotSupported) => Ok(false),
        (Encrypt::Off, EncryptionLevel::Off) => Ok(false),
        _ => Ok(true),
    }
}

impl Request for PreloginRequest {
    fn start(&mut self, _session: &Session) -> Result<Vec<Message>> {
        let prelogin = PreLogin::new()
            .with_encryption(self.encrypt.level())
            .with_thread_id(std::process::id());
        Ok(vec![Message::new(PacketType::PreLogin, prelogin.encode())])
    }

    fn handle(&mut self, packet: Packet, session: &mut Session) -> Result<PacketResponse> {
        let Some(message) = self.assembler.push(packet) else {
            return Ok(PacketResponse::Continue);
        };

        let response = PreLogin::decode(&message.payload)?;
        session.server_encryption = Some(response.encryption);
        tracing::debug!(
            client = ?self.encrypt,
            server = ?response.encryption,
            server_version = ?response.server_version,
            "received PRELOGIN response"
        );

        if negotiate(self.encrypt, response.encryption)? {
            Ok(PacketResponse::KickoffSsl)
        } else {
            Ok(PacketResponse::Done)
        }
    }

    fn complete(mut self: Box<Self>, result: Result<()>, _session: &Session) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    fn name(&self) -> &'static str {
        "prelogin"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{PacketHeader, PacketStatus};

    fn response(level: EncryptionLevel) -> Packet {
        let payload = PreLogin::new().with_encryption(level).encode();
        let header = PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 0);
        Packet::new(header, payload)
    }

    #[test]
    fn test_negotiation_table() {
        use EncryptionLevel as S;

        assert!(negotiate(Encrypt::On, S::On).unwrap());
        assert!(negotiate(Encrypt::On, S::Off).unwrap());
        assert!(negotiate(Encrypt::Off, S::Required).unwrap());
        assert!(!negotiate(Encrypt::Off, S::Off).unwrap());
        assert!(!negotiate(Encrypt::Off, S::NotSupported).unwrap());
        assert!(!negotiate(Encrypt::NotSupported, S::On).unwrap());
        assert!(matches!(
            negotiate(Encrypt::Required, S::NotSupported),
            Err(Error::EncryptionNotSupported)
        ));
        assert!(matches!(
            negotiate(Encrypt::NotSupported, S::Required),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_start_sends_prelogin() {
        let (mut request, _rx) = PreloginRequest::new(Encrypt::Off);
        let messages = request.start(&Session::new("h", 4096)).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].packet_type, PacketType::PreLogin);
        let sent = PreLogin::decode(&messages[0].payload).unwrap();
        assert_eq!(sent.encryption, EncryptionLevel::Off);
    }

    #[test]
    fn test_response_outcomes() {
        let mut session = Session::new("h", 4096);

        let (mut request, _rx) = PreloginRequest::new(Encrypt::On);
        let outcome = request.handle(response(EncryptionLevel::On), &mut session).unwrap();
        assert!(matches!(outcome, PacketResponse::KickoffSsl));
        assert_eq!(session.server_encryption, Some(EncryptionLevel::On));

        let (mut request, _rx) = PreloginRequest::new(Encrypt::Off);
        let outcome = request.handle(response(EncryptionLevel::Off), &mut session).unwrap();
        assert!(matches!(outcome, PacketResponse::Done));

        let (mut request, _rx) = PreloginRequest::new(Encrypt::Required);
        assert!(request
            .handle(response(EncryptionLevel::NotSupported), &mut session)
            .is_err());
    }

    #[test]
    fn test_completion_is_reported() {
        let (request, mut rx) = PreloginRequest::new(Encrypt::Off);
        Box::new(request).complete(Err(Error::ConnectionClosed), &Session::new("h", 4096));
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
    }
}
