//! LOGIN7 exchange.

use tds_codec::{Message, Packet};
use tds_protocol::{EnvChange, Login7, LoginAck, PacketType, ServerMessage, StreamingTokenParser, Token};
use tokio::sync::oneshot;

use crate::config::{Config, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use crate::error::{Error, Result};
use crate::request::{PacketResponse, Request, Session};

/// Authenticates with SQL credentials.
///
/// Completes with a snapshot of the negotiated [`Session`].
pub struct LoginRequest {
    login: Login7,
    parser: StreamingTokenParser,
    ack: Option<LoginAck>,
    error: Option<ServerMessage>,
    done: Option<oneshot::Sender<Result<Session>>>,
}

impl LoginRequest {
    /// Build the LOGIN7 message from the configuration.
    #[must_use]
    pub fn new(config: &Config) -> (Self, oneshot::Receiver<Result<Session>>) {
        let mut login = Login7::new()
            .with_sql_auth(config.user.clone(), config.password.clone())
            .with_app_name(config.application_name.clone())
            .with_server_name(config.host.clone())
            .with_packet_size(u32::from(config.packet_size));
        if let Some(database) = &config.database {
            login = login.with_database(database.clone());
        }

        let (tx, rx) = oneshot::channel();
        let request = Self {
            login,
            parser: StreamingTokenParser::new(),
            ack: None,
            error: None,
            done: Some(tx),
        };
        (request, rx)
    }
}

/// Apply an environment change to the session.
pub(crate) fn apply_env_change(env: &EnvChange, session: &mut Session) {
    if let Some(size) = env.new_packet_size() {
        let size = size.clamp(usize::from(MIN_PACKET_SIZE), usize::from(MAX_PACKET_SIZE));
        tracing::debug!(packet_size = size, "server changed packet size");
        session.packet_size = size;
    } else if let Some(database) = env.new_database() {
        tracing::debug!(database = database, "database changed");
        session.database = Some(database.to_string());
    } else {
        tracing::trace!(env_type = ?env.env_type, "ignoring environment change");
    }
}

impl Request for LoginRequest {
    fn start(&mut self, _session: &Session) -> Result<Vec<Message>> {
        Ok(vec![Message::new(PacketType::Tds7Login, self.login.encode())])
    }

    fn handle(&mut self, packet: Packet, session: &mut Session) -> Result<PacketResponse> {
        let is_final = packet.is_end_of_message();
        let parsed = self.parser.feed(&packet.payload, is_final)?;

        for token in parsed.tokens {
            match token {
                Token::LoginAck(ack) => {
                    tracing::debug!(
                        tds_version = %ack.tds_version,
                        program = %ack.prog_name,
                        "login acknowledged"
                    );
                    session.tds_version = Some(ack.tds_version);
                    session.server_program = Some(ack.prog_name.clone());
                    session.server_version = Some(ack.prog_version);
                    self.ack = Some(ack);
                }
                Token::EnvChange(env) => apply_env_change(&env, session),
                Token::Error(message) => {
                    tracing::debug!(number = message.number, message = %message.message, "login error");
                    self.error.get_or_insert(message);
                }
                Token::Info(message) => {
                    tracing::debug!(number = message.number, message = %message.message, "server info");
                }
                Token::Done(_)
                | Token::DoneProc(_)
                | Token::DoneInProc(_)
                | Token::ReturnStatus(_)
                | Token::Order(_)
                | Token::ColMetaData(_)
                | Token::Row(_)
                | Token::NbcRow(_) => {}
            }
        }

        if !is_final {
            return Ok(PacketResponse::Continue);
        }

        match (&self.ack, self.error.take()) {
            (Some(_), _) => Ok(PacketResponse::Done),
            (None, Some(message)) => Err(Error::Login {
                number: message.number,
                message: message.message,
            }),
            (None, None) => Err(Error::Login {
                number: 0,
                message: "login response carried no LOGINACK".into(),
            }),
        }
    }

    fn complete(mut self: Box<Self>, result: Result<()>, session: &Session) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result.map(|()| session.clone()));
        }
    }

    fn name(&self) -> &'static str {
        "login"
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("user", &self.login.username)
            .field("acknowledged", &self.ack.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tds_protocol::codec::write_b_varchar;
    use tds_protocol::{PacketHeader, PacketStatus};

    fn packet(payload: BytesMut, eom: bool) -> Packet {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        Packet::new(
            PacketHeader::new(PacketType::TabularResult, status, 0),
            payload.freeze(),
        )
    }

    fn env_packet_size(buf: &mut BytesMut, size: &str) {
        let mut body = BytesMut::new();
        body.put_u8(4);
        write_b_varchar(&mut body, size);
        write_b_varchar(&mut body, "4096");
        buf.put_u8(0xE3);
        buf.put_u16_le(body.len() as u16);
        buf.put(body);
    }

    fn login_ack(buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        body.put_u8(1);
        body.put_u32(0x7400_0004);
        write_b_varchar(&mut body, "Microsoft SQL Server");
        body.put_u32(0x1000_0000);
        buf.put_u8(0xAD);
        buf.put_u16_le(body.len() as u16);
        buf.put(body);
    }

    fn error(buf: &mut BytesMut, number: i32, text: &str) {
        let mut body = BytesMut::new();
        body.put_i32_le(number);
        body.put_u8(1);
        body.put_u8(14);
        tds_protocol::codec::write_us_varchar(&mut body, text);
        write_b_varchar(&mut body, "db");
        write_b_varchar(&mut body, "");
        body.put_i32_le(1);
        buf.put_u8(0xAA);
        buf.put_u16_le(body.len() as u16);
        buf.put(body);
    }

    fn done(buf: &mut BytesMut) {
        buf.put_u8(0xFD);
        buf.put_slice(&[0u8; 12]);
    }

    fn request() -> LoginRequest {
        LoginRequest::new(&Config::new().credentials("sa", "pw")).0
    }

    #[test]
    fn test_start_encodes_login7() {
        let mut request = request();
        let messages = request.start(&Session::new("h", 4096)).unwrap();
        assert_eq!(messages[0].packet_type, PacketType::Tds7Login);
        let decoded = Login7::decode(&messages[0].payload).unwrap();
        assert_eq!(decoded.username, "sa");
        assert_eq!(decoded.password, "pw");
    }

    #[test]
    fn test_ack_completes_and_updates_session() {
        let mut request = request();
        let mut session = Session::new("h", 4096);

        let mut first = BytesMut::new();
        env_packet_size(&mut first, "8000");
        let mut second = BytesMut::new();
        login_ack(&mut second);
        done(&mut second);

        assert!(matches!(
            request.handle(packet(first, false), &mut session).unwrap(),
            PacketResponse::Continue
        ));
        assert!(matches!(
            request.handle(packet(second, true), &mut session).unwrap(),
            PacketResponse::Done
        ));
        assert_eq!(session.packet_size, 8000);
        assert_eq!(session.server_program.as_deref(), Some("Microsoft SQL Server"));
    }

    #[test]
    fn test_error_without_ack_fails() {
        let mut request = request();
        let mut session = Session::new("h", 4096);
        let mut buf = BytesMut::new();
        error(&mut buf, 18456, "Login failed for user 'sa'.");
        done(&mut buf);

        match request.handle(packet(buf, true), &mut session) {
            Err(Error::Login { number, message }) => {
                assert_eq!(number, 18456);
                assert!(message.starts_with("Login failed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
