//! Sans-IO connection core.
//!
//! [`ConnectionCore`] owns the pipeline, the handshake state and the FIFO
//! of requests. It never touches a socket: the caller feeds it bytes read
//! from the transport with [`ConnectionCore::receive`] and drains the bytes
//! to write with [`ConnectionCore::take_outbound`].
//!
//! Only the request at the head of the queue is started; its response is
//! routed to it packet by packet until it reports completion, then the
//! next request starts. A request that fails partway through a response
//! leaves the rest of that response to be discarded up to its last packet.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tds_codec::{Message, Packet};

use crate::error::{Error, Result};
use crate::pipeline::{Frame, Interrupt, Link, Output, Pipeline, StageEvent};
use crate::request::{Backpressure, PacketResponse, Request, Session};
use crate::stages::{
    COORDINATOR, DECODER, ENCODER, PacketDecoder, PacketEncoder, PreloginCoordinator,
    SecureLayerFactory, TLS,
};
use crate::state::ConnectionState;

/// How far an error reaches.
#[derive(Debug)]
enum Failure {
    /// Fails the current request; the connection carries on.
    Request(Error),
    /// The connection can no longer be trusted and is closed.
    Connection(Error),
}

/// State and request queue of one connection, independent of any transport.
pub struct ConnectionCore {
    state: ConnectionState,
    session: Session,
    link: Link,
    pipeline: Pipeline,
    queue: VecDeque<Box<dyn Request>>,
    active: bool,
    draining: bool,
    secure: Option<Arc<dyn SecureLayerFactory>>,
    outbox: Vec<Bytes>,
}

impl ConnectionCore {
    /// Create a core with plain packet framing installed.
    pub fn new(session: Session, secure: Option<Arc<dyn SecureLayerFactory>>) -> Result<Self> {
        let mut link = Link::new(session.packet_size);
        let mut pipeline = Pipeline::new();
        pipeline.add_last(DECODER, Box::new(PacketDecoder::new()), &mut link)?;
        pipeline.add_last(ENCODER, Box::new(PacketEncoder::new()), &mut link)?;

        Ok(Self {
            state: ConnectionState::Initial,
            session,
            link,
            pipeline,
            queue: VecDeque::new(),
            active: false,
            draining: false,
            secure,
            outbox: Vec::new(),
        })
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Negotiated session properties.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The installed pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Number of requests queued, including the one in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.state.is_open()
    }

    /// Queue a request. It starts once every earlier request completed.
    pub fn enqueue(&mut self, request: Box<dyn Request>) {
        if self.is_closed() {
            request.complete(Err(Error::ConnectionClosed), &self.session);
            return;
        }
        tracing::trace!(request = request.name(), queued = self.queue.len(), "enqueued request");
        self.queue.push_back(request);
        self.start_next();
    }

    /// Bytes waiting to be written to the transport.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    /// Feed bytes read from the transport.
    pub fn receive(&mut self, bytes: Bytes) {
        if self.is_closed() {
            tracing::debug!(len = bytes.len(), "discarding data received after close");
            return;
        }
        match self.pipeline.read(bytes, &mut self.link) {
            Ok(output) => self.process(output),
            Err(e) => self.fail(Failure::Connection(e), true),
        }
    }

    /// The transport reached end of stream.
    pub fn transport_closed(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.pipeline.eof() {
            self.fail_head(e);
        }
        self.close();
    }

    /// The transport failed; fail the request in flight and close.
    pub fn abort(&mut self, error: Error) {
        if self.is_closed() {
            return;
        }
        self.fail(Failure::Connection(error), true);
    }

    /// Pending backpressure of the request in flight, if any.
    pub fn backpressure(&mut self) -> Option<Backpressure> {
        if !self.active {
            return None;
        }
        self.queue.front_mut().and_then(|head| head.backpressure())
    }

    /// Close the connection and fail every queued request.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ConnectionState::Closed;
        self.active = false;
        self.draining = false;

        let abandoned = self.queue.len();
        for request in self.queue.drain(..) {
            request.complete(Err(Error::ConnectionClosed), &self.session);
        }
        tracing::info!(abandoned, "connection closed");
    }

    fn start_next(&mut self) {
        while !self.active && !self.is_closed() {
            let Some(head) = self.queue.front_mut() else {
                return;
            };
            tracing::debug!(request = head.name(), state = %self.state, "starting request");

            let started = head
                .start(&self.session)
                .map_err(Failure::Request)
                .and_then(|messages| self.send(messages));
            match started {
                Ok(()) => self.active = true,
                Err(failure) => self.fail(failure, true),
            }
        }
    }

    fn send(&mut self, messages: Vec<Message>) -> std::result::Result<(), Failure> {
        self.link.packet_size = self.session.packet_size;
        for message in messages {
            let next = self
                .state
                .on_send(message.packet_type)
                .map_err(Failure::Request)?;
            let packets = message.into_packets(self.link.packet_size, &mut self.link.sequence);
            let bytes = self
                .pipeline
                .write(packets, &mut self.link)
                .map_err(Failure::Connection)?;
            self.outbox.extend(bytes);

            if next != self.state {
                tracing::debug!(from = %self.state, to = %next, "connection state changed");
                self.state = next;
            }
        }
        Ok(())
    }

    fn process(&mut self, output: Output) {
        self.outbox.extend(output.outbound);

        let mut packets = output.packets.into_iter();
        while let Some(packet) = packets.next() {
            if self.is_closed() {
                return;
            }
            if self.dispatch(packet) {
                // The pipeline changed under the remaining packets.
                let rest: Vec<Frame> = packets.map(Frame::Packet).collect();
                if !rest.is_empty() {
                    match self.pipeline.resume_after(ENCODER, rest, &mut self.link) {
                        Ok(output) => self.process(output),
                        Err(e) => self.fail(Failure::Connection(e), true),
                    }
                }
                break;
            }
        }

        if let Some(interrupt) = output.interrupt {
            if let Err(failure) = self.on_interrupt(interrupt) {
                self.fail(failure, true);
            }
        }
    }

    /// Route one packet to the head request. Returns true when the
    /// pipeline was rebuilt for the encryption handshake.
    fn dispatch(&mut self, packet: Packet) -> bool {
        let eom = packet.is_end_of_message();

        if self.draining {
            tracing::trace!(eom, "discarding packet of a failed request");
            self.draining = !eom;
            return false;
        }
        if !self.active {
            tracing::debug!(
                packet_type = ?packet.header.packet_type,
                len = packet.payload.len(),
                "discarding packet with no request in flight"
            );
            return false;
        }
        let Some(head) = self.queue.front_mut() else {
            return false;
        };

        match head.handle(packet, &mut self.session) {
            Ok(PacketResponse::Continue) => {}
            Ok(PacketResponse::Respond(messages)) => {
                if let Err(failure) = self.send(messages) {
                    self.fail(failure, eom);
                }
            }
            Ok(PacketResponse::Done) => {
                self.finish_head();
                self.start_next();
            }
            Ok(PacketResponse::KickoffSsl) => match self.kickoff() {
                Ok(()) => return true,
                Err(failure) => self.fail(failure, eom),
            },
            Err(e) => self.fail(Failure::Request(e), eom),
        }
        false
    }

    /// Insert the coordinator and the secure layer behind the framing stages.
    ///
    /// A kickoff outside `PreloginSent` fails only the current request. Any
    /// failure after that closes the connection: a coordinator inserted
    /// without its secure layer leaves a pipeline that cannot carry the
    /// requests still queued, so they fail with `ConnectionClosed`.
    fn kickoff(&mut self) -> std::result::Result<(), Failure> {
        self.state.check_kickoff().map_err(Failure::Request)?;
        let factory = self.secure.as_ref().ok_or_else(|| {
            Failure::Connection(Error::Config(
                "encryption was negotiated but no secure layer is configured".into(),
            ))
        })?;
        let stage = factory
            .create(&self.session.host)
            .map_err(Failure::Connection)?;

        tracing::debug!(host = %self.session.host, "starting encryption upgrade");
        self.link.packet_size = self.session.packet_size;
        let conn = Failure::Connection;
        let out = self
            .pipeline
            .add_last(COORDINATOR, Box::new(PreloginCoordinator), &mut self.link)
            .map_err(conn)?;
        self.outbox.extend(out);
        let out = self
            .pipeline
            .insert_after(COORDINATOR, TLS, stage, &mut self.link)
            .map_err(conn)?;
        self.outbox.extend(out);

        self.state = ConnectionState::TlsHandshakeStarted;
        Ok(())
    }

    fn on_interrupt(&mut self, interrupt: Interrupt) -> std::result::Result<(), Failure> {
        match interrupt.event {
            StageEvent::HandshakeCompleted => {
                self.complete_handshake(&interrupt.stage, interrupt.pending)
            }
        }
    }

    /// Move packet framing behind the secure layer.
    fn complete_handshake(
        &mut self,
        stage: &str,
        pending: Vec<Frame>,
    ) -> std::result::Result<(), Failure> {
        if self.state != ConnectionState::TlsHandshakeStarted || stage != TLS {
            return Err(Failure::Connection(Error::Pipeline(format!(
                "stage '{stage}' completed a handshake in state {}",
                self.state
            ))));
        }

        let conn = Failure::Connection;
        self.pipeline.remove(COORDINATOR).map_err(conn)?;
        let leftover = self.pipeline.remove(DECODER).map_err(conn)?.take_buffered();
        self.pipeline.remove(ENCODER).map_err(conn)?;

        let out = self
            .pipeline
            .insert_after(TLS, DECODER, Box::new(PacketDecoder::new()), &mut self.link)
            .map_err(conn)?;
        self.outbox.extend(out);
        let out = self
            .pipeline
            .insert_after(DECODER, ENCODER, Box::new(PacketEncoder::new()), &mut self.link)
            .map_err(conn)?;
        self.outbox.extend(out);

        self.state = ConnectionState::TlsHandshakeComplete;
        tracing::info!(stages = ?self.pipeline.names(), "connection encrypted");

        self.finish_head();
        self.start_next();

        if !pending.is_empty() && !self.is_closed() {
            let output = self
                .pipeline
                .resume_after(TLS, pending, &mut self.link)
                .map_err(conn)?;
            self.process(output);
        }
        if let Some(bytes) = leftover {
            if !self.is_closed() {
                let output = self
                    .pipeline
                    .inject_at(TLS, vec![Frame::Bytes(bytes)], &mut self.link)
                    .map_err(conn)?;
                self.process(output);
            }
        }
        Ok(())
    }

    fn finish_head(&mut self) {
        self.active = false;
        let Some(head) = self.queue.pop_front() else {
            return;
        };
        if self.state == ConnectionState::LoginSent {
            self.state = ConnectionState::LoggedIn;
            tracing::info!(
                database = ?self.session.database,
                packet_size = self.session.packet_size,
                "logged in"
            );
        }
        tracing::debug!(request = head.name(), "request completed");
        head.complete(Ok(()), &self.session);
    }

    fn fail_head(&mut self, error: Error) {
        self.active = false;
        if let Some(head) = self.queue.pop_front() {
            tracing::debug!(request = head.name(), error = %error, "request failed");
            head.complete(Err(error), &self.session);
        }
    }

    /// `eom` tells whether the packet that caused the failure ended its
    /// message; if not, the rest of the message is discarded.
    fn fail(&mut self, failure: Failure, eom: bool) {
        match failure {
            Failure::Request(error) => {
                self.fail_head(error);
                self.draining = !eom;
                self.start_next();
            }
            Failure::Connection(error) => {
                tracing::warn!(error = %error, "closing connection after fatal error");
                self.fail_head(error);
                self.close();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .field("queued", &self.queue.len())
            .field("active", &self.active)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::BytesMut;
    use tds_codec::TdsCodec;
    use tds_protocol::{PacketHeader, PacketStatus, PacketType, ProtocolError};
    use tokio::sync::oneshot;
    use tokio_util::codec::Encoder;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Sends one message and completes on the end of its response.
    struct Scripted {
        name: &'static str,
        packet_type: PacketType,
        fail_first: bool,
        kickoff: bool,
        log: Log,
        done: Option<oneshot::Sender<Result<()>>>,
    }

    fn scripted(name: &'static str, log: &Log) -> (Scripted, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let scripted = Scripted {
            name,
            packet_type: PacketType::SqlBatch,
            fail_first: false,
            kickoff: false,
            log: Arc::clone(log),
            done: Some(tx),
        };
        (scripted, rx)
    }

    impl Request for Scripted {
        fn start(&mut self, _session: &Session) -> Result<Vec<Message>> {
            Ok(vec![Message::new(self.packet_type, self.name.as_bytes().to_vec())])
        }

        fn handle(&mut self, packet: Packet, _session: &mut Session) -> Result<PacketResponse> {
            let text = String::from_utf8_lossy(&packet.payload).into_owned();
            self.log.lock().unwrap().push(format!("{}:{text}", self.name));
            if self.fail_first {
                self.fail_first = false;
                return Err(ProtocolError::Malformed("scripted failure".into()).into());
            }
            if self.kickoff {
                return Ok(PacketResponse::KickoffSsl);
            }
            if packet.is_end_of_message() {
                Ok(PacketResponse::Done)
            } else {
                Ok(PacketResponse::Continue)
            }
        }

        fn complete(mut self: Box<Self>, result: Result<()>, _session: &Session) {
            if let Some(done) = self.done.take() {
                let _ = done.send(result);
            }
        }
    }

    fn wire(packet_type: PacketType, payload: &str, eom: bool) -> Bytes {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        let packet = Packet::new(
            PacketHeader::new(packet_type, status, 0),
            payload.as_bytes().to_vec(),
        );
        let mut dst = BytesMut::new();
        TdsCodec::new().encode(packet, &mut dst).unwrap();
        dst.freeze()
    }

    fn reply(payload: &str, eom: bool) -> Bytes {
        wire(PacketType::TabularResult, payload, eom)
    }

    fn core() -> ConnectionCore {
        ConnectionCore::new(Session::new("localhost", 4096), None).unwrap()
    }

    /// Payloads of the packets in the outbox.
    fn sent(core: &mut ConnectionCore) -> Vec<String> {
        let mut codec = TdsCodec::new();
        let mut buf = BytesMut::new();
        for chunk in core.take_outbound() {
            buf.extend_from_slice(&chunk);
        }
        codec
            .decode_all(&mut buf)
            .unwrap()
            .into_iter()
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_requests_run_in_order() {
        let log = Log::default();
        let mut core = core();
        let (a, mut a_rx) = scripted("a", &log);
        let (b, mut b_rx) = scripted("b", &log);
        let (c, mut c_rx) = scripted("c", &log);
        core.enqueue(Box::new(a));
        core.enqueue(Box::new(b));
        core.enqueue(Box::new(c));

        assert_eq!(sent(&mut core), vec!["a"]);
        assert_eq!(core.pending(), 3);

        core.receive(reply("1", false));
        assert!(a_rx.try_recv().is_err());
        core.receive(reply("2", true));
        assert!(a_rx.try_recv().unwrap().is_ok());
        assert_eq!(sent(&mut core), vec!["b"]);

        // Both responses in a single read.
        let mut both = BytesMut::from(&reply("3", true)[..]);
        both.extend_from_slice(&reply("4", true));
        core.receive(both.freeze());

        assert!(b_rx.try_recv().unwrap().is_ok());
        assert!(c_rx.try_recv().unwrap().is_ok());
        assert_eq!(sent(&mut core), vec!["c"]);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:2", "b:3", "c:4"]);
        assert_eq!(core.pending(), 0);
    }

    #[test]
    fn test_close_fails_queued_requests() {
        let log = Log::default();
        let mut core = core();
        let (a, mut a_rx) = scripted("a", &log);
        let (b, mut b_rx) = scripted("b", &log);
        core.enqueue(Box::new(a));
        core.enqueue(Box::new(b));

        core.close();
        assert!(matches!(a_rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(b_rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(core.state(), ConnectionState::Closed);

        let (late, mut late_rx) = scripted("late", &log);
        core.enqueue(Box::new(late));
        assert!(matches!(late_rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_login_before_prelogin_is_rejected() {
        let log = Log::default();
        let mut core = core();
        let (mut login, mut login_rx) = scripted("login", &log);
        login.packet_type = PacketType::Tds7Login;
        let (next, mut next_rx) = scripted("next", &log);
        core.enqueue(Box::new(login));
        core.enqueue(Box::new(next));

        let err = login_rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_sequencing_error());
        assert_eq!(core.state(), ConnectionState::Initial);

        // The next request still runs.
        assert_eq!(sent(&mut core), vec!["next"]);
        core.receive(reply("ok", true));
        assert!(next_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_prelogin_only_once() {
        let log = Log::default();
        let mut core = core();
        let (mut first, mut first_rx) = scripted("p1", &log);
        first.packet_type = PacketType::PreLogin;
        let (mut second, mut second_rx) = scripted("p2", &log);
        second.packet_type = PacketType::PreLogin;
        core.enqueue(Box::new(first));
        core.enqueue(Box::new(second));
        assert_eq!(core.state(), ConnectionState::PreloginSent);

        core.receive(reply("resp", true));
        assert!(first_rx.try_recv().unwrap().is_ok());
        assert!(second_rx.try_recv().unwrap().unwrap_err().is_sequencing_error());
        assert_eq!(sent(&mut core), vec!["p1"]);
    }

    #[test]
    fn test_kickoff_outside_prelogin_is_rejected() {
        let log = Log::default();
        let mut core = core();
        let (mut request, mut rx) = scripted("k", &log);
        request.kickoff = true;
        core.enqueue(Box::new(request));

        core.receive(reply("resp", true));
        assert!(rx.try_recv().unwrap().unwrap_err().is_sequencing_error());
        assert_eq!(core.pipeline().names(), vec![DECODER, ENCODER]);
        assert!(!core.is_closed());
    }

    #[test]
    fn test_kickoff_without_secure_layer_closes() {
        let log = Log::default();
        let mut core = core();
        let (mut request, mut rx) = scripted("k", &log);
        request.packet_type = PacketType::PreLogin;
        request.kickoff = true;
        core.enqueue(Box::new(request));

        core.receive(reply("resp", true));
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Config(_))));
        assert!(core.is_closed());
    }

    #[test]
    fn test_failed_request_drains_rest_of_message() {
        let log = Log::default();
        let mut core = core();
        let (mut a, mut a_rx) = scripted("a", &log);
        a.fail_first = true;
        let (b, mut b_rx) = scripted("b", &log);
        core.enqueue(Box::new(a));
        core.enqueue(Box::new(b));

        core.receive(reply("a1", false));
        assert!(a_rx.try_recv().unwrap().unwrap_err().is_protocol_error());
        assert_eq!(sent(&mut core), vec!["a", "b"]);

        core.receive(reply("a2", false));
        core.receive(reply("a3", true));
        assert!(b_rx.try_recv().is_err());
        core.receive(reply("b1", true));
        assert!(b_rx.try_recv().unwrap().is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["a:a1", "b:b1"]);
    }

    #[test]
    fn test_packet_without_request_is_discarded() {
        let mut core = core();
        core.receive(reply("stray", true));
        assert!(!core.is_closed());
        assert!(core.take_outbound().is_empty());
    }

    #[test]
    fn test_framing_error_closes_connection() {
        let log = Log::default();
        let mut core = core();
        let (a, mut a_rx) = scripted("a", &log);
        let (b, mut b_rx) = scripted("b", &log);
        core.enqueue(Box::new(a));
        core.enqueue(Box::new(b));

        core.receive(Bytes::from_static(&[0x04, 0x01, 0x00, 0x04, 0, 0, 0, 0]));
        assert!(a_rx.try_recv().unwrap().unwrap_err().is_protocol_error());
        assert!(matches!(b_rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert!(core.is_closed());
    }

    #[test]
    fn test_truncated_stream_fails_head() {
        let log = Log::default();
        let mut core = core();
        let (a, mut a_rx) = scripted("a", &log);
        core.enqueue(Box::new(a));

        let partial = reply("partial", true);
        core.receive(partial.slice(..5));
        core.transport_closed();
        assert!(a_rx.try_recv().unwrap().unwrap_err().is_protocol_error());
        assert!(core.is_closed());
    }
}
