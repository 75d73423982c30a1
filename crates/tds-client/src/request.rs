//! The request abstraction.
//!
//! A request produces the messages that start it, handles every packet of
//! its response, and reports its own completion. The connection runs one
//! request at a time, in the order they were enqueued.

use std::future::Future;
use std::pin::Pin;

use tds_codec::{Message, Packet};
use tds_protocol::{EncryptionLevel, TdsVersion};

use crate::error::Result;

/// What to do after a request handled a packet.
#[derive(Debug)]
pub enum PacketResponse {
    /// More packets are expected.
    Continue,
    /// The request is finished; dequeue it and report success.
    Done,
    /// Send these messages and keep the request active.
    Respond(Vec<Message>),
    /// Start the TLS upgrade. Only legal right after PRELOGIN.
    KickoffSsl,
}

/// Properties negotiated over the life of a connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Session {
    /// Host the connection was opened to.
    pub host: String,
    /// Maximum size of outbound packets.
    pub packet_size: usize,
    /// Encryption level the server announced in PRELOGIN.
    pub server_encryption: Option<EncryptionLevel>,
    /// TDS version acknowledged at login.
    pub tds_version: Option<TdsVersion>,
    /// Server program name from the login acknowledgment.
    pub server_program: Option<String>,
    /// Server program version from the login acknowledgment.
    pub server_version: Option<u32>,
    /// Current database.
    pub database: Option<String>,
}

impl Session {
    /// Session defaults before anything is negotiated.
    #[must_use]
    pub fn new(host: impl Into<String>, packet_size: usize) -> Self {
        Self {
            host: host.into(),
            packet_size,
            server_encryption: None,
            tds_version: None,
            server_program: None,
            server_version: None,
            database: None,
        }
    }
}

/// Future the connection awaits before reading more from the transport.
pub type Backpressure = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One unit of work on a connection.
pub trait Request: Send {
    /// Messages to send when the request becomes current.
    fn start(&mut self, session: &Session) -> Result<Vec<Message>>;

    /// Handle one packet of the response.
    ///
    /// An error fails this request only; the connection moves on to the
    /// next one.
    fn handle(&mut self, packet: Packet, session: &mut Session) -> Result<PacketResponse>;

    /// Report the outcome to whoever is waiting. Called exactly once.
    fn complete(self: Box<Self>, result: Result<()>, session: &Session);

    /// Returned while the request cannot hand off more output.
    ///
    /// The connection stops reading until the future resolves, then asks
    /// again.
    fn backpressure(&mut self) -> Option<Backpressure> {
        None
    }

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "request"
    }
}
