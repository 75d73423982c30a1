//! Mock TDS server.
//!
//! Speaks enough of the server side of the protocol to drive a client
//! through PRELOGIN, LOGIN7 and SQL batches without a real database. The
//! only secure layer it knows is the scrambled stand-in from
//! [`crate::scramble`]: whenever the PRELOGIN exchange agrees on
//! encryption, the server runs that handshake.
//!
//! Responses are split into small packets so that clients see tokens that
//! straddle packet boundaries.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar_int(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tds_codec::{CodecError, Message, MessageAssembler, PacketSequence, PacketStream};
use tds_protocol::{
    DoneStatus, EncryptionLevel, EnvChangeType, Login7, PacketType, PreLogin, ProtocolError,
    SqlServerVersion, decode_sql_batch,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::scramble::{CLIENT_FINISHED, CLIENT_HELLO, SERVER_FINISHED, SERVER_HELLO, Scrambled};
use crate::tokens::{ColumnKind, MockColumn, ScalarValue, TokenStreamBuilder};

/// TDS 7.4 as sent in LOGINACK.
const TDS_74: u32 = 0x7400_0004;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed client message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client sent something out of order.
    #[error("unexpected client message: {0}")]
    Unexpected(String),
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// Builds a response from the SQL text of a batch.
pub type ResponseFn = Arc<dyn Fn(&str) -> Bytes + Send + Sync>;

/// Mock response configuration.
#[derive(Clone)]
pub enum MockResponse {
    /// A single row with a single unnamed column.
    Scalar(ScalarValue),

    /// A result set.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<ScalarValue>>,
    },

    /// A server error.
    Error {
        /// Error number.
        number: i32,
        /// Error message.
        message: String,
        /// Severity class.
        severity: u8,
    },

    /// A DONE with a row count and no result set.
    RowsAffected(u64),

    /// A pre-encoded token stream.
    Raw(Bytes),

    /// A token stream computed from the SQL text.
    Custom(ResponseFn),
}

impl fmt::Debug for MockResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Rows { columns, rows } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .field("rows", rows)
                .finish(),
            Self::Error {
                number,
                message,
                severity,
            } => f
                .debug_struct("Error")
                .field("number", number)
                .field("message", message)
                .field("severity", severity)
                .finish(),
            Self::RowsAffected(n) => f.debug_tuple("RowsAffected").field(n).finish(),
            Self::Raw(data) => f.debug_tuple("Raw").field(&data.len()).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl MockResponse {
    /// Create a scalar integer response.
    pub fn scalar_int(value: i32) -> Self {
        Self::Scalar(ScalarValue::Int(value))
    }

    /// Create a scalar string response.
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::Scalar(ScalarValue::String(value.into()))
    }

    /// Create an empty result response.
    pub fn empty() -> Self {
        Self::RowsAffected(0)
    }

    /// Create a rows affected response.
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Create an error response with severity 16.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            severity: 16,
        }
    }

    /// Create a multi-row response.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// Create a response computed from the SQL text.
    pub fn custom(f: impl Fn(&str) -> Bytes + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Encode the token stream for `sql`.
    pub fn encode(&self, sql: &str) -> Bytes {
        match self {
            Self::Scalar(value) => {
                let column = MockColumn::new("", scalar_kind(value));
                TokenStreamBuilder::new()
                    .col_metadata(&[column])
                    .row(std::slice::from_ref(value))
                    .done(1)
                    .build()
            }
            Self::Rows { columns, rows } => {
                let mut builder = TokenStreamBuilder::new().col_metadata(columns);
                for row in rows {
                    builder = if row.contains(&ScalarValue::Null) {
                        builder.nbc_row(row)
                    } else {
                        builder.row(row)
                    };
                }
                builder.done(rows.len() as u64).build()
            }
            Self::Error {
                number,
                message,
                severity,
            } => TokenStreamBuilder::new()
                .error(*number, *severity, message)
                .done_error()
                .build(),
            Self::RowsAffected(count) => TokenStreamBuilder::new().done(*count).build(),
            Self::Raw(data) => data.clone(),
            Self::Custom(f) => f(sql),
        }
    }
}

fn scalar_kind(value: &ScalarValue) -> ColumnKind {
    match value {
        ScalarValue::Null | ScalarValue::Int(_) => ColumnKind::Int,
        ScalarValue::Bool(_) => ColumnKind::Bit,
        ScalarValue::BigInt(_) => ColumnKind::BigInt,
        ScalarValue::Double(_) => ColumnKind::Float,
        ScalarValue::String(_) => ColumnKind::NVarChar(4000),
        ScalarValue::Binary(_) => ColumnKind::VarBinary(8000),
        ScalarValue::Decimal(_) => ColumnKind::Decimal(38, 0),
        ScalarValue::DateTime2 { .. } => ColumnKind::DateTime2(7),
    }
}

/// Mock server configuration.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Responses keyed by normalized SQL text.
    pub responses: HashMap<String, MockResponse>,
    /// Response for SQL with no configured match.
    pub default_response: Option<MockResponse>,
    /// Program name reported in LOGINACK.
    pub server_name: String,
    /// Database reported after login.
    pub database: String,
    /// Encryption level advertised in PRELOGIN.
    pub encryption: EncryptionLevel,
    /// Reject every login with this error number and message.
    pub login_error: Option<(i32, String)>,
    /// Packet size announced with an ENVCHANGE after login.
    pub packet_size: Option<u32>,
    /// Size of the packets responses are split into.
    pub response_packet_size: usize,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: None,
            server_name: "MockSQLServer".to_string(),
            database: "master".to_string(),
            encryption: EncryptionLevel::NotSupported,
            login_error: None,
            packet_size: None,
            response_packet_size: 64,
        }
    }
}

impl MockServerConfig {
    fn find_response(&self, sql: &str) -> MockResponse {
        self.responses
            .get(&normalize(sql))
            .or(self.default_response.as_ref())
            .cloned()
            .unwrap_or_else(MockResponse::empty)
    }
}

fn normalize(sql: &str) -> String {
    sql.trim().to_lowercase()
}

/// SQL batches received by the server, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct BatchLog(Arc<Mutex<Vec<String>>>);

impl BatchLog {
    async fn push(&self, sql: String) {
        self.0.lock().await.push(sql);
    }

    /// Every batch received so far.
    pub async fn batches(&self) -> Vec<String> {
        self.0.lock().await.clone()
    }
}

/// Builder for mock server configuration.
#[derive(Debug, Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `sql` (trimmed, case-insensitive) with `response`.
    pub fn with_response(mut self, sql: impl AsRef<str>, response: MockResponse) -> Self {
        self.config
            .responses
            .insert(normalize(sql.as_ref()), response);
        self
    }

    /// Response for unmatched SQL.
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = Some(response);
        self
    }

    /// Program name reported in LOGINACK.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Database reported after login.
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Encryption level advertised in PRELOGIN.
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Reject logins with the given error.
    pub fn with_login_failure(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_error = Some((number, message.into()));
        self
    }

    /// Announce a packet size after login.
    pub fn with_packet_size(mut self, size: u32) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// Split responses into packets of at most `size` bytes.
    pub fn with_response_packet_size(mut self, size: usize) -> Self {
        self.config.response_packet_size = size;
        self
    }

    /// The finished configuration.
    pub fn config(self) -> MockServerConfig {
        self.config
    }

    /// Start a TCP server on a free local port.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }

    /// Serve one connection over an in-memory pipe.
    ///
    /// Must be called inside a tokio runtime.
    pub fn duplex(self) -> DuplexServer {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let batches = BatchLog::default();
        let config = Arc::new(self.config);
        let task = tokio::spawn(serve(server, config, batches.clone()));
        DuplexServer {
            client,
            batches,
            task,
        }
    }
}

/// A mock connection over an in-memory pipe.
#[derive(Debug)]
pub struct DuplexServer {
    /// Client end of the pipe.
    pub client: DuplexStream,
    /// Batches the server received.
    pub batches: BatchLog,
    /// The server task; finishes when the client goes away.
    pub task: JoinHandle<Result<()>>,
}

/// Mock TDS server listening on a local TCP port.
#[derive(Debug)]
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    batches: BatchLog,
    connection_count: Arc<Mutex<usize>>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = Arc::new(config);
        let batches = BatchLog::default();
        let connection_count = Arc::new(Mutex::new(0usize));

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            batches: batches.clone(),
            connection_count: connection_count.clone(),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "mock server accepted connection");
                                let _ = stream.set_nodelay(true);
                                let config = config.clone();
                                let batches = batches.clone();
                                let count = connection_count.clone();
                                tokio::spawn(async move {
                                    *count.lock().await += 1;
                                    if let Err(e) = serve(stream, config, batches).await {
                                        tracing::debug!(error = %e, "mock connection failed");
                                    }
                                    let mut c = count.lock().await;
                                    *c = c.saturating_sub(1);
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "mock server accept failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(server)
    }

    /// Get the server's listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get the current connection count.
    pub async fn connection_count(&self) -> usize {
        *self.connection_count.lock().await
    }

    /// Batches received across all connections.
    pub async fn batches(&self) -> Vec<String> {
        self.batches.batches().await
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether a client and server encryption setting lead to a secure layer.
fn encryption_agreed(client: EncryptionLevel, server: EncryptionLevel) -> bool {
    use EncryptionLevel::{NotSupported, Off};
    match (client, server) {
        (NotSupported, _) | (_, NotSupported) | (Off, Off) => false,
        _ => true,
    }
}

struct ServerConn<T> {
    stream: PacketStream<Scrambled<T>>,
    assembler: MessageAssembler,
    sequence: PacketSequence,
    packet_size: usize,
}

impl<T> ServerConn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Next complete message, or `None` once the client hung up.
    async fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some(packet) = self.stream.next().await {
            if let Some(message) = self.assembler.push(packet?) {
                tracing::trace!(
                    packet_type = ?message.packet_type,
                    len = message.payload.len(),
                    "mock server received message"
                );
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn read_expected(&mut self, packet_type: PacketType) -> Result<Message> {
        match self.next_message().await? {
            Some(message) if message.packet_type == packet_type => Ok(message),
            Some(message) => Err(MockServerError::Unexpected(format!(
                "expected {packet_type:?}, got {:?}",
                message.packet_type
            ))),
            None => Err(MockServerError::Unexpected(format!(
                "connection closed while waiting for {packet_type:?}"
            ))),
        }
    }

    async fn send(&mut self, packet_type: PacketType, payload: Bytes) -> Result<()> {
        let packets =
            Message::new(packet_type, payload).into_packets(self.packet_size, &mut self.sequence);
        for packet in packets {
            self.stream.feed(packet).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let hello = self.read_expected(PacketType::PreLogin).await?;
        if hello.payload.as_ref() != CLIENT_HELLO {
            return Err(MockServerError::Unexpected("bad client hello".into()));
        }
        self.send(PacketType::PreLogin, Bytes::from_static(SERVER_HELLO))
            .await?;

        let finished = self.read_expected(PacketType::PreLogin).await?;
        if finished.payload.as_ref() != CLIENT_FINISHED {
            return Err(MockServerError::Unexpected("bad client finished".into()));
        }
        // The client scrambles as soon as it sees SERVER_FINISHED.
        self.stream.get_mut().set_read(true);
        self.send(PacketType::PreLogin, Bytes::from_static(SERVER_FINISHED))
            .await?;
        self.stream.get_mut().set_write(true);
        tracing::debug!("mock server secure layer active");
        Ok(())
    }
}

/// Serve one client connection until it closes.
pub async fn serve<T>(io: T, config: Arc<MockServerConfig>, batches: BatchLog) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = ServerConn {
        stream: PacketStream::new(Scrambled::new(io)),
        assembler: MessageAssembler::new(),
        sequence: PacketSequence::new(),
        packet_size: config.response_packet_size,
    };

    let prelogin = conn.read_expected(PacketType::PreLogin).await?;
    let request = PreLogin::decode(&prelogin.payload)?;
    let mut response = PreLogin::new().with_encryption(config.encryption);
    response.server_version = Some(SqlServerVersion {
        major: 16,
        minor: 0,
        build: 1000,
        sub_build: 0,
    });
    conn.send(PacketType::TabularResult, response.encode())
        .await?;

    if encryption_agreed(request.encryption, config.encryption) {
        conn.handshake().await?;
    }

    let login = conn.read_expected(PacketType::Tds7Login).await?;
    let login = Login7::decode(&login.payload)?;
    tracing::debug!(user = %login.username, database = %login.database, "mock login");

    if let Some((number, message)) = &config.login_error {
        let tokens = TokenStreamBuilder::new()
            .error(*number, 14, message)
            .done_error()
            .build();
        conn.send(PacketType::TabularResult, tokens).await?;
        return Ok(());
    }

    let database = if login.database.is_empty() {
        config.database.as_str()
    } else {
        login.database.as_str()
    };
    let mut tokens = TokenStreamBuilder::new()
        .env_change(EnvChangeType::Database, database, "master")
        .info(5701, &format!("Changed database context to '{database}'."));
    if let Some(size) = config.packet_size {
        tokens = tokens.env_change(EnvChangeType::PacketSize, &size.to_string(), "4096");
    }
    let tokens = tokens.login_ack(&config.server_name, TDS_74).done(0).build();
    conn.send(PacketType::TabularResult, tokens).await?;

    while let Some(message) = conn.next_message().await? {
        match message.packet_type {
            PacketType::SqlBatch => {
                let sql = decode_sql_batch(&message.payload)?;
                tracing::debug!(%sql, "mock server batch");
                let response = config.find_response(&sql).encode(&sql);
                batches.push(sql).await;
                conn.send(PacketType::TabularResult, response).await?;
            }
            PacketType::Attention => {
                let ack = TokenStreamBuilder::new()
                    .done_status(DoneStatus::ATTN)
                    .build();
                conn.send(PacketType::TabularResult, ack).await?;
            }
            other => {
                tracing::debug!(packet_type = ?other, "mock server ignoring message");
            }
        }
    }

    Ok(())
}
