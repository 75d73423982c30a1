//! The public client handle.

use std::sync::Arc;

use tds_types::SqlValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::Config;
use crate::connection::{self, Command};
use crate::engine::ConnectionCore;
use crate::error::{Error, Result};
use crate::request::{Request, Session};
use crate::requests::{LoginRequest, PreloginRequest, SqlBatchRequest};
use crate::stages::{RustlsLayer, SecureLayerFactory};
use crate::stream::RowStream;

/// Commands buffered between handles and the connection actor.
const COMMAND_CAPACITY: usize = 32;

/// Rows buffered per query before the connection stops reading.
const ROW_CAPACITY: usize = 256;

/// Handle to one connection.
///
/// Clones share the connection; requests from every clone run one at a
/// time in the order they were submitted.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    session: Arc<Session>,
}

impl Client {
    /// Connect over TCP, negotiate encryption and log in.
    pub async fn connect(config: Config) -> Result<Self> {
        tracing::info!(
            host = %config.host,
            port = config.port,
            database = ?config.database,
            "connecting to SQL Server"
        );

        let addr = format!("{}:{}", config.host, config.port);
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;
        stream.set_nodelay(true)?;

        Self::connect_with(stream, config).await
    }

    /// Run the handshake over an already established transport.
    ///
    /// Encryption, when negotiated, uses rustls with the settings from
    /// [`Config::tls_config`].
    pub async fn connect_with<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let secure: Arc<dyn SecureLayerFactory> = Arc::new(RustlsLayer::new(config.tls_config()));
        Self::connect_with_secure_layer(transport, config, Some(secure)).await
    }

    /// Run the handshake with a custom secure layer, or none.
    ///
    /// Without a secure layer, a server that insists on encryption fails
    /// the connection.
    pub async fn connect_with_secure_layer<T>(
        transport: T,
        config: Config,
        secure: Option<Arc<dyn SecureLayerFactory>>,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connect_timeout = config.connect_timeout;
        timeout(connect_timeout, Self::handshake(transport, config, secure))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
    }

    async fn handshake<T>(
        transport: T,
        config: Config,
        secure: Option<Arc<dyn SecureLayerFactory>>,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let host = config.server_name.clone().unwrap_or_else(|| config.host.clone());
        let session = Session::new(host, usize::from(config.packet_size));
        let core = ConnectionCore::new(session.clone(), secure)?;

        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(connection::run(core, transport, receiver));

        let mut client = Self {
            commands,
            session: Arc::new(session),
        };

        let (prelogin, done) = PreloginRequest::new(config.encrypt);
        client.enqueue(Box::new(prelogin)).await?;
        if let Err(e) = wait(done).await {
            client.close().await;
            return Err(e);
        }

        let (login, done) = LoginRequest::new(&config);
        client.enqueue(Box::new(login)).await?;
        match wait(done).await {
            Ok(session) => {
                client.session = Arc::new(session);
                Ok(client)
            }
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Session properties negotiated during login.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run a SQL batch and stream its rows.
    pub async fn query(&self, sql: impl Into<String>) -> Result<RowStream> {
        let (request, handle) = SqlBatchRequest::new(sql, ROW_CAPACITY);
        self.enqueue(Box::new(request)).await?;
        Ok(RowStream::new(handle))
    }

    /// Run a SQL batch and decode every row into name/value pairs.
    pub async fn query_values(&self, sql: impl Into<String>) -> Result<Vec<Vec<(String, SqlValue)>>> {
        let rows = self.query(sql).await?.collect_all().await?;
        rows.iter().map(|row| row.values()).collect()
    }

    /// Run a SQL batch, discard any rows and return the affected row count.
    pub async fn execute(&self, sql: impl Into<String>) -> Result<u64> {
        let (request, handle) = SqlBatchRequest::new(sql, 1);
        drop(handle.rows);
        self.enqueue(Box::new(request)).await?;
        let summary = wait(handle.done).await?;
        Ok(summary.rows_affected)
    }

    /// Queue a custom request. It reports its own outcome.
    pub async fn send(&self, request: Box<dyn Request>) -> Result<()> {
        self.enqueue(request).await
    }

    /// Close the connection. Queued requests fail with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    /// Whether the connection actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn enqueue(&self, request: Box<dyn Request>) -> Result<()> {
        self.commands
            .send(Command::Send(request))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

async fn wait<T>(done: oneshot::Receiver<Result<T>>) -> Result<T> {
    done.await.map_err(|_| Error::ConnectionClosed)?
}
