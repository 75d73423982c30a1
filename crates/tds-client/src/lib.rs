//! # tds-client
//!
//! Async TDS client built around a sans-IO connection core.
//!
//! ## Architecture
//!
//! - [`pipeline`]: an ordered list of named byte-processing stages. Plain
//!   connections run `[packet-decoder, packet-encoder]`.
//! - [`engine::ConnectionCore`]: the handshake state machine and the FIFO of
//!   [`Request`]s. Exactly one request is in flight; the rest wait.
//! - [`Client`]: a cloneable handle to a tokio task that owns the
//!   transport and the core.
//!
//! A connection opens with PRELOGIN. When both sides agree on encryption
//! the core installs a TLS stage behind a PRELOGIN-wrapping coordinator,
//! and once the handshake completes it moves packet framing behind the
//! TLS stage:
//!
//! ```text
//! [decoder, encoder] -> [decoder, encoder, coordinator, tls] -> [tls, decoder, encoder]
//! ```
//!
//! LOGIN7 follows, then SQL batches.
//!
//! ## Example
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use tds_client::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tds_client::Error> {
//!     let config = Config::from_connection_string(
//!         "Server=localhost;Database=master;User Id=sa;Password=Password123;",
//!     )?;
//!     let client = Client::connect(config).await?;
//!
//!     let mut rows = client.query("SELECT name, database_id FROM sys.databases").await?;
//!     while let Some(row) = rows.next().await {
//!         let row = row?;
//!         let name: String = row.get("name")?;
//!         let id: i32 = row.get("database_id")?;
//!         println!("{id}: {name}");
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
mod connection;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod pipeline;
pub mod request;
pub mod requests;
pub mod row;
pub mod stages;
pub mod state;
pub mod stream;

pub use client::Client;
pub use config::{Config, Encrypt};
pub use engine::ConnectionCore;
pub use error::{Error, Result};
pub use lookup::LookupTable;
pub use pipeline::{Frame, Link, Pipeline, Stage, StageContext, StageEvent};
pub use request::{Backpressure, PacketResponse, Request, Session};
pub use requests::{BatchSummary, LoginRequest, PreloginRequest, SqlBatchRequest};
pub use row::Row;
pub use stages::{RustlsLayer, SecureLayerFactory};
pub use state::ConnectionState;
pub use stream::RowStream;

// Re-exported so custom requests and stages can be written against this
// crate alone.
pub use tds_codec::{Message, Packet};
pub use tds_protocol::{EncryptionLevel, PacketType, ServerMessage};
pub use tds_types::{FromSql, SqlValue};
