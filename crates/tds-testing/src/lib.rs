//! # tds-testing
//!
//! Test infrastructure for the TDS client.
//!
//! ## Features
//!
//! - A mock TDS server that runs the PRELOGIN, LOGIN7 and SQL batch
//!   exchanges, over TCP or an in-memory pipe
//! - Token stream builders for hand-crafted server responses
//! - A scrambling stand-in for TLS, so the encryption upgrade can be tested
//!   without certificates
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use tds_testing::{MockColumn, MockResponse, MockTdsServer, ScalarValue};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockTdsServer::builder()
//!         .with_response(
//!             "SELECT * FROM users WHERE id = 1",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![ScalarValue::Int(1), ScalarValue::String("Alice".into())]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_server;
pub mod scramble;
pub mod tokens;

pub use mock_server::{
    BatchLog, DuplexServer, MockResponse, MockServerBuilder, MockServerConfig, MockServerError,
    MockTdsServer, serve,
};
pub use scramble::{SCRAMBLE_KEY, Scrambled, scramble};
pub use tokens::{ColumnKind, MockColumn, ScalarValue, TokenStreamBuilder};
