//! End-to-end client tests against the mock server over an in-memory pipe.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::ScrambleLayer;
use futures_util::StreamExt;
use proptest::prelude::*;
use tds_client::{Client, Config, Encrypt, Error, SecureLayerFactory, SqlValue};
use tds_protocol::EncryptionLevel;
use tds_testing::{
    BatchLog, DuplexServer, MockColumn, MockResponse, MockServerBuilder, MockTdsServer, ScalarValue,
    TokenStreamBuilder,
};
use tokio::task::JoinHandle;

fn config(encrypt: Encrypt) -> Config {
    Config::new()
        .host("mock")
        .credentials("sa", "secret")
        .database("appdb")
        .encrypt(encrypt)
}

/// Server side of a connected test client.
struct Mock {
    batches: BatchLog,
    task: JoinHandle<tds_testing::mock_server::Result<()>>,
}

async fn connect_plain(builder: MockServerBuilder) -> (Client, Mock) {
    let DuplexServer {
        client: transport,
        batches,
        task,
    } = builder.duplex();
    let client = Client::connect_with_secure_layer(transport, config(Encrypt::Off), None)
        .await
        .unwrap();
    (client, Mock { batches, task })
}

fn users() -> MockResponse {
    MockResponse::rows(
        vec![
            MockColumn::int("id"),
            MockColumn::nvarchar("name", 50),
            MockColumn::decimal("balance", 10, 2),
        ],
        vec![
            vec![
                ScalarValue::Int(1),
                ScalarValue::String("Alice".into()),
                ScalarValue::Decimal(1234),
            ],
            vec![ScalarValue::Int(2), ScalarValue::Null, ScalarValue::Decimal(-50)],
        ],
    )
}

#[tokio::test]
async fn test_plain_query_streams_rows() {
    let (client, mock) =
        connect_plain(MockTdsServer::builder().with_response("SELECT * FROM users", users())).await;
    assert_eq!(client.session().database.as_deref(), Some("appdb"));

    let mut stream = client.query("SELECT * FROM users").await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.get::<i32>("id").unwrap(), 1);
    assert_eq!(first.get::<String>("name").unwrap(), "Alice");
    match first.value("balance").unwrap() {
        SqlValue::Decimal(d) => assert_eq!(d.to_string(), "12.34"),
        other => panic!("unexpected {other:?}"),
    }

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.get::<Option<String>>("name").unwrap(), None);
    assert!(second.is_null("name"));

    assert!(stream.next().await.is_none());
    assert_eq!(stream.summary().unwrap().rows_affected, 2);
    assert_eq!(mock.batches.batches().await, vec!["SELECT * FROM users"]);
}

#[tokio::test]
async fn test_scrambled_session() {
    let transport = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::On)
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .duplex()
        .client;

    let layer = ScrambleLayer::new();
    let secure: Arc<dyn SecureLayerFactory> = layer.clone();
    let client = Client::connect_with_secure_layer(transport, config(Encrypt::On), Some(secure))
        .await
        .unwrap();
    assert_eq!(layer.created(), 1);
    assert_eq!(client.session().server_encryption, Some(EncryptionLevel::On));

    let values = client.query_values("SELECT 1").await.unwrap();
    assert_eq!(values, vec![vec![(String::new(), SqlValue::Int(1))]]);
}

#[tokio::test]
async fn test_server_error_fails_only_that_query() {
    let (client, _mock) = connect_plain(
        MockTdsServer::builder()
            .with_response("SELECT * FROM nope", MockResponse::error(208, "Invalid object name 'nope'."))
            .with_response("SELECT 1", MockResponse::scalar_int(1)),
    )
    .await;

    let err = client
        .query("SELECT * FROM nope")
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap_err();
    assert!(err.is_server_error(208), "got {err:?}");

    let rows = client.query("SELECT 1").await.unwrap().collect_all().await.unwrap();
    assert_eq!(rows[0].get_at::<i32>(0).unwrap(), 1);
}

#[tokio::test]
async fn test_login_failure() {
    let transport = MockTdsServer::builder()
        .with_login_failure(18456, "Login failed for user 'sa'.")
        .duplex()
        .client;

    let err = Client::connect_with_secure_layer(transport, config(Encrypt::Off), None)
        .await
        .unwrap_err();
    match err {
        Error::Login { number, message } => {
            assert_eq!(number, 18456);
            assert!(message.contains("Login failed"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_encryption_without_secure_layer() {
    let transport = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::Required)
        .duplex()
        .client;

    let err = Client::connect_with_secure_layer(transport, config(Encrypt::Off), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {err:?}");
}

#[tokio::test]
async fn test_execute_returns_row_count() {
    let multi = TokenStreamBuilder::new()
        .done_in_proc(3)
        .done_in_proc(4)
        .done(0)
        .build();
    let (client, _mock) = connect_plain(
        MockTdsServer::builder()
            .with_response("DELETE FROM t", MockResponse::affected(5))
            .with_response("EXEC two_updates", MockResponse::Raw(multi)),
    )
    .await;

    assert_eq!(client.execute("DELETE FROM t").await.unwrap(), 5);
    assert_eq!(client.execute("EXEC two_updates").await.unwrap(), 7);
}

#[tokio::test]
async fn test_packet_size_change_is_applied() {
    let (client, _mock) = connect_plain(MockTdsServer::builder().with_packet_size(8192)).await;
    assert_eq!(client.session().packet_size, 8192);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clones_share_connection_without_crosstalk() {
    let echo = MockResponse::custom(|sql| {
        TokenStreamBuilder::new()
            .col_metadata(&[MockColumn::nvarchar("sql", 100)])
            .row(&[ScalarValue::String(sql.to_string())])
            .done(1)
            .build()
    });
    let (client, mock) = connect_plain(MockTdsServer::builder().with_default_response(echo)).await;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let sql = format!("SELECT {i}");
            let rows = client.query(sql.clone()).await.unwrap().collect_all().await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get::<String>("sql").unwrap(), sql);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(mock.batches.batches().await.len(), 16);
}

#[tokio::test]
async fn test_concurrent_executes_on_one_handle() {
    let (client, mock) = connect_plain(MockTdsServer::builder()).await;

    let a = client.execute("UPDATE a");
    let b = client.execute("UPDATE b");
    let c = client.execute("UPDATE c");
    let (a, b, c) = tokio::join!(a, b, c);
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let mut batches = mock.batches.batches().await;
    batches.sort();
    assert_eq!(batches, vec!["UPDATE a", "UPDATE b", "UPDATE c"]);
}

#[tokio::test]
async fn test_close_rejects_new_requests() {
    let (client, _mock) = connect_plain(MockTdsServer::builder()).await;
    let other = client.clone();

    client.close().await;
    assert!(matches!(
        other.execute("SELECT 1").await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_server_hangup_fails_pending_query() {
    let hang = MockResponse::Raw(Bytes::from_static(&[0xD1]));
    let (client, mock) =
        connect_plain(MockTdsServer::builder().with_response("SELECT hang", hang)).await;

    // A lone ROW token with no metadata fails the query, not the connection.
    let err = client.query("SELECT hang").await.unwrap().collect_all().await.unwrap_err();
    assert!(!matches!(err, Error::ConnectionClosed), "got {err:?}");

    mock.task.abort();
    let _ = mock.task.await;
    let err = client.execute("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed | Error::Io(_)), "got {err:?}");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_rows_survive_any_packet_split(packet_size in 9usize..200, count in 0usize..40) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let rows: Vec<Vec<ScalarValue>> = (0..count)
                .map(|i| vec![
                    ScalarValue::Int(i as i32),
                    ScalarValue::String(format!("row number {i}")),
                ])
                .collect();
            let response = MockResponse::rows(
                vec![MockColumn::int("n"), MockColumn::nvarchar_max("label")],
                rows,
            );
            let (client, _mock) = connect_plain(
                MockTdsServer::builder()
                    .with_response_packet_size(packet_size)
                    .with_response("SELECT rows", response),
            )
            .await;

            let got = client.query("SELECT rows").await.unwrap().collect_all().await.unwrap();
            assert_eq!(got.len(), count);
            for (i, row) in got.iter().enumerate() {
                assert_eq!(row.get::<i32>("n").unwrap(), i as i32);
                assert_eq!(row.get::<String>("label").unwrap(), format!("row number {i}"));
            }
        });
    }
}
