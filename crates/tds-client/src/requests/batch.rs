//! SQL batch execution.

use std::collections::VecDeque;
use std::sync::Arc;

use tds_codec::{Message, Packet};
use tds_protocol::{
    PacketType, ProtocolError, RowData, ServerMessage, StreamingTokenParser, Token,
    encode_sql_batch,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::lookup::LookupTable;
use crate::request::{Backpressure, PacketResponse, Request, Session};
use super::login::apply_env_change;
use crate::row::Row;

/// Totals collected while a batch ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct BatchSummary {
    /// Sum of the counts reported by DONE and DONEINPROC tokens.
    pub rows_affected: u64,
    /// Number of result sets (COLMETADATA tokens) seen.
    pub result_sets: usize,
    /// Last RETURNSTATUS value.
    pub return_status: Option<i32>,
    /// Informational messages, in arrival order.
    pub messages: Vec<ServerMessage>,
}

/// Delivers rows to a bounded channel without blocking the connection.
///
/// Rows that do not fit are held back; the request then reports
/// backpressure so the connection stops reading until the consumer catches
/// up. A dropped receiver turns the sink into a discard.
#[derive(Debug)]
struct RowSink {
    tx: mpsc::Sender<Row>,
    backlog: VecDeque<Row>,
    closed: bool,
}

impl RowSink {
    fn new(tx: mpsc::Sender<Row>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
            closed: false,
        }
    }

    fn push(&mut self, row: Row) {
        if self.closed {
            return;
        }
        if !self.backlog.is_empty() {
            self.backlog.push_back(row);
            return;
        }
        self.offer(row);
    }

    fn offer(&mut self, row: Row) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(row)) => {
                self.backlog.push_front(row);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("row receiver dropped, discarding remaining rows");
                self.closed = true;
                self.backlog.clear();
                false
            }
        }
    }

    fn flush(&mut self) {
        while !self.closed {
            let Some(row) = self.backlog.pop_front() else {
                break;
            };
            if !self.offer(row) {
                break;
            }
        }
    }

    fn is_blocked(&self) -> bool {
        !self.closed && !self.backlog.is_empty()
    }

    /// Hand any held-back rows to a task that waits for the consumer.
    fn finish(mut self) {
        self.flush();
        if !self.is_blocked() {
            return;
        }
        let backlog = std::mem::take(&mut self.backlog);
        let tx = self.tx;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for row in backlog {
                        if tx.send(row).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!(rows = backlog.len(), "no runtime to deliver buffered rows");
            }
        }
    }
}

/// Runs one SQL batch and streams its rows.
pub struct SqlBatchRequest {
    sql: String,
    parser: StreamingTokenParser,
    table: Option<Arc<LookupTable>>,
    rows: RowSink,
    error: Option<ServerMessage>,
    summary: BatchSummary,
    done: Option<oneshot::Sender<Result<BatchSummary>>>,
}

/// Receiving halves for a batch's rows and outcome.
#[derive(Debug)]
pub struct BatchHandle {
    /// Rows in arrival order.
    pub rows: mpsc::Receiver<Row>,
    /// Outcome, sent once the response has been fully read.
    pub done: oneshot::Receiver<Result<BatchSummary>>,
}

impl SqlBatchRequest {
    /// Create a request whose rows are buffered up to `capacity` at a time.
    #[must_use]
    pub fn new(sql: impl Into<String>, capacity: usize) -> (Self, BatchHandle) {
        let (row_tx, row_rx) = mpsc::channel(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let request = Self {
            sql: sql.into(),
            parser: StreamingTokenParser::new(),
            table: None,
            rows: RowSink::new(row_tx),
            error: None,
            summary: BatchSummary::default(),
            done: Some(done_tx),
        };
        let handle = BatchHandle {
            rows: row_rx,
            done: done_rx,
        };
        (request, handle)
    }

    fn row(&mut self, data: RowData) -> Result<()> {
        let table = self
            .table
            .as_ref()
            .ok_or(ProtocolError::RowBeforeMetadata)?;
        let row = Row::new(Arc::clone(table), data)?;
        self.rows.push(row);
        Ok(())
    }

    fn token(&mut self, token: Token, session: &mut Session) -> Result<()> {
        match token {
            Token::ColMetaData(metadata) => {
                tracing::trace!(
                    columns = metadata.columns.len(),
                    generation = metadata.generation,
                    "new result set"
                );
                self.summary.result_sets += 1;
                self.table = Some(Arc::new(LookupTable::build(metadata)));
            }
            Token::Row(data) | Token::NbcRow(data) => self.row(data)?,
            Token::Done(done) | Token::DoneInProc(done) => {
                self.summary.rows_affected += done.rows_affected().unwrap_or(0);
            }
            Token::DoneProc(_) => {}
            Token::ReturnStatus(status) => self.summary.return_status = Some(status),
            Token::Error(message) => {
                tracing::debug!(
                    number = message.number,
                    class = message.class,
                    message = %message.message,
                    "server error"
                );
                self.error.get_or_insert(message);
            }
            Token::Info(message) => {
                tracing::debug!(number = message.number, message = %message.message, "server info");
                self.summary.messages.push(message);
            }
            Token::EnvChange(env) => apply_env_change(&env, session),
            Token::LoginAck(_) | Token::Order(_) => {}
        }
        Ok(())
    }
}

impl Request for SqlBatchRequest {
    fn start(&mut self, _session: &Session) -> Result<Vec<Message>> {
        tracing::debug!(sql_len = self.sql.len(), "executing SQL batch");
        Ok(vec![Message::new(
            PacketType::SqlBatch,
            encode_sql_batch(&self.sql),
        )])
    }

    fn handle(&mut self, packet: Packet, session: &mut Session) -> Result<PacketResponse> {
        let is_final = packet.is_end_of_message();
        let parsed = self.parser.feed(&packet.payload, is_final)?;
        for token in parsed.tokens {
            self.token(token, session)?;
        }

        if !is_final {
            return Ok(PacketResponse::Continue);
        }
        match self.error.take() {
            Some(message) => Err(message.into()),
            None => Ok(PacketResponse::Done),
        }
    }

    fn complete(mut self: Box<Self>, result: Result<()>, _session: &Session) {
        let outcome = result.map(|()| std::mem::take(&mut self.summary));
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
        self.rows.finish();
    }

    fn backpressure(&mut self) -> Option<Backpressure> {
        self.rows.flush();
        if !self.rows.is_blocked() {
            return None;
        }
        let tx = self.rows.tx.clone();
        Some(Box::pin(async move {
            let _ = tx.reserve().await;
        }))
    }

    fn name(&self) -> &'static str {
        "sql-batch"
    }
}

impl std::fmt::Debug for SqlBatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBatchRequest")
            .field("sql", &self.sql)
            .field("summary", &self.summary)
            .field("backlog", &self.rows.backlog.len())
            .finish_non_exhaustive()
    }
}
