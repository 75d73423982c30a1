//! Streaming query results.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::requests::{BatchHandle, BatchSummary};
use crate::row::Row;

/// Rows of a SQL batch, in the order the server sent them.
///
/// Yields every row, then `Err` if the batch failed. The summary of a
/// successful batch is available from [`RowStream::summary`] once the
/// stream has ended.
///
/// Dropping the stream early discards the remaining rows; the connection
/// still reads the rest of the response.
///
/// ```rust,ignore
/// use futures_util::StreamExt;
///
/// let mut rows = client.query("SELECT name FROM sys.databases").await?;
/// while let Some(row) = rows.next().await {
///     let name: String = row?.get("name")?;
/// }
/// ```
#[derive(Debug)]
pub struct RowStream {
    rows: mpsc::Receiver<Row>,
    done: Option<oneshot::Receiver<Result<BatchSummary>>>,
    summary: Option<BatchSummary>,
}

impl RowStream {
    pub(crate) fn new(handle: BatchHandle) -> Self {
        Self {
            rows: handle.rows,
            done: Some(handle.done),
            summary: None,
        }
    }

    /// Totals of the finished batch; `None` until the stream ended.
    #[must_use]
    pub fn summary(&self) -> Option<&BatchSummary> {
        self.summary.as_ref()
    }

    /// Collect every remaining row.
    pub async fn collect_all(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match this.rows.poll_recv(cx) {
            Poll::Ready(Some(row)) => return Poll::Ready(Some(Ok(row))),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        let Some(done) = this.done.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = match Pin::new(done).poll(cx) {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => return Poll::Pending,
        };
        this.done = None;

        match outcome {
            Ok(Ok(summary)) => {
                this.summary = Some(summary);
                Poll::Ready(None)
            }
            Ok(Err(e)) => Poll::Ready(Some(Err(e))),
            Err(_) => Poll::Ready(Some(Err(Error::ConnectionClosed))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::requests::SqlBatchRequest;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_error_follows_rows() {
        let (request, handle) = SqlBatchRequest::new("SELECT 1", 4);
        let mut stream = RowStream::new(handle);
        drop(request);

        match stream.next().await {
            Some(Err(Error::ConnectionClosed)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.is_none());
        assert!(stream.summary().is_none());
    }
}
