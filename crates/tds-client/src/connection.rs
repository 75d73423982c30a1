//! The connection actor.
//!
//! One task per connection owns the transport and the [`ConnectionCore`].
//! It waits on either a command from a [`Client`](crate::Client) handle or
//! bytes from the transport, runs the core synchronously, and writes
//! whatever the core produced before waiting again. While the request in
//! flight reports backpressure, the transport is not read.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::engine::ConnectionCore;
use crate::error::Error;
use crate::request::Request;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Message from a client handle to the actor.
pub(crate) enum Command {
    /// Queue a request.
    Send(Box<dyn Request>),
    /// Close the connection.
    Close,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send(request) => f.debug_tuple("Send").field(&request.name()).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Drive a connection until it closes.
pub(crate) async fn run<T>(mut core: ConnectionCore, io: T, mut commands: mpsc::Receiver<Command>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        if let Err(e) = flush(&mut core, &mut writer).await {
            tracing::warn!(error = %e, "write to transport failed");
            core.abort(Error::Io(e));
        }
        if core.is_closed() {
            break;
        }

        match core.backpressure() {
            Some(wait) => {
                tracing::trace!("request is backed up, pausing reads");
                tokio::select! {
                    command = commands.recv() => on_command(&mut core, command),
                    () = wait => {}
                }
            }
            None => {
                tokio::select! {
                    command = commands.recv() => on_command(&mut core, command),
                    read = read_chunk(&mut reader, &mut buffer) => match read {
                        Ok(0) => {
                            tracing::debug!("transport reached end of stream");
                            core.transport_closed();
                        }
                        Ok(n) => {
                            tracing::trace!(bytes = n, "read from transport");
                            core.receive(buffer.split().freeze());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "read from transport failed");
                            core.abort(Error::Io(e));
                        }
                    },
                }
            }
        }
    }

    // A close may still have bytes queued.
    if let Err(e) = flush(&mut core, &mut writer).await {
        tracing::debug!(error = %e, "final flush failed");
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "transport shutdown failed");
    }

    commands.close();
    while let Some(command) = commands.recv().await {
        if let Command::Send(request) = command {
            core.enqueue(request);
        }
    }
    tracing::debug!("connection actor stopped");
}

fn on_command(core: &mut ConnectionCore, command: Option<Command>) {
    match command {
        Some(Command::Send(request)) => core.enqueue(request),
        Some(Command::Close) => {
            tracing::debug!("close requested");
            core.close();
        }
        None => {
            tracing::debug!("all client handles dropped");
            core.close();
        }
    }
}

async fn read_chunk<T: AsyncRead>(
    reader: &mut ReadHalf<T>,
    buffer: &mut BytesMut,
) -> std::io::Result<usize> {
    buffer.reserve(READ_BUFFER_SIZE);
    reader.read_buf(buffer).await
}

async fn flush<T: AsyncWrite>(
    core: &mut ConnectionCore,
    writer: &mut WriteHalf<T>,
) -> std::io::Result<()> {
    let chunks = core.take_outbound();
    if chunks.is_empty() {
        return Ok(());
    }
    for chunk in chunks {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Encrypt;
    use crate::request::Session;
    use crate::requests::PreloginRequest;
    use crate::state::ConnectionState;
    use bytes::Bytes;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tds_codec::{Message, PacketSequence, TdsCodec};
    use tokio::io::ReadBuf;
    use tds_protocol::{EncryptionLevel, PacketType, PreLogin};
    use tokio_util::codec::Encoder;

    fn framed(packet_type: PacketType, payload: Bytes) -> Bytes {
        let mut codec = TdsCodec::new();
        let mut dst = BytesMut::new();
        for packet in Message::new(packet_type, payload).into_packets(4096, &mut PacketSequence::new()) {
            codec.encode(packet, &mut dst).unwrap();
        }
        dst.freeze()
    }

    #[tokio::test]
    async fn test_actor_writes_request_and_routes_reply() {
        let request = PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .with_thread_id(std::process::id())
            .encode();
        let reply = PreLogin::new()
            .with_encryption(EncryptionLevel::NotSupported)
            .encode();
        let transport = tokio_test::io::Builder::new()
            .write(&framed(PacketType::PreLogin, request))
            .read(&framed(PacketType::TabularResult, reply))
            .build();

        let core = ConnectionCore::new(Session::new("localhost", 4096), None).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let actor = tokio::spawn(run(core, transport, rx));

        let (prelogin, done) = PreloginRequest::new(Encrypt::NotSupported);
        tx.send(Command::Send(Box::new(prelogin))).await.unwrap();
        done.await.unwrap().unwrap();

        // The scripted transport reports end of stream once its script ran out.
        actor.await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_requests_after_close_are_failed() {
        let transport = tokio_test::io::Builder::new().build();
        let core = ConnectionCore::new(Session::new("localhost", 4096), None).unwrap();
        assert_eq!(core.state(), ConnectionState::Initial);
        let (tx, rx) = mpsc::channel(4);

        let (prelogin, done) = PreloginRequest::new(Encrypt::NotSupported);
        tx.send(Command::Close).await.unwrap();
        tx.send(Command::Send(Box::new(prelogin))).await.unwrap();
        run(core, transport, rx).await;

        assert!(matches!(done.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    /// Transport whose shutdown always fails.
    struct BrokenShutdown(tokio_test::io::Mock);

    impl AsyncRead for BrokenShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }
    }

    #[tokio::test]
    async fn test_failed_shutdown_still_stops_actor() {
        let transport = BrokenShutdown(tokio_test::io::Builder::new().build());
        let core = ConnectionCore::new(Session::new("localhost", 4096), None).unwrap();
        let (tx, rx) = mpsc::channel(4);

        let (first, first_done) = PreloginRequest::new(Encrypt::NotSupported);
        let (second, second_done) = PreloginRequest::new(Encrypt::NotSupported);
        tx.send(Command::Close).await.unwrap();
        tx.send(Command::Send(Box::new(first))).await.unwrap();
        tx.send(Command::Send(Box::new(second))).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), run(core, transport, rx))
            .await
            .unwrap();

        assert!(matches!(first_done.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(second_done.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(tx.is_closed());
    }
}
