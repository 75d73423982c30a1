//! A stand-in secure layer for exercising the encryption upgrade.
//!
//! Real TLS needs certificates on both ends. The scrambled handshake keeps
//! the same shape (a client hello, a server hello, a finished message from
//! each side, all carried in PRELOGIN packets) and afterwards XORs every
//! byte on the wire with [`SCRAMBLE_KEY`]. That is enough to prove that
//! framing really moved behind the secure layer: a peer that forgot to
//! switch sees garbage packet headers.
//!
//! Handshake, as seen on the wire:
//!
//! ```text
//! client -> PRELOGIN(CLIENT_HELLO)
//! server -> PRELOGIN(SERVER_HELLO)
//! client -> PRELOGIN(CLIENT_FINISHED)
//! server -> PRELOGIN(SERVER_FINISHED)
//! ... every later byte is scrambled in both directions
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Key every post-handshake byte is XORed with.
pub const SCRAMBLE_KEY: u8 = 0x5A;
/// First client handshake message.
pub const CLIENT_HELLO: &[u8] = b"SCRAMBLE-CLIENT-HELLO";
/// Server reply to [`CLIENT_HELLO`].
pub const SERVER_HELLO: &[u8] = b"SCRAMBLE-SERVER-HELLO";
/// Client message ending its side of the handshake.
pub const CLIENT_FINISHED: &[u8] = b"SCRAMBLE-CLIENT-FINISHED";
/// Server message ending the handshake.
pub const SERVER_FINISHED: &[u8] = b"SCRAMBLE-SERVER-FINISHED";

/// XOR `data` in place with [`SCRAMBLE_KEY`]. Applying it twice restores
/// the input.
pub fn scramble(data: &mut [u8]) {
    for byte in data {
        *byte ^= SCRAMBLE_KEY;
    }
}

/// Transport wrapper that scrambles reads and writes once switched on.
///
/// Each direction is switched independently so the server can start
/// descrambling before it sends its final plain handshake message.
#[derive(Debug)]
pub struct Scrambled<T> {
    inner: T,
    read: bool,
    write: bool,
}

impl<T> Scrambled<T> {
    /// Wrap a transport with scrambling off in both directions.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            read: false,
            write: false,
        }
    }

    /// Descramble bytes read from now on.
    pub fn set_read(&mut self, on: bool) {
        self.read = on;
    }

    /// Scramble bytes written from now on.
    pub fn set_write(&mut self, on: bool) {
        self.write = on;
    }

    /// Whether both directions are scrambled.
    pub fn is_active(&self) -> bool {
        self.read && self.write
    }

    /// Unwrap the transport.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Scrambled<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if this.read {
            if let Poll::Ready(Ok(())) = result {
                scramble(&mut buf.filled_mut()[start..]);
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Scrambled<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write {
            // XOR is per byte, so a short write leaves nothing to undo.
            let mut scrambled = buf.to_vec();
            scramble(&mut scrambled);
            Pin::new(&mut this.inner).poll_write(cx, &scrambled)
        } else {
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
