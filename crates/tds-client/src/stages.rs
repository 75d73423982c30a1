//! The concrete pipeline stages.
//!
//! A fresh connection runs `[packet-decoder, packet-encoder]`. During the
//! TLS upgrade the pipeline is
//! `[packet-decoder, packet-encoder, prelogin-coordinator, tls]`: TLS
//! records travel inside PRELOGIN packets, so the coordinator unwraps them
//! for the TLS stage and wraps the TLS stage's output again. Once the
//! handshake completes the pipeline becomes `[tls, packet-decoder,
//! packet-encoder]` and every byte on the wire is encrypted.

use bytes::BytesMut;
use tds_codec::{CodecError, Message, TdsCodec};
use tds_protocol::PacketType;
use tds_tls::{TlsConfig, TlsConnector, TlsSession};
use tokio_util::codec::Encoder;

use crate::error::{Error, Result};
use crate::pipeline::{Frame, Stage, StageContext, StageEvent};

/// Name of the inbound packet framing stage.
pub const DECODER: &str = "packet-decoder";
/// Name of the outbound packet framing stage.
pub const ENCODER: &str = "packet-encoder";
/// Name of the PRELOGIN wrapping stage used during the TLS handshake.
pub const COORDINATOR: &str = "prelogin-coordinator";
/// Name of the secure layer stage.
pub const TLS: &str = "tls";

/// Splits inbound bytes into packets.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    codec: TdsCodec,
    buffer: BytesMut,
}

impl PacketDecoder {
    /// Create a decoder accepting packets up to the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for PacketDecoder {
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        match frame {
            Frame::Bytes(bytes) => {
                self.buffer.extend_from_slice(&bytes);
                for packet in self.codec.decode_all(&mut self.buffer)? {
                    ctx.emit_inbound(Frame::Packet(packet));
                }
            }
            packet @ Frame::Packet(_) => ctx.emit_inbound(packet),
        }
        Ok(())
    }

    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.emit_outbound(frame);
        Ok(())
    }

    fn on_eof(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TruncatedStream {
                buffered: self.buffer.len(),
            }
            .into())
        }
    }

    fn take_buffered(&mut self) -> Option<bytes::Bytes> {
        (!self.buffer.is_empty()).then(|| self.buffer.split().freeze())
    }
}

/// Serializes outbound packets.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    codec: TdsCodec,
}

impl PacketEncoder {
    /// Create an encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for PacketEncoder {
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.emit_inbound(frame);
        Ok(())
    }

    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        match frame {
            Frame::Packet(packet) => {
                let mut dst = BytesMut::with_capacity(packet.total_size());
                self.codec.encode(packet, &mut dst)?;
                ctx.emit_outbound(Frame::Bytes(dst.freeze()));
            }
            bytes @ Frame::Bytes(_) => ctx.emit_outbound(bytes),
        }
        Ok(())
    }
}

/// Carries TLS records inside PRELOGIN packets while the handshake runs.
#[derive(Debug, Default)]
pub struct PreloginCoordinator;

impl Stage for PreloginCoordinator {
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        match frame {
            Frame::Packet(packet) if packet.header.packet_type == PacketType::PreLogin => {
                tracing::trace!(len = packet.payload.len(), "unwrapped TLS handshake data");
                if !packet.payload.is_empty() {
                    ctx.emit_inbound(Frame::Bytes(packet.payload));
                }
                Ok(())
            }
            Frame::Packet(packet) => Err(Error::Pipeline(format!(
                "unexpected {:?} packet during TLS handshake",
                packet.header.packet_type
            ))),
            bytes @ Frame::Bytes(_) => {
                ctx.emit_inbound(bytes);
                Ok(())
            }
        }
    }

    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        match frame {
            Frame::Bytes(bytes) => {
                tracing::trace!(len = bytes.len(), "wrapping TLS handshake data");
                let packet_size = ctx.packet_size();
                let packets = Message::new(PacketType::PreLogin, bytes)
                    .into_packets(packet_size, ctx.sequence());
                for packet in packets {
                    ctx.emit_outbound(Frame::Packet(packet));
                }
            }
            packet @ Frame::Packet(_) => ctx.emit_outbound(packet),
        }
        Ok(())
    }
}

/// Creates the secure layer stage for the encryption upgrade.
pub trait SecureLayerFactory: Send + Sync {
    /// Build a stage for a session with `host`.
    ///
    /// The stage starts its handshake in [`Stage::on_added`] and raises
    /// [`StageEvent::HandshakeCompleted`] when it is done.
    fn create(&self, host: &str) -> Result<Box<dyn Stage>>;
}

/// Secure layer backed by rustls.
#[derive(Debug, Clone)]
pub struct RustlsLayer {
    config: TlsConfig,
}

impl RustlsLayer {
    /// Create a factory for the given TLS settings.
    #[must_use]
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }
}

impl SecureLayerFactory for RustlsLayer {
    fn create(&self, host: &str) -> Result<Box<dyn Stage>> {
        let connector = TlsConnector::new(self.config.clone())?;
        let session = connector.session(host)?;
        Ok(Box::new(TlsStage::new(session)))
    }
}

/// Encrypts outbound bytes and decrypts inbound bytes.
#[derive(Debug)]
pub struct TlsStage {
    session: TlsSession,
    handshaking: bool,
}

impl TlsStage {
    /// Wrap a fresh client session.
    #[must_use]
    pub fn new(session: TlsSession) -> Self {
        Self {
            session,
            handshaking: true,
        }
    }

    fn flush(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let ciphertext = self.session.take_tls()?;
        if !ciphertext.is_empty() {
            ctx.emit_outbound(Frame::Bytes(ciphertext));
        }
        Ok(())
    }
}

impl Stage for TlsStage {
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        let Frame::Bytes(ciphertext) = frame else {
            return Err(Error::Pipeline("TLS stage received a framed packet".into()));
        };

        let plaintext = self.session.read_tls(&ciphertext)?;
        self.flush(ctx)?;

        if self.handshaking && !self.session.is_handshaking() {
            self.handshaking = false;
            tracing::debug!("TLS handshake completed");
            ctx.raise(StageEvent::HandshakeCompleted);
        }
        if !plaintext.is_empty() {
            ctx.emit_inbound(Frame::Bytes(plaintext));
        }
        Ok(())
    }

    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        let Frame::Bytes(plaintext) = frame else {
            return Err(Error::Pipeline("TLS stage asked to write a framed packet".into()));
        };
        self.session.write_plaintext(&plaintext)?;
        self.flush(ctx)
    }

    fn on_added(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        tracing::debug!("starting TLS handshake");
        self.flush(ctx)
    }
}
