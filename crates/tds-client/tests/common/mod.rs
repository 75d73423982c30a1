//! Shared fixtures: a secure layer speaking the mock server's scrambled
//! handshake.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tds_client::{Error, Frame, Result, SecureLayerFactory, Stage, StageContext, StageEvent};
use tds_testing::scramble::{CLIENT_FINISHED, CLIENT_HELLO, SERVER_FINISHED, SERVER_HELLO, scramble};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitServerHello,
    AwaitServerFinished,
    Active,
}

/// Client side of the scrambled handshake.
#[derive(Debug)]
pub struct ScrambleStage {
    phase: Phase,
    buffer: BytesMut,
}

impl ScrambleStage {
    fn new() -> Self {
        Self {
            phase: Phase::AwaitServerHello,
            buffer: BytesMut::new(),
        }
    }

    /// Take `expected` once enough handshake bytes arrived.
    fn take(&mut self, expected: &[u8]) -> Result<bool> {
        if self.buffer.len() < expected.len() {
            return Ok(false);
        }
        let got = self.buffer.split_to(expected.len());
        if got.as_ref() != expected {
            return Err(Error::Pipeline(format!("bad handshake message {got:?}")));
        }
        Ok(true)
    }
}

impl Stage for ScrambleStage {
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        let Frame::Bytes(bytes) = frame else {
            return Err(Error::Pipeline("scramble stage got a packet".into()));
        };
        match self.phase {
            Phase::Active => {
                let mut data = bytes.to_vec();
                scramble(&mut data);
                ctx.emit_inbound(Frame::Bytes(Bytes::from(data)));
            }
            Phase::AwaitServerHello => {
                self.buffer.extend_from_slice(&bytes);
                if self.take(SERVER_HELLO)? {
                    self.phase = Phase::AwaitServerFinished;
                    ctx.emit_outbound(Frame::Bytes(Bytes::from_static(CLIENT_FINISHED)));
                }
            }
            Phase::AwaitServerFinished => {
                self.buffer.extend_from_slice(&bytes);
                if self.take(SERVER_FINISHED)? {
                    self.phase = Phase::Active;
                    ctx.raise(StageEvent::HandshakeCompleted);
                }
            }
        }
        Ok(())
    }

    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()> {
        match (self.phase, frame) {
            (Phase::Active, Frame::Bytes(bytes)) => {
                let mut data = bytes.to_vec();
                scramble(&mut data);
                ctx.emit_outbound(Frame::Bytes(Bytes::from(data)));
                Ok(())
            }
            (_, frame) => Err(Error::Pipeline(format!(
                "scramble stage cannot write {frame:?} in {:?}",
                self.phase
            ))),
        }
    }

    fn on_added(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        ctx.emit_outbound(Frame::Bytes(Bytes::from_static(CLIENT_HELLO)));
        Ok(())
    }
}

/// Factory counting how many secure layers it built.
#[derive(Debug, Default)]
pub struct ScrambleLayer {
    created: AtomicUsize,
}

impl ScrambleLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SecureLayerFactory for ScrambleLayer {
    fn create(&self, _host: &str) -> Result<Box<dyn Stage>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScrambleStage::new()))
    }
}
