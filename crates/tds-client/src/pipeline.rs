//! Byte pipeline of named stages.
//!
//! Stage 0 sits next to the transport; the last stage hands inbound frames
//! to the connection core. Inbound data moves up through [`Stage::read`],
//! outbound data moves down through [`Stage::write`]. Stages can be inserted
//! and removed by name while the connection runs, which is how the TLS
//! upgrade moves packet framing behind the encryption layer.

use bytes::Bytes;
use tds_codec::{Packet, PacketSequence};

use crate::error::{Error, Result};

/// A unit of data moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Unframed bytes.
    Bytes(Bytes),
    /// A complete TDS packet.
    Packet(Packet),
}

/// Out-of-band signal raised by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    /// The secure layer finished its handshake.
    HandshakeCompleted,
}

/// Per-call context handed to a stage.
///
/// Stages emit frames in either direction and may raise events; the
/// pipeline routes whatever was emitted once the call returns.
#[derive(Debug)]
pub struct StageContext<'a> {
    sequence: &'a mut PacketSequence,
    packet_size: usize,
    inbound: Vec<Frame>,
    outbound: Vec<Frame>,
    events: Vec<StageEvent>,
}

impl<'a> StageContext<'a> {
    fn new(link: &'a mut Link) -> Self {
        Self {
            sequence: &mut link.sequence,
            packet_size: link.packet_size,
            inbound: Vec::new(),
            outbound: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Pass a frame towards the connection core.
    pub fn emit_inbound(&mut self, frame: Frame) {
        self.inbound.push(frame);
    }

    /// Pass a frame towards the transport.
    pub fn emit_outbound(&mut self, frame: Frame) {
        self.outbound.push(frame);
    }

    /// Raise an event for the connection core.
    pub fn raise(&mut self, event: StageEvent) {
        self.events.push(event);
    }

    /// The connection's packet sequence, for stages that build packets.
    pub fn sequence(&mut self) -> &mut PacketSequence {
        self.sequence
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }
}

/// One byte-processing stage.
pub trait Stage: Send {
    /// Handle a frame moving towards the core.
    fn read(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()>;

    /// Handle a frame moving towards the transport.
    fn write(&mut self, frame: Frame, ctx: &mut StageContext<'_>) -> Result<()>;

    /// Called once after the stage is inserted.
    fn on_added(&mut self, _ctx: &mut StageContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The transport reached end of stream.
    fn on_eof(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bytes buffered but not yet turned into frames. Called on removal.
    fn take_buffered(&mut self) -> Option<Bytes> {
        None
    }
}

/// State shared by all stages of one connection.
#[derive(Debug)]
pub struct Link {
    /// Packet id counter.
    pub sequence: PacketSequence,
    /// Maximum packet size for outbound packets.
    pub packet_size: usize,
}

impl Link {
    /// Fresh link state.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self {
            sequence: PacketSequence::new(),
            packet_size,
        }
    }
}

/// A pass stopped because a stage raised an event.
#[derive(Debug)]
pub struct Interrupt {
    /// The event.
    pub event: StageEvent,
    /// Name of the stage that raised it.
    pub stage: String,
    /// Frames the stage emitted inbound, not yet passed on.
    pub pending: Vec<Frame>,
}

/// Result of pushing data through the pipeline.
#[derive(Debug, Default)]
pub struct Output {
    /// Packets that reached the core.
    pub packets: Vec<Packet>,
    /// Bytes to write to the transport.
    pub outbound: Vec<Bytes>,
    /// Set when a stage raised an event mid-pass.
    pub interrupt: Option<Interrupt>,
}

struct Entry {
    name: String,
    stage: Box<dyn Stage>,
}

/// Ordered list of named stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Entry>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage names, transport side first.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|e| e.name.as_str()).collect()
    }

    /// Whether a stage with this name is installed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Append a stage next to the core.
    pub fn add_last(
        &mut self,
        name: &str,
        stage: Box<dyn Stage>,
        link: &mut Link,
    ) -> Result<Vec<Bytes>> {
        let index = self.stages.len();
        self.insert_at(index, name, stage, link)
    }

    /// Insert a stage directly on the core side of `anchor`.
    pub fn insert_after(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
        link: &mut Link,
    ) -> Result<Vec<Bytes>> {
        let index = self.position(anchor)? + 1;
        self.insert_at(index, name, stage, link)
    }

    /// Insert a stage directly on the transport side of `anchor`.
    pub fn insert_before(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Box<dyn Stage>,
        link: &mut Link,
    ) -> Result<Vec<Bytes>> {
        let index = self.position(anchor)?;
        self.insert_at(index, name, stage, link)
    }

    /// Remove a stage by name and return it.
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Stage>> {
        let index = self.position(name)?;
        let entry = self.stages.remove(index);
        tracing::debug!(stage = name, stages = ?self.names(), "removed pipeline stage");
        Ok(entry.stage)
    }

    /// Push bytes received from the transport through every stage.
    pub fn read(&mut self, bytes: Bytes, link: &mut Link) -> Result<Output> {
        self.read_from(0, vec![Frame::Bytes(bytes)], link)
    }

    /// Continue an interrupted pass with the stage after `stage`.
    pub fn resume_after(
        &mut self,
        stage: &str,
        frames: Vec<Frame>,
        link: &mut Link,
    ) -> Result<Output> {
        let start = self.position(stage)? + 1;
        self.read_from(start, frames, link)
    }

    /// Feed frames inbound starting at `stage` itself.
    pub fn inject_at(&mut self, stage: &str, frames: Vec<Frame>, link: &mut Link) -> Result<Output> {
        let start = self.position(stage)?;
        self.read_from(start, frames, link)
    }

    /// Push packets from the core down to the transport.
    pub fn write(&mut self, packets: Vec<Packet>, link: &mut Link) -> Result<Vec<Bytes>> {
        let frames = packets.into_iter().map(Frame::Packet).collect();
        self.write_below(self.stages.len(), frames, link)
    }

    /// Tell every stage the transport hit end of stream.
    pub fn eof(&mut self) -> Result<()> {
        for entry in &mut self.stages {
            entry.stage.on_eof()?;
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| Error::Pipeline(format!("no stage named '{name}'")))
    }

    fn insert_at(
        &mut self,
        index: usize,
        name: &str,
        mut stage: Box<dyn Stage>,
        link: &mut Link,
    ) -> Result<Vec<Bytes>> {
        if self.contains(name) {
            return Err(Error::Pipeline(format!("stage '{name}' already installed")));
        }

        let mut ctx = StageContext::new(link);
        stage.on_added(&mut ctx)?;
        let StageContext {
            inbound, outbound, ..
        } = ctx;
        if !inbound.is_empty() {
            return Err(Error::Pipeline(format!(
                "stage '{name}' produced inbound data while being added"
            )));
        }

        self.stages.insert(
            index,
            Entry {
                name: name.to_string(),
                stage,
            },
        );
        tracing::debug!(stage = name, index, stages = ?self.names(), "inserted pipeline stage");

        self.write_below(index, outbound, link)
    }

    fn read_from(&mut self, start: usize, mut frames: Vec<Frame>, link: &mut Link) -> Result<Output> {
        let mut output = Output::default();

        for index in start..self.stages.len() {
            let mut next = Vec::new();
            let mut events = Vec::new();

            for frame in frames {
                let mut ctx = StageContext::new(link);
                self.stages[index].stage.read(frame, &mut ctx)?;
                let StageContext {
                    inbound,
                    outbound,
                    events: raised,
                    ..
                } = ctx;
                next.extend(inbound);
                if !outbound.is_empty() {
                    output
                        .outbound
                        .extend(self.write_below(index, outbound, link)?);
                }
                events.extend(raised);
            }

            if let Some(event) = events.into_iter().next() {
                output.interrupt = Some(Interrupt {
                    event,
                    stage: self.stages[index].name.clone(),
                    pending: next,
                });
                return Ok(output);
            }
            frames = next;
        }

        for frame in frames {
            match frame {
                Frame::Packet(packet) => output.packets.push(packet),
                Frame::Bytes(bytes) => {
                    return Err(Error::Pipeline(format!(
                        "{} unframed bytes reached the connection",
                        bytes.len()
                    )));
                }
            }
        }
        Ok(output)
    }

    /// Run frames down through the stages below `index`.
    fn write_below(&mut self, index: usize, mut frames: Vec<Frame>, link: &mut Link) -> Result<Vec<Bytes>> {
        for stage_index in (0..index).rev() {
            let mut next = Vec::new();
            for frame in frames {
                let mut ctx = StageContext::new(link);
                self.stages[stage_index].stage.write(frame, &mut ctx)?;
                if !ctx.inbound.is_empty() || !ctx.events.is_empty() {
                    return Err(Error::Pipeline(format!(
                        "stage '{}' produced inbound data while writing",
                        self.stages[stage_index].name
                    )));
                }
                next.extend(ctx.outbound);
            }
            frames = next;
        }

        frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bytes(bytes) => Ok(bytes),
                Frame::Packet(packet) => Err(Error::Pipeline(format!(
                    "unencoded {:?} packet reached the transport",
                    packet.header.packet_type
                ))),
            })
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.names())
            .finish()
    }
}
