//! Server-side half of the bridge, run once per audio-server cycle.

use crate::error::Result;
use crate::handshake::{Exchange, ServerHandshake};
use crate::layout::Direction;
use crate::rt;
use crate::sem::Semaphore;
use crate::shm::{ControlSegment, SampleSegment};

/// Transport state reported by the audio server for the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transport {
    pub rolling: bool,
    pub frame: u64,
}

/// The audio server's view of one processing cycle.
///
/// Port indices are zero based and match [`crate::layout::port_name`].
pub trait CycleIo {
    /// Frames in this cycle.
    fn frames(&self) -> usize;
    fn input_ports(&self) -> usize;
    fn output_ports(&self) -> usize;
    fn input(&self, port: usize) -> &[f32];
    fn output(&mut self, port: usize) -> &mut [f32];
    fn transport(&self) -> Transport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The driver consumed the inputs and returned outputs.
    Exchanged,
    /// No driver was attached, or it detached before taking the cycle;
    /// outputs were silenced.
    Silent,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub exchanged: u64,
    pub silent: u64,
    pub failed: u64,
}

pub struct CollectorBridge<S> {
    control: ControlSegment,
    samples: SampleSegment,
    handshake: ServerHandshake<S>,
    priority_probe: fn() -> u32,
    stats: CollectorStats,
}

impl<S: Semaphore> CollectorBridge<S> {
    pub fn new(
        control: ControlSegment,
        samples: SampleSegment,
        handshake: ServerHandshake<S>,
    ) -> Self {
        Self {
            control,
            samples,
            handshake,
            priority_probe: rt::current_thread_priority,
            stats: CollectorStats::default(),
        }
    }

    /// Replaces the function used to read the calling thread's priority.
    pub fn with_priority_probe(mut self, probe: fn() -> u32) -> Self {
        self.priority_probe = probe;
        self
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    pub fn control(&self) -> &ControlSegment {
        &self.control
    }

    pub fn is_resyncing(&self) -> bool {
        self.handshake.is_resyncing()
    }

    /// Runs one cycle. Never blocks while no driver is attached; on a
    /// handshake failure the outputs are silenced and the error returned.
    pub fn process<I: CycleIo + ?Sized>(&mut self, io: &mut I) -> Result<CycleOutcome> {
        let transport = io.transport();
        let block = self.control.block();
        block.set_transport(transport.rolling, transport.frame);

        if !block.is_running() {
            block.set_priority((self.priority_probe)());
            silence(io);
            self.stats.silent += 1;
            return Ok(CycleOutcome::Silent);
        }

        // A late reply means the driver may still be reading the segment.
        if let Err(err) = self.handshake.resync() {
            silence(io);
            self.stats.failed += 1;
            return Err(err);
        }

        let params = *self.samples.params();
        let frames = io.frames().min(params.frames());

        for port in 0..params.channel_count(Direction::Input) {
            let Some(dst) = self.samples.channel_mut(Direction::Input, port) else {
                continue;
            };
            if port < io.input_ports() {
                let src = io.input(port);
                let n = frames.min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
                dst[n..].fill(0.0);
            } else {
                dst.fill(0.0);
            }
        }

        match self.handshake.exchange(|| block.is_running()) {
            Ok(Exchange::Completed) => {}
            Ok(Exchange::Detached) => {
                silence(io);
                self.stats.silent += 1;
                return Ok(CycleOutcome::Silent);
            }
            Err(err) => {
                silence(io);
                self.stats.failed += 1;
                return Err(err);
            }
        }

        for port in 0..io.output_ports() {
            let dst = io.output(port);
            match self.samples.channel(Direction::Output, port) {
                Some(src) => {
                    let n = frames.min(dst.len());
                    dst[..n].copy_from_slice(&src[..n]);
                    dst[n..].fill(0.0);
                }
                None => dst.fill(0.0),
            }
        }

        self.stats.exchanged += 1;
        tracing::trace!(frame = transport.frame, "cycle exchanged");
        Ok(CycleOutcome::Exchanged)
    }
}

fn silence<I: CycleIo + ?Sized>(io: &mut I) {
    for port in 0..io.output_ports() {
        io.output(port).fill(0.0);
    }
}

/// Plain in-memory [`CycleIo`] with planar buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarCycle {
    pub inputs: Vec<Vec<f32>>,
    pub outputs: Vec<Vec<f32>>,
    pub transport: Transport,
}

impl PlanarCycle {
    pub fn new(inputs: usize, outputs: usize, frames: usize) -> Self {
        Self {
            inputs: vec![vec![0.0; frames]; inputs],
            outputs: vec![vec![0.0; frames]; outputs],
            transport: Transport::default(),
        }
    }
}

impl CycleIo for PlanarCycle {
    fn frames(&self) -> usize {
        self.inputs
            .first()
            .or_else(|| self.outputs.first())
            .map_or(0, Vec::len)
    }

    fn input_ports(&self) -> usize {
        self.inputs.len()
    }

    fn output_ports(&self) -> usize {
        self.outputs.len()
    }

    fn input(&self, port: usize) -> &[f32] {
        &self.inputs[port]
    }

    fn output(&mut self, port: usize) -> &mut [f32] {
        &mut self.outputs[port]
    }

    fn transport(&self) -> Transport {
        self.transport
    }
}
