//! Fixed memory layouts shared by the server and driver processes.

use core::mem::size_of;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::fmt;

use crate::error::{BridgeError, Result};

pub const DEFAULT_INPUTS: u32 = 8;
pub const DEFAULT_OUTPUTS: u32 = 8;
/// Upper bound on ports per direction.
pub const MAX_CHANNELS: u32 = 1024;

/// Bytes per sample in the sample segment.
pub const SAMPLE_BYTES: usize = size_of::<f32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Server-side port name, `input-<index>` or `output-<index>`.
pub fn port_name(direction: Direction, index: usize) -> String {
    format!("{direction}-{index}")
}

/// Stream shape fixed for the life of one bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub inputs: u32,
    pub outputs: u32,
    pub buffer_frames: u32,
    pub sample_rate: u32,
}

impl StreamParams {
    pub fn new(inputs: u32, outputs: u32, buffer_frames: u32, sample_rate: u32) -> Self {
        Self {
            inputs,
            outputs,
            buffer_frames,
            sample_rate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_frames == 0 {
            return Err(BridgeError::invalid("buffer_frames must be non-zero"));
        }
        if self.sample_rate == 0 {
            return Err(BridgeError::invalid("sample_rate must be non-zero"));
        }
        if self.inputs == 0 && self.outputs == 0 {
            return Err(BridgeError::invalid("session needs at least one channel"));
        }
        if self.inputs > MAX_CHANNELS || self.outputs > MAX_CHANNELS {
            return Err(BridgeError::invalid(format!(
                "at most {MAX_CHANNELS} channels per direction, got {} in / {} out",
                self.inputs, self.outputs
            )));
        }
        if self.checked_sample_bytes().is_none() {
            return Err(BridgeError::invalid("sample segment size overflows"));
        }
        Ok(())
    }

    fn checked_sample_bytes(&self) -> Option<usize> {
        (self.inputs as usize)
            .checked_add(self.outputs as usize)?
            .checked_mul(self.frames())?
            .checked_mul(SAMPLE_BYTES)
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.buffer_frames as usize
    }

    pub fn channel_count(&self, direction: Direction) -> usize {
        match direction {
            Direction::Input => self.inputs as usize,
            Direction::Output => self.outputs as usize,
        }
    }

    /// Total number of `f32` samples in the sample segment.
    pub fn sample_len(&self) -> usize {
        self.frames() * (self.inputs as usize + self.outputs as usize)
    }

    /// Size in bytes of the sample segment.
    pub fn sample_bytes(&self) -> usize {
        self.sample_len() * SAMPLE_BYTES
    }

    /// Sample range of one channel inside the sample segment.
    pub fn channel_range(&self, direction: Direction, channel: usize) -> Option<Range<usize>> {
        if channel >= self.channel_count(direction) {
            return None;
        }
        let frames = self.frames();
        let base = match direction {
            Direction::Input => 0,
            Direction::Output => self.inputs as usize * frames,
        };
        let start = base + channel * frames;
        Some(start..start + frames)
    }

    /// Range covering every channel of one direction.
    pub fn section_range(&self, direction: Direction) -> Range<usize> {
        let split = self.inputs as usize * self.frames();
        match direction {
            Direction::Input => 0..split,
            Direction::Output => split..self.sample_len(),
        }
    }
}

/// Control block at the start of the control segment.
///
/// Field order and widths are part of the cross-process contract. Each field
/// has a single writing side:
///
/// | field | writer |
/// |---|---|
/// | `frame`, `transport_rolling` | collector, every cycle |
/// | `priority` | collector, only while `running` is false |
/// | `running` | driver callback thread |
/// | `inputs`, `outputs`, `buffer_frames`, `sample_rate` | collector, once at creation |
#[repr(C)]
#[derive(Debug, Default)]
pub struct ControlBlock {
    frame: AtomicU64,
    transport_rolling: AtomicU32,
    priority: AtomicU32,
    running: AtomicU32,
    inputs: AtomicU32,
    outputs: AtomicU32,
    buffer_frames: AtomicU32,
    sample_rate: AtomicU32,
}

pub const CONTROL_BLOCK_BYTES: usize = size_of::<ControlBlock>();

const _: () = assert!(CONTROL_BLOCK_BYTES == 40);

impl ControlBlock {
    /// Writes the immutable session fields and resets the mutable ones.
    pub fn initialize(&self, params: &StreamParams) {
        self.frame.store(0, Ordering::Relaxed);
        self.transport_rolling.store(0, Ordering::Relaxed);
        self.priority.store(0, Ordering::Relaxed);
        self.inputs.store(params.inputs, Ordering::Relaxed);
        self.outputs.store(params.outputs, Ordering::Relaxed);
        self.buffer_frames
            .store(params.buffer_frames, Ordering::Relaxed);
        self.sample_rate.store(params.sample_rate, Ordering::Relaxed);
        self.running.store(0, Ordering::Release);
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            inputs: self.inputs.load(Ordering::Acquire),
            outputs: self.outputs.load(Ordering::Acquire),
            buffer_frames: self.buffer_frames.load(Ordering::Acquire),
            sample_rate: self.sample_rate.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn set_transport(&self, rolling: bool, frame: u64) {
        self.transport_rolling
            .store(u32::from(rolling), Ordering::Relaxed);
        self.frame.store(frame, Ordering::Release);
    }

    #[inline]
    pub fn transport_rolling(&self) -> bool {
        self.transport_rolling.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_running(&self, running: bool) {
        self.running.store(u32::from(running), Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_block_matches_wire_layout() {
        assert_eq!(CONTROL_BLOCK_BYTES, 40);
        assert_eq!(core::mem::align_of::<ControlBlock>(), 8);
    }

    #[test]
    fn default_session_sample_segment_size() {
        let params = StreamParams::new(DEFAULT_INPUTS, DEFAULT_OUTPUTS, 256, 48_000);
        assert_eq!(params.sample_bytes(), 16_384);
        assert_eq!(params.sample_len(), 4_096);
    }

    #[test]
    fn channel_ranges_partition_the_segment() {
        let params = StreamParams::new(2, 3, 4, 48_000);
        assert_eq!(params.channel_range(Direction::Input, 0), Some(0..4));
        assert_eq!(params.channel_range(Direction::Input, 1), Some(4..8));
        assert_eq!(params.channel_range(Direction::Output, 0), Some(8..12));
        assert_eq!(params.channel_range(Direction::Output, 2), Some(16..20));
        assert_eq!(params.channel_range(Direction::Input, 2), None);
        assert_eq!(params.channel_range(Direction::Output, 3), None);
        assert_eq!(params.section_range(Direction::Input), 0..8);
        assert_eq!(params.section_range(Direction::Output), 8..20);
    }

    #[test]
    fn port_names_are_zero_based() {
        assert_eq!(port_name(Direction::Input, 0), "input-0");
        assert_eq!(port_name(Direction::Output, 7), "output-7");
    }

    #[test]
    fn initialize_publishes_session_shape() {
        let block = ControlBlock::default();
        block.set_running(true);
        block.set_priority(70);
        let params = StreamParams::new(8, 8, 256, 48_000);
        block.initialize(&params);
        assert_eq!(block.stream_params(), params);
        assert!(!block.is_running());
        assert_eq!(block.priority(), 0);
    }

    #[test]
    fn zero_sized_sessions_are_rejected() {
        assert!(StreamParams::new(8, 8, 0, 48_000).validate().is_err());
        assert!(StreamParams::new(0, 0, 256, 48_000).validate().is_err());
        assert!(StreamParams::new(8, 8, 256, 48_000).validate().is_ok());
    }

    #[test]
    fn oversized_channel_counts_are_rejected_without_overflow() {
        let err = StreamParams::new(u32::MAX, 1, 256, 48_000).validate().unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter(_)));
        assert!(StreamParams::new(u32::MAX, u32::MAX, u32::MAX, 48_000)
            .validate()
            .is_err());
        assert!(StreamParams::new(MAX_CHANNELS, MAX_CHANNELS, 256, 48_000)
            .validate()
            .is_ok());
        assert!(StreamParams::new(0, MAX_CHANNELS + 1, 256, 48_000)
            .validate()
            .is_err());
    }
}
