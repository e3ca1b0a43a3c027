//! Per-channel double buffers inside the driver process.
//!
//! Every channel owns `2 * frames` fixed-point samples split into two
//! segments. A single `toggle` selects the segment the host works on this
//! cycle; the output conversion always reads the other one, so the host never
//! sees a segment that is being refreshed.

use crate::convert::{convert_to_fixed, convert_to_float, OverflowPolicy};
use crate::error::{BridgeError, Result};
use crate::layout::Direction;
use crate::shm::SampleSegment;

#[derive(Debug, Clone)]
pub struct Channel {
    active: bool,
    buffer: Box<[i32]>,
}

impl Channel {
    fn new(frames: usize) -> Self {
        Self {
            active: false,
            buffer: vec![0; frames * 2].into_boxed_slice(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn segment(&self, frames: usize, index: usize) -> &[i32] {
        &self.buffer[index * frames..(index + 1) * frames]
    }

    fn segment_mut(&mut self, frames: usize, index: usize) -> &mut [i32] {
        &mut self.buffer[index * frames..(index + 1) * frames]
    }
}

#[derive(Debug)]
pub struct ChannelStore {
    frames: usize,
    inputs: Vec<Channel>,
    outputs: Vec<Channel>,
    toggle: usize,
}

impl ChannelStore {
    pub fn new(inputs: usize, outputs: usize, frames: usize) -> Self {
        Self {
            frames,
            inputs: (0..inputs).map(|_| Channel::new(frames)).collect(),
            outputs: (0..outputs).map(|_| Channel::new(frames)).collect(),
            toggle: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel_count(&self, direction: Direction) -> usize {
        self.channels(direction).len()
    }

    fn channels(&self, direction: Direction) -> &[Channel] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    fn channels_mut(&mut self, direction: Direction) -> &mut [Channel] {
        match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        }
    }

    /// Segment index the host works on during the current cycle.
    #[inline]
    pub fn toggle(&self) -> usize {
        self.toggle
    }

    /// Segment index the output conversion reads during the current cycle.
    #[inline]
    pub fn output_read_index(&self) -> usize {
        1 - self.toggle
    }

    #[inline]
    pub fn flip(&mut self) {
        self.toggle ^= 1;
    }

    /// Marks a channel as registered by the host.
    pub fn activate(&mut self, direction: Direction, channel: i64) -> Result<()> {
        let count = self.channel_count(direction);
        let index = usize::try_from(channel)
            .ok()
            .filter(|&index| index < count)
            .ok_or_else(|| BridgeError::invalid(format!("{direction} channel {channel}")))?;
        self.channels_mut(direction)[index].active = true;
        Ok(())
    }

    pub fn deactivate_all(&mut self) {
        for channel in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            channel.active = false;
        }
    }

    pub fn is_active(&self, direction: Direction, channel: usize) -> Option<bool> {
        self.channels(direction).get(channel).map(Channel::is_active)
    }

    pub fn segment(&self, direction: Direction, channel: usize, index: usize) -> Option<&[i32]> {
        if index > 1 {
            return None;
        }
        let frames = self.frames;
        self.channels(direction)
            .get(channel)
            .map(|c| c.segment(frames, index))
    }

    /// Converts every active input channel into segment `toggle`.
    pub fn load_inputs(&mut self, samples: &SampleSegment, policy: OverflowPolicy) {
        let (frames, index) = (self.frames, self.toggle);
        for (ch, channel) in self.inputs.iter_mut().enumerate() {
            if !channel.active {
                continue;
            }
            if let Some(src) = samples.channel(Direction::Input, ch) {
                convert_to_fixed(src, channel.segment_mut(frames, index), policy);
            }
        }
    }

    /// Converts segment `1 - toggle` of every active output channel into the
    /// output section.
    pub fn store_outputs(&self, samples: &mut SampleSegment) {
        let (frames, index) = (self.frames, self.output_read_index());
        for (ch, channel) in self.outputs.iter().enumerate() {
            if !channel.active {
                continue;
            }
            if let Some(dst) = samples.channel_mut(Direction::Output, ch) {
                convert_to_float(channel.segment(frames, index), dst);
            }
        }
    }

    /// View handed to the host callback for this cycle.
    pub fn host_buffers(&mut self) -> HostBuffers<'_> {
        HostBuffers {
            index: self.toggle,
            frames: self.frames,
            inputs: &self.inputs,
            outputs: &mut self.outputs,
        }
    }
}

/// The host's window onto the double buffers during one callback.
///
/// Only active channels are reachable and only segment [`index`](Self::index)
/// of each, mirroring the buffer index passed to `bufferSwitch`.
#[derive(Debug)]
pub struct HostBuffers<'a> {
    index: usize,
    frames: usize,
    inputs: &'a [Channel],
    outputs: &'a mut [Channel],
}

impl<'a> HostBuffers<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, channel: usize) -> Option<&[i32]> {
        self.inputs
            .get(channel)
            .filter(|c| c.active)
            .map(|c| c.segment(self.frames, self.index))
    }

    pub fn output_mut(&mut self, channel: usize) -> Option<&mut [i32]> {
        let (frames, index) = (self.frames, self.index);
        self.outputs
            .get_mut(channel)
            .filter(|c| c.active)
            .map(|c| c.segment_mut(frames, index))
    }

    /// An active input and an active output at the same time.
    pub fn io_mut(&mut self, input: usize, output: usize) -> Option<(&[i32], &mut [i32])> {
        let (frames, index) = (self.frames, self.index);
        let src = self.inputs.get(input).filter(|c| c.active)?;
        let dst = self.outputs.get_mut(output).filter(|c| c.active)?;
        Some((src.segment(frames, index), dst.segment_mut(frames, index)))
    }
}
