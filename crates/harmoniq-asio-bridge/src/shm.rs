//! Named shared-memory segments backed by memory-mapped files.
//!
//! On Linux the default directory is `/dev/shm`, so a segment named
//! `harmoniq-bridge-info` is the same object `shm_open("/harmoniq-bridge-info")`
//! would return. Both processes map the file with `MAP_SHARED`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{BridgeError, Result};
use crate::layout::{ControlBlock, Direction, StreamParams, CONTROL_BLOCK_BYTES};

#[derive(Debug)]
pub struct SharedSegment {
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedSegment {
    /// Creates the named segment and maps `len` zeroed bytes. A stale object
    /// with the same name is unlinked first, so old mappings keep their own
    /// backing memory.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref();
        Self::unlink(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(path, &file, len)
    }

    /// Maps an existing segment. Never creates the backing object.
    pub fn open(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment holds {actual} bytes, expected {len}"),
            ));
        }
        Self::map(path, &file, len)
    }

    fn map(path: &Path, file: &File, len: usize) -> io::Result<Self> {
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// Removes the segment name. Existing mappings stay valid until dropped.
    pub fn unlink(path: impl AsRef<Path>) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Mapping of the control segment.
#[derive(Debug)]
pub struct ControlSegment {
    segment: SharedSegment,
}

impl ControlSegment {
    pub fn create(path: impl AsRef<Path>, params: &StreamParams) -> Result<Self> {
        let path = path.as_ref();
        let segment = SharedSegment::create(path, CONTROL_BLOCK_BYTES).map_err(|source| {
            BridgeError::ControlSegmentUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let control = Self { segment };
        control.block().initialize(params);
        Ok(control)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let segment = SharedSegment::open(path, CONTROL_BLOCK_BYTES).map_err(|source| {
            BridgeError::ControlSegmentUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self { segment })
    }

    #[inline]
    pub fn block(&self) -> &ControlBlock {
        // Mappings are page aligned and at least CONTROL_BLOCK_BYTES long; the
        // block consists of atomics, so shared access from both processes is sound.
        unsafe { &*(self.segment.mmap.as_ptr() as *const ControlBlock) }
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }
}

/// Mapping of the sample segment: `inputs` channels followed by `outputs`
/// channels, `buffer_frames` floats each.
#[derive(Debug)]
pub struct SampleSegment {
    segment: SharedSegment,
    params: StreamParams,
}

impl SampleSegment {
    pub fn create(path: impl AsRef<Path>, params: StreamParams) -> Result<Self> {
        let path = path.as_ref();
        let segment = SharedSegment::create(path, params.sample_bytes()).map_err(|source| {
            BridgeError::SampleSegmentUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self { segment, params })
    }

    pub fn open(path: impl AsRef<Path>, params: StreamParams) -> Result<Self> {
        let path = path.as_ref();
        let segment = SharedSegment::open(path, params.sample_bytes()).map_err(|source| {
            if source.kind() == io::ErrorKind::InvalidData {
                BridgeError::LayoutMismatch {
                    expected: params.sample_bytes(),
                    actual: fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0),
                }
            } else {
                BridgeError::SampleSegmentUnavailable {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Ok(Self { segment, params })
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    fn samples(&self) -> &[f32] {
        unsafe {
            std::slice::from_raw_parts(
                self.segment.mmap.as_ptr() as *const f32,
                self.params.sample_len(),
            )
        }
    }

    fn samples_mut(&mut self) -> &mut [f32] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.mmap.as_mut_ptr() as *mut f32,
                self.params.sample_len(),
            )
        }
    }

    /// One channel's samples, or `None` when the channel is out of range.
    pub fn channel(&self, direction: Direction, channel: usize) -> Option<&[f32]> {
        let range = self.params.channel_range(direction, channel)?;
        Some(&self.samples()[range])
    }

    pub fn channel_mut(&mut self, direction: Direction, channel: usize) -> Option<&mut [f32]> {
        let range = self.params.channel_range(direction, channel)?;
        Some(&mut self.samples_mut()[range])
    }

    pub fn section_mut(&mut self, direction: Direction) -> &mut [f32] {
        let range = self.params.section_range(direction);
        &mut self.samples_mut()[range]
    }

    pub fn zero_section(&mut self, direction: Direction) {
        self.section_mut(direction).fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParams {
        StreamParams::new(2, 2, 8, 48_000)
    }

    #[test]
    fn open_never_creates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-info");
        let err = ControlSegment::open(&path).unwrap_err();
        assert!(matches!(err, BridgeError::ControlSegmentUnavailable { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn both_mappings_see_the_same_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers");
        let mut writer = SampleSegment::create(&path, params()).unwrap();
        let reader = SampleSegment::open(&path, params()).unwrap();

        writer
            .channel_mut(Direction::Output, 1)
            .unwrap()
            .copy_from_slice(&[0.25; 8]);

        assert_eq!(reader.channel(Direction::Output, 1).unwrap(), &[0.25; 8]);
        assert_eq!(reader.channel(Direction::Input, 0).unwrap(), &[0.0; 8]);
        assert!(reader.channel(Direction::Output, 2).is_none());
    }

    #[test]
    fn control_block_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let server = ControlSegment::create(&path, &params()).unwrap();
        let driver = ControlSegment::open(&path).unwrap();

        assert_eq!(driver.block().stream_params(), params());
        driver.block().set_running(true);
        assert!(server.block().is_running());
        assert_eq!(fs::metadata(&path).unwrap().len(), CONTROL_BLOCK_BYTES as u64);
    }

    #[test]
    fn undersized_sample_segment_is_a_layout_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers");
        let _small = SampleSegment::create(&path, StreamParams::new(1, 1, 8, 48_000)).unwrap();
        let err = SampleSegment::open(&path, params()).unwrap_err();
        assert!(matches!(err, BridgeError::LayoutMismatch { expected: 128, actual: 64 }));
    }

    #[test]
    fn recreate_leaves_stale_mapping_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers");
        let mut stale = SampleSegment::create(&path, params()).unwrap();
        stale
            .channel_mut(Direction::Input, 0)
            .unwrap()
            .copy_from_slice(&[0.5; 8]);

        let mut fresh = SampleSegment::create(&path, params()).unwrap();
        assert_eq!(fresh.channel(Direction::Input, 0).unwrap(), &[0.0; 8]);
        assert_eq!(stale.channel(Direction::Input, 0).unwrap(), &[0.5; 8]);

        fresh
            .channel_mut(Direction::Output, 0)
            .unwrap()
            .copy_from_slice(&[0.25; 8]);
        assert_eq!(stale.channel(Direction::Output, 0).unwrap(), &[0.0; 8]);
        let reopened = SampleSegment::open(&path, params()).unwrap();
        assert_eq!(reopened.channel(Direction::Output, 0).unwrap(), &[0.25; 8]);
    }

    #[test]
    fn unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info");
        let _segment = SharedSegment::create(&path, 16).unwrap();
        SharedSegment::unlink(&path).unwrap();
        SharedSegment::unlink(&path).unwrap();
        assert!(!path.exists());
    }
}
