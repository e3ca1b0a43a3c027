//! Sample positions, timestamps and the time-info record handed to hosts.

use std::time::Instant;

/// 64-bit value split into two 32-bit words, most significant first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitU64 {
    pub hi: u32,
    pub lo: u32,
}

impl SplitU64 {
    pub const fn from_u64(value: u64) -> Self {
        Self {
            hi: (value >> 32) as u32,
            lo: value as u32,
        }
    }

    pub const fn to_u64(self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }
}

/// Sample position in frames.
pub type AsioSamples = SplitU64;
/// System time in nanoseconds.
pub type AsioTimeStamp = SplitU64;

pub mod time_info_flags {
    pub const SYSTEM_TIME_VALID: u32 = 1;
    pub const SAMPLE_POSITION_VALID: u32 = 1 << 1;
    pub const SAMPLE_RATE_VALID: u32 = 1 << 2;
    pub const SPEED_VALID: u32 = 1 << 3;
    pub const SAMPLE_RATE_CHANGED: u32 = 1 << 4;
    pub const CLOCK_SOURCE_CHANGED: u32 = 1 << 5;
}

pub mod time_code_flags {
    pub const VALID: u32 = 1;
    pub const RUNNING: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeInfo {
    pub speed: f64,
    pub system_time: AsioTimeStamp,
    pub sample_position: AsioSamples,
    pub sample_rate: f64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeCode {
    pub speed: f64,
    pub samples: AsioSamples,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AsioTime {
    pub time_info: TimeInfo,
    pub time_code: TimeCode,
}

impl AsioTime {
    pub fn new(sample_rate: f64) -> Self {
        use time_info_flags::*;
        Self {
            time_info: TimeInfo {
                speed: 1.0,
                sample_rate,
                flags: SYSTEM_TIME_VALID | SAMPLE_POSITION_VALID | SAMPLE_RATE_VALID,
                ..TimeInfo::default()
            },
            time_code: TimeCode {
                speed: 1.0,
                ..TimeCode::default()
            },
        }
    }

    /// Refreshes the per-cycle fields. `read_time_code` mirrors the sample
    /// position into the timecode as well.
    pub fn update(
        &mut self,
        position: u64,
        system_time_ns: u64,
        rolling: bool,
        read_time_code: bool,
    ) {
        self.time_info.sample_position = AsioSamples::from_u64(position);
        self.time_info.system_time = AsioTimeStamp::from_u64(system_time_ns);
        if rolling {
            self.time_code.flags |= time_code_flags::RUNNING;
        } else {
            self.time_code.flags &= !time_code_flags::RUNNING;
        }
        if read_time_code {
            self.time_code.samples = self.time_info.sample_position;
            self.time_code.flags |= time_code_flags::VALID;
        } else {
            self.time_code.flags &= !time_code_flags::VALID;
        }
    }

    pub fn raise(&mut self, flag: u32) {
        self.time_info.flags |= flag;
    }

    /// Clears the flags that only apply to a single callback.
    pub fn clear_one_shot(&mut self) {
        self.time_info.flags &=
            !(time_info_flags::SAMPLE_RATE_CHANGED | time_info_flags::CLOCK_SOURCE_CHANGED);
    }
}

/// Monotonic nanosecond clock anchored at driver creation.
#[derive(Debug, Clone, Copy)]
pub struct DriverClock {
    epoch: Instant,
}

impl DriverClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for DriverClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_words_round_trip() {
        let value = 0x0000_0001_8000_0002;
        let split = SplitU64::from_u64(value);
        assert_eq!(split.hi, 1);
        assert_eq!(split.lo, 0x8000_0002);
        assert_eq!(split.to_u64(), value);
    }

    #[test]
    fn one_shot_flags_clear_without_touching_validity() {
        let mut time = AsioTime::new(48_000.0);
        time.raise(time_info_flags::CLOCK_SOURCE_CHANGED);
        time.clear_one_shot();
        assert_eq!(time.time_info.flags & time_info_flags::CLOCK_SOURCE_CHANGED, 0);
        assert_ne!(time.time_info.flags & time_info_flags::SAMPLE_RATE_VALID, 0);
    }

    #[test]
    fn timecode_follows_transport() {
        let mut time = AsioTime::new(48_000.0);
        time.update(512, 10, true, true);
        assert_eq!(time.time_code.samples.to_u64(), 512);
        assert_ne!(time.time_code.flags & time_code_flags::RUNNING, 0);
        time.update(512, 20, false, false);
        assert_eq!(time.time_code.flags, 0);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = DriverClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
