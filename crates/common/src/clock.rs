//! Frame clock utilities.
//!
//! Encoders are fed microsecond timestamps. During export the timestamp is
//! derived from the number of frames already emitted, never from source time,
//! so spliced segments stay contiguous regardless of where they came from.

/// Microseconds per second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Converts between frame counts and microsecond timestamps for a fixed
/// rational frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClock {
    num: u32,
    den: u32,
}

impl FrameClock {
    /// Create a clock for `num / den` frames per second.
    ///
    /// Zero components are clamped to one so the clock never divides by zero.
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num: num.max(1),
            den: den.max(1),
        }
    }

    /// Frames per second as a float.
    pub fn fps(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Presentation timestamp of the given frame in microseconds.
    pub fn frame_to_us(&self, frame: u64) -> u64 {
        ((frame as u128 * MICROS_PER_SEC as u128 * self.den as u128) / self.num as u128) as u64
    }

    /// Duration of a single frame in microseconds (rounded down).
    pub fn frame_duration_us(&self) -> u64 {
        self.frame_to_us(1)
    }

    /// Frame index containing the given timestamp.
    pub fn us_to_frame(&self, us: u64) -> u64 {
        ((us as u128 * self.num as u128) / (MICROS_PER_SEC as u128 * self.den as u128)) as u64
    }

    /// Duration in seconds of `frames` frames.
    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.fps()
    }

    /// Number of frames spanning `secs` seconds, rounded to nearest.
    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        (secs.max(0.0) * self.fps()).round() as u64
    }
}

/// Continuous output timestamp counter used while stitching.
#[derive(Debug, Clone)]
pub struct EmissionCounter {
    clock: FrameClock,
    emitted: u64,
}

impl EmissionCounter {
    pub fn new(clock: FrameClock) -> Self {
        Self { clock, emitted: 0 }
    }

    /// Timestamp for the next frame, advancing the counter.
    pub fn next_timestamp_us(&mut self) -> u64 {
        let ts = self.clock.frame_to_us(self.emitted);
        self.emitted += 1;
        ts
    }

    /// Frames emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Advance by `frames` without producing timestamps (copied segments).
    pub fn advance(&mut self, frames: u64) {
        self.emitted += frames;
    }
}
