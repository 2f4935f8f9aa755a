//! # Global runtime configuration.
//!
//! Provides [`SupervisorConfig`], centralized settings for the supervisor and the engines it starts.
//!
//! ## Sentinel values
//! - `stop_grace = 0s` → do not wait for cooperative exit, abandon the worker immediately
//! - `tick = 0s` / `frame_interval = 0s` → fall back to the default interval
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use livevisor::SupervisorConfig;
//!
//! let mut cfg = SupervisorConfig::default();
//! cfg.stop_grace = Duration::from_millis(500);
//! cfg.audio.sample_rate = 48_000;
//!
//! assert_eq!(cfg.audio.chunk_duration(), Duration::from_micros(21_333));
//! ```

use std::time::Duration;

const DEFAULT_TICK: Duration = Duration::from_millis(10);
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// PCM layout produced by the audio engines (interleaved `f32` samples).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames produced per chunk.
    pub chunk_frames: usize,
}

impl AudioFormat {
    /// Number of interleaved samples in one chunk.
    #[inline]
    pub fn chunk_samples(&self) -> usize {
        self.chunk_frames * usize::from(self.channels.max(1))
    }

    /// Wall-clock length of one chunk when played back.
    #[inline]
    pub fn chunk_duration(&self) -> Duration {
        let micros = (self.chunk_frames as u64 * 1_000_000) / u64::from(self.sample_rate.max(1));
        Duration::from_micros(micros)
    }
}

impl Default for AudioFormat {
    /// 44.1kHz stereo, 1024 frames per chunk.
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            chunk_frames: 1024,
        }
    }
}

/// Global configuration for the supervisor runtime.
///
/// ## Field semantics
/// - `stop_grace`: how long teardown waits for a worker to exit cooperatively
/// - `bus_capacity`: observability event ring buffer (min 1; clamped by Bus)
/// - `command_capacity`: bounded queue between handles and the control loop (min 1)
/// - `tick`: how often a script engine yields to its interpreter between reloads
/// - `frame_interval`: frame pacing of the graphics engine
/// - `audio`: sample format of both audio engines
/// - `sink_capacity`: chunks buffered by an audio output before it signals backpressure (min 1)
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub stop_grace: Duration,
    pub bus_capacity: usize,
    pub command_capacity: usize,
    pub tick: Duration,
    pub frame_interval: Duration,
    pub audio: AudioFormat,
    pub sink_capacity: usize,
}

impl SupervisorConfig {
    /// Returns the interpreter tick, replacing the `0s` sentinel with the default.
    #[inline]
    pub fn tick_interval(&self) -> Duration {
        if self.tick.is_zero() { DEFAULT_TICK } else { self.tick }
    }

    /// Returns the frame interval, replacing the `0s` sentinel with the default.
    #[inline]
    pub fn frame_pacing(&self) -> Duration {
        if self.frame_interval.is_zero() {
            DEFAULT_FRAME_INTERVAL
        } else {
            self.frame_interval
        }
    }

    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    #[inline]
    pub fn command_capacity_clamped(&self) -> usize {
        self.command_capacity.max(1)
    }

    #[inline]
    pub fn sink_capacity_clamped(&self) -> usize {
        self.sink_capacity.max(1)
    }
}

impl Default for SupervisorConfig {
    /// Default configuration:
    ///
    /// - `stop_grace = 2s`
    /// - `bus_capacity = 1024`
    /// - `command_capacity = 64`
    /// - `tick = 10ms`, `frame_interval = 16ms`
    /// - `audio = 44.1kHz stereo, 1024-frame chunks`
    /// - `sink_capacity = 8` chunks
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
            bus_capacity: 1024,
            command_capacity: 64,
            tick: DEFAULT_TICK,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            audio: AudioFormat::default(),
            sink_capacity: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_intervals_fall_back_to_defaults() {
        let cfg = SupervisorConfig {
            tick: Duration::ZERO,
            frame_interval: Duration::ZERO,
            ..SupervisorConfig::default()
        };
        assert_eq!(cfg.tick_interval(), DEFAULT_TICK);
        assert_eq!(cfg.frame_pacing(), DEFAULT_FRAME_INTERVAL);
    }

    #[test]
    fn test_capacities_are_clamped() {
        let cfg = SupervisorConfig {
            bus_capacity: 0,
            command_capacity: 0,
            sink_capacity: 0,
            ..SupervisorConfig::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
        assert_eq!(cfg.command_capacity_clamped(), 1);
        assert_eq!(cfg.sink_capacity_clamped(), 1);
    }

    #[test]
    fn test_chunk_samples_interleaves_channels() {
        let fmt = AudioFormat {
            sample_rate: 8_000,
            channels: 2,
            chunk_frames: 80,
        };
        assert_eq!(fmt.chunk_samples(), 160);
        assert_eq!(fmt.chunk_duration(), Duration::from_millis(10));
    }
}
