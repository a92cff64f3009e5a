//! Session configuration: buffer sizing, state thresholds and pacing.

use crate::error::{SpeakError, SpeakResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest ring buffer a session may ask for, in seconds
pub const MAX_BUFFER_DURATION_SECS: f64 = 600.0;

/// Highest sample rate a stream may use, in Hz
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Buffered-audio thresholds that gate state transitions, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferThresholds {
    /// Buffered audio needed before playback first starts
    pub initial_buffer_secs: f64,
    /// Playback pauses to rebuffer below this level
    pub min_buffer_secs: f64,
    /// Playback resumes after rebuffering at this level
    pub resume_buffer_secs: f64,
}

impl Default for BufferThresholds {
    fn default() -> Self {
        Self {
            initial_buffer_secs: 3.0,
            min_buffer_secs: 0.5,
            resume_buffer_secs: 1.5,
        }
    }
}

impl BufferThresholds {
    /// Create thresholds from explicit values
    #[must_use]
    pub const fn new(initial_buffer_secs: f64, min_buffer_secs: f64, resume_buffer_secs: f64) -> Self {
        Self {
            initial_buffer_secs,
            min_buffer_secs,
            resume_buffer_secs,
        }
    }

    /// Validate threshold ordering
    ///
    /// # Errors
    ///
    /// Returns an error if a threshold is negative or not finite, or if
    /// `min_buffer_secs` is not strictly below both other thresholds.
    pub fn validate(&self) -> SpeakResult<()> {
        for (name, value) in [
            ("initial_buffer_secs", self.initial_buffer_secs),
            ("min_buffer_secs", self.min_buffer_secs),
            ("resume_buffer_secs", self.resume_buffer_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SpeakError::configuration(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }

        if self.min_buffer_secs >= self.resume_buffer_secs {
            return Err(SpeakError::configuration(format!(
                "min_buffer_secs ({}) must be below resume_buffer_secs ({})",
                self.min_buffer_secs, self.resume_buffer_secs
            )));
        }

        if self.min_buffer_secs >= self.initial_buffer_secs {
            return Err(SpeakError::configuration(format!(
                "min_buffer_secs ({}) must be below initial_buffer_secs ({})",
                self.min_buffer_secs, self.initial_buffer_secs
            )));
        }

        Ok(())
    }
}

/// Streaming session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Sample rate used when the stream does not announce one
    pub sample_rate: u32,
    /// Ring buffer length in seconds of audio
    pub buffer_duration_secs: f64,
    /// State machine thresholds
    pub thresholds: BufferThresholds,
    /// Samples requested per sink pull
    pub block_size: usize,
    /// Backoff before retrying a write into a full ring buffer
    pub write_retry_delay_ms: u64,
    /// How often the consumer re-checks buffer level while the queue is idle
    pub level_check_interval_ms: u64,
    /// Unix socket of the synthesis server
    pub socket_path: PathBuf,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            buffer_duration_secs: 30.0,
            thresholds: BufferThresholds::default(),
            block_size: 2048,
            write_retry_delay_ms: 20,
            level_check_interval_ms: 50,
            socket_path: default_socket_path(),
        }
    }
}

impl StreamingConfig {
    /// Set the buffer thresholds
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: BufferThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Set the ring buffer length in seconds
    #[must_use]
    pub fn with_buffer_duration(mut self, secs: f64) -> Self {
        self.buffer_duration_secs = secs;
        self
    }

    /// Set the fallback sample rate
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set the sink pull block size
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the write retry delay
    #[must_use]
    pub fn with_write_retry_delay(mut self, delay_ms: u64) -> Self {
        self.write_retry_delay_ms = delay_ms;
        self
    }

    /// Set the socket path of the synthesis server
    #[must_use]
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Backoff before retrying a full-buffer write
    #[must_use]
    pub const fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    /// Idle interval between buffer-level checks
    #[must_use]
    pub const fn level_check_interval(&self) -> Duration {
        Duration::from_millis(self.level_check_interval_ms)
    }

    /// Validate the configuration
    ///
    /// Thresholds larger than the ring buffer could never be reached once
    /// the buffer is full, so they are rejected here.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first invalid field.
    pub fn validate(&self) -> SpeakResult<()> {
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(SpeakError::configuration(format!(
                "sample_rate must be between 1 and {MAX_SAMPLE_RATE}, got {}",
                self.sample_rate
            )));
        }

        if self.block_size == 0 {
            return Err(SpeakError::configuration("block_size must be greater than 0"));
        }

        if !self.buffer_duration_secs.is_finite() || self.buffer_duration_secs <= 0.0 {
            return Err(SpeakError::configuration(format!(
                "buffer_duration_secs must be positive, got {}",
                self.buffer_duration_secs
            )));
        }

        if self.buffer_duration_secs > MAX_BUFFER_DURATION_SECS {
            return Err(SpeakError::configuration(format!(
                "buffer_duration_secs ({}) exceeds the {MAX_BUFFER_DURATION_SECS}s limit",
                self.buffer_duration_secs
            )));
        }

        self.thresholds.validate()?;

        if self.thresholds.initial_buffer_secs > self.buffer_duration_secs {
            return Err(SpeakError::configuration(format!(
                "initial_buffer_secs ({}) exceeds buffer_duration_secs ({})",
                self.thresholds.initial_buffer_secs, self.buffer_duration_secs
            )));
        }

        if self.thresholds.resume_buffer_secs > self.buffer_duration_secs {
            return Err(SpeakError::configuration(format!(
                "resume_buffer_secs ({}) exceeds buffer_duration_secs ({})",
                self.thresholds.resume_buffer_secs, self.buffer_duration_secs
            )));
        }

        Ok(())
    }
}

/// Parameters a sink is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count of the delivered samples (always mono here)
    pub channels: u16,
    /// Samples per pull
    pub block_size: usize,
}

impl SinkSpec {
    /// Mono spec at the given rate and block size
    #[must_use]
    pub const fn mono(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            channels: crate::DEFAULT_CHANNELS,
            block_size,
        }
    }

    /// Wall-clock duration of one block
    #[must_use]
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// `~/.chatter/speak.sock`, falling back to the temp dir without a home
fn default_socket_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || std::env::temp_dir().join("speak.sock"),
        |dirs| dirs.home_dir().join(".chatter").join("speak.sock"),
    )
}
