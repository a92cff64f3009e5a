//! # Speak Stream
//!
//! Real-time playback of streamed speech synthesis.
//!
//! Synthesized audio arrives as irregularly paced chunks over a local socket
//! and is played through a pull-based audio sink with minimal startup latency.
//!
//! ## Features
//!
//! - Lock-free single-producer single-consumer sample ring buffer
//! - Incremental decoder for the `SPKR` binary framing
//! - Auditable playback state machine with buffering thresholds
//! - Producer/consumer session loop with cooperative cancellation
//! - Mock sink for tests, `cpal` output behind the `cpal-output` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use speak_stream::{MockSink, StreamSession, StreamingConfig, SynthesisRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = StreamSession::new(StreamingConfig::default(), Box::new(MockSink::new()))?;
//!     let interrupt = speak_stream::spawn_interrupt_handler(session.cancel_handle());
//!
//!     let request = SynthesisRequest::new("Hello, world!");
//!     let result = session.run(&request).await;
//!     interrupt.abort();
//!
//!     println!("played {:.1}s, success: {}", result.total_duration_seconds, result.success);
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod protocol;
pub mod ring_buffer;
pub mod sink;
pub mod state_machine;

// Re-export main types for convenience
pub use config::{BufferThresholds, SinkSpec, StreamingConfig};
pub use error::{SpeakError, SpeakResult};
pub use orchestrator::{
    spawn_interrupt_handler, CancelHandle, ProgressCallback, StreamProgress, StreamResult,
    StreamSession,
};
pub use playback::{EngineStatus, PlaybackEngine, PlaybackMetrics};
pub use protocol::{SampleChunk, StreamMessage, SynthesisRequest};
pub use ring_buffer::RingBuffer;
#[cfg(feature = "cpal-output")]
pub use sink::CpalSink;
pub use sink::{AudioSink, MockSink, MockSinkHandle, PullCallback, PullStatus, SinkEvent};
pub use state_machine::{
    ListenerId, StreamEvent, StreamState, StreamStateMachine, TransitionRecord,
};

/// Version information for the speak-stream crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sample rate for audio processing (24 kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Default number of audio channels (mono)
pub const DEFAULT_CHANNELS: u16 = 1;
