//! SPKR binary streaming protocol.
//!
//! After a JSON request line, the synthesis server answers with a sequence of
//! little-endian frames, each a 16-byte header followed by an optional payload:
//!
//! ```text
//! CHUNK  [SPKR][id:u32][count:u32][rate:u32][count * f32]
//! END    [SPKR][0xFFFFFFFF][total_chunks:u32][0]
//! ERROR  [SPKR][0xFFFFFFFE][len:u32][0][len bytes utf-8]
//! ```

/// Incremental frame decoder and async message stream
pub mod decoder;
/// Frame encoders for the synthesis side
pub mod encoder;
/// Outbound JSON request
pub mod request;

pub use decoder::{decode_stream, FrameDecoder};
pub use encoder::{encode_chunk, encode_end, encode_error};
pub use request::{SynthesisRequest, STREAM_METHOD};

/// Frame magic
pub const MAGIC: [u8; 4] = *b"SPKR";

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 16;

/// Header id marking the end of the stream
pub const END_MARKER: u32 = 0xFFFF_FFFF;

/// Header id marking an error message
pub const ERROR_MARKER: u32 = 0xFFFF_FFFE;

/// Largest sample count accepted in one chunk
pub const MAX_CHUNK_SAMPLES: u32 = 1 << 24;

/// Largest error message accepted, in bytes
pub const MAX_ERROR_MESSAGE_BYTES: u32 = 1 << 20;

/// One unit of synthesized audio
#[derive(Debug, Clone, PartialEq)]
pub struct SampleChunk {
    /// Sender-assigned sequence id
    pub id: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Mono samples
    pub samples: Vec<f32>,
}

impl SampleChunk {
    /// Create a chunk
    #[must_use]
    pub const fn new(id: u32, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            id,
            sample_rate,
            samples,
        }
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the chunk carries no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Audio samples
    Chunk(SampleChunk),
    /// Graceful end of stream
    End {
        /// Chunks the sender says it sent
        total_chunks: u32,
    },
    /// The sender failed
    Error {
        /// Error text from the sender
        message: String,
    },
}

impl StreamMessage {
    /// Whether this message ends the stream
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}
