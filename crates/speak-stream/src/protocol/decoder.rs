use super::{
    SampleChunk, StreamMessage, END_MARKER, ERROR_MARKER, HEADER_LEN, MAGIC,
    MAX_CHUNK_SAMPLES, MAX_ERROR_MESSAGE_BYTES,
};
use crate::error::{SpeakError, SpeakResult};
use bytes::{Buf, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    id: u32,
    count: u32,
    rate: u32,
}

impl FrameHeader {
    fn payload_len(&self) -> usize {
        match self.id {
            END_MARKER => 0,
            ERROR_MARKER => self.count as usize,
            _ => self.count as usize * 4,
        }
    }
}

/// Incremental decoder that reassembles frames split across reads.
///
/// Bytes are appended as they arrive; [`FrameDecoder::decode`] yields a
/// message once a whole frame is buffered and keeps any trailing bytes for
/// the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Append received bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a magic mismatch or an implausible length.
    pub fn decode(&mut self) -> SpeakResult<Option<StreamMessage>> {
        let Some(header) = self.peek_header()? else {
            return Ok(None);
        };

        let frame_len = HEADER_LEN + header.payload_len();
        if self.buffer.len() < frame_len {
            trace!(
                "Awaiting frame payload: {} of {} bytes",
                self.buffer.len(),
                frame_len
            );
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(header.payload_len());

        let message = match header.id {
            END_MARKER => StreamMessage::End {
                total_chunks: header.count,
            },
            ERROR_MARKER => StreamMessage::Error {
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
            id => StreamMessage::Chunk(SampleChunk::new(
                id,
                header.rate,
                payload
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            )),
        };

        Ok(Some(message))
    }

    /// Check that the source closed on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` describing the partial frame still pending.
    pub fn finish(&self) -> SpeakResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        if self.buffer.len() < HEADER_LEN {
            return Err(SpeakError::connection_closed(format!(
                "partial header ({} of {} bytes)",
                self.buffer.len(),
                HEADER_LEN
            )));
        }

        let expected = self
            .peek_header()
            .ok()
            .flatten()
            .map_or(0, |header| HEADER_LEN + header.payload_len());

        Err(SpeakError::connection_closed(format!(
            "partial payload ({} of {} bytes)",
            self.buffer.len(),
            expected
        )))
    }

    fn peek_header(&self) -> SpeakResult<Option<FrameHeader>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        if self.buffer[..4] != MAGIC {
            return Err(SpeakError::protocol(format!(
                "invalid magic {:02x?}",
                &self.buffer[..4]
            )));
        }

        let mut fields = &self.buffer[4..HEADER_LEN];
        let header = FrameHeader {
            id: fields.get_u32_le(),
            count: fields.get_u32_le(),
            rate: fields.get_u32_le(),
        };

        match header.id {
            END_MARKER => {}
            ERROR_MARKER if header.count > MAX_ERROR_MESSAGE_BYTES => {
                return Err(SpeakError::protocol(format!(
                    "error message of {} bytes exceeds limit of {}",
                    header.count, MAX_ERROR_MESSAGE_BYTES
                )));
            }
            ERROR_MARKER => {}
            id if header.count > MAX_CHUNK_SAMPLES => {
                return Err(SpeakError::protocol(format!(
                    "chunk {id} declares {} samples, limit is {}",
                    header.count, MAX_CHUNK_SAMPLES
                )));
            }
            _ => {}
        }

        Ok(Some(header))
    }

    fn reserve(&mut self) {
        self.buffer.reserve(READ_CHUNK_SIZE);
    }
}

/// Decode messages lazily from a byte source.
///
/// The stream suspends only while waiting for more bytes, ends right after
/// an End or Error message without reading further, and ends quietly if the
/// source closes on a frame boundary. A close mid-frame yields
/// `ConnectionClosed`; a bad header yields `ProtocolError`.
pub fn decode_stream<R>(mut reader: R) -> impl Stream<Item = SpeakResult<StreamMessage>>
where
    R: AsyncRead + Unpin,
{
    async_stream::try_stream! {
        let mut decoder = FrameDecoder::new();

        'frames: loop {
            while let Some(message) = decoder.decode()? {
                let terminal = message.is_terminal();
                yield message;
                if terminal {
                    break 'frames;
                }
            }

            decoder.reserve();
            let read = reader
                .read_buf(&mut decoder.buffer)
                .await
                .map_err(SpeakError::from)?;

            if read == 0 {
                debug!("Byte source closed with {} bytes pending", decoder.pending_bytes());
                decoder.finish()?;
                break 'frames;
            }
        }
    }
}
