use super::{END_MARKER, ERROR_MARKER, HEADER_LEN, MAGIC};
use crate::error::{SpeakError, SpeakResult};
use bytes::{BufMut, Bytes, BytesMut};

fn put_header(buf: &mut BytesMut, id: u32, count: u32, rate: u32) {
    buf.put_slice(&MAGIC);
    buf.put_u32_le(id);
    buf.put_u32_le(count);
    buf.put_u32_le(rate);
}

/// Encode an audio chunk frame
///
/// # Errors
///
/// Returns an error if `samples` holds more than `u32::MAX` samples.
pub fn encode_chunk(id: u32, sample_rate: u32, samples: &[f32]) -> SpeakResult<Bytes> {
    let count = u32::try_from(samples.len()).map_err(|_| {
        SpeakError::invalid_input(format!("chunk of {} samples is too large to frame", samples.len()))
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + samples.len() * 4);
    put_header(&mut buf, id, count, sample_rate);
    for sample in samples {
        buf.put_f32_le(*sample);
    }
    Ok(buf.freeze())
}

/// Encode the end-of-stream frame
#[must_use]
pub fn encode_end(total_chunks: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, END_MARKER, total_chunks, 0);
    buf.freeze()
}

/// Encode an error frame
///
/// # Errors
///
/// Returns an error if the message is longer than `u32::MAX` bytes.
pub fn encode_error(message: &str) -> SpeakResult<Bytes> {
    let len = u32::try_from(message.len()).map_err(|_| {
        SpeakError::invalid_input(format!("error message of {} bytes is too large to frame", message.len()))
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.len());
    put_header(&mut buf, ERROR_MARKER, len, 0);
    buf.put_slice(message.as_bytes());
    Ok(buf.freeze())
}
