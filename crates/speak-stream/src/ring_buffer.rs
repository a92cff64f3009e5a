//! Bounded single-producer single-consumer sample buffer.
//!
//! The consumer loop is the only writer and the sink's pull callback is the
//! only reader. Storage is a split `ringbuf` heap ring: the writer alone
//! locks the producer half and the reader alone locks the consumer half.
//! One slot beyond the usable capacity is allocated and never filled.

use crate::config::{MAX_BUFFER_DURATION_SECS, MAX_SAMPLE_RATE};
use crate::error::{SpeakError, SpeakResult};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Largest usable capacity a buffer may be created with
pub const MAX_CAPACITY_SAMPLES: usize = MAX_BUFFER_DURATION_SECS as usize * MAX_SAMPLE_RATE as usize;

/// Bounded FIFO of audio samples
pub struct RingBuffer {
    ring: Arc<HeapRb<f32>>,
    producer: Mutex<HeapProd<f32>>,
    consumer: Mutex<HeapCons<f32>>,
    capacity: usize,
    sample_rate: u32,
    underrun_samples: AtomicU64,
    underrun_events: AtomicU64,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("sample_rate", &self.sample_rate)
            .field("available", &self.available_to_read())
            .finish_non_exhaustive()
    }
}

impl RingBuffer {
    /// Create a buffer holding `duration_secs` of audio at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns an error if the duration is not positive or the resulting
    /// capacity is zero or larger than [`MAX_CAPACITY_SAMPLES`].
    pub fn new(duration_secs: f64, sample_rate: u32) -> SpeakResult<Self> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(SpeakError::configuration(format!(
                "Ring buffer duration must be positive, got {duration_secs}"
            )));
        }

        let samples = (duration_secs * f64::from(sample_rate)).ceil();
        if samples > MAX_CAPACITY_SAMPLES as f64 {
            return Err(SpeakError::configuration(format!(
                "Ring buffer of {duration_secs}s at {sample_rate}Hz exceeds {MAX_CAPACITY_SAMPLES} samples"
            )));
        }

        Self::with_capacity(samples as usize, sample_rate)
    }

    /// Create a buffer holding exactly `capacity` samples
    ///
    /// # Errors
    ///
    /// Returns an error if capacity or sample rate is zero, or if capacity
    /// exceeds [`MAX_CAPACITY_SAMPLES`].
    pub fn with_capacity(capacity: usize, sample_rate: u32) -> SpeakResult<Self> {
        if capacity == 0 {
            return Err(SpeakError::configuration("Ring buffer capacity must be greater than 0"));
        }
        if sample_rate == 0 {
            return Err(SpeakError::configuration("Sample rate must be greater than 0"));
        }
        if capacity > MAX_CAPACITY_SAMPLES {
            return Err(SpeakError::configuration(format!(
                "Ring buffer capacity {capacity} exceeds {MAX_CAPACITY_SAMPLES} samples"
            )));
        }
        let slots = capacity.checked_add(1).ok_or_else(|| {
            SpeakError::configuration(format!("Ring buffer capacity {capacity} is too large"))
        })?;

        debug!(
            "Creating ring buffer: {} samples ({:.2}s @ {}Hz)",
            capacity,
            capacity as f64 / f64::from(sample_rate),
            sample_rate
        );

        let ring = Arc::new(HeapRb::<f32>::new(slots));
        let (producer, consumer) = Arc::clone(&ring).split();

        Ok(Self {
            ring,
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
            sample_rate,
            underrun_samples: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        })
    }

    /// Usable capacity in samples (excludes the slack slot)
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots allocated in the underlying ring, slack slot included
    #[must_use]
    pub fn allocated_slots(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Sample rate the buffer was sized for
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples ready to be read
    #[must_use]
    pub fn available_to_read(&self) -> usize {
        self.ring.occupied_len()
    }

    /// Free space for writing
    #[must_use]
    pub fn available_to_write(&self) -> usize {
        self.capacity.saturating_sub(self.available_to_read())
    }

    /// Seconds of audio currently buffered
    #[must_use]
    pub fn buffered_seconds(&self) -> f64 {
        self.available_to_read() as f64 / f64::from(self.sample_rate)
    }

    /// Whether no more samples can be written
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.available_to_read() >= self.capacity
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Total silence samples substituted for missing data
    #[must_use]
    pub fn underrun_samples(&self) -> u64 {
        self.underrun_samples.load(Ordering::Relaxed)
    }

    /// Number of reads that came up short
    #[must_use]
    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    /// Write as many samples as fit without overwriting unread data.
    ///
    /// Returns the number written; a short count means the buffer is full
    /// and the caller must retry the remainder later.
    pub fn write(&self, samples: &[f32]) -> usize {
        let mut producer = self.producer.lock();
        let count = samples.len().min(self.available_to_write());
        producer.push_slice(&samples[..count])
    }

    /// Read up to `output.len()` samples in FIFO order.
    ///
    /// Any shortfall is zero-filled and counted as underrun. Returns the
    /// number of real samples copied.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let count = self.consumer.lock().pop_slice(output);

        let shortfall = output.len() - count;
        if shortfall > 0 {
            output[count..].fill(0.0);
            self.underrun_samples.fetch_add(shortfall as u64, Ordering::Relaxed);
            self.underrun_events.fetch_add(1, Ordering::Relaxed);
        }

        count
    }

    /// Drop buffered samples and reset the underrun counters
    pub fn clear(&mut self) {
        self.consumer.get_mut().clear();
        *self.underrun_samples.get_mut() = 0;
        *self.underrun_events.get_mut() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 * 0.01).collect()
    }

    #[test]
    fn test_capacity_from_duration() {
        let buffer = RingBuffer::new(0.5, 1000).expect("Should create buffer");
        assert_eq!(buffer.capacity(), 500);
        assert_eq!(buffer.sample_rate(), 1000);

        // Fractional sample counts round up
        let buffer = RingBuffer::new(0.0015, 1000).expect("Should create buffer");
        assert_eq!(buffer.capacity(), 2);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(RingBuffer::new(0.0, 24_000).is_err());
        assert!(RingBuffer::new(-1.0, 24_000).is_err());
        assert!(RingBuffer::with_capacity(0, 24_000).is_err());
        assert!(RingBuffer::with_capacity(16, 0).is_err());
    }

    #[test]
    fn test_slack_slot_is_allocated() {
        let buffer = RingBuffer::with_capacity(8, 4).expect("Should create buffer");
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.allocated_slots(), 9);

        buffer.write(&ramp(20));
        assert_eq!(buffer.available_to_read(), 8);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_oversized_buffer_is_rejected() {
        let err = RingBuffer::new(1e15, 24_000).unwrap_err();
        assert!(matches!(err, SpeakError::ConfigurationError { .. }));

        assert!(matches!(
            RingBuffer::with_capacity(usize::MAX, 24_000),
            Err(SpeakError::ConfigurationError { .. })
        ));
        assert!(RingBuffer::with_capacity(MAX_CAPACITY_SAMPLES + 1, 24_000).is_err());
    }

    #[test]
    fn test_fill_to_capacity_then_reject() {
        let buffer = RingBuffer::with_capacity(8, 4).expect("Should create buffer");
        assert!(buffer.is_empty());

        assert_eq!(buffer.write(&ramp(8)), 8);
        assert!(buffer.is_full());
        assert_eq!(buffer.write(&[1.0, 2.0]), 0);
        assert_eq!(buffer.buffered_seconds(), 2.0);

        let mut out = [0.0; 3];
        assert_eq!(buffer.read(&mut out), 3);
        assert_eq!(out, [0.0, 0.01, 0.02]);
        assert_eq!(buffer.buffered_seconds(), 5.0 / 4.0);
        assert!(!buffer.is_full());
        assert_eq!(buffer.underrun_samples(), 0);
    }

    #[test]
    fn test_partial_write_reports_count() {
        let buffer = RingBuffer::with_capacity(5, 10).expect("Should create buffer");
        assert_eq!(buffer.write(&ramp(3)), 3);
        assert_eq!(buffer.write(&ramp(4)), 2);
        assert_eq!(buffer.available_to_write(), 0);
    }

    #[test]
    fn test_empty_read_fills_silence() {
        let buffer = RingBuffer::with_capacity(16, 24_000).expect("Should create buffer");
        let mut out = [0.7_f32; 10];

        assert_eq!(buffer.read(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(buffer.underrun_samples(), 10);
        assert_eq!(buffer.underrun_events(), 1);
    }

    #[test]
    fn test_short_read_zero_fills_tail() {
        let buffer = RingBuffer::with_capacity(16, 24_000).expect("Should create buffer");
        buffer.write(&[0.5, -0.5]);

        let mut out = [9.0_f32; 5];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0, 0.0]);
        assert_eq!(buffer.underrun_samples(), 3);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let buffer = RingBuffer::with_capacity(4, 100).expect("Should create buffer");
        let mut out = [0.0; 3];

        for round in 0..10 {
            let base = round as f32 * 10.0;
            assert_eq!(buffer.write(&[base, base + 1.0, base + 2.0]), 3);
            assert_eq!(buffer.read(&mut out), 3);
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = RingBuffer::with_capacity(4, 100).expect("Should create buffer");
        buffer.write(&[1.0, 2.0]);
        let mut out = [0.0; 4];
        buffer.read(&mut out);
        assert_eq!(buffer.underrun_samples(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.underrun_samples(), 0);
        assert_eq!(buffer.underrun_events(), 0);
        assert_eq!(buffer.write(&ramp(4)), 4);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        use std::sync::Arc;

        let buffer = Arc::new(RingBuffer::with_capacity(64, 48_000).expect("Should create buffer"));
        let total = 10_000;
        let input: Vec<f32> = (0..total).map(|i| i as f32).collect();

        let writer = {
            let buffer = Arc::clone(&buffer);
            let input = input.clone();
            std::thread::spawn(move || {
                let mut offset = 0;
                while offset < input.len() {
                    offset += buffer.write(&input[offset..]);
                    std::thread::yield_now();
                }
            })
        };

        let mut received = Vec::with_capacity(total);
        let mut block = [0.0_f32; 17];
        while received.len() < total {
            let n = buffer.read(&mut block);
            received.extend_from_slice(&block[..n]);
            std::thread::yield_now();
        }

        writer.join().expect("Writer thread should finish");
        assert_eq!(received, input);
    }
}
