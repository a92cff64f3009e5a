//! Thread-driven sink for tests and machines without audio output.

use super::{AudioSink, PullCallback, PullStatus, SinkEvent};
use crate::config::SinkSpec;
use crate::error::{SpeakError, SpeakResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Capture {
    samples: Mutex<Vec<f32>>,
    spec: Mutex<Option<SinkSpec>>,
    pulls: AtomicU64,
    opened: AtomicBool,
    closed: AtomicBool,
    flushed: AtomicBool,
}

/// Read-only view of what a [`MockSink`] received
#[derive(Debug, Clone, Default)]
pub struct MockSinkHandle {
    capture: Arc<Capture>,
}

impl MockSinkHandle {
    /// Every sample delivered, silence included
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.capture.samples.lock().clone()
    }

    /// Delivered samples that are not exact silence
    #[must_use]
    pub fn audible_samples(&self) -> Vec<f32> {
        self.capture
            .samples
            .lock()
            .iter()
            .copied()
            .filter(|s| *s != 0.0)
            .collect()
    }

    /// Number of pull callbacks made
    #[must_use]
    pub fn pull_count(&self) -> u64 {
        self.capture.pulls.load(Ordering::Acquire)
    }

    /// Spec the sink was opened with
    #[must_use]
    pub fn spec(&self) -> Option<SinkSpec> {
        *self.capture.spec.lock()
    }

    /// Whether `open` succeeded
    #[must_use]
    pub fn was_opened(&self) -> bool {
        self.capture.opened.load(Ordering::Acquire)
    }

    /// Whether the sink reported `Flushed`
    #[must_use]
    pub fn was_flushed(&self) -> bool {
        self.capture.flushed.load(Ordering::Acquire)
    }

    /// Whether the sink has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.capture.closed.load(Ordering::Acquire)
    }
}

/// Simulated output device.
///
/// Pulls one block per block period (scaled by `speed`), waits `latency`
/// after the final block before reporting `Flushed`, then holds the device
/// for `close_delay` before reporting `Closed`. Can be told to fail after a
/// number of pulls.
#[derive(Debug)]
pub struct MockSink {
    speed: f64,
    latency: Duration,
    close_delay: Duration,
    fail_after: Option<u64>,
    handle: MockSinkHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSink {
    /// Real-time sink with 20 ms of simulated output latency
    #[must_use]
    pub fn new() -> Self {
        Self {
            speed: 1.0,
            latency: Duration::from_millis(20),
            close_delay: Duration::ZERO,
            fail_after: None,
            handle: MockSinkHandle::default(),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Run the clock `speed` times faster than real time
    #[must_use]
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Delay between the final block and the flush notification
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay between `Flushed` and `Closed`; `close` cuts it short
    #[must_use]
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Report a device error after `pulls` blocks
    #[must_use]
    pub fn failing_after(mut self, pulls: u64) -> Self {
        self.fail_after = Some(pulls);
        self
    }

    /// Inspection handle sharing this sink's capture
    #[must_use]
    pub fn handle(&self) -> MockSinkHandle {
        self.handle.clone()
    }

    fn block_period(&self, spec: &SinkSpec) -> Duration {
        if self.speed.is_finite() && self.speed > 0.0 {
            spec.block_duration().div_f64(self.speed)
        } else {
            Duration::ZERO
        }
    }
}

impl AudioSink for MockSink {
    fn open(
        &mut self,
        spec: SinkSpec,
        mut pull: PullCallback,
        events: UnboundedSender<SinkEvent>,
    ) -> SpeakResult<()> {
        if self.thread.is_some() {
            return Err(SpeakError::sink("Mock sink is already open"));
        }
        if spec.block_size == 0 {
            return Err(SpeakError::sink("Block size must be greater than 0"));
        }

        let period = self.block_period(&spec);
        let latency = self.latency;
        let close_delay = self.close_delay;
        let fail_after = self.fail_after;
        let stop = Arc::clone(&self.stop);
        let capture = Arc::clone(&self.handle.capture);

        info!(
            "Opening mock sink: {}Hz, {} samples per block, period {:?}",
            spec.sample_rate, spec.block_size, period
        );
        *capture.spec.lock() = Some(spec);
        capture.opened.store(true, Ordering::Release);

        let thread = std::thread::Builder::new()
            .name("mock-sink".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; spec.block_size];

                while !stop.load(Ordering::Acquire) {
                    let pulls = capture.pulls.load(Ordering::Acquire);
                    if fail_after.is_some_and(|limit| pulls >= limit) {
                        warn!("Mock sink failing after {} pulls", pulls);
                        let _ = events.send(SinkEvent::Error(format!(
                            "simulated device failure after {pulls} blocks"
                        )));
                        capture.closed.store(true, Ordering::Release);
                        return;
                    }

                    let status = pull(&mut block);
                    capture.samples.lock().extend_from_slice(&block);
                    capture.pulls.fetch_add(1, Ordering::AcqRel);

                    if status == PullStatus::Finished {
                        std::thread::sleep(latency);
                        debug!("Mock sink flushed");
                        capture.flushed.store(true, Ordering::Release);
                        let _ = events.send(SinkEvent::Flushed);
                        hold_open(close_delay, &stop);
                        break;
                    }

                    std::thread::sleep(period);
                }

                capture.closed.store(true, Ordering::Release);
                let _ = events.send(SinkEvent::Closed);
            })
            .map_err(|e| SpeakError::sink(format!("Failed to spawn mock sink thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Mock sink thread panicked");
            }
            debug!("Mock sink closed");
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn hold_open(delay: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !stop.load(Ordering::Acquire) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(5)));
    }
}

impl Drop for MockSink {
    fn drop(&mut self) {
        self.close();
    }
}
