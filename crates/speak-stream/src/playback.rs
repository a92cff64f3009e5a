//! Playback engine: answers sink pulls from the ring buffer.
//!
//! The engine sits between the consumer loop (the only writer of the ring
//! buffer) and the sink's pull callback (the only reader). Control flags are
//! atomics so the callback never blocks, whichever thread the sink runs it on.

use crate::config::SinkSpec;
use crate::error::{SpeakError, SpeakResult};
use crate::ring_buffer::RingBuffer;
use crate::sink::{AudioSink, PullCallback, PullStatus, SinkEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine lifecycle as seen by waiters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Sink not opened yet
    Idle,
    /// Sink is pulling
    Running,
    /// Sink confirmed close after the final block
    Completed,
    /// Stopped before completion
    Stopped,
    /// Sink reported an error
    Failed(String),
}

impl EngineStatus {
    /// Whether the engine will not pull again
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed(_))
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackMetrics {
    /// Seconds of audio waiting in the ring buffer
    pub buffered_seconds: f64,
    /// Samples accepted from the consumer
    pub total_written: u64,
    /// Samples handed to the sink
    pub total_forwarded: u64,
    /// Pulls answered with a full block of silence
    pub silent_blocks: u64,
    /// Silence samples substituted for missing data
    pub underrun_samples: u64,
    /// Reads that came up short
    pub underrun_events: u64,
    /// Whether the sink is pulling and not paused
    pub is_playing: bool,
    /// Whether the final block has been delivered
    pub is_finished: bool,
}

#[derive(Debug, Default)]
struct EngineFlags {
    started: AtomicBool,
    paused: AtomicBool,
    draining: AtomicBool,
    finished: AtomicBool,
    stopped: AtomicBool,
    total_written: AtomicU64,
    total_forwarded: AtomicU64,
    silent_blocks: AtomicU64,
}

/// Pull-driven adapter from the ring buffer to an [`AudioSink`]
pub struct PlaybackEngine {
    buffer: Arc<RingBuffer>,
    flags: Arc<EngineFlags>,
    sink: SharedSink,
    sink_name: String,
    spec: SinkSpec,
    status: Arc<watch::Sender<EngineStatus>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("sink", &self.sink_name)
            .field("spec", &self.spec)
            .field("status", &*self.status.borrow())
            .field("buffered_seconds", &self.buffer.buffered_seconds())
            .finish_non_exhaustive()
    }
}

impl PlaybackEngine {
    /// Create an engine over `buffer`; the sink is opened by [`start`](Self::start)
    #[must_use]
    pub fn new(buffer: Arc<RingBuffer>, sink: Box<dyn AudioSink>, block_size: usize) -> Self {
        let spec = SinkSpec::mono(buffer.sample_rate(), block_size);
        let (status, _) = watch::channel(EngineStatus::Idle);

        Self {
            buffer,
            flags: Arc::new(EngineFlags::default()),
            sink_name: sink.name().to_string(),
            sink: Arc::new(Mutex::new(Some(sink))),
            spec,
            status: Arc::new(status),
            monitor: Mutex::new(None),
        }
    }

    /// Ring buffer shared with the pull callback
    #[must_use]
    pub const fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Spec the sink is opened with
    #[must_use]
    pub const fn spec(&self) -> SinkSpec {
        self.spec
    }

    /// Write samples into the ring buffer; returns how many fit
    pub fn write(&self, samples: &[f32]) -> usize {
        let written = self.buffer.write(samples);
        self.flags
            .total_written
            .fetch_add(written as u64, Ordering::AcqRel);
        written
    }

    /// Begin the pull cycle. A second call is a no-op.
    ///
    /// The sink is opened on the blocking pool; an open failure is reported
    /// through [`status`](Self::status) as [`EngineStatus::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the engine was stopped or no Tokio runtime is
    /// available.
    pub fn start(&self) -> SpeakResult<()> {
        if self.flags.stopped.load(Ordering::Acquire) {
            return Err(SpeakError::sink("Cannot start a stopped playback engine"));
        }
        if self.flags.started.swap(true, Ordering::AcqRel) {
            debug!("Playback engine already started");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.flags.started.store(false, Ordering::Release);
            SpeakError::concurrency(format!("Playback engine needs a Tokio runtime: {e}"))
        })?;

        info!(
            "Starting playback on '{}' ({}Hz, {} samples per block, {:.2}s buffered)",
            self.sink_name,
            self.spec.sample_rate,
            self.spec.block_size,
            self.buffer.buffered_seconds()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.status.send_replace(EngineStatus::Running);
        let monitor = runtime.spawn(monitor_sink(
            events_rx,
            Arc::clone(&self.flags),
            Arc::clone(&self.status),
        ));
        *self.monitor.lock() = Some(monitor);

        let sink = Arc::clone(&self.sink);
        let flags = Arc::clone(&self.flags);
        let spec = self.spec;
        let pull = self.pull_callback();
        drop(runtime.spawn_blocking(move || open_sink(&sink, &flags, spec, pull, events_tx)));

        Ok(())
    }

    /// Answer pulls with silence without consuming the buffer
    pub fn pause(&self) {
        if !self.flags.paused.swap(true, Ordering::AcqRel) {
            debug!(
                "Playback paused at {:.2}s buffered",
                self.buffer.buffered_seconds()
            );
        }
    }

    /// Resume consuming the buffer after [`pause`](Self::pause)
    pub fn resume(&self) {
        if self.flags.paused.swap(false, Ordering::AcqRel) {
            debug!(
                "Playback resumed at {:.2}s buffered",
                self.buffer.buffered_seconds()
            );
        }
    }

    /// Mark that no further writes will happen
    pub fn start_draining(&self) {
        if !self.flags.draining.swap(true, Ordering::AcqRel) {
            info!(
                "Draining {:.2}s of buffered audio",
                self.buffer.buffered_seconds()
            );
        }
    }

    /// Whether the sink was opened and the engine has not been stopped
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flags.started.load(Ordering::Acquire) && !self.flags.stopped.load(Ordering::Acquire)
    }

    /// Whether the sink is pulling and not paused
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.is_active()
            && !self.flags.paused.load(Ordering::Acquire)
            && !self.flags.finished.load(Ordering::Acquire)
    }

    /// Whether the final block has been delivered or the engine stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::Acquire)
    }

    /// Current lifecycle status
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> PlaybackMetrics {
        PlaybackMetrics {
            buffered_seconds: self.buffer.buffered_seconds(),
            total_written: self.flags.total_written.load(Ordering::Acquire),
            total_forwarded: self.flags.total_forwarded.load(Ordering::Acquire),
            silent_blocks: self.flags.silent_blocks.load(Ordering::Acquire),
            underrun_samples: self.buffer.underrun_samples(),
            underrun_events: self.buffer.underrun_events(),
            is_playing: self.is_playing(),
            is_finished: self.is_finished(),
        }
    }

    /// Wait until the sink confirms close.
    ///
    /// Returns immediately if the engine never started.
    ///
    /// # Errors
    ///
    /// Returns a sink error if the device failed.
    pub async fn wait_for_completion(&self) -> SpeakResult<()> {
        if !self.flags.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut status = self.status.subscribe();
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                EngineStatus::Completed | EngineStatus::Stopped => return Ok(()),
                EngineStatus::Failed(message) => return Err(SpeakError::sink(message)),
                EngineStatus::Idle | EngineStatus::Running => {}
            }

            // The sender lives in `self`, so this only fails on teardown.
            if status.changed().await.is_err() {
                return Err(SpeakError::concurrency("Playback status channel closed"));
            }
        }
    }

    /// Halt immediately and release the sink, closing it on the blocking
    /// pool. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a concurrency error if the close task panicked.
    pub async fn shutdown(&self) -> SpeakResult<()> {
        if !self.halt() {
            return Ok(());
        }

        let sink = Arc::clone(&self.sink);
        let closed = tokio::task::spawn_blocking(move || close_sink(&sink))
            .await
            .map_err(SpeakError::from);
        self.log_stopped();
        closed
    }

    /// Halt immediately and release the sink on the calling thread.
    /// Idempotent; prefer [`shutdown`](Self::shutdown) inside a runtime.
    pub fn stop(&self) {
        if self.halt() {
            close_sink(&self.sink);
            self.log_stopped();
        }
    }

    /// Flag the engine stopped; returns whether this call did it
    fn halt(&self) -> bool {
        if self.flags.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.flags.finished.store(true, Ordering::Release);

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        self.status.send_if_modified(|status| {
            if status.is_done() {
                false
            } else {
                *status = EngineStatus::Stopped;
                true
            }
        });
        true
    }

    fn log_stopped(&self) {
        let metrics = self.metrics();
        info!(
            "Playback stopped: {} of {} samples forwarded, {} underrun samples",
            metrics.total_forwarded, metrics.total_written, metrics.underrun_samples
        );
    }

    fn pull_callback(&self) -> PullCallback {
        let buffer = Arc::clone(&self.buffer);
        let flags = Arc::clone(&self.flags);

        Box::new(move |output: &mut [f32]| {
            if flags.finished.load(Ordering::Acquire) {
                output.fill(0.0);
                return PullStatus::Finished;
            }

            if flags.paused.load(Ordering::Acquire) {
                output.fill(0.0);
                return PullStatus::Continue;
            }

            if flags.draining.load(Ordering::Acquire) {
                // Only what is there; the tail of the last block is not an underrun.
                let available = output.len().min(buffer.available_to_read());
                let read = buffer.read(&mut output[..available]);
                output[read..].fill(0.0);
                let forwarded = flags
                    .total_forwarded
                    .fetch_add(read as u64, Ordering::AcqRel)
                    + read as u64;

                if buffer.is_empty() && forwarded >= flags.total_written.load(Ordering::Acquire) {
                    flags.finished.store(true, Ordering::Release);
                    return PullStatus::Finished;
                }
                return PullStatus::Continue;
            }

            let read = buffer.read(output);
            flags
                .total_forwarded
                .fetch_add(read as u64, Ordering::AcqRel);
            if read == 0 {
                flags.silent_blocks.fetch_add(1, Ordering::Relaxed);
            }
            PullStatus::Continue
        })
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

type SharedSink = Arc<Mutex<Option<Box<dyn AudioSink>>>>;

fn open_sink(
    sink: &SharedSink,
    flags: &EngineFlags,
    spec: SinkSpec,
    pull: PullCallback,
    events: mpsc::UnboundedSender<SinkEvent>,
) {
    let mut guard = sink.lock();
    let Some(sink) = guard.as_mut() else {
        return;
    };
    if flags.stopped.load(Ordering::Acquire) {
        debug!("Playback stopped before '{}' opened", sink.name());
        return;
    }

    let failure = events.clone();
    if let Err(e) = sink.open(spec, pull, events) {
        error!("Failed to open sink '{}': {}", sink.name(), e);
        let _ = failure.send(SinkEvent::Error(e.to_string()));
    }
}

fn close_sink(sink: &SharedSink) {
    let taken = sink.lock().take();
    if let Some(mut sink) = taken {
        debug!("Closing sink '{}'", sink.name());
        sink.close();
    }
}

async fn monitor_sink(
    mut events: mpsc::UnboundedReceiver<SinkEvent>,
    flags: Arc<EngineFlags>,
    status: Arc<watch::Sender<EngineStatus>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Flushed => debug!("Sink flushed"),
            SinkEvent::Closed => {
                flags.finished.store(true, Ordering::Release);
                status.send_if_modified(|current| {
                    if current.is_done() {
                        false
                    } else {
                        *current = EngineStatus::Completed;
                        true
                    }
                });
                debug!("Sink closed");
                return;
            }
            SinkEvent::Error(message) => {
                error!("Sink error: {}", message);
                flags.finished.store(true, Ordering::Release);
                status.send_replace(EngineStatus::Failed(message));
                return;
            }
        }
    }

    if !flags.stopped.load(Ordering::Acquire) {
        warn!("Sink dropped its event channel without closing");
        flags.finished.store(true, Ordering::Release);
        status.send_replace(EngineStatus::Failed(
            "sink exited without closing".to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MockSink;
    use std::time::Duration;

    fn fast_sink() -> MockSink {
        MockSink::new().with_speed(50.0).with_latency(Duration::from_millis(1))
    }

    fn engine_with(sink: MockSink, seconds: f64) -> PlaybackEngine {
        let buffer = Arc::new(RingBuffer::new(seconds, 24_000).expect("Should create buffer"));
        PlaybackEngine::new(buffer, Box::new(sink), 240)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("Condition should hold in time");
    }

    #[tokio::test]
    async fn test_drains_everything_written() {
        let sink = fast_sink();
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);

        assert_eq!(engine.write(&vec![0.25; 1000]), 1000);
        engine.start_draining();
        engine.start().expect("Should start");

        tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion())
            .await
            .expect("Should complete")
            .expect("Sink should not fail");

        let metrics = engine.metrics();
        assert_eq!(metrics.total_forwarded, 1000);
        assert!(metrics.is_finished);
        assert_eq!(metrics.underrun_samples, 0);
        assert_eq!(handle.audible_samples().len(), 1000);
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[tokio::test]
    async fn test_flush_alone_does_not_complete() {
        let sink = fast_sink().with_close_delay(Duration::from_millis(300));
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);

        engine.write(&vec![0.25; 480]);
        engine.start_draining();
        engine.start().expect("Should start");

        wait_until(|| handle.was_flushed()).await;
        let early = tokio::time::timeout(Duration::from_millis(50), engine.wait_for_completion()).await;
        assert!(early.is_err(), "Completion must wait for the sink to close");
        assert_eq!(engine.status(), EngineStatus::Running);
        assert!(!handle.is_closed());

        tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion())
            .await
            .expect("Should complete once closed")
            .expect("Sink should not fail");
        assert!(handle.is_closed());
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[tokio::test]
    async fn test_underrun_emits_silent_blocks() {
        let sink = fast_sink();
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);

        engine.start().expect("Should start");
        wait_until(|| handle.pull_count() >= 2).await;

        let metrics = engine.metrics();
        assert!(metrics.silent_blocks > 0);
        assert!(metrics.underrun_samples >= 240);
        assert!(handle.audible_samples().is_empty());
        engine.shutdown().await.expect("Should shut down");
    }

    #[tokio::test]
    async fn test_pause_keeps_buffer() {
        let sink = fast_sink();
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);

        engine.pause();
        engine.write(&vec![0.5; 4800]);
        engine.start().expect("Should start");
        wait_until(|| handle.pull_count() >= 2).await;

        assert_eq!(engine.buffer().available_to_read(), 4800);
        assert!(!engine.is_playing());
        assert_eq!(engine.buffer().underrun_samples(), 0);

        engine.resume();
        engine.start_draining();
        tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion())
            .await
            .expect("Should complete")
            .expect("Sink should not fail");
        assert_eq!(engine.metrics().total_forwarded, 4800);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_hang() {
        let engine = engine_with(fast_sink().failing_after(3), 1.0);
        engine.write(&vec![0.5; 24_000]);
        engine.start().expect("Should start");

        let result = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion())
            .await
            .expect("Should not hang");
        assert!(matches!(result, Err(SpeakError::SinkError { .. })));
        assert!(engine.is_finished());
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let buffer = Arc::new(RingBuffer::new(1.0, 24_000).expect("Should create buffer"));
        let engine = PlaybackEngine::new(buffer, Box::new(fast_sink()), 0);
        engine.start().expect("Opening happens in the background");

        let result = tokio::time::timeout(Duration::from_secs(5), engine.wait_for_completion())
            .await
            .expect("Should not hang");
        let Err(SpeakError::SinkError { message }) = result else {
            panic!("Expected a sink error, got {result:?}");
        };
        assert!(message.contains("Block size"));
        assert!(matches!(engine.status(), EngineStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let sink = fast_sink();
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);
        engine.start().expect("Should start");
        wait_until(|| handle.was_opened()).await;

        engine.shutdown().await.expect("Should shut down");
        engine.shutdown().await.expect("Second shutdown is a no-op");
        engine.stop();
        assert!(handle.is_closed());
        assert!(!engine.is_active());
        assert!(engine.start().is_err());
        engine
            .wait_for_completion()
            .await
            .expect("Stopped engine should not report failure");
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_open_skips_sink() {
        let sink = fast_sink();
        let handle = sink.handle();
        let engine = engine_with(sink, 1.0);

        engine.start().expect("Should start");
        engine.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!engine.is_active());
        assert_eq!(engine.status(), EngineStatus::Stopped);
        // Whichever ran first, the sink ends up released
        assert!(!handle.was_opened() || handle.is_closed());
    }

    #[tokio::test]
    async fn test_wait_without_start_returns() {
        let engine = engine_with(fast_sink(), 1.0);
        engine.wait_for_completion().await.expect("Should return immediately");
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn test_start_requires_runtime() {
        let engine = engine_with(fast_sink(), 1.0);
        let err = engine.start().unwrap_err();
        assert!(matches!(err, SpeakError::ConcurrencyError { .. }));
        assert!(!engine.is_active());
    }
}
