//! Streaming session orchestration.
//!
//! A session sends one request line, then runs two cooperative loops:
//!
//! - the producer only decodes frames from the channel into an unbounded
//!   queue and never looks at the ring buffer;
//! - the consumer drains that queue into the ring buffer, retrying when it
//!   is full, and drives the state machine from the buffer level.
//!
//! The producer never waits for buffer space; backpressure lives only in the
//! consumer's retry loop.

use crate::config::StreamingConfig;
use crate::error::{SpeakError, SpeakResult};
use crate::playback::{EngineStatus, PlaybackEngine, PlaybackMetrics};
use crate::protocol::{decode_stream, SampleChunk, StreamMessage, SynthesisRequest};
use crate::ring_buffer::RingBuffer;
use crate::sink::AudioSink;
use crate::state_machine::{
    ListenerId, StreamEvent, StreamState, StreamStateMachine, TransitionRecord,
};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedMachine = Arc<Mutex<StreamStateMachine>>;

/// Progress snapshot passed to the progress callback after each chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamProgress {
    /// State after the chunk was handled
    pub state: StreamState,
    /// Chunks consumed so far
    pub chunks_received: u32,
    /// Seconds of audio waiting in the ring buffer
    pub buffered_seconds: f64,
    /// Samples written to the ring buffer so far
    pub total_samples_received: u64,
}

/// Observer called after each consumed chunk
pub type ProgressCallback = Box<dyn FnMut(&StreamProgress) + Send + 'static>;

/// Outcome of a session
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    /// Whether the session ended in `Finished`
    pub success: bool,
    /// Chunks fully written to the ring buffer
    pub total_chunks: u32,
    /// Samples written to the ring buffer
    pub total_samples: u64,
    /// `total_samples` in seconds at the stream's sample rate
    pub total_duration_seconds: f64,
    /// Pulls that could not be filled from the buffer
    pub underrun_count: u64,
    /// Silence samples inserted for missing audio
    pub underrun_samples: u64,
    /// Times playback paused to rebuffer
    pub rebuffer_count: u32,
    /// State the machine ended in
    pub final_state: StreamState,
    /// What went wrong, if anything
    pub error: Option<SpeakError>,
    /// Reason passed to [`CancelHandle::cancel`]
    pub cancel_reason: Option<String>,
    /// Every transition, oldest first
    pub transitions: Vec<TransitionRecord>,
}

/// Apply an event and notify listeners without holding the machine lock,
/// so a listener may itself use a [`CancelHandle`].
fn dispatch(
    machine: &SharedMachine,
    event: StreamEvent,
    buffered_seconds: f64,
) -> Option<TransitionRecord> {
    let (record, listeners) = {
        let mut machine = machine.lock();
        let record = machine.apply(event, buffered_seconds)?;
        (record, machine.listeners())
    };

    for listener in listeners {
        listener(&record);
    }
    Some(record)
}

/// Cloneable handle that cancels a running session
#[derive(Clone)]
pub struct CancelHandle {
    machine: SharedMachine,
    reason: Arc<watch::Sender<Option<String>>>,
    buffered_bits: Arc<AtomicU64>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("reason", &*self.reason.borrow())
            .finish_non_exhaustive()
    }
}

impl CancelHandle {
    fn new(machine: SharedMachine) -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            machine,
            reason: Arc::new(reason),
            buffered_bits: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    /// Cancel the session. Only the first call has an effect; returns
    /// whether this call was it.
    pub fn cancel<S: Into<String>>(&self, reason: S) -> bool {
        let reason = reason.into();
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason.clone());
                true
            }
        });

        if first {
            info!("Cancelling stream: {}", reason);
            dispatch(
                &self.machine,
                StreamEvent::Cancel { reason },
                self.buffered_seconds(),
            );
        }
        first
    }

    /// Whether `cancel` was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.borrow().is_some()
    }

    /// Reason given to the first `cancel`
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.reason.subscribe()
    }

    fn buffered_seconds(&self) -> f64 {
        f64::from_bits(self.buffered_bits.load(Ordering::Acquire))
    }

    fn set_buffered_seconds(&self, seconds: f64) {
        self.buffered_bits.store(seconds.to_bits(), Ordering::Release);
    }
}

/// Cancel `handle` when the process receives Ctrl-C.
///
/// Abort the returned task once the session is over.
#[must_use]
pub fn spawn_interrupt_handler(handle: CancelHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                handle.cancel("interrupted");
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    })
}

/// One streaming request from connect to final result
pub struct StreamSession {
    config: StreamingConfig,
    sink: Option<Box<dyn AudioSink>>,
    machine: SharedMachine,
    cancel: CancelHandle,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create a session that will play through `sink`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: StreamingConfig, sink: Box<dyn AudioSink>) -> SpeakResult<Self> {
        config.validate()?;

        let machine = Arc::new(Mutex::new(StreamStateMachine::new(config.thresholds)));
        let cancel = CancelHandle::new(Arc::clone(&machine));

        Ok(Self {
            config,
            sink: Some(sink),
            machine,
            cancel,
            progress: None,
        })
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Current state machine state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.machine.lock().state()
    }

    /// Handle that cancels this session from any task or thread
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Subscribe to state transitions
    ///
    /// # Errors
    ///
    /// Returns an error if the listener limit is reached.
    pub fn subscribe<F>(&self, listener: F) -> SpeakResult<ListenerId>
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        self.machine.lock().subscribe(listener)
    }

    /// Remove a transition listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.machine.lock().unsubscribe(id)
    }

    /// Observe progress after each consumed chunk
    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&StreamProgress) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
    }

    /// Connect to the synthesis server's Unix socket and stream `request`
    #[cfg(unix)]
    pub async fn run(self, request: &SynthesisRequest) -> StreamResult {
        if let Err(e) = request.validate() {
            return self.fail_early(e);
        }

        let path = self.config.socket_path.clone();
        debug!("Connecting to {}", path.display());

        match tokio::net::UnixStream::connect(&path).await {
            Ok(stream) => self.run_with_channel(stream, request).await,
            Err(e) => {
                let error = SpeakError::connection(format!(
                    "Failed to connect to {}: {e}",
                    path.display()
                ));
                self.fail_early(error)
            }
        }
    }

    /// Stream `request` over an already-open channel
    pub async fn run_with_channel<C>(mut self, mut channel: C, request: &SynthesisRequest) -> StreamResult
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = request.validate() {
            return self.fail_early(e);
        }

        dispatch(&self.machine, StreamEvent::Start, 0.0);

        if let Err(e) = send_request(&mut channel, request).await {
            shutdown(&mut channel).await;
            return self.fail_early(e);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let mut consumer = Consumer {
            config: &self.config,
            machine: &self.machine,
            cancel: &self.cancel,
            sink: self.sink.take(),
            progress: self.progress.take(),
            engine: None,
            chunks_received: 0,
            samples_received: 0,
            generation_error: None,
        };

        let producer = produce(decode_stream(&mut channel), queue_tx, self.cancel.subscribe());
        let (produced, consumed) = tokio::join!(producer, consumer.run(queue_rx));

        let mut fatal = consumed.err().filter(SpeakError::is_fatal);
        if let Err(e) = produced {
            if fatal.is_none() && e.is_fatal() && !self.cancel.is_cancelled() {
                fatal = Some(e);
            }
        }

        if let Some(e) = &fatal {
            error!("Stream failed: {}", e);
            consumer.shutdown_engine().await;
            if self.state() == StreamState::Buffering {
                // The engine is stopped, so nothing buffered will play.
                dispatch(
                    &self.machine,
                    StreamEvent::GenerationError {
                        error: e.to_string(),
                    },
                    0.0,
                );
            }
        } else if !self.cancel.is_cancelled() && self.state() == StreamState::Draining {
            match consumer.wait_for_playback().await {
                Ok(()) => {
                    dispatch(
                        &self.machine,
                        StreamEvent::BufferEmpty,
                        consumer.buffered_seconds(),
                    );
                }
                Err(e) if e.is_fatal() => fatal = Some(e),
                Err(e) => debug!("Drain ended early: {}", e),
            }
        }

        consumer.shutdown_engine().await;
        let metrics = consumer.engine.as_ref().map(PlaybackEngine::metrics);
        let sample_rate = consumer
            .engine
            .as_ref()
            .map_or(self.config.sample_rate, |engine| engine.spec().sample_rate);
        let chunks = consumer.chunks_received;
        let samples = consumer.samples_received;
        let error = fatal.or_else(|| consumer.generation_error.take());
        drop(consumer);

        shutdown(&mut channel).await;
        self.finish(chunks, samples, sample_rate, metrics, error)
    }

    fn fail_early(self, error: SpeakError) -> StreamResult {
        warn!("Stream failed before audio: {}", error);
        dispatch(&self.machine, StreamEvent::Start, 0.0);
        dispatch(
            &self.machine,
            StreamEvent::GenerationError {
                error: error.to_string(),
            },
            0.0,
        );
        let sample_rate = self.config.sample_rate;
        self.finish(0, 0, sample_rate, None, Some(error))
    }

    fn finish(
        self,
        total_chunks: u32,
        total_samples: u64,
        sample_rate: u32,
        metrics: Option<PlaybackMetrics>,
        error: Option<SpeakError>,
    ) -> StreamResult {
        let machine = self.machine.lock();
        let final_state = machine.state();

        let result = StreamResult {
            success: final_state == StreamState::Finished,
            total_chunks,
            total_samples,
            total_duration_seconds: total_samples as f64 / f64::from(sample_rate.max(1)),
            underrun_count: metrics.map_or(0, |m| m.underrun_events),
            underrun_samples: metrics.map_or(0, |m| m.underrun_samples),
            rebuffer_count: machine.rebuffer_count(),
            final_state,
            error,
            cancel_reason: self.cancel.reason(),
            transitions: machine.history().to_vec(),
        };

        info!(
            "Stream {}: {} chunks, {:.2}s of audio, {} underruns, {} rebuffers, final state {}",
            if result.success { "finished" } else { "failed" },
            result.total_chunks,
            result.total_duration_seconds,
            result.underrun_count,
            result.rebuffer_count,
            result.final_state
        );
        result
    }
}

async fn send_request<C>(channel: &mut C, request: &SynthesisRequest) -> SpeakResult<()>
where
    C: AsyncWrite + Unpin,
{
    let line = request.to_json_line()?;
    debug!("Sending request ({} bytes)", line.len());

    channel
        .write_all(line.as_bytes())
        .await
        .map_err(|e| SpeakError::connection(format!("Failed to send request: {e}")))?;
    channel
        .flush()
        .await
        .map_err(|e| SpeakError::connection(format!("Failed to send request: {e}")))
}

async fn shutdown<C>(channel: &mut C)
where
    C: AsyncWrite + Unpin,
{
    if let Err(e) = channel.shutdown().await {
        debug!("Channel shutdown: {}", e);
    }
}

/// Decode messages into the queue until End, Error, a decode failure,
/// cancellation, or the consumer going away.
async fn produce<S>(
    messages: S,
    queue: mpsc::UnboundedSender<StreamMessage>,
    mut cancel: watch::Receiver<Option<String>>,
) -> SpeakResult<()>
where
    S: Stream<Item = SpeakResult<StreamMessage>>,
{
    futures::pin_mut!(messages);

    loop {
        if let Some(reason) = cancel.borrow_and_update().clone() {
            debug!("Producer stopping: cancelled");
            return Err(SpeakError::cancelled(reason));
        }

        let next = tokio::select! {
            next = messages.next() => next,
            _ = cancel.changed() => continue,
            () = queue.closed() => {
                debug!("Producer stopping: consumer exited");
                return Ok(());
            }
        };

        match next {
            Some(Ok(message)) => {
                let terminal = message.is_terminal();
                if queue.send(message).is_err() {
                    return Ok(());
                }
                if terminal {
                    return Ok(());
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(SpeakError::connection_closed(
                    "stream ended without an end marker",
                ))
            }
        }
    }
}

struct Consumer<'a> {
    config: &'a StreamingConfig,
    machine: &'a SharedMachine,
    cancel: &'a CancelHandle,
    sink: Option<Box<dyn AudioSink>>,
    progress: Option<ProgressCallback>,
    engine: Option<PlaybackEngine>,
    chunks_received: u32,
    samples_received: u64,
    generation_error: Option<SpeakError>,
}

impl Consumer<'_> {
    async fn run(&mut self, mut queue: mpsc::UnboundedReceiver<StreamMessage>) -> SpeakResult<()> {
        let mut cancel = self.cancel.subscribe();
        let mut ticker = tokio::time::interval(self.config.level_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Some(reason) = cancel.borrow_and_update().clone() {
                debug!("Consumer stopping: cancelled");
                return Err(SpeakError::cancelled(reason));
            }
            self.check_sink()?;

            tokio::select! {
                message = queue.recv() => match message {
                    Some(StreamMessage::Chunk(chunk)) => self.on_chunk(chunk).await?,
                    Some(StreamMessage::End { total_chunks }) => {
                        self.on_end(total_chunks)?;
                        return Ok(());
                    }
                    Some(StreamMessage::Error { message }) => {
                        self.on_generation_error(message)?;
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => self.check_level()?,
                _ = cancel.changed() => {}
            }
        }
    }

    async fn on_chunk(&mut self, chunk: SampleChunk) -> SpeakResult<()> {
        if self.engine.is_none() {
            self.engine = Some(self.create_engine(chunk.sample_rate)?);
        }

        debug!(
            "Chunk {}: {} samples ({:.3}s)",
            chunk.id,
            chunk.len(),
            chunk.duration_secs()
        );

        let (written, complete) = self.write_chunk(&chunk).await?;
        self.samples_received += written as u64;
        if !complete {
            return Ok(());
        }
        self.chunks_received += 1;

        self.dispatch(StreamEvent::ChunkReceived {
            samples: chunk.len(),
            chunk_id: chunk.id,
        })?;
        self.check_level()?;

        if let Some(callback) = self.progress.as_mut() {
            let progress = StreamProgress {
                state: self.machine.lock().state(),
                chunks_received: self.chunks_received,
                buffered_seconds: self
                    .engine
                    .as_ref()
                    .map_or(0.0, |engine| engine.buffer().buffered_seconds()),
                total_samples_received: self.samples_received,
            };
            callback(&progress);
        }
        Ok(())
    }

    /// Write with retry while the buffer is full. Returns the samples written
    /// and whether the whole chunk made it in before a cancel.
    async fn write_chunk(&self, chunk: &SampleChunk) -> SpeakResult<(usize, bool)> {
        let Some(engine) = self.engine.as_ref() else {
            return Err(SpeakError::concurrency("Playback engine missing"));
        };

        if chunk.sample_rate != 0 && chunk.sample_rate != engine.spec().sample_rate {
            warn!(
                "Chunk {} is {}Hz but playback runs at {}Hz",
                chunk.id,
                chunk.sample_rate,
                engine.spec().sample_rate
            );
        }

        let mut offset = 0;
        loop {
            offset += engine.write(&chunk.samples[offset..]);
            if offset == chunk.len() {
                return Ok((offset, true));
            }

            // Partial write: a full buffer while buffering is enough to start.
            self.dispatch(StreamEvent::ChunkReceived {
                samples: offset,
                chunk_id: chunk.id,
            })?;
            self.check_level()?;
            self.check_sink()?;
            if self.cancel.is_cancelled() {
                return Ok((offset, false));
            }

            tokio::time::sleep(self.config.write_retry_delay()).await;
        }
    }

    fn on_end(&mut self, total_chunks: u32) -> SpeakResult<()> {
        if total_chunks != self.chunks_received {
            warn!(
                "Server reports {} chunks, received {}",
                total_chunks, self.chunks_received
            );
        }
        info!("Generation complete: {} chunks", total_chunks);
        self.dispatch(StreamEvent::GenerationComplete { total_chunks })
    }

    fn on_generation_error(&mut self, message: String) -> SpeakResult<()> {
        warn!("Server reported a generation error: {}", message);
        self.generation_error = Some(SpeakError::generation(message.clone()));
        self.dispatch(StreamEvent::GenerationError { error: message })
    }

    fn create_engine(&mut self, sample_rate: u32) -> SpeakResult<PlaybackEngine> {
        let sample_rate = if sample_rate == 0 {
            self.config.sample_rate
        } else {
            sample_rate
        };
        let buffer = RingBuffer::new(self.config.buffer_duration_secs, sample_rate)?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| SpeakError::concurrency("Audio sink already in use"))?;

        Ok(PlaybackEngine::new(
            Arc::new(buffer),
            sink,
            self.config.block_size,
        ))
    }

    fn buffered_seconds(&self) -> f64 {
        let seconds = self
            .engine
            .as_ref()
            .map_or(0.0, |engine| engine.buffer().buffered_seconds());
        self.cancel.set_buffered_seconds(seconds);
        seconds
    }

    fn dispatch(&self, event: StreamEvent) -> SpeakResult<()> {
        match dispatch(self.machine, event, self.buffered_seconds()) {
            Some(record) => self.react(&record),
            None => Ok(()),
        }
    }

    /// Compare the buffer level against the thresholds of the current state
    fn check_level(&self) -> SpeakResult<()> {
        let buffered_seconds = self.buffered_seconds();
        let thresholds = self.config.thresholds;

        let state = self.machine.lock().state();
        match state {
            StreamState::Playing if buffered_seconds < thresholds.min_buffer_secs => {
                self.dispatch(StreamEvent::BufferLow { buffered_seconds })
            }
            StreamState::Rebuffering if buffered_seconds >= thresholds.resume_buffer_secs => {
                self.dispatch(StreamEvent::BufferOk { buffered_seconds })
            }
            _ => Ok(()),
        }
    }

    fn check_sink(&self) -> SpeakResult<()> {
        match self.engine.as_ref().map(PlaybackEngine::status) {
            Some(EngineStatus::Failed(message)) => Err(SpeakError::sink(message)),
            _ => Ok(()),
        }
    }

    /// Drive the engine to match a transition
    fn react(&self, record: &TransitionRecord) -> SpeakResult<()> {
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };

        match (record.from, record.to) {
            (StreamState::Buffering, StreamState::Playing) => engine.start(),
            (StreamState::Rebuffering, StreamState::Playing) => {
                engine.resume();
                Ok(())
            }
            (_, StreamState::Rebuffering) => {
                engine.pause();
                Ok(())
            }
            (_, StreamState::Draining) => {
                engine.start_draining();
                engine.resume();
                engine.start()
            }
            _ => Ok(()),
        }
    }

    async fn wait_for_playback(&self) -> SpeakResult<()> {
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };
        if !engine.is_active() {
            return Ok(());
        }

        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            result = engine.wait_for_completion() => result,
            _ = cancel.wait_for(Option::is_some) => {
                debug!("Cancelled while draining");
                Err(SpeakError::cancelled(self.cancel.reason().unwrap_or_default()))
            }
        }
    }

    async fn shutdown_engine(&self) {
        if let Some(engine) = self.engine.as_ref() {
            if let Err(e) = engine.shutdown().await {
                warn!("Playback engine shutdown: {}", e);
            }
        }
    }
}
