//! Playback state machine.
//!
//! Pure transition logic for one streaming session. Every transition is
//! logged on the `speak_stream::transition` target and handed to subscribed
//! listeners together with the buffer level and thresholds that produced it;
//! that trail is what explains a stutter or a late start after the fact.

use crate::config::BufferThresholds;
use crate::error::{SpeakError, SpeakResult};
use std::sync::Arc;
use tracing::{info, trace};

/// Maximum number of concurrently subscribed listeners
pub const MAX_LISTENERS: usize = 8;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Nothing requested yet
    Idle,
    /// Waiting for the initial cushion of audio
    Buffering,
    /// Audio is being played
    Playing,
    /// Playback paused until the buffer recovers
    Rebuffering,
    /// Generation is over, playing out what is buffered
    Draining,
    /// Session ended normally or was cancelled
    Finished,
    /// Session failed before any audio was playable
    Error,
}

impl StreamState {
    /// Whether no further transitions can happen
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Buffering => write!(f, "BUFFERING"),
            Self::Playing => write!(f, "PLAYING"),
            Self::Rebuffering => write!(f, "REBUFFERING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The request was sent
    Start,
    /// A chunk was written to the ring buffer
    ChunkReceived {
        /// Samples in the chunk
        samples: usize,
        /// Sender sequence id
        chunk_id: u32,
    },
    /// The sender finished
    GenerationComplete {
        /// Chunks the sender reports
        total_chunks: u32,
    },
    /// The sender failed
    GenerationError {
        /// Failure description
        error: String,
    },
    /// Buffer level fell
    BufferLow {
        /// Level that triggered the event
        buffered_seconds: f64,
    },
    /// Buffer level recovered
    BufferOk {
        /// Level that triggered the event
        buffered_seconds: f64,
    },
    /// Everything buffered has been played
    BufferEmpty,
    /// The user cancelled
    Cancel {
        /// Why
        reason: String,
    },
}

impl StreamEvent {
    /// Event name as it appears in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::ChunkReceived { .. } => "CHUNK_RECEIVED",
            Self::GenerationComplete { .. } => "GENERATION_COMPLETE",
            Self::GenerationError { .. } => "GENERATION_ERROR",
            Self::BufferLow { .. } => "BUFFER_LOW",
            Self::BufferOk { .. } => "BUFFER_OK",
            Self::BufferEmpty => "BUFFER_EMPTY",
            Self::Cancel { .. } => "CANCEL",
        }
    }
}

impl std::fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    /// 1-based transition counter
    pub sequence: u64,
    /// State before
    pub from: StreamState,
    /// State after
    pub to: StreamState,
    /// Event that caused it
    pub event: StreamEvent,
    /// Buffer level at the time
    pub buffered_seconds: f64,
    /// Thresholds in force
    pub thresholds: BufferThresholds,
}

/// Handle returned by [`StreamStateMachine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Transition observer
pub type StateListener = Arc<dyn Fn(&TransitionRecord) + Send + Sync>;

/// State machine for one session
pub struct StreamStateMachine {
    state: StreamState,
    thresholds: BufferThresholds,
    transition_count: u64,
    rebuffer_count: u32,
    history: Vec<TransitionRecord>,
    listeners: Vec<(ListenerId, StateListener)>,
    next_listener_id: u64,
}

impl std::fmt::Debug for StreamStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStateMachine")
            .field("state", &self.state)
            .field("thresholds", &self.thresholds)
            .field("transition_count", &self.transition_count)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl StreamStateMachine {
    /// Create a machine in `Idle`
    #[must_use]
    pub const fn new(thresholds: BufferThresholds) -> Self {
        Self {
            state: StreamState::Idle,
            thresholds,
            transition_count: 0,
            rebuffer_count: 0,
            history: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the machine reached `Finished` or `Error`
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Active thresholds
    #[must_use]
    pub const fn thresholds(&self) -> &BufferThresholds {
        &self.thresholds
    }

    /// Number of transitions applied
    #[must_use]
    pub const fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Number of PLAYING to REBUFFERING transitions
    #[must_use]
    pub const fn rebuffer_count(&self) -> u32 {
        self.rebuffer_count
    }

    /// All transitions so far, oldest first
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Register a transition listener
    ///
    /// # Errors
    ///
    /// Returns an error if [`MAX_LISTENERS`] are already subscribed.
    pub fn subscribe<F>(&mut self, listener: F) -> SpeakResult<ListenerId>
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(SpeakError::invalid_input(format!(
                "At most {MAX_LISTENERS} state listeners can be subscribed"
            )));
        }

        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    /// Remove a listener; returns whether it was subscribed
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Apply an event and notify listeners of the resulting transition.
    ///
    /// Events with no matching rule for the current state, and every event
    /// after a terminal state, are ignored and return `None`.
    pub fn dispatch(&mut self, event: StreamEvent, buffered_seconds: f64) -> Option<TransitionRecord> {
        let record = self.apply(event, buffered_seconds)?;
        for listener in self.listeners() {
            listener(&record);
        }
        Some(record)
    }

    /// Apply an event without notifying listeners
    pub(crate) fn apply(&mut self, event: StreamEvent, buffered_seconds: f64) -> Option<TransitionRecord> {
        let Some(next) = self.next_state(&event, buffered_seconds) else {
            trace!(
                "Ignoring {} in {} (buffered {:.2}s)",
                event,
                self.state,
                buffered_seconds
            );
            return None;
        };

        self.transition_count += 1;
        if self.state == StreamState::Playing && next == StreamState::Rebuffering {
            self.rebuffer_count += 1;
        }

        let record = TransitionRecord {
            sequence: self.transition_count,
            from: self.state,
            to: next,
            event,
            buffered_seconds,
            thresholds: self.thresholds,
        };

        info!(
            target: "speak_stream::transition",
            seq = record.sequence,
            from = %record.from,
            to = %record.to,
            event = %record.event,
            buffered_seconds = record.buffered_seconds,
            initial = record.thresholds.initial_buffer_secs,
            min = record.thresholds.min_buffer_secs,
            resume = record.thresholds.resume_buffer_secs,
            "State transition"
        );

        self.state = next;
        self.history.push(record.clone());
        Some(record)
    }

    /// Snapshot of subscribed listeners
    pub(crate) fn listeners(&self) -> Vec<StateListener> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn next_state(&self, event: &StreamEvent, buffered_seconds: f64) -> Option<StreamState> {
        use StreamEvent as E;
        use StreamState as S;

        if self.state.is_terminal() {
            return None;
        }

        if matches!(event, E::Cancel { .. }) {
            return Some(S::Finished);
        }

        let t = &self.thresholds;
        match (self.state, event) {
            (S::Idle, E::Start) => Some(S::Buffering),

            (S::Buffering, E::ChunkReceived { .. }) if buffered_seconds >= t.initial_buffer_secs => {
                Some(S::Playing)
            }
            (S::Buffering, E::GenerationComplete { .. }) => Some(S::Draining),
            // Partial audio still plays; with nothing buffered there is nothing to salvage.
            (S::Buffering, E::GenerationError { .. }) if buffered_seconds > 0.0 => Some(S::Draining),
            (S::Buffering, E::GenerationError { .. }) => Some(S::Error),

            (S::Playing, E::BufferLow { buffered_seconds }) if *buffered_seconds < t.min_buffer_secs => {
                Some(S::Rebuffering)
            }
            (S::Playing | S::Rebuffering, E::GenerationComplete { .. } | E::GenerationError { .. }) => {
                Some(S::Draining)
            }

            (S::Rebuffering, E::BufferOk { buffered_seconds }) if *buffered_seconds >= t.resume_buffer_secs => {
                Some(S::Playing)
            }

            (S::Draining, E::BufferEmpty) => Some(S::Finished),

            _ => None,
        }
    }
}
