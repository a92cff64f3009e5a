//! Pull-based audio sinks.
//!
//! A sink owns the clock: once opened it repeatedly asks the pull callback
//! for the next block of mono samples and reports its lifecycle through
//! [`SinkEvent`]s. `Flushed` means every delivered block reached the device;
//! `Closed` means the sink released the device and will not pull again.

use crate::config::SinkSpec;
use crate::error::SpeakResult;
use tokio::sync::mpsc::UnboundedSender;

#[cfg(feature = "cpal-output")]
mod device;
mod mock;

#[cfg(feature = "cpal-output")]
pub use device::CpalSink;
pub use mock::{MockSink, MockSinkHandle};

/// Answer from the pull callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    /// More blocks will follow
    Continue,
    /// This block is the last one; flush and close
    Finished,
}

/// Callback that fills one block of mono samples
pub type PullCallback = Box<dyn FnMut(&mut [f32]) -> PullStatus + Send + 'static>;

/// Lifecycle notification from a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// All delivered samples have been played
    Flushed,
    /// The sink released the device
    Closed,
    /// The device failed; no further pulls will happen
    Error(String),
}

/// Audio output driven by its own clock
pub trait AudioSink: Send {
    /// Open the device and begin pulling blocks of `spec.block_size` samples.
    ///
    /// # Errors
    ///
    /// Returns a sink error if the device cannot be opened or is already open.
    fn open(
        &mut self,
        spec: SinkSpec,
        pull: PullCallback,
        events: UnboundedSender<SinkEvent>,
    ) -> SpeakResult<()>;

    /// Stop pulling and release the device. Safe to call more than once.
    fn close(&mut self);

    /// Human-readable sink name
    fn name(&self) -> &str;
}
