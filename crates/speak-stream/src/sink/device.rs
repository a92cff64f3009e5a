//! Real output device through `cpal`.
//!
//! `cpal::Stream` is not `Send`, so the stream is built and owned by a
//! dedicated thread that lives until the pull callback finishes, the device
//! errors, or the sink is closed.

use super::{AudioSink, PullCallback, PullStatus, SinkEvent};
use crate::config::SinkSpec;
use crate::error::{SpeakError, SpeakResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Control {
    Stop,
}

/// Sink playing through the default (or a named) output device
pub struct CpalSink {
    device_name: Option<String>,
    name: String,
    flush_delay: Duration,
    control: Option<mpsc::Sender<Control>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CpalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalSink")
            .field("name", &self.name)
            .field("open", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CpalSink {
    /// Sink for `device_name`, or the host default when `None`
    #[must_use]
    pub fn new(device_name: Option<String>) -> Self {
        let name = device_name.clone().unwrap_or_else(|| "default".to_string());
        Self {
            device_name,
            name,
            flush_delay: Duration::from_millis(150),
            control: None,
            thread: None,
        }
    }

    /// Time allowed for the device to play out its own buffer after the last block
    #[must_use]
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Names of the available output devices
    ///
    /// # Errors
    ///
    /// Returns a sink error if the host cannot enumerate devices.
    pub fn list_devices() -> SpeakResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SpeakError::sink(format!("Failed to enumerate devices: {e}")))?
            .filter_map(|device| device.name().ok())
            .collect();
        Ok(devices)
    }
}

fn find_device(name: Option<&str>) -> SpeakResult<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        let mut devices = host
            .output_devices()
            .map_err(|e| SpeakError::sink(format!("Failed to enumerate devices: {e}")))?;
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            return Ok(device);
        }
        warn!("Output device '{}' not found, using default", name);
    }

    host.default_output_device()
        .ok_or_else(|| SpeakError::sink("No default output device found"))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut pull: PullCallback,
    finished: Arc<AtomicBool>,
    events: UnboundedSender<SinkEvent>,
    block_size: usize,
) -> SpeakResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono = vec![0.0f32; block_size];
    let mut cursor = block_size;
    let mut last_block = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    if cursor == mono.len() {
                        if last_block {
                            finished.store(true, Ordering::Release);
                            mono.fill(0.0);
                        } else {
                            last_block = pull(&mut mono) == PullStatus::Finished;
                        }
                        cursor = 0;
                    }

                    let value = <T as Sample>::from_sample(mono[cursor].clamp(-1.0, 1.0));
                    frame.fill(value);
                    cursor += 1;
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
                let _ = events.send(SinkEvent::Error(err.to_string()));
            },
            None,
        )
        .map_err(|e| SpeakError::sink(format!("Failed to build output stream: {e}")))
}

fn open_stream(
    device_name: Option<&str>,
    spec: SinkSpec,
    pull: PullCallback,
    finished: Arc<AtomicBool>,
    events: UnboundedSender<SinkEvent>,
) -> SpeakResult<Stream> {
    let device = find_device(device_name)?;
    let default = device
        .default_output_config()
        .map_err(|e| SpeakError::sink(format!("Failed to get default config: {e}")))?;

    let config = StreamConfig {
        channels: default.channels(),
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        "Opening output device '{}': {}Hz, {} channels, {:?}",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        spec.sample_rate,
        config.channels,
        default.sample_format()
    );

    let stream = match default.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, pull, finished, events, spec.block_size)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, pull, finished, events, spec.block_size)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, pull, finished, events, spec.block_size)?,
        format => {
            return Err(SpeakError::sink(format!("Unsupported sample format: {format:?}")));
        }
    };

    stream
        .play()
        .map_err(|e| SpeakError::sink(format!("Failed to start stream: {e}")))?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn open(
        &mut self,
        spec: SinkSpec,
        pull: PullCallback,
        events: UnboundedSender<SinkEvent>,
    ) -> SpeakResult<()> {
        if self.thread.is_some() {
            return Err(SpeakError::sink("Output device is already open"));
        }
        if spec.block_size == 0 {
            return Err(SpeakError::sink("Block size must be greater than 0"));
        }

        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let device_name = self.device_name.clone();
        let flush_delay = self.flush_delay;

        let thread = std::thread::Builder::new()
            .name("cpal-sink".to_string())
            .spawn(move || {
                let finished = Arc::new(AtomicBool::new(false));
                let stream = match open_stream(
                    device_name.as_deref(),
                    spec,
                    pull,
                    Arc::clone(&finished),
                    events.clone(),
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                loop {
                    match control_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if finished.load(Ordering::Acquire) {
                        std::thread::sleep(flush_delay);
                        debug!("Output device flushed");
                        let _ = events.send(SinkEvent::Flushed);
                        break;
                    }
                }

                drop(stream);
                let _ = events.send(SinkEvent::Closed);
            })
            .map_err(|e| SpeakError::sink(format!("Failed to spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.control = Some(control_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(SpeakError::sink("Output thread exited before the stream started"))
            }
        }
    }

    fn close(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Output thread panicked");
            }
            debug!("Output device '{}' closed", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}
