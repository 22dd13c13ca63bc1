//! Microphone capture for conversation sessions.
//!
//! The cpal callback never blocks: it assembles fixed-size frames, runs them
//! through the preprocessor and offers them to a bounded queue. While the
//! capture gate is closed (the system is speaking) frames are discarded.

use super::preprocessing::AudioPreprocessor;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Fixed-size block of normalized mono samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn to_pcm16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect()
    }

    /// Little-endian 16-bit PCM bytes
    pub fn to_pcm16_bytes(&self) -> Vec<u8> {
        self.to_pcm16()
            .into_iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }
}

/// Mean absolute value of 16-bit samples
pub fn mean_abs_pcm16(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    pcm.iter().map(|s| (*s as f32).abs()).sum::<f32>() / pcm.len() as f32
}

// ============================================================================
// Capture gate and frame queue
// ============================================================================

/// Whether captured audio is currently accepted
#[derive(Debug)]
pub struct CaptureGate {
    open: AtomicBool,
}

impl Default for CaptureGate {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Bounded single-consumer queue between the capture callback and the send loop
pub struct FrameQueue {
    tx: mpsc::Sender<AudioFrame>,
    rx: Mutex<mpsc::Receiver<AudioFrame>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking; a full queue drops the frame
    pub fn offer(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn try_take(&self) -> Option<AudioFrame> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.try_recv().ok()
    }

    /// Discard everything queued; returns the number of frames discarded
    pub fn drain(&self) -> usize {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receives raw mono samples from a capture callback
pub struct FrameSink {
    gate: Arc<CaptureGate>,
    queue: Arc<FrameQueue>,
    preprocessor: AudioPreprocessor,
    pending: Vec<f32>,
    frame_size: usize,
}

impl FrameSink {
    pub fn new(
        gate: Arc<CaptureGate>,
        queue: Arc<FrameQueue>,
        preprocessor: AudioPreprocessor,
        frame_size: usize,
    ) -> Self {
        Self {
            gate,
            queue,
            preprocessor,
            pending: Vec::with_capacity(frame_size),
            frame_size: frame_size.max(1),
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        if !self.gate.is_open() {
            // Partial frames straddling a pause are discarded with it
            self.pending.clear();
            return;
        }
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() == self.frame_size {
                let mut frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.preprocessor.process(&mut frame);
                self.queue.offer(AudioFrame::new(frame));
            }
        }
    }
}

// ============================================================================
// Audio input seam
// ============================================================================

pub trait CaptureStream: Send {
    fn stop(&mut self);
}

pub trait AudioInput: Send + Sync {
    fn start(&self, sink: FrameSink) -> Result<Box<dyn CaptureStream>>;
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// List available input devices
pub fn list_input_devices() -> Result<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .as_ref()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();

    let mut devices = Vec::new();
    for device in host.input_devices().context("Failed to enumerate input devices")? {
        if let Ok(name) = device.name() {
            let is_default = name == default_name;
            devices.push(AudioDevice {
                id: name.clone(),
                name,
                is_default,
            });
        }
    }
    Ok(devices)
}

/// Get device by ID (name) or return default
pub fn get_device(device_id: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    match device_id {
        Some(id) if id != "default" => {
            for device in host.input_devices().context("Failed to enumerate devices")? {
                if let Ok(name) = device.name() {
                    if name == id {
                        return Ok(device);
                    }
                }
            }
            anyhow::bail!("Device not found: {}", id);
        }
        _ => host
            .default_input_device()
            .context("No default input device available"),
    }
}

/// Pick a configuration running at `sample_rate`, preferring mono
fn select_input_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let rate = cpal::SampleRate(sample_rate);
    let mut candidates: Vec<_> = device
        .supported_input_configs()
        .context("Failed to query input configs")?
        .filter(|range| range.min_sample_rate() <= rate && range.max_sample_rate() >= rate)
        .collect();
    candidates.sort_by_key(|range| range.channels());

    let range = candidates
        .into_iter()
        .next()
        .with_context(|| format!("Input device does not support {} Hz", sample_rate))?;
    let supported = range.with_sample_rate(rate);
    debug!(
        "Selected input config: {} Hz, {} channels, format {:?}",
        sample_rate,
        supported.channels(),
        supported.sample_format()
    );
    Ok((supported.config(), supported.sample_format()))
}

/// Microphone input through cpal.
///
/// cpal streams are not `Send`, so each stream lives on its own thread
/// until stopped.
pub struct MicrophoneInput {
    device_id: Option<String>,
    sample_rate: u32,
}

impl MicrophoneInput {
    pub fn new(device_id: Option<String>, sample_rate: u32) -> Self {
        Self {
            device_id,
            sample_rate,
        }
    }
}

struct MicrophoneStream {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureStream for MicrophoneStream {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn first_channel_f32(data: &[f32], channels: usize) -> Vec<f32> {
    data.iter().step_by(channels.max(1)).copied().collect()
}

fn first_channel_i16(data: &[i16], channels: usize) -> Vec<f32> {
    data.iter()
        .step_by(channels.max(1))
        .map(|s| *s as f32 / i16::MAX as f32)
        .collect()
}

fn build_stream(device_id: Option<&str>, sample_rate: u32, mut sink: FrameSink) -> Result<cpal::Stream> {
    let device = get_device(device_id)?;
    let (config, format) = select_input_config(&device, sample_rate)?;
    let channels = config.channels as usize;
    let error_callback = |err| error!("Audio stream error: {}", err);

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| sink.push(&first_channel_f32(data, channels)),
            error_callback,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| sink.push(&first_channel_i16(data, channels)),
            error_callback,
            None,
        ),
        other => anyhow::bail!("Unsupported sample format: {:?}", other),
    }
    .context("Failed to build input stream")?;

    stream.play().context("Failed to start input stream")?;
    Ok(stream)
}

impl AudioInput for MicrophoneInput {
    fn start(&self, sink: FrameSink) -> Result<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_id = self.device_id.clone();
        let sample_rate = self.sample_rate;

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || match build_stream(device_id.as_deref(), sample_rate, sink) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Block until stopped or the owner is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Capture stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .context("Failed to spawn capture thread")?;

        ready_rx
            .recv()
            .context("Capture thread exited before reporting")??;
        info!("Microphone capture started at {} Hz", sample_rate);

        Ok(Box::new(MicrophoneStream {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}
