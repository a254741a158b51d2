//! **CaptureConduit** - microphone → fixed-size frames → outbound channel.
//!
//! Frames are never buffered behind the connection: if the call is muted or the
//! outbound queue is closed/full, the frame is dropped on the spot. Captured audio
//! only ever goes to the frame channel, never to the speaker.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Default capture block size in samples.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Raw sample callback handed to a [`Microphone`]. Called on the audio thread.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Capture parameters for one call.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Negotiated sample rate in Hz.
    pub sample_rate: u32,
    /// Always 1 (mono) for calls.
    pub channels: u16,
    /// Samples per emitted frame.
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl CaptureConfig {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            channels: 1,
            frame_size,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// One block of captured mono samples at the negotiated rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub sequence: u64,
    pub captured_at: Instant,
}

/// A microphone that pushes raw samples into a callback until closed.
pub trait Microphone: Send {
    /// Acquire the device and start delivering samples. Fails with `VoiceError::Device`.
    fn open(&mut self, config: &CaptureConfig, on_samples: SampleCallback) -> VoiceResult<()>;

    /// Release the device. Must be safe to call repeatedly or before `open`.
    fn close(&mut self);
}

/// Shared mute flag. The only state written by the controller and read by the
/// capture callback.
#[derive(Debug, Clone, Default)]
pub struct MuteSwitch(Arc<AtomicBool>);

impl MuteSwitch {
    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

/// Whether the outbound link can currently take audio. Opened and closed by the
/// connection driver.
#[derive(Debug, Clone, Default)]
pub struct LinkGate(Arc<AtomicBool>);

impl LinkGate {
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Capture counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_emitted: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    emitted: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_emitted: self.emitted.load(Ordering::Relaxed),
            frames_forwarded: self.forwarded.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one emitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Forwarded,
    DroppedMuted,
    DroppedLinkClosed,
    DroppedBackpressure,
}

/// Accumulates arbitrary-sized device buffers into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    buffer: Vec<f32>,
    sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            sample_rate,
            buffer: Vec::with_capacity(frame_size.max(1)),
            sequence: 0,
        }
    }

    /// Feed samples; `emit` is called once per completed frame.
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(AudioFrame)) {
        for &sample in data {
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_size {
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_size));
                emit(AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                    sequence: self.sequence,
                    captured_at: Instant::now(),
                });
                self.sequence += 1;
            }
        }
    }

    /// Samples waiting for the current frame to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Forward one frame unless muted, the link is closed, or the queue is full.
fn forward_frame(
    frame: AudioFrame,
    mute: &MuteSwitch,
    link: &LinkGate,
    tx: &mpsc::Sender<AudioFrame>,
) -> FrameDisposition {
    if mute.is_muted() {
        return FrameDisposition::DroppedMuted;
    }
    if !link.is_open() {
        return FrameDisposition::DroppedLinkClosed;
    }
    match tx.try_send(frame) {
        Ok(()) => FrameDisposition::Forwarded,
        Err(mpsc::error::TrySendError::Full(_)) => FrameDisposition::DroppedBackpressure,
        Err(mpsc::error::TrySendError::Closed(_)) => FrameDisposition::DroppedLinkClosed,
    }
}

/// Owns the microphone for one call and feeds frames to the session.
pub struct CaptureConduit {
    microphone: Box<dyn Microphone>,
    mute: MuteSwitch,
    link: LinkGate,
    counters: Arc<CaptureCounters>,
    active: bool,
}

impl CaptureConduit {
    pub fn new(microphone: Box<dyn Microphone>) -> Self {
        Self {
            microphone,
            mute: MuteSwitch::default(),
            link: LinkGate::default(),
            counters: Arc::new(CaptureCounters::default()),
            active: false,
        }
    }

    /// Acquire the microphone and start emitting frames into `frame_tx`.
    pub fn start(&mut self, config: &CaptureConfig, frame_tx: mpsc::Sender<AudioFrame>) -> VoiceResult<()> {
        if self.active {
            return Err(VoiceError::Device("capture already started".to_string()));
        }
        if config.frame_size == 0 {
            return Err(VoiceError::Config("frame size must be greater than zero".to_string()));
        }

        info!(
            target: "helpdesk::voice",
            "🎤 Starting capture ({}Hz mono, {} samples/frame)",
            config.sample_rate, config.frame_size
        );

        let mut assembler = FrameAssembler::new(config.frame_size, config.sample_rate);
        let mute = self.mute.clone();
        let link = self.link.clone();
        let counters = Arc::clone(&self.counters);

        let on_samples: SampleCallback = Box::new(move |data: &[f32]| {
            assembler.push(data, |frame| {
                counters.emitted.fetch_add(1, Ordering::Relaxed);
                let sequence = frame.sequence;
                match forward_frame(frame, &mute, &link, &frame_tx) {
                    FrameDisposition::Forwarded => {
                        counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    dropped => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("frame {} dropped: {:?}", sequence, dropped);
                    }
                }
            });
        });

        self.microphone.open(config, on_samples)?;
        self.active = true;
        info!(target: "helpdesk::voice", "✅ Audio capture started");
        Ok(())
    }

    /// Release the microphone. Idempotent.
    pub fn stop(&mut self) {
        self.link.close();
        if !self.active {
            return;
        }
        self.microphone.close();
        self.active = false;
        info!(target: "helpdesk::voice", "🛑 Audio capture stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mute_switch(&self) -> MuteSwitch {
        self.mute.clone()
    }

    pub fn link_gate(&self) -> LinkGate {
        self.link.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}

impl Drop for CaptureConduit {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default input device via CPAL.
///
/// The `cpal::Stream` is owned by a dedicated thread (it is not `Send` on every
/// platform); `close` signals that thread and joins it.
#[derive(Default)]
pub struct CpalMicrophone {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        Ok(cpal::default_host()
            .input_devices()?
            .filter_map(|d| d.name().ok())
            .collect())
    }

    fn build_stream(config: &CaptureConfig, mut on_samples: SampleCallback) -> VoiceResult<cpal::Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::Device("No input device available".to_string()))?;

        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
        if config.echo_cancellation || config.noise_suppression {
            // cpal exposes no DSP controls; the platform's voice processing applies if enabled.
            debug!("Echo cancellation/noise suppression requested; relying on host defaults");
        }

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        Ok(stream)
    }
}

impl Microphone for CpalMicrophone {
    fn open(&mut self, config: &CaptureConfig, on_samples: SampleCallback) -> VoiceResult<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let config = config.clone();

        let handle = thread::Builder::new()
            .name("helpdesk-capture".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(&config, on_samples) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until close() or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoiceError::Device("capture thread exited during startup".to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}
