//! **PlaybackScheduler** - gap-free, non-overlapping playback of agent audio chunks.
//!
//! Every chunk starts at `max(now, cursor)` on the output clock and pushes the cursor
//! to the end of the chunk. `now` is read from the output device each time, so
//! arbitrary delays between inbound chunks do not matter.
//!
//! The device side sits behind [`AudioOutput`]; [`RodioSpeaker`] is the real one.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Default tolerance used to decide that playback has drained.
pub const DEFAULT_DRAIN_TOLERANCE: Duration = Duration::from_millis(50);

/// An audio output device with its own clock, measured in seconds.
pub trait AudioOutput: Send {
    /// Current position of the output clock.
    fn now(&self) -> f64;

    /// Queue `samples` (mono) to start playing at `start_at` on the output clock.
    fn play_at(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> VoiceResult<()>;

    /// Stop immediately and discard anything queued.
    fn halt(&mut self);
}

impl<O: AudioOutput + ?Sized> AudioOutput for Box<O> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn play_at(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> VoiceResult<()> {
        (**self).play_at(samples, sample_rate, start_at)
    }

    fn halt(&mut self) {
        (**self).halt()
    }
}

/// A chunk placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    /// Sequence number within this scheduler.
    pub id: u64,
    /// Planned start on the output clock (seconds).
    pub start: f64,
    /// Chunk length (seconds).
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Result of one [`PlaybackScheduler::poll`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackProgress {
    /// Chunks whose playback ended since the previous poll.
    pub completed: Vec<ScheduledChunk>,
    /// True when the output clock has reached the cursor, within tolerance.
    pub drained: bool,
}

/// Schedules decoded chunks on an [`AudioOutput`] timeline.
pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    /// Earliest time at which the next chunk may start. Never moves backward.
    cursor: f64,
    pending: VecDeque<ScheduledChunk>,
    drain_tolerance: f64,
    next_id: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self::with_tolerance(output, DEFAULT_DRAIN_TOLERANCE)
    }

    pub fn with_tolerance(output: O, drain_tolerance: Duration) -> Self {
        Self {
            output,
            cursor: 0.0,
            pending: VecDeque::new(),
            drain_tolerance: drain_tolerance.as_secs_f64(),
            next_id: 0,
        }
    }

    /// Schedule one chunk at `max(now, cursor)` and advance the cursor past it.
    pub fn schedule_chunk(&mut self, samples: Vec<f32>, sample_rate: u32) -> VoiceResult<ScheduledChunk> {
        if sample_rate == 0 {
            return Err(VoiceError::Codec("sample rate must be greater than zero".to_string()));
        }
        let now = self.output.now();
        let start = now.max(self.cursor);
        let duration = samples.len() as f64 / sample_rate as f64;

        if !samples.is_empty() {
            self.output.play_at(samples, sample_rate, start)?;
        }

        let chunk = ScheduledChunk {
            id: self.next_id,
            start,
            duration,
        };
        self.next_id += 1;
        self.cursor = chunk.end();
        self.pending.push_back(chunk);

        trace!(
            "chunk {} scheduled at {:.3}s for {:.3}s (now {:.3}s)",
            chunk.id, start, duration, now
        );
        Ok(chunk)
    }

    /// Retire finished chunks and report whether playback has drained.
    pub fn poll(&mut self) -> PlaybackProgress {
        let now = self.output.now();
        let mut completed = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.end() <= now {
                completed.push(*front);
                self.pending.pop_front();
            } else {
                break;
            }
        }
        let drained = self.is_drained_at(now);
        PlaybackProgress { completed, drained }
    }

    /// True when the output clock has reached the cursor (within tolerance).
    pub fn is_drained(&self) -> bool {
        self.is_drained_at(self.output.now())
    }

    fn is_drained_at(&self, now: f64) -> bool {
        now + self.drain_tolerance >= self.cursor
    }

    /// Stop playback now and forget pending chunks. No completion fires for them.
    pub fn stop(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} pending chunk(s)", self.pending.len());
        }
        self.pending.clear();
        self.output.halt();
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    pub fn output(&self) -> &O {
        &self.output
    }
}

enum SpeakerCommand {
    Play {
        samples: Vec<f32>,
        sample_rate: u32,
        lead_silence: Duration,
    },
    Halt,
    Shutdown,
}

/// Speaker on the default output device via Rodio.
///
/// `OutputStream` is not `Send` on every platform, so it lives on a dedicated
/// thread and this handle talks to it over a channel. The clock is monotonic time
/// since the device was opened.
pub struct RodioSpeaker {
    commands: std_mpsc::Sender<SpeakerCommand>,
    opened_at: Instant,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioSpeaker {
    /// Open the default output device.
    pub fn open() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");
        let (commands, command_rx) = std_mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

        let thread = thread::Builder::new()
            .name("helpdesk-speaker".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Device(e.to_string())));
                        return;
                    }
                };
                let mut sink = match Sink::try_new(&handle) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Device(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = command_rx.recv() {
                    match command {
                        SpeakerCommand::Play {
                            samples,
                            sample_rate,
                            lead_silence,
                        } => {
                            // Only an idle sink needs padding; a busy one already ends at start_at.
                            if sink.empty() && !lead_silence.is_zero() {
                                sink.append(
                                    rodio::source::Zero::<f32>::new(1, sample_rate)
                                        .take_duration(lead_silence),
                                );
                            }
                            sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
                        }
                        SpeakerCommand::Halt => {
                            sink.stop();
                            // A stopped sink stays stopped; start a fresh one for later chunks.
                            match Sink::try_new(&handle) {
                                Ok(s) => sink = s,
                                Err(e) => {
                                    warn!("Speaker: could not recreate sink: {}", e);
                                    break;
                                }
                            }
                        }
                        SpeakerCommand::Shutdown => break,
                    }
                }
                sink.stop();
                debug!("Speaker thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio playback initialized");
                Ok(Self {
                    commands,
                    opened_at: Instant::now(),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device("speaker thread exited during startup".to_string()))
            }
        }
    }

    /// List available output devices.
    pub fn list_output_devices() -> VoiceResult<Vec<String>> {
        use cpal::traits::{DeviceTrait, HostTrait};
        let host = cpal::default_host();
        Ok(host.output_devices()?.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioOutput for RodioSpeaker {
    fn now(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn play_at(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> VoiceResult<()> {
        let gap = start_at - self.now();
        let lead_silence = if gap > 0.001 {
            Duration::from_secs_f64(gap)
        } else {
            Duration::ZERO
        };
        self.commands
            .send(SpeakerCommand::Play {
                samples,
                sample_rate,
                lead_silence,
            })
            .map_err(|_| VoiceError::Device("speaker thread is gone".to_string()))
    }

    fn halt(&mut self) {
        let _ = self.commands.send(SpeakerCommand::Halt);
        info!("⏹️ Audio playback stopped");
    }
}

impl Drop for RodioSpeaker {
    fn drop(&mut self) {
        let _ = self.commands.send(SpeakerCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
