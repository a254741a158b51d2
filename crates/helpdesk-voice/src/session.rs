//! **SessionProtocol** - call state machine and inbound/outbound message handling.
//!
//! This is the synchronous core of a call. It never touches the network itself:
//! the connection driver feeds it socket events, captured frames and poll ticks,
//! and sends whatever outbound messages it returns. Every state change goes to
//! observers as a [`CallEvent`] and is mirrored on a `watch` channel.

use crate::capture::{AudioFrame, LinkGate, MuteSwitch};
use crate::codec;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioOutput, PlaybackScheduler};
use crate::protocol::{preview, InboundMessage, OutboundMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Call state as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    /// Agent signalled it is working on a reply. Advisory only.
    Listening,
    /// Agent audio is playing.
    Speaking,
    Error,
}

impl CallState {
    pub const ALL: [CallState; 6] = [
        CallState::Idle,
        CallState::Connecting,
        CallState::Connected,
        CallState::Listening,
        CallState::Speaking,
        CallState::Error,
    ];

    /// Connection is open.
    pub fn is_active(self) -> bool {
        matches!(self, CallState::Connected | CallState::Listening | CallState::Speaking)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Listening => "listening",
            CallState::Speaking => "speaking",
            CallState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Things that can move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A new attempt begins.
    Dial,
    Opened,
    InboundAudio,
    Drained,
    Thinking,
    Transcript,
    /// Inbound `error` message, or a local fatal failure.
    Failure,
    Closed,
}

impl Trigger {
    pub const ALL: [Trigger; 8] = [
        Trigger::Dial,
        Trigger::Opened,
        Trigger::InboundAudio,
        Trigger::Drained,
        Trigger::Thinking,
        Trigger::Transcript,
        Trigger::Failure,
        Trigger::Closed,
    ];
}

/// The transition table. `None` means the pair is not a transition.
pub fn next_state(state: CallState, trigger: Trigger) -> Option<CallState> {
    use CallState::*;
    match (trigger, state) {
        (Trigger::Dial, Idle | Error) => Some(Connecting),
        (Trigger::Opened, Connecting) => Some(Connected),
        (Trigger::InboundAudio, Connected | Listening) => Some(Speaking),
        (Trigger::Drained, Speaking) => Some(Connected),
        (Trigger::Thinking, Connected | Speaking) => Some(Listening),
        (Trigger::Failure, Idle | Connecting | Connected | Listening | Speaking) => Some(Error),
        // Idle and Error both end the attempt. A close after Error does not
        // overwrite it, so the failure stays visible until the next Dial.
        (Trigger::Closed, Connecting | Connected | Listening | Speaking) => Some(Idle),
        _ => None,
    }
}

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    /// `user` maps to [`Role::User`]; anything else, including nothing, is the agent.
    pub fn from_wire(role: Option<&str>) -> Self {
        match role {
            Some(r) if r.eq_ignore_ascii_case("user") => Role::User,
            _ => Role::Agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Notifications for the surrounding application.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    Transcript(TranscriptEntry),
    Error(String),
    /// The attempt is over and its resources are released.
    Resolved { session_id: Uuid },
}

/// Fan-out to observers: an event stream plus the current state.
#[derive(Debug, Clone)]
pub struct CallObserver {
    events: mpsc::UnboundedSender<CallEvent>,
    state: Arc<watch::Sender<CallState>>,
}

impl CallObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>, watch::Receiver<CallState>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(CallState::Idle);
        (
            Self {
                events,
                state: Arc::new(state),
            },
            event_rx,
            state_rx,
        )
    }

    /// Send an event. A dropped receiver is not an error.
    pub fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    fn publish_state(&self, state: CallState) {
        self.state.send_replace(state);
    }
}

/// Current state plus the observer it reports to.
#[derive(Debug)]
pub struct CallStateMachine {
    state: CallState,
    observer: CallObserver,
}

impl CallStateMachine {
    pub fn new(observer: CallObserver) -> Self {
        observer.publish_state(CallState::Idle);
        Self {
            state: CallState::Idle,
            observer,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn observer(&self) -> &CallObserver {
        &self.observer
    }

    /// Apply a trigger. Returns true if the state changed.
    pub fn apply(&mut self, trigger: Trigger) -> bool {
        let Some(to) = next_state(self.state, trigger) else {
            trace!("{:?} ignored in state {}", trigger, self.state);
            return false;
        };
        if to == self.state {
            return false;
        }
        let from = self.state;
        self.state = to;
        info!(target: "helpdesk::voice", "📞 Call state {} → {}", from, to);
        self.observer.publish_state(to);
        self.observer.emit(CallEvent::StateChanged { from, to });
        true
    }

    /// Move to `Error` and surface the message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.apply(Trigger::Failure);
        self.observer.emit(CallEvent::Error(message));
    }
}

/// Session counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
}

/// Live session counters, shareable with the controller.
#[derive(Debug, Default)]
pub struct SessionCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    frames_sent: AtomicU64,
    chunks: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            messages_received: self.received.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks.load(Ordering::Relaxed),
        }
    }
}

/// What the driver should do after an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Remote reported an error; close the connection.
    Terminate,
}

/// Fixed parameters of one call attempt.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: Uuid,
    pub sample_rate: u32,
    /// Already normalized; `None` means no context message.
    pub language: Option<String>,
}

/// One call attempt's protocol state.
pub struct SessionProtocol<O: AudioOutput> {
    params: SessionParams,
    machine: CallStateMachine,
    scheduler: PlaybackScheduler<O>,
    mute: MuteSwitch,
    link: LinkGate,
    counters: Arc<SessionCounters>,
    resolved: bool,
}

impl<O: AudioOutput> SessionProtocol<O> {
    /// Build a session around a machine that is already `Connecting`.
    pub fn new(
        params: SessionParams,
        machine: CallStateMachine,
        scheduler: PlaybackScheduler<O>,
        mute: MuteSwitch,
        link: LinkGate,
    ) -> Self {
        Self {
            params,
            machine,
            scheduler,
            mute,
            link,
            counters: Arc::new(SessionCounters::default()),
            resolved: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.params.session_id
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<O> {
        &self.scheduler
    }

    /// Connection opened. Returns the messages to send right away.
    pub fn on_open(&mut self) -> Vec<OutboundMessage> {
        if !self.machine.apply(Trigger::Opened) {
            return Vec::new();
        }
        info!(target: "helpdesk::voice", "🔗 Session {} connected", self.params.session_id);
        self.link.open();
        match &self.params.language {
            Some(lang) => {
                debug!("Sending language context: {}", lang);
                vec![OutboundMessage::language_context(lang)]
            }
            None => Vec::new(),
        }
    }

    /// Handle one inbound text frame. Malformed input is dropped, never fatal.
    pub fn handle_inbound_text(&mut self, text: &str) -> Flow {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match InboundMessage::parse(text) {
            Ok(message) => self.handle_inbound(message),
            Err(e) => {
                self.drop_message(&e, text);
                Flow::Continue
            }
        }
    }

    pub fn handle_inbound(&mut self, message: InboundMessage) -> Flow {
        match message {
            InboundMessage::Audio { audio } => {
                if let Err(e) = self.play_chunk(&audio) {
                    self.drop_message(&e, &audio);
                }
                Flow::Continue
            }
            InboundMessage::Thinking => {
                self.machine.apply(Trigger::Thinking);
                Flow::Continue
            }
            InboundMessage::Transcript { role, text, transcript } => {
                let entry = TranscriptEntry {
                    role: Role::from_wire(role.as_deref()),
                    text: non_empty(text).or(non_empty(transcript)).unwrap_or_default(),
                    timestamp: Utc::now(),
                };
                debug!("📝 {:?}: {}", entry.role, entry.text);
                self.machine.observer().emit(CallEvent::Transcript(entry));
                Flow::Continue
            }
            InboundMessage::Error { message, error } => {
                let message = message.or(error).unwrap_or_else(|| "agent reported an error".to_string());
                self.on_remote_error(message);
                Flow::Terminate
            }
            InboundMessage::Unknown => {
                debug!("Ignoring inbound message with unrecognized type");
                Flow::Continue
            }
        }
    }

    fn play_chunk(&mut self, audio: &str) -> VoiceResult<()> {
        if !self.machine.state().is_active() {
            debug!("Audio received in state {}, not playing", self.machine.state());
            return Ok(());
        }
        let samples = codec::decode_inbound(audio)?;
        self.scheduler.schedule_chunk(samples, self.params.sample_rate)?;
        self.counters.chunks.fetch_add(1, Ordering::Relaxed);
        self.machine.apply(Trigger::InboundAudio);
        Ok(())
    }

    fn drop_message(&self, error: &VoiceError, payload: &str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            target: "helpdesk::voice",
            "Dropped inbound message ({}): {}",
            error,
            preview(payload)
        );
    }

    /// Encode a captured frame, or `None` if it must not be sent.
    pub fn on_frame(&mut self, frame: &AudioFrame) -> Option<OutboundMessage> {
        if self.mute.is_muted() || !self.link.is_open() || !self.machine.state().is_active() {
            return None;
        }
        Some(OutboundMessage::audio(&frame.samples, frame.sample_rate))
    }

    /// Record that an outbound audio frame went out on the socket.
    pub fn note_frame_sent(&self) {
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Check playback progress; `Speaking` falls back to `Connected` once drained.
    pub fn poll_playback(&mut self) {
        let progress = self.scheduler.poll();
        for chunk in &progress.completed {
            trace!("chunk {} finished at {:.3}s", chunk.id, chunk.end());
        }
        if progress.drained && self.machine.state() == CallState::Speaking {
            self.machine.apply(Trigger::Drained);
        }
    }

    /// Remote `error` message. No retry.
    pub fn on_remote_error(&mut self, message: String) {
        warn!(target: "helpdesk::voice", "❌ Agent error: {}", message);
        self.link.close();
        self.machine.fail(message);
    }

    /// Local transport failure (open, send or receive).
    pub fn on_transport_error(&mut self, error: &VoiceError) {
        warn!(target: "helpdesk::voice", "❌ Connection failed: {}", error);
        self.link.close();
        self.machine.fail(error.to_string());
    }

    /// Connection closed, cleanly or not. Releases playback and resolves the
    /// attempt. Idempotent.
    pub fn on_close(&mut self) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.link.close();
        self.scheduler.stop();
        self.machine.apply(Trigger::Closed);
        info!(
            target: "helpdesk::voice",
            "📴 Session {} closed ({})",
            self.params.session_id,
            self.machine.state()
        );
        self.machine.observer().emit(CallEvent::Resolved {
            session_id: self.params.session_id,
        });
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackScheduler;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct TestOutput {
        clock: Arc<Mutex<f64>>,
        played: Arc<Mutex<Vec<f64>>>,
        halted: Arc<Mutex<bool>>,
    }

    impl TestOutput {
        fn set_time(&self, t: f64) {
            *self.clock.lock().unwrap() = t;
        }
    }

    impl AudioOutput for TestOutput {
        fn now(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn play_at(&mut self, _samples: Vec<f32>, _sample_rate: u32, start_at: f64) -> VoiceResult<()> {
            self.played.lock().unwrap().push(start_at);
            Ok(())
        }

        fn halt(&mut self) {
            *self.halted.lock().unwrap() = true;
        }
    }

    struct Harness {
        session: SessionProtocol<TestOutput>,
        output: TestOutput,
        events: mpsc::UnboundedReceiver<CallEvent>,
        state_rx: watch::Receiver<CallState>,
        mute: MuteSwitch,
        link: LinkGate,
    }

    fn harness(language: Option<&str>) -> Harness {
        let (observer, events, state_rx) = CallObserver::new();
        let mut machine = CallStateMachine::new(observer);
        machine.apply(Trigger::Dial);
        let output = TestOutput::default();
        let mute = MuteSwitch::default();
        let link = LinkGate::default();
        let session = SessionProtocol::new(
            SessionParams {
                session_id: Uuid::new_v4(),
                sample_rate: 24000,
                language: language.map(str::to_string),
            },
            machine,
            PlaybackScheduler::new(output.clone()),
            mute.clone(),
            link.clone(),
        );
        Harness {
            session,
            output,
            events,
            state_rx,
            mute,
            link,
        }
    }

    fn audio_message(seconds: f64) -> String {
        let samples = vec![0.1f32; (24000.0 * seconds) as usize];
        format!(r#"{{"type":"audio","audio":"{}"}}"#, codec::encode_outbound(&samples))
    }

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; 4096],
            sample_rate: 24000,
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn unlisted_pairs_leave_state_unchanged() {
        let listed = [
            (Trigger::Dial, CallState::Idle),
            (Trigger::Dial, CallState::Error),
            (Trigger::Opened, CallState::Connecting),
            (Trigger::InboundAudio, CallState::Connected),
            (Trigger::InboundAudio, CallState::Listening),
            (Trigger::Drained, CallState::Speaking),
            (Trigger::Thinking, CallState::Connected),
            (Trigger::Thinking, CallState::Speaking),
            (Trigger::Failure, CallState::Idle),
            (Trigger::Failure, CallState::Connecting),
            (Trigger::Failure, CallState::Connected),
            (Trigger::Failure, CallState::Listening),
            (Trigger::Failure, CallState::Speaking),
            (Trigger::Closed, CallState::Connecting),
            (Trigger::Closed, CallState::Connected),
            (Trigger::Closed, CallState::Listening),
            (Trigger::Closed, CallState::Speaking),
        ];
        for trigger in Trigger::ALL {
            for state in CallState::ALL {
                let next = next_state(state, trigger);
                if listed.contains(&(trigger, state)) {
                    assert!(next.is_some(), "{:?} in {:?}", trigger, state);
                } else {
                    assert_eq!(next, None, "{:?} in {:?}", trigger, state);
                }
            }
        }
    }

    #[test]
    fn happy_path() {
        let mut h = harness(None);
        assert_eq!(h.session.state(), CallState::Connecting);
        assert!(h.session.on_open().is_empty());
        assert_eq!(h.session.state(), CallState::Connected);
        assert!(h.link.is_open());

        h.session.handle_inbound_text(r#"{"type":"thinking"}"#);
        assert_eq!(h.session.state(), CallState::Listening);

        h.session.handle_inbound_text(&audio_message(0.2));
        assert_eq!(h.session.state(), CallState::Speaking);
        assert_eq!(*h.output.played.lock().unwrap(), vec![0.0]);

        h.output.set_time(0.1);
        h.session.poll_playback();
        assert_eq!(h.session.state(), CallState::Speaking);

        h.output.set_time(0.2);
        h.session.poll_playback();
        assert_eq!(h.session.state(), CallState::Connected);
        assert_eq!(*h.state_rx.borrow(), CallState::Connected);

        let transitions: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                CallState::Connecting,
                CallState::Connected,
                CallState::Listening,
                CallState::Speaking,
                CallState::Connected
            ]
        );
    }

    #[test]
    fn language_preference_sends_one_context_message() {
        let mut h = harness(Some("French"));
        let sent = h.session.on_open();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundMessage::Context { text } if text.contains("French")));
        // A repeated open is not a transition and sends nothing.
        assert!(h.session.on_open().is_empty());
    }

    #[test]
    fn malformed_audio_is_dropped_without_state_change() {
        let mut h = harness(None);
        h.session.on_open();
        let flow = h.session.handle_inbound_text(r#"{"type":"audio", "audio":"!!!not-base64"}"#);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.session.state(), CallState::Connected);
        assert_eq!(h.session.scheduler().cursor(), 0.0);
        assert_eq!(h.session.stats().messages_dropped, 1);
        assert!(h.link.is_open());

        h.session.handle_inbound_text("{ definitely not json");
        assert_eq!(h.session.stats().messages_dropped, 2);
        assert_eq!(h.session.stats().messages_received, 2);
    }

    #[test]
    fn transcript_fields_fall_back() {
        let mut h = harness(None);
        h.session.on_open();
        drain(&mut h.events);
        h.session.handle_inbound_text(r#"{"type":"transcript","transcript":"hello"}"#);
        h.session.handle_inbound_text(r#"{"type":"transcript","role":"user","text":"hi","transcript":"x"}"#);
        h.session.handle_inbound_text(r#"{"type":"transcript"}"#);
        h.session.handle_inbound_text(r#"{"type":"transcript","text":"","transcript":"spoken"}"#);
        let entries: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::Transcript(t) => Some((t.role, t.text)),
                _ => None,
            })
            .collect();
        assert_eq!(
            entries,
            vec![
                (Role::Agent, "hello".to_string()),
                (Role::User, "hi".to_string()),
                (Role::Agent, String::new()),
                (Role::Agent, "spoken".to_string())
            ]
        );
        assert_eq!(h.session.state(), CallState::Connected);
    }

    #[test]
    fn muted_frames_produce_no_outbound_audio() {
        let mut h = harness(None);
        h.session.on_open();
        h.mute.set(true);
        for _ in 0..20 {
            assert!(h.session.on_frame(&frame()).is_none());
        }
        h.mute.set(false);
        assert!(matches!(h.session.on_frame(&frame()), Some(OutboundMessage::Audio { sample_rate: 24000, .. })));
    }

    #[test]
    fn frames_keep_flowing_while_agent_thinks_or_speaks() {
        let mut h = harness(None);
        h.session.on_open();

        h.session.handle_inbound_text(r#"{"type":"thinking"}"#);
        assert_eq!(h.session.state(), CallState::Listening);
        assert!(h.session.on_frame(&frame()).is_some());

        h.session.handle_inbound_text(&audio_message(0.5));
        assert_eq!(h.session.state(), CallState::Speaking);
        assert!(h.session.on_frame(&frame()).is_some());

        h.mute.set(true);
        assert!(h.session.on_frame(&frame()).is_none());
    }

    #[test]
    fn frames_before_open_are_not_sent() {
        let mut h = harness(None);
        assert!(h.session.on_frame(&frame()).is_none());
    }

    #[test]
    fn remote_error_is_terminal_and_close_keeps_it() {
        let mut h = harness(None);
        h.session.on_open();
        let flow = h.session.handle_inbound_text(r#"{"type":"error","message":"quota exceeded"}"#);
        assert_eq!(flow, Flow::Terminate);
        assert_eq!(h.session.state(), CallState::Error);
        assert!(!h.link.is_open());

        h.session.on_close();
        assert_eq!(h.session.state(), CallState::Error);
        let events = drain(&mut h.events);
        assert!(events.contains(&CallEvent::Error("quota exceeded".to_string())));
        assert!(matches!(events.last(), Some(CallEvent::Resolved { .. })));
    }

    #[test]
    fn close_mid_playback_halts_and_resolves_once() {
        let mut h = harness(None);
        h.session.on_open();
        h.output.set_time(0.3);
        h.session.handle_inbound_text(&audio_message(0.5));
        assert_eq!(h.session.scheduler().pending_chunks(), 1);

        h.session.on_close();
        h.session.on_close();
        assert_eq!(h.session.state(), CallState::Idle);
        assert!(*h.output.halted.lock().unwrap());
        assert_eq!(h.session.scheduler().pending_chunks(), 0);

        h.output.set_time(2.0);
        h.session.poll_playback();
        assert_eq!(h.session.state(), CallState::Idle);
        let resolved = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::Resolved { .. }))
            .count();
        assert_eq!(resolved, 1);
    }

    #[test]
    fn audio_after_close_is_ignored() {
        let mut h = harness(None);
        h.session.on_open();
        h.session.on_close();
        h.session.handle_inbound_text(&audio_message(0.1));
        assert_eq!(h.session.state(), CallState::Idle);
        assert_eq!(h.session.stats().chunks_scheduled, 0);
    }

    #[test]
    fn odd_length_audio_counts_as_dropped() {
        let mut h = harness(None);
        h.session.on_open();
        let msg = format!(r#"{{"type":"audio","audio":"{}"}}"#, BASE64.encode([0u8; 3]));
        h.session.handle_inbound_text(&msg);
        assert_eq!(h.session.stats().messages_dropped, 1);
        assert_eq!(h.session.state(), CallState::Connected);
    }
}
