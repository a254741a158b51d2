//! **CallController** - one call at a time: negotiate, acquire devices, connect, run, tear down.
//!
//! Any failure during start moves the attempt to `Error` and releases whatever
//! was already acquired, in reverse order. Nothing is retried automatically;
//! [`CallController::retry_call`] starts a fresh attempt with the last preferences.

use crate::capture::{CaptureConduit, CaptureConfig, CpalMicrophone, Microphone, MuteSwitch};
use crate::config::{normalize_language, VoiceClientConfig};
use crate::connection::{self, CallResources, SessionTask};
use crate::error::{VoiceError, VoiceResult};
use crate::negotiate::{HttpNegotiator, NegotiatedSession, NegotiationRequest, Negotiator};
use crate::playback::{AudioOutput, PlaybackScheduler, RodioSpeaker};
use crate::session::{
    CallEvent, CallObserver, CallState, CallStateMachine, SessionCounters, SessionParams, SessionProtocol,
    SessionStats, Trigger,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Opens the audio devices for one call.
pub trait DeviceProvider: Send + Sync {
    fn microphone(&self) -> VoiceResult<Box<dyn Microphone>>;
    fn speaker(&self) -> VoiceResult<Box<dyn AudioOutput>>;
}

/// Default input via CPAL, default output via rodio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl DeviceProvider for SystemDevices {
    fn microphone(&self) -> VoiceResult<Box<dyn Microphone>> {
        Ok(Box::new(CpalMicrophone::new()))
    }

    fn speaker(&self) -> VoiceResult<Box<dyn AudioOutput>> {
        Ok(Box::new(RodioSpeaker::open()?))
    }
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPreferences {
    pub agent_id: String,
    /// `None` or `auto` lets the agent pick.
    pub language: Option<String>,
    /// Join with the microphone muted. Applied before capture starts.
    pub muted: bool,
}

impl CallPreferences {
    pub fn from_config(config: &VoiceClientConfig) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            language: config.preferred_language(),
            muted: false,
        }
    }
}

/// One call attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub session_id: Uuid,
    pub endpoint: String,
    pub sample_rate: u32,
    pub language: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct ActiveCall {
    session: CallSession,
    task: SessionTask<Box<dyn AudioOutput>>,
    mute: MuteSwitch,
    counters: Arc<SessionCounters>,
}

pub struct CallController {
    config: VoiceClientConfig,
    negotiator: Arc<dyn Negotiator>,
    devices: Arc<dyn DeviceProvider>,
    observer: CallObserver,
    event_rx: Option<mpsc::UnboundedReceiver<CallEvent>>,
    state_rx: watch::Receiver<CallState>,
    active: Option<ActiveCall>,
    last_preferences: Option<CallPreferences>,
}

impl CallController {
    pub fn new(
        config: VoiceClientConfig,
        negotiator: impl Negotiator + 'static,
        devices: impl DeviceProvider + 'static,
    ) -> Self {
        let (observer, event_rx, state_rx) = CallObserver::new();
        Self {
            config,
            negotiator: Arc::new(negotiator),
            devices: Arc::new(devices),
            observer,
            event_rx: Some(event_rx),
            state_rx,
            active: None,
            last_preferences: None,
        }
    }

    /// HTTP negotiation against `config.negotiation_url` and the system audio devices.
    pub fn with_system_devices(config: VoiceClientConfig) -> Self {
        let negotiator = HttpNegotiator::new(
            config.negotiation_url.clone(),
            std::time::Duration::from_secs(config.negotiation_timeout_secs),
        );
        Self::new(config, negotiator, SystemDevices)
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.event_rx.take()
    }

    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    pub fn current_session(&self) -> Option<&CallSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn is_muted(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.mute.is_muted())
    }

    pub fn session_stats(&self) -> Option<SessionStats> {
        self.active.as_ref().map(|a| a.counters.snapshot())
    }

    /// The connection ended on its own and the call is waiting for `end_call`.
    pub fn is_call_finished(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.task.is_finished())
    }

    /// Start a call. Any call already running is ended first.
    pub async fn start_call(&mut self, preferences: CallPreferences) -> VoiceResult<CallSession> {
        self.end_call().await;
        self.last_preferences = Some(preferences.clone());

        let language = normalize_language(preferences.language.as_deref());
        let mut machine = CallStateMachine::new(self.observer.clone());
        machine.apply(Trigger::Dial);
        info!(
            target: "helpdesk::voice",
            "📞 Calling agent {} (language: {})",
            preferences.agent_id,
            language.as_deref().unwrap_or("auto")
        );

        let request = NegotiationRequest {
            agent_id: preferences.agent_id.clone(),
            language: language.clone(),
        };
        let negotiated = match self.negotiator.negotiate(&request).await {
            Ok(n) => n,
            Err(e) => return Err(abort_start(&mut machine, e)),
        };

        let microphone = match self.devices.microphone() {
            Ok(m) => m,
            Err(e) => return Err(abort_start(&mut machine, e)),
        };
        let capture = CaptureConduit::new(microphone);
        capture.mute_switch().set(preferences.muted);
        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_queue_depth);
        let capture_config = CaptureConfig::new(negotiated.sample_rate, self.config.frame_size);
        // Device open waits on the audio thread's handshake; keep it off the runtime.
        let started = tokio::task::spawn_blocking(move || {
            let mut capture = capture;
            let result = capture.start(&capture_config, frame_tx);
            (capture, result)
        })
        .await;
        let capture = match started {
            Ok((capture, Ok(()))) => capture,
            Ok((capture, Err(e))) => {
                release(capture).await;
                return Err(abort_start(&mut machine, e));
            }
            Err(e) => return Err(abort_start(&mut machine, VoiceError::Device(e.to_string()))),
        };

        let devices = Arc::clone(&self.devices);
        let speaker = match tokio::task::spawn_blocking(move || devices.speaker()).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                release(capture).await;
                return Err(abort_start(&mut machine, e));
            }
            Err(e) => {
                release(capture).await;
                return Err(abort_start(&mut machine, VoiceError::Device(e.to_string())));
            }
        };

        let ws = match connection::connect(&negotiated.endpoint).await {
            Ok(ws) => ws,
            Err(e) => {
                release((speaker, capture)).await;
                return Err(abort_start(&mut machine, e));
            }
        };

        let NegotiatedSession { endpoint, sample_rate } = negotiated;
        let call = CallSession {
            session_id: Uuid::new_v4(),
            endpoint,
            sample_rate,
            language: language.clone(),
            started_at: Utc::now(),
        };
        let session = SessionProtocol::new(
            SessionParams {
                session_id: call.session_id,
                sample_rate,
                language,
            },
            machine,
            PlaybackScheduler::with_tolerance(speaker, self.config.drain_tolerance()),
            capture.mute_switch(),
            capture.link_gate(),
        );
        let mute = capture.mute_switch();
        let counters = session.counters();
        let task = SessionTask::spawn(
            ws,
            CallResources { session, capture },
            frame_rx,
            self.config.poll_interval(),
        );

        self.active = Some(ActiveCall {
            session: call.clone(),
            task,
            mute,
            counters,
        });
        Ok(call)
    }

    /// Start again with the preferences of the last attempt.
    pub async fn retry_call(&mut self) -> VoiceResult<CallSession> {
        let preferences = self
            .last_preferences
            .clone()
            .ok_or_else(|| VoiceError::Config("no previous call to retry".to_string()))?;
        info!(target: "helpdesk::voice", "🔁 Retrying call to agent {}", preferences.agent_id);
        self.start_call(preferences).await
    }

    /// End the current call, if any. Does not wait for queued playback.
    pub async fn end_call(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!(target: "helpdesk::voice", "Ending call {}", active.session.session_id);
        match active.task.shutdown().await {
            Some(resources) => {
                let stats = resources.session.stats();
                info!(
                    target: "helpdesk::voice",
                    "✅ Call {} ended ({} received, {} dropped, {} frames sent)",
                    active.session.session_id,
                    stats.messages_received,
                    stats.messages_dropped,
                    stats.frames_sent
                );
                release(resources).await;
            }
            None => warn!("Call {} ended without releasing cleanly", active.session.session_id),
        }
    }

    /// Flip mute. Returns the new value; `false` with no call running.
    pub fn toggle_mute(&self) -> bool {
        match &self.active {
            Some(active) => {
                let muted = active.mute.toggle();
                if muted {
                    info!(target: "helpdesk::voice", "🔇 Microphone muted");
                } else {
                    info!(target: "helpdesk::voice", "🎤 Microphone unmuted");
                }
                muted
            }
            None => false,
        }
    }
}

/// Drop device handles on the blocking pool; their threads are joined on drop.
async fn release<T: Send + 'static>(resources: T) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(resources)).await {
        warn!("Device release panicked: {}", e);
    }
}

fn abort_start(machine: &mut CallStateMachine, error: VoiceError) -> VoiceError {
    warn!(target: "helpdesk::voice", "❌ Call start failed: {}", error);
    machine.fail(error.to_string());
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SampleCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoEndpoint;

    #[async_trait::async_trait]
    impl Negotiator for NoEndpoint {
        async fn negotiate(&self, _request: &NegotiationRequest) -> VoiceResult<NegotiatedSession> {
            Err(VoiceError::Negotiation("response has no connection endpoint".to_string()))
        }
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl Negotiator for Unreachable {
        async fn negotiate(&self, _request: &NegotiationRequest) -> VoiceResult<NegotiatedSession> {
            // Port 9 (discard) is closed on test hosts.
            Ok(NegotiatedSession {
                endpoint: "ws://127.0.0.1:9/call".to_string(),
                sample_rate: 24000,
            })
        }
    }

    struct NullMic;

    impl Microphone for NullMic {
        fn open(&mut self, _config: &CaptureConfig, _on_samples: SampleCallback) -> VoiceResult<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct NullOutput;

    impl AudioOutput for NullOutput {
        fn now(&self) -> f64 {
            0.0
        }

        fn play_at(&mut self, _samples: Vec<f32>, _sample_rate: u32, _start_at: f64) -> VoiceResult<()> {
            Ok(())
        }

        fn halt(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct CountingDevices {
        mics: Arc<AtomicUsize>,
        speakers: Arc<AtomicUsize>,
        deny_microphone: bool,
    }

    impl DeviceProvider for CountingDevices {
        fn microphone(&self) -> VoiceResult<Box<dyn Microphone>> {
            if self.deny_microphone {
                return Err(VoiceError::Device("permission denied".to_string()));
            }
            self.mics.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullMic))
        }

        fn speaker(&self) -> VoiceResult<Box<dyn AudioOutput>> {
            self.speakers.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullOutput))
        }
    }

    fn prefs() -> CallPreferences {
        CallPreferences {
            agent_id: "support".to_string(),
            language: None,
            muted: false,
        }
    }

    #[tokio::test]
    async fn negotiation_failure_acquires_nothing() {
        let devices = CountingDevices::default();
        let mut controller = CallController::new(VoiceClientConfig::default(), NoEndpoint, devices.clone());
        let mut events = controller.take_event_receiver().unwrap();

        let err = controller.start_call(prefs()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Negotiation(_)));
        assert_eq!(controller.state(), CallState::Error);
        assert_eq!(devices.mics.load(Ordering::SeqCst), 0);
        assert_eq!(devices.speakers.load(Ordering::SeqCst), 0);
        assert!(controller.current_session().is_none());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= matches!(event, CallEvent::Error(_));
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn denied_microphone_is_device_error() {
        let devices = CountingDevices {
            deny_microphone: true,
            ..Default::default()
        };
        let mut controller = CallController::new(VoiceClientConfig::default(), Unreachable, devices.clone());
        let err = controller.start_call(prefs()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Device(_)));
        assert_eq!(controller.state(), CallState::Error);
        assert_eq!(devices.speakers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connection_failure_is_connection_error() {
        let devices = CountingDevices::default();
        let mut controller = CallController::new(VoiceClientConfig::default(), Unreachable, devices.clone());
        let err = controller.start_call(prefs()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Connection(_)));
        assert_eq!(controller.state(), CallState::Error);
        assert!(controller.current_session().is_none());
    }

    #[tokio::test]
    async fn retry_without_previous_call_fails() {
        let mut controller = CallController::new(VoiceClientConfig::default(), NoEndpoint, CountingDevices::default());
        assert!(controller.retry_call().await.is_err());
        let _ = controller.start_call(prefs()).await;
        assert!(matches!(controller.retry_call().await, Err(VoiceError::Negotiation(_))));
    }

    #[tokio::test]
    async fn idle_controller_operations_are_no_ops() {
        let mut controller = CallController::new(VoiceClientConfig::default(), NoEndpoint, CountingDevices::default());
        assert_eq!(controller.state(), CallState::Idle);
        assert!(!controller.toggle_mute());
        controller.end_call().await;
        controller.end_call().await;
        assert!(controller.take_event_receiver().is_some());
        assert!(controller.take_event_receiver().is_none());
    }
}
