//! # Helpdesk Voice - Realtime Support Calls
//!
//! Full-duplex voice sessions with a remote support agent: microphone frames go
//! out as base64 PCM over a WebSocket, agent audio comes back and is stitched
//! into continuous playback, and a small state machine tracks the call.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CallController                          │
//! │   negotiate → acquire mic → connect → run → teardown         │
//! │                                                              │
//! │  ┌──────────────┐  frames   ┌──────────────┐   ws   ┌─────┐ │
//! │  │CaptureConduit│──────────→│SessionProtocol│←─────→│agent│ │
//! │  │   (cpal)     │  (mute)   │ state machine │       └─────┘ │
//! │  └──────────────┘           └──────────────┘                 │
//! │                                    │ chunks                  │
//! │                                    ↓                         │
//! │                           ┌──────────────────┐               │
//! │                           │PlaybackScheduler │               │
//! │                           │  (rodio, cursor) │               │
//! │                           └──────────────────┘               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod codec;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod negotiate;
pub mod playback;
pub mod protocol;
pub mod session;

pub use capture::{
    AudioFrame, CaptureConduit, CaptureConfig, CaptureStats, CpalMicrophone, LinkGate, Microphone, MuteSwitch,
};
pub use config::VoiceClientConfig;
pub use controller::{CallController, CallPreferences, CallSession, DeviceProvider, SystemDevices};
pub use error::{VoiceError, VoiceResult};
pub use negotiate::{HttpNegotiator, NegotiatedSession, NegotiationRequest, Negotiator};
pub use playback::{AudioOutput, PlaybackScheduler, RodioSpeaker, ScheduledChunk};
pub use protocol::{InboundMessage, OutboundMessage};
pub use session::{CallEvent, CallState, Role, SessionProtocol, SessionStats, TranscriptEntry};
