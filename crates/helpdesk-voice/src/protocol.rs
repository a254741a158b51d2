//! JSON wire vocabulary exchanged with the remote voice agent.
//!
//! Every message is an object with a `type` tag. Unknown inbound tags decode to
//! [`InboundMessage::Unknown`] so newer agents don't break older clients.

use crate::codec;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// Instructions for the agent, sent once when the link opens.
    Context { text: String },
    /// One captured frame, base64 PCM16.
    Audio {
        audio: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
    },
}

impl OutboundMessage {
    /// Encode a captured frame.
    pub fn audio(samples: &[f32], sample_rate: u32) -> Self {
        OutboundMessage::Audio {
            audio: codec::encode_outbound(samples),
            sample_rate,
        }
    }

    /// Language instruction for the agent.
    pub fn language_context(language: &str) -> Self {
        OutboundMessage::Context {
            text: context_instruction(language),
        }
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the agent sends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    /// One synthesized chunk, base64 PCM16.
    Audio { audio: String },
    Transcript {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
    },
    /// Agent is working on a reply.
    Thinking,
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse one text frame. Any failure is a `VoiceError::Protocol`.
    pub fn parse(text: &str) -> VoiceResult<Self> {
        serde_json::from_str(text).map_err(|e| VoiceError::Protocol(format!("{}: {}", e, preview(text))))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Audio { .. } => "audio",
            InboundMessage::Transcript { .. } => "transcript",
            InboundMessage::Thinking => "thinking",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// Text of the one-time `context` message for a language preference.
pub fn context_instruction(language: &str) -> String {
    format!(
        "The customer prefers {lang}. Respond only in {lang}, and greet the customer in {lang}.",
        lang = language
    )
}

/// First 100 characters of a payload, for log lines.
pub fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
