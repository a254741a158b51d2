//! Client configuration loaded from TOML and environment.
//!
//! Precedence: env `HELPDESK__*` > file at `HELPDESK_CONFIG` (default `config/helpdesk-voice`) > defaults.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Language value meaning "let the agent decide".
pub const AUTO_LANGUAGE: &str = "auto";

/// Configuration for the voice client.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | HELPDESK__NEGOTIATION_URL | http://127.0.0.1:8000/api/voice/session | Negotiation service endpoint. |
/// | HELPDESK__AGENT_ID | support | Remote agent to call. |
/// | HELPDESK__LANGUAGE | auto | Preferred language; `auto` sends no context message. |
/// | HELPDESK__FRAME_SIZE | 4096 | Capture block size in samples. |
/// | HELPDESK__DRAIN_TOLERANCE_MS | 50 | Slack when deciding playback has drained. |
/// | HELPDESK__POLL_INTERVAL_MS | 20 | Playback progress poll cadence. |
/// | HELPDESK__FRAME_QUEUE_DEPTH | 8 | Frames buffered between capture and connection. |
/// | HELPDESK__NEGOTIATION_TIMEOUT_SECS | 15 | HTTP timeout for negotiation. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceClientConfig {
    pub negotiation_url: String,
    pub agent_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub frame_size: usize,
    pub drain_tolerance_ms: u64,
    pub poll_interval_ms: u64,
    pub frame_queue_depth: usize,
    pub negotiation_timeout_secs: u64,
}

fn default_language() -> String {
    AUTO_LANGUAGE.to_string()
}

impl Default for VoiceClientConfig {
    fn default() -> Self {
        Self {
            negotiation_url: "http://127.0.0.1:8000/api/voice/session".to_string(),
            agent_id: "support".to_string(),
            language: default_language(),
            frame_size: 4096,
            drain_tolerance_ms: 50,
            poll_interval_ms: 20,
            frame_queue_depth: 8,
            negotiation_timeout_secs: 15,
        }
    }
}

impl VoiceClientConfig {
    /// Load config from file and environment, then validate.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("HELPDESK_CONFIG").unwrap_or_else(|_| "config/helpdesk-voice".to_string());
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("negotiation_url", defaults.negotiation_url)?
            .set_default("agent_id", defaults.agent_id)?
            .set_default("language", defaults.language)?
            .set_default("frame_size", defaults.frame_size as i64)?
            .set_default("drain_tolerance_ms", defaults.drain_tolerance_ms as i64)?
            .set_default("poll_interval_ms", defaults.poll_interval_ms as i64)?
            .set_default("frame_queue_depth", defaults.frame_queue_depth as i64)?
            .set_default("negotiation_timeout_secs", defaults.negotiation_timeout_secs as i64)?;

        // Accepts either an exact path or a stem resolved by extension.
        let built = builder
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("HELPDESK").separator("__"))
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall capture or playback.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.frame_size == 0 {
            return Err(VoiceError::Config("frame_size must be greater than zero".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(VoiceError::Config("poll_interval_ms must be greater than zero".to_string()));
        }
        if self.frame_queue_depth == 0 {
            return Err(VoiceError::Config("frame_queue_depth must be greater than zero".to_string()));
        }
        if self.negotiation_url.trim().is_empty() {
            return Err(VoiceError::Config("negotiation_url is empty".to_string()));
        }
        Ok(())
    }

    /// Preferred language, `None` when unset or `auto`.
    pub fn preferred_language(&self) -> Option<String> {
        normalize_language(Some(self.language.as_str()))
    }

    pub fn drain_tolerance(&self) -> Duration {
        Duration::from_millis(self.drain_tolerance_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Trim a language preference; empty and `auto` mean no preference.
pub fn normalize_language(language: Option<&str>) -> Option<String> {
    let lang = language?.trim();
    if lang.is_empty() || lang.eq_ignore_ascii_case(AUTO_LANGUAGE) {
        None
    } else {
        Some(lang.to_string())
    }
}
