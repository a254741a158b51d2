//! Session negotiation: ask the support backend where to connect and at what rate.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Used when the backend omits `audioConfig.sampleRate`.
pub const DEFAULT_SAMPLE_RATE: u32 = 24000;

/// Request body: `{agentId, language?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    #[serde(default)]
    pub connection_endpoint: Option<String>,
    #[serde(default)]
    pub audio_config: Option<AudioConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

/// A usable endpoint and sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedSession {
    pub endpoint: String,
    pub sample_rate: u32,
}

impl TryFrom<NegotiationResponse> for NegotiatedSession {
    type Error = VoiceError;

    fn try_from(response: NegotiationResponse) -> VoiceResult<Self> {
        let endpoint = response
            .connection_endpoint
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| VoiceError::Negotiation("response has no connection endpoint".to_string()))?;
        let sample_rate = response
            .audio_config
            .and_then(|c| c.sample_rate)
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        if sample_rate == 0 {
            return Err(VoiceError::Negotiation("sample rate must be greater than zero".to_string()));
        }
        Ok(Self { endpoint, sample_rate })
    }
}

/// Produces a connection endpoint for a call.
#[async_trait::async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, request: &NegotiationRequest) -> VoiceResult<NegotiatedSession>;
}

/// Negotiates over HTTP with a JSON POST.
pub struct HttpNegotiator {
    url: String,
    client: reqwest::Client,
}

impl HttpNegotiator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url: url.into(), client }
    }
}

#[async_trait::async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(&self, request: &NegotiationRequest) -> VoiceResult<NegotiatedSession> {
        let res = self.client.post(&self.url).json(request).send().await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Negotiation(format!(
                "negotiation failed with {}: {}",
                status,
                crate::protocol::preview(&body)
            )));
        }

        let parsed: NegotiationResponse = res.json().await?;
        let session = NegotiatedSession::try_from(parsed)?;
        info!(
            target: "helpdesk::voice",
            "🤝 Negotiated {} at {}Hz for agent {}",
            session.endpoint, session.sample_rate, request.agent_id
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response and hand back the raw request.
    async fn one_shot_server(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/voice/session", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let content_length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + content_length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    #[test]
    fn request_omits_language_when_unset() {
        let body = serde_json::to_value(NegotiationRequest {
            agent_id: "billing".to_string(),
            language: None,
        })
        .unwrap();
        assert_eq!(body, json!({"agentId": "billing"}));
    }

    #[test]
    fn missing_endpoint_is_negotiation_error() {
        let err = NegotiatedSession::try_from(NegotiationResponse::default()).unwrap_err();
        assert!(matches!(err, VoiceError::Negotiation(_)));
    }

    #[test]
    fn missing_sample_rate_uses_default() {
        let response: NegotiationResponse = serde_json::from_value(json!({"connectionEndpoint": "ws://x"})).unwrap();
        let session = NegotiatedSession::try_from(response).unwrap();
        assert_eq!(session.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[tokio::test]
    async fn http_negotiation_success() {
        let body = json!({"connectionEndpoint": "ws://127.0.0.1:9/call", "audioConfig": {"sampleRate": 16000}});
        let (url, server) = one_shot_server("200 OK", body.to_string()).await;
        let negotiator = HttpNegotiator::new(url, Duration::from_secs(5));
        let session = negotiator
            .negotiate(&NegotiationRequest {
                agent_id: "support".to_string(),
                language: Some("German".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(session.endpoint, "ws://127.0.0.1:9/call");
        assert_eq!(session.sample_rate, 16000);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/voice/session"));
        assert!(request.contains(r#""agentId":"support""#));
        assert!(request.contains(r#""language":"German""#));
    }

    #[tokio::test]
    async fn http_error_status_is_negotiation_error() {
        let (url, _server) = one_shot_server("503 Service Unavailable", "{}".to_string()).await;
        let negotiator = HttpNegotiator::new(url, Duration::from_secs(5));
        let err = negotiator
            .negotiate(&NegotiationRequest {
                agent_id: "support".to_string(),
                language: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Negotiation(_)));
    }
}
