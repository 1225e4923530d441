//! Wire protocol for the remote conversational endpoint.
//!
//! Defines the client and server message shapes exchanged over the live
//! WebSocket, the crate error type, and the decoding of server frames into
//! typed [`ServerEvent`]s the session controller can dispatch on.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

/// Fallback output rate when an inline audio part carries no parseable rate.
pub const DEFAULT_OUTPUT_RATE: u32 = 24_000;

/// Error type for live session operations.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Generation configuration carried in the session setup frame.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// A single content part (text only on the client side).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Role-tagged content, used for the system instruction and history priming.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Session setup message, sent once per connection.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// `{}` requests resumption handles; `{"handle": ...}` resumes a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<serde_json::Value>,
}

/// A base64 payload tagged with its encoding, e.g. `audio/pcm;rate=16000`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

impl MediaBlob {
    pub fn pcm(bytes: &[u8], rate: u32) -> Self {
        Self {
            data: general_purpose::STANDARD.encode(bytes),
            mime_type: format!("audio/pcm;rate={rate}"),
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self {
            data: general_purpose::STANDARD.encode(bytes),
            mime_type: "image/jpeg".to_string(),
        }
    }
}

/// A chunk of realtime input (audio or video).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaBlob>,
}

/// Message sent from client to server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Setup(SessionSetup),
    ClientContent(serde_json::Value),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Serialize to the single-key envelope the endpoint expects.
    pub fn to_frame(&self) -> Result<String> {
        let frame = match self {
            ClientMessage::Setup(setup) => json!({ "setup": serde_json::to_value(setup)? }),
            ClientMessage::ClientContent(content) => json!({ "clientContent": content }),
            ClientMessage::RealtimeInput(input) => {
                json!({ "realtimeInput": serde_json::to_value(input)? })
            }
        };
        Ok(frame.to_string())
    }
}

/// Server -> client messages, keyed by their single envelope field.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
    SessionResumptionUpdate {
        #[serde(rename = "sessionResumptionUpdate")]
        session_resumption_update: serde_json::Value,
    },
}

/// Decoded inbound events, dispatched by the session controller.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The connection's setup handshake completed; the session is live.
    SetupComplete,
    /// A new resumption handle; replaces any previously stored one.
    ResumptionUpdate { resumable: bool, handle: String },
    /// Early-disconnect warning: the connection will close soon.
    GoAway { time_left: Option<String> },
    /// Barge-in: stop in-flight playback immediately.
    Interrupted,
    /// Interim text delta for the current turn.
    TextDelta(String),
    /// Decoded audio delta with the rate carried by its mime type.
    AudioDelta { data: Vec<u8>, rate: u32 },
    /// The current conversational turn is complete.
    TurnComplete,
    /// The transport closed (clean or not). Emitted by the reader task.
    Closed,
    /// The transport failed mid-session. Emitted by the reader task.
    TransportError(String),
}

/// Extract the sample rate from a `audio/pcm;rate=<n>` mime type.
pub fn pcm_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("rate="))
        .and_then(|r| r.parse().ok())
}

/// Parse one server frame into zero or more events.
///
/// A frame that is not valid JSON or not a known message kind is a protocol
/// anomaly: the caller logs and ignores it.
pub fn parse_server_frame(text: &str) -> Result<Vec<ServerEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;

    let events = match message {
        ServerMessage::SetupComplete { .. } => vec![ServerEvent::SetupComplete],
        ServerMessage::SessionResumptionUpdate {
            session_resumption_update,
        } => {
            let resumable = session_resumption_update["resumable"]
                .as_bool()
                .unwrap_or(false);
            let handle = session_resumption_update["newHandle"]
                .as_str()
                .unwrap_or("")
                .to_string();
            vec![ServerEvent::ResumptionUpdate { resumable, handle }]
        }
        ServerMessage::GoAway { go_away } => {
            let time_left = go_away["timeLeft"].as_str().map(String::from);
            vec![ServerEvent::GoAway { time_left }]
        }
        ServerMessage::ServerContent { server_content } => parse_server_content(server_content),
    };

    Ok(events)
}

/// Flatten a `serverContent` payload into events, in part order.
fn parse_server_content(content: serde_json::Value) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    if content["interrupted"].as_bool() == Some(true) {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(parts) = content["modelTurn"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(ServerEvent::TextDelta(text.to_string()));
                }
            } else if let Some(inline) = part.get("inlineData") {
                let rate = inline["mimeType"]
                    .as_str()
                    .and_then(pcm_rate_from_mime)
                    .unwrap_or(DEFAULT_OUTPUT_RATE);
                match inline["data"]
                    .as_str()
                    .map(|d| general_purpose::STANDARD.decode(d))
                {
                    Some(Ok(data)) if !data.is_empty() => {
                        events.push(ServerEvent::AudioDelta { data, rate });
                    }
                    Some(Err(e)) => warn!("dropping undecodable inline audio part: {e}"),
                    _ => warn!("inline data part without data field"),
                }
            }
        }
    }

    if content["turnComplete"].as_bool() == Some(true) {
        events.push(ServerEvent::TurnComplete);
    }

    events
}
