//! Events crossing the crate's concurrency boundaries.

/// Media produced by the capture side, forwarded to the transport.
///
/// Audio frames are already resampled and framed as little-endian 16-bit PCM
/// at the endpoint's input rate; video frames are JPEG encoded.
#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(Vec<u8>),
    Video(Vec<u8>),
}

/// Notifications delivered to the presentation layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session became active (true) or returned to idle (false).
    StateChange(bool),
    /// Accumulated interim text of the in-progress turn; empty on clear.
    InterimText(String),
    /// A finalized turn: its text and, when audio was received, a WAV
    /// container of the turn's raw samples.
    TurnComplete {
        text: String,
        audio_wav: Option<Vec<u8>>,
    },
    /// Screen-video sharing started (true) or stopped (false).
    VideoStreaming(bool),
    /// A user-facing error message. Fatal errors force the session to idle.
    Error(String),
}

/// One prior conversational turn, supplied by the caller at session start to
/// prime the endpoint with context.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: String,
    pub text_parts: Vec<String>,
}

/// Per-start options.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub stream_video: bool,
}
