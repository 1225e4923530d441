//! voxlive - real-time duplex voice session client
//!
//! Streams microphone (and optionally screen-video) input to a remote
//! conversational voice endpoint over a persistent WebSocket and plays the
//! endpoint's streamed audio back gaplessly. The session survives barge-in
//! interrupts, proactive connection migrations, and unexpected closes via
//! resumption handles.

#![forbid(unsafe_code)]

/// Credential acquisition for connect and reconnect.
pub mod auth;
/// Scoped microphone and screen-source acquisition.
pub mod capture;
/// Channel event types crossing thread boundaries.
pub mod event;
/// Gapless inbound playback scheduling.
pub mod playback;
/// Wire protocol and error types.
pub mod protocol;
/// The outbound resampling encoder and its capture thread.
pub mod resample;
/// The session state machine and reconnect policy.
pub mod session;
/// WebSocket transport.
pub mod transport;
/// Per-turn text/audio aggregation.
pub mod turn;
/// Screen-frame throttling and JPEG encoding.
pub mod video;

pub use auth::{Credential, CredentialIssuer, EnvCredentialIssuer, StaticCredentialIssuer};
pub use event::{HistoryTurn, SessionEvent, StartOptions};
pub use protocol::LiveError;
pub use session::{spawn, SessionConfig, SessionHandle};
