//! Session protocol controller: the state machine at the center of the
//! crate.
//!
//! The controller task is the single writer to all session state. Capture
//! threads, the transport reader, playback completions, and reconnect timers
//! only talk to it through channels, so there is no shared-state locking
//! anywhere in the session path. Each connection carries an epoch; events
//! tagged with a superseded epoch are discarded, which is what makes
//! `stop_session` and reconnection safe against late callbacks.

use crate::auth::CredentialIssuer;
use crate::capture::CaptureHandle;
use crate::event::{HistoryTurn, MediaFrame, SessionEvent, StartOptions};
use crate::playback::{PlaybackSink, PulseOutput, Scheduler, SourceId};
use crate::protocol::{
    Content, GenerationConfig, LiveError, Part, Result, ServerEvent, SessionSetup,
};
use crate::resample;
use crate::transport::Transport;
use crate::turn::TurnAggregator;
use crate::video;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound media frames buffered between the capture side and the
/// controller. Capture never blocks: a full channel drops frames.
const MEDIA_CHANNEL_DEPTH: usize = 64;

/// Session configuration. Rates are fixed by the endpoint contract; the
/// reconnect fields bound the resumption policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, without the credential query parameter.
    pub endpoint: String,
    pub model: String,
    pub system_instruction: Option<String>,
    /// BCP-47 language code for the endpoint's speech output.
    pub language: Option<String>,
    /// Named voice for the endpoint's speech output.
    pub voice: Option<String>,
    pub temperature: Option<f32>,
    /// Default video-sharing preference; `StartOptions` decides per start.
    pub video_enabled: bool,
    /// Client name reported to the audio server.
    pub app_name: String,
    /// Rate the microphone is captured at before resampling.
    pub native_sample_rate: u32,
    /// Rate the endpoint requires for realtime audio input.
    pub input_sample_rate: u32,
    /// Initial playback rate; inbound chunks may switch it mid-session.
    pub output_sample_rate: u32,
    pub video_frame_period: Duration,
    /// Base delay before a reconnect attempt; doubles per consecutive
    /// failure.
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: None,
            language: None,
            voice: None,
            temperature: None,
            video_enabled: false,
            app_name: "voxlive".to_string(),
            native_sample_rate: 48_000,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            video_frame_period: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closing,
}

enum Command {
    Start {
        history: Vec<HistoryTurn>,
        options: StartOptions,
    },
    Stop,
    Reconnect,
}

/// Caller-facing handle. Commands are serviced by the controller task in
/// arrival order.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Start a session. A no-op while one is already connecting or active.
    pub fn start_session(&self, history: Vec<HistoryTurn>, options: StartOptions) {
        let _ = self.cmd_tx.send(Command::Start { history, options });
    }

    /// Stop the session. Safe to call from any state; idempotent.
    pub fn stop_session(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

/// Spawn the controller task. Presentation-layer notifications arrive on the
/// returned receiver.
pub fn spawn(
    config: SessionConfig,
    issuer: Arc<dyn CredentialIssuer>,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let controller = Controller::new(config, issuer, events_tx, cmd_tx.clone());
    tokio::spawn(controller.run(cmd_rx));
    (SessionHandle { cmd_tx }, events_rx)
}

struct Controller {
    config: SessionConfig,
    issuer: Arc<dyn CredentialIssuer>,
    state: SessionState,
    manual_stop: bool,
    resumption_handle: Option<String>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    epoch: u64,
    pending_history: Vec<HistoryTurn>,
    video_active: bool,
    capture: Option<CaptureHandle>,
    transport: Option<Transport>,
    playback: Option<Box<dyn PlaybackSink>>,
    turn: TurnAggregator,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    server_tx: mpsc::UnboundedSender<(u64, ServerEvent)>,
    server_rx: Option<mpsc::UnboundedReceiver<(u64, ServerEvent)>>,
    media_tx: mpsc::Sender<MediaFrame>,
    media_rx: Option<mpsc::Receiver<MediaFrame>>,
    done_tx: mpsc::UnboundedSender<SourceId>,
    done_rx: Option<mpsc::UnboundedReceiver<SourceId>>,
}

impl Controller {
    fn new(
        config: SessionConfig,
        issuer: Arc<dyn CredentialIssuer>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::channel(MEDIA_CHANNEL_DEPTH);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Self {
            config,
            issuer,
            state: SessionState::Idle,
            manual_stop: false,
            resumption_handle: None,
            reconnect_timer: None,
            reconnect_attempts: 0,
            epoch: 0,
            pending_history: Vec::new(),
            video_active: false,
            capture: None,
            transport: None,
            playback: None,
            turn: TurnAggregator::new(),
            events_tx,
            cmd_tx,
            server_tx,
            server_rx: Some(server_rx),
            media_tx,
            media_rx: Some(media_rx),
            done_tx,
            done_rx: Some(done_rx),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut server_rx = self.server_rx.take().expect("run called once");
        let mut media_rx = self.media_rx.take().expect("run called once");
        let mut done_rx = self.done_rx.take().expect("run called once");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Start { history, options }) => {
                        self.handle_start(history, options).await;
                    }
                    Some(Command::Stop) => self.handle_stop(),
                    Some(Command::Reconnect) => self.handle_reconnect().await,
                    None => {
                        self.handle_stop();
                        break;
                    }
                },
                Some((epoch, event)) = server_rx.recv() => {
                    self.handle_server_event(epoch, event).await;
                }
                Some(frame) = media_rx.recv() => self.handle_media(frame).await,
                Some(id) = done_rx.recv() => {
                    if let Some(playback) = self.playback.as_mut() {
                        playback.on_complete(id);
                    }
                }
            }
        }

        debug!("controller task ended");
    }

    async fn handle_start(&mut self, history: Vec<HistoryTurn>, options: StartOptions) {
        if self.state != SessionState::Idle {
            debug!("start_session ignored: session is {:?}", self.state);
            return;
        }

        info!("starting session (video: {})", options.stream_video);
        self.manual_stop = false;
        self.reconnect_attempts = 0;

        let capture = match CaptureHandle::acquire(
            &self.config.app_name,
            self.config.native_sample_rate,
            options.stream_video,
        ) {
            Ok(capture) => capture,
            Err(e) => {
                self.emit_error(format!("device acquisition failed: {e:#}"));
                return;
            }
        };
        self.capture = Some(capture);

        // History primes a fresh session only; a resumed session already
        // has its context server-side.
        self.pending_history = if self.resumption_handle.is_none() {
            history
        } else {
            Vec::new()
        };

        if let Err(e) = self.open_transport().await {
            self.emit_error(format!("failed to open session: {e}"));
            self.handle_stop();
        }
    }

    /// Obtain a credential and open a connection with the current resumption
    /// handle. Shared by start and reconnect.
    async fn open_transport(&mut self) -> Result<()> {
        let credential = self.issuer.issue()?;
        self.epoch += 1;
        self.state = SessionState::Connecting;

        let url = format!("{}?key={}", self.config.endpoint, credential.secret());
        let transport = Transport::connect(&url, self.epoch, self.server_tx.clone()).await?;
        transport.send_setup(&self.build_setup()).await?;
        self.transport = Some(transport);
        Ok(())
    }

    fn build_setup(&self) -> SessionSetup {
        let mut speech = serde_json::Map::new();
        if let Some(voice) = &self.config.voice {
            speech.insert(
                "voiceConfig".to_string(),
                json!({"prebuiltVoiceConfig": {"voiceName": voice}}),
            );
        }
        if let Some(language) = &self.config.language {
            speech.insert("languageCode".to_string(), json!(language));
        }

        SessionSetup {
            model: self.config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: self.config.temperature,
                speech_config: (!speech.is_empty()).then(|| speech.into()),
            }),
            system_instruction: self.config.system_instruction.as_ref().map(|text| Content {
                role: Some("SYSTEM".to_string()),
                parts: vec![Part {
                    text: Some(text.clone()),
                }],
            }),
            // `{}` still requests resumption handles on a fresh session.
            session_resumption: Some(match &self.resumption_handle {
                Some(handle) => json!({"handle": handle}),
                None => json!({}),
            }),
        }
    }

    async fn handle_server_event(&mut self, epoch: u64, event: ServerEvent) {
        if epoch != self.epoch {
            debug!("ignoring event from superseded connection (epoch {epoch})");
            return;
        }

        match event {
            ServerEvent::SetupComplete => self.on_open().await,
            ServerEvent::ResumptionUpdate { resumable, handle } => {
                if resumable && !handle.is_empty() {
                    debug!("resumption handle updated");
                    self.resumption_handle = Some(handle);
                }
            }
            ServerEvent::GoAway { time_left } => {
                // Proactive migration: the connection is doomed but the
                // session is not.
                info!(
                    "server will close the connection (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
                self.schedule_reconnect();
            }
            ServerEvent::Interrupted => {
                info!("playback interrupted by the endpoint");
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt();
                }
            }
            ServerEvent::TextDelta(delta) => {
                self.turn.push_text(&delta);
                self.emit(SessionEvent::InterimText(self.turn.text().to_string()));
            }
            ServerEvent::AudioDelta { data, rate } => {
                self.turn.push_audio(&data, rate);
                if let Some(playback) = self.playback.as_mut() {
                    playback.enqueue_pcm16(&data, rate);
                }
            }
            ServerEvent::TurnComplete => {
                let completed = self.turn.finish();
                self.emit(SessionEvent::TurnComplete {
                    text: completed.text,
                    audio_wav: completed.audio_wav,
                });
                self.emit(SessionEvent::InterimText(String::new()));
            }
            ServerEvent::TransportError(message) => {
                self.emit_error(format!("transport error: {message}"));
                self.handle_stop();
            }
            ServerEvent::Closed => self.on_closed(),
        }
    }

    /// The connection's setup handshake completed.
    async fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("open signal in state {:?} ignored", self.state);
            return;
        }

        if !self.pending_history.is_empty() {
            let turns = std::mem::take(&mut self.pending_history);
            if let Some(transport) = &self.transport {
                if let Err(e) = transport.send_history(&turns).await {
                    warn!("history priming failed: {e}");
                }
            }
        }

        self.start_pipeline();
        if self.state == SessionState::Idle {
            return; // pipeline start failed and tore the session down
        }

        self.state = SessionState::Active;
        self.reconnect_attempts = 0;
        self.emit(SessionEvent::StateChange(true));
        info!("session active");
    }

    /// Start playback, the capture thread, and the video throttler. On a
    /// reconnect the capture side is already running and only the transport
    /// was rebuilt, so each piece starts at most once per session.
    fn start_pipeline(&mut self) {
        if self.playback.is_none() {
            let app_name = self.config.app_name.clone();
            let done_tx = self.done_tx.clone();
            let open = move |rate| PulseOutput::open(rate, &app_name, done_tx.clone());
            match Scheduler::new(open, self.config.output_sample_rate) {
                Ok(scheduler) => self.playback = Some(Box::new(scheduler)),
                Err(e) => {
                    self.emit_error(format!("audio output unavailable: {e}"));
                    self.handle_stop();
                    return;
                }
            }
        }

        if let Some(capture) = self.capture.as_mut() {
            if let Some(mic) = capture.take_mic() {
                resample::spawn_capture_thread(
                    mic,
                    self.config.input_sample_rate,
                    self.media_tx.clone(),
                );
            }
            if let Some(screen) = capture.take_screen() {
                video::spawn_frame_throttler(
                    screen,
                    capture.stop_flag(),
                    self.config.video_frame_period,
                    self.media_tx.clone(),
                );
                self.video_active = true;
                self.emit(SessionEvent::VideoStreaming(true));
            }
        }
    }

    fn on_closed(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closing) {
            return;
        }

        if !self.manual_stop && self.resumption_handle.is_some() {
            info!("connection closed unexpectedly, resuming");
            self.schedule_reconnect();
        } else {
            // No handle to resume with: terminal, same as a transport error.
            self.emit_error("connection closed".to_string());
            self.handle_stop();
        }
    }

    /// At most one pending timer; attempts are bounded and the delay doubles
    /// per consecutive failure.
    fn schedule_reconnect(&mut self) {
        if self.manual_stop {
            return;
        }
        if self.reconnect_timer.is_some() {
            debug!("reconnect already pending");
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            self.emit_error(LiveError::ReconnectExhausted.to_string());
            self.handle_stop();
            return;
        }

        self.reconnect_attempts += 1;
        let delay = self.config.reconnect_delay * 2u32.pow(self.reconnect_attempts - 1);
        self.state = SessionState::Reconnecting;

        info!(
            "reconnect in {:?} (attempt {}/{})",
            delay, self.reconnect_attempts, self.config.max_reconnect_attempts
        );
        let cmd_tx = self.cmd_tx.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::Reconnect);
        }));
    }

    async fn handle_reconnect(&mut self) {
        self.reconnect_timer = None;
        if self.manual_stop || self.state != SessionState::Reconnecting {
            debug!("reconnect timer fired after stop, ignoring");
            return;
        }

        // The superseded connection goes away before its replacement opens.
        if let Some(old) = self.transport.take() {
            old.close();
        }

        match self.open_transport().await {
            Ok(()) => {}
            Err(e @ LiveError::Credential(_)) => {
                self.emit_error(e.to_string());
                self.handle_stop();
            }
            Err(e) => {
                warn!("reconnect attempt failed: {e}");
                self.state = SessionState::Reconnecting;
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_media(&mut self, frame: MediaFrame) {
        if self.state != SessionState::Active {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };

        let result = match frame {
            MediaFrame::Audio(bytes) => {
                transport
                    .send_audio(&bytes, self.config.input_sample_rate)
                    .await
            }
            MediaFrame::Video(jpeg) => transport.send_video(&jpeg).await,
        };

        // A failed send means the connection is going down; the reader
        // reports that separately.
        if let Err(e) = result {
            warn!("media send failed: {e}");
        }
    }

    /// The single cancellation point. Synchronously invalidates the pending
    /// reconnect timer and supersedes the connection epoch, then releases
    /// every owned resource.
    fn handle_stop(&mut self) {
        let was_active = matches!(
            self.state,
            SessionState::Active | SessionState::Reconnecting
        );
        self.state = SessionState::Closing;
        self.manual_stop = true;

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.epoch += 1; // late events from this connection are now stale

        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.interrupt();
        }
        self.playback = None;
        self.turn.reset();
        self.pending_history.clear();

        self.state = SessionState::Idle;
        if self.video_active {
            self.video_active = false;
            self.emit(SessionEvent::VideoStreaming(false));
        }
        if was_active {
            self.emit(SessionEvent::StateChange(false));
        }
        info!("session stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&self, message: String) {
        warn!("{message}");
        self.emit(SessionEvent::Error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentialIssuer;

    fn controller() -> (Controller, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            SessionConfig::default(),
            Arc::new(StaticCredentialIssuer::new("test-key")),
            events_tx,
            cmd_tx,
        );
        (controller, events_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn start_is_a_noop_while_connected() {
        let (mut c, mut events) = controller();
        c.state = SessionState::Active;

        c.handle_start(Vec::new(), StartOptions::default()).await;

        assert_eq!(c.state, SessionState::Active);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn close_with_handle_schedules_exactly_one_reconnect() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;
        c.resumption_handle = Some("handle-1".to_string());

        c.handle_server_event(1, ServerEvent::Closed).await;
        assert!(c.reconnect_timer.is_some());
        assert_eq!(c.state, SessionState::Reconnecting);
        assert_eq!(c.reconnect_attempts, 1);

        // A second close signal while a timer is pending adds nothing.
        c.handle_server_event(1, ServerEvent::Closed).await;
        assert_eq!(c.reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn stop_clears_the_pending_reconnect_timer() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;
        c.resumption_handle = Some("handle-1".to_string());
        c.handle_server_event(1, ServerEvent::Closed).await;
        assert!(c.reconnect_timer.is_some());

        c.handle_stop();

        assert!(c.reconnect_timer.is_none());
        assert!(c.manual_stop);
        assert_eq!(c.state, SessionState::Idle);

        // The timer's command is ignored even if it already fired.
        c.handle_reconnect().await;
        assert_eq!(c.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn close_without_handle_is_terminal() {
        let (mut c, mut events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;

        c.handle_server_event(1, ServerEvent::Closed).await;

        assert!(c.reconnect_timer.is_none());
        assert_eq!(c.state, SessionState::Idle);
        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StateChange(false))));
    }

    #[tokio::test]
    async fn manual_stop_suppresses_reconnect() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;
        c.resumption_handle = Some("handle-1".to_string());
        c.manual_stop = true;

        c.on_closed();
        assert!(c.reconnect_timer.is_none());
    }

    #[tokio::test]
    async fn events_from_a_superseded_connection_are_ignored() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 2;
        c.resumption_handle = Some("handle-1".to_string());

        c.handle_server_event(1, ServerEvent::Closed).await;

        assert!(c.reconnect_timer.is_none());
        assert_eq!(c.state, SessionState::Active);
    }

    #[tokio::test]
    async fn newer_resumption_handle_replaces_the_old_one() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;

        c.handle_server_event(
            1,
            ServerEvent::ResumptionUpdate {
                resumable: true,
                handle: "first".to_string(),
            },
        )
        .await;
        c.handle_server_event(
            1,
            ServerEvent::ResumptionUpdate {
                resumable: true,
                handle: "second".to_string(),
            },
        )
        .await;

        assert_eq!(c.resumption_handle.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn text_deltas_accumulate_and_clear_on_turn_complete() {
        let (mut c, mut events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;

        c.handle_server_event(1, ServerEvent::TextDelta("Hello ".to_string()))
            .await;
        c.handle_server_event(1, ServerEvent::TextDelta("there".to_string()))
            .await;
        c.handle_server_event(1, ServerEvent::TurnComplete).await;

        let events = drain(&mut events);
        let interim: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::InterimText(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(interim, ["Hello ", "Hello there", ""]);

        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::TurnComplete { text, audio_wav: None } if text == "Hello there"
        )));
    }

    #[tokio::test]
    async fn go_away_schedules_a_proactive_migration() {
        let (mut c, _events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;
        c.resumption_handle = Some("handle-1".to_string());

        c.handle_server_event(
            1,
            ServerEvent::GoAway {
                time_left: Some("10s".to_string()),
            },
        )
        .await;

        assert!(c.reconnect_timer.is_some());
        assert_eq!(c.state, SessionState::Reconnecting);
        // The stored handle is untouched; the migration reuses it.
        assert_eq!(c.resumption_handle.as_deref(), Some("handle-1"));
    }

    #[tokio::test]
    async fn reconnect_attempts_are_bounded() {
        let (mut c, mut events) = controller();
        c.state = SessionState::Active;
        c.epoch = 1;
        c.resumption_handle = Some("handle-1".to_string());
        c.reconnect_attempts = c.config.max_reconnect_attempts;

        c.handle_server_event(1, ServerEvent::Closed).await;

        assert!(c.reconnect_timer.is_none());
        assert_eq!(c.state, SessionState::Idle);
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(_))));
    }
}
