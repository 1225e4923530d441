//! WebSocket transport to the remote endpoint.
//!
//! The socket is split so reading and writing proceed concurrently: a reader
//! task decodes server frames into [`ServerEvent`]s tagged with the
//! connection's epoch, and the writer half is shared behind a lock for the
//! session controller's sends. Malformed frames are logged and ignored; the
//! reader reports close and failure as events rather than tearing anything
//! down itself.

use crate::protocol::{
    parse_server_frame, ClientMessage, LiveError, MediaBlob, RealtimeInput, Result, ServerEvent,
    SessionSetup,
};
use crate::event::HistoryTurn;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// One live connection. Dropping it without [`Transport::close`] leaves the
/// reader to notice the socket closing on its own.
pub struct Transport {
    writer: WsSink,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Open the socket and start the reader task. Events are tagged with
    /// `epoch` so the controller can discard messages from a superseded
    /// connection.
    pub async fn connect(
        url: &str,
        epoch: u64,
        events_tx: mpsc::UnboundedSender<(u64, ServerEvent)>,
    ) -> Result<Self> {
        info!("connecting to live endpoint");
        let (ws, response) = connect_async(url).await?;
        debug!("WebSocket handshake status: {}", response.status());

        let (sink, stream) = ws.split();
        let reader = tokio::spawn(read_loop(stream, epoch, events_tx));

        Ok(Self {
            writer: Arc::new(Mutex::new(sink)),
            reader,
        })
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let frame = message.to_frame()?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::text(frame))
            .await
            .map_err(LiveError::WebSocket)
    }

    pub async fn send_setup(&self, setup: &SessionSetup) -> Result<()> {
        debug!("sending session setup for {}", setup.model);
        self.send(&ClientMessage::Setup(setup.clone())).await
    }

    pub async fn send_audio(&self, bytes: &[u8], rate: u32) -> Result<()> {
        self.send(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(MediaBlob::pcm(bytes, rate)),
            video: None,
        }))
        .await
    }

    pub async fn send_video(&self, jpeg: &[u8]) -> Result<()> {
        self.send(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            video: Some(MediaBlob::jpeg(jpeg)),
        }))
        .await
    }

    /// One-shot priming with prior conversation turns. `turnComplete` stays
    /// false so the endpoint takes the turns as context, not as something to
    /// answer.
    pub async fn send_history(&self, turns: &[HistoryTurn]) -> Result<()> {
        let turns: Vec<_> = turns
            .iter()
            .map(|t| {
                json!({
                    "role": t.role,
                    "parts": t.text_parts.iter()
                        .map(|p| json!({"text": p}))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        info!("priming endpoint with {} history turns", turns.len());
        self.send(&ClientMessage::ClientContent(json!({
            "turns": turns,
            "turnComplete": false,
        })))
        .await
    }

    /// Close the socket and retire the reader. The controller has already
    /// bumped its epoch, so anything still in flight is discarded.
    pub fn close(self) {
        self.reader.abort();
        let writer = self.writer;
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!("close frame not delivered: {e}");
            }
        });
    }
}

async fn read_loop(
    mut stream: WsStream,
    epoch: u64,
    events_tx: mpsc::UnboundedSender<(u64, ServerEvent)>,
) {
    debug!("transport reader started (epoch {epoch})");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                forward_frame(&text, epoch, &events_tx);
            }
            // The endpoint also delivers JSON frames as binary messages.
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => forward_frame(&text, epoch, &events_tx),
                Err(_) => debug!("ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Ok(Message::Close(frame)) => {
                info!("server closed the connection: {frame:?}");
                let _ = events_tx.send((epoch, ServerEvent::Closed));
                return;
            }
            Ok(_) => {} // ping/pong
            Err(e) => {
                let _ = events_tx.send((epoch, ServerEvent::TransportError(e.to_string())));
                return;
            }
        }
    }

    debug!("transport reader ended (epoch {epoch})");
    let _ = events_tx.send((epoch, ServerEvent::Closed));
}

fn forward_frame(text: &str, epoch: u64, events_tx: &mpsc::UnboundedSender<(u64, ServerEvent)>) {
    match parse_server_frame(text) {
        Ok(events) => {
            for event in events {
                if events_tx.send((epoch, event)).is_err() {
                    return;
                }
            }
        }
        // Protocol anomaly: never fatal.
        Err(e) => warn!("ignoring malformed server frame: {e}"),
    }
}
