//! voxlive - terminal front-end for the live voice session.
//!
//! Streams the microphone (and optionally the screen) to the configured
//! endpoint and prints interim text and completed turns as they arrive.
//! Ctrl-C stops the session and exits.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use voxlive::{EnvCredentialIssuer, SessionConfig, SessionEvent, StartOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    info!("starting voxlive");

    let mut config = SessionConfig::default();
    if let Ok(model) = std::env::var("VOXLIVE_MODEL") {
        config.model = model;
    }
    if let Ok(voice) = std::env::var("VOXLIVE_VOICE") {
        config.voice = Some(voice);
    }
    if let Ok(language) = std::env::var("VOXLIVE_LANGUAGE") {
        config.language = Some(language);
    }
    config.video_enabled = std::env::var("VOXLIVE_VIDEO").is_ok_and(|v| v == "1");

    let options = StartOptions {
        stream_video: config.video_enabled,
    };

    let issuer = Arc::new(EnvCredentialIssuer::new("GEMINI_API_KEY"));
    let (session, mut events) = voxlive::spawn(config, issuer);

    session.start_session(Vec::new(), options);

    let mut was_active = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping session");
                session.stop_session();
            }
            event = events.recv() => match event {
                Some(SessionEvent::StateChange(active)) => {
                    info!("session {}", if active { "active" } else { "idle" });
                    if active {
                        was_active = true;
                    } else {
                        break;
                    }
                }
                Some(SessionEvent::InterimText(text)) => {
                    if !text.is_empty() {
                        print!("\r{text}");
                    }
                }
                Some(SessionEvent::TurnComplete { text, audio_wav }) => {
                    println!(
                        "\n[turn] {text} ({} KB audio)",
                        audio_wav.map_or(0, |wav| wav.len() / 1024)
                    );
                }
                Some(SessionEvent::VideoStreaming(on)) => {
                    info!("video sharing {}", if on { "started" } else { "stopped" });
                }
                Some(SessionEvent::Error(message)) => {
                    error!("{message}");
                    // A failed start never reaches Active, so there is no
                    // state change to wait for.
                    if !was_active {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!("voxlive stopped");
    Ok(())
}
