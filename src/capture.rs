//! Scoped acquisition of the microphone and optional screen-video source.
//!
//! [`CaptureHandle::acquire`] validates every requested device up front so a
//! missing or permission-denied device fails the start attempt immediately.
//! [`CaptureHandle::release`] is idempotent and also runs on drop, so the
//! devices are let go on every exit path.

use anyhow::{Context, Result};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use xcap::{Frame, Monitor, VideoRecorder};

/// Token handed to the capture thread; the record stream itself is created
/// on that thread (the probe in [`CaptureHandle::acquire`] has already
/// validated the device).
pub struct MicSource {
    pub app_name: String,
    pub native_rate: u32,
    pub stop: Arc<AtomicBool>,
}

impl MicSource {
    pub fn open_stream(&self) -> Result<psimple::Simple> {
        open_record_stream(&self.app_name, self.native_rate)
    }
}

/// A running screen recorder plus its frame feed.
pub struct ScreenSource {
    recorder: VideoRecorder,
    frames: Receiver<Frame>,
}

impl ScreenSource {
    fn open() -> Result<Self> {
        let monitors = Monitor::all().context("failed to enumerate monitors")?;
        if monitors.is_empty() {
            anyhow::bail!("no monitors found");
        }

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0])
            .clone();

        info!(
            "capturing monitor {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0)
        );

        let (recorder, frames) = monitor
            .video_recorder()
            .context("failed to open screen recorder")?;
        recorder.start().context("failed to start screen recorder")?;

        Ok(Self { recorder, frames })
    }

    /// The most recent frame, draining anything older.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.frames.try_iter().last()
    }
}

impl Drop for ScreenSource {
    fn drop(&mut self) {
        if let Err(e) = self.recorder.stop() {
            warn!("failed to stop screen recorder: {e}");
        }
    }
}

/// Owns the capture devices for the lifetime of one session.
pub struct CaptureHandle {
    app_name: String,
    native_rate: u32,
    stop: Arc<AtomicBool>,
    mic_claimed: bool,
    screen: Option<ScreenSource>,
    released: bool,
}

impl CaptureHandle {
    /// Acquire the microphone unconditionally and the screen source only when
    /// `wants_video`. Any failure is fatal to the start attempt.
    pub fn acquire(app_name: &str, native_rate: u32, wants_video: bool) -> Result<Self> {
        // Validate the microphone now; the capture thread reopens it.
        drop(open_record_stream(app_name, native_rate)?);

        let screen = if wants_video {
            Some(ScreenSource::open()?)
        } else {
            None
        };

        info!(
            "capture devices acquired (rate {native_rate} Hz, video: {})",
            wants_video
        );

        Ok(Self {
            app_name: app_name.to_string(),
            native_rate,
            stop: Arc::new(AtomicBool::new(false)),
            mic_claimed: false,
            screen,
            released: false,
        })
    }

    /// Shared stop flag watched by the capture thread and video task.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Claim the microphone for the capture thread. Returns `None` once
    /// claimed so a reconnect does not spawn a second thread.
    pub fn take_mic(&mut self) -> Option<MicSource> {
        if self.mic_claimed || self.released {
            return None;
        }
        self.mic_claimed = true;
        Some(MicSource {
            app_name: self.app_name.clone(),
            native_rate: self.native_rate,
            stop: self.stop.clone(),
        })
    }

    /// Hand the screen source to the frame throttler.
    pub fn take_screen(&mut self) -> Option<ScreenSource> {
        self.screen.take()
    }

    /// Stop every underlying source. Idempotent; called on all exit paths.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop.store(true, Ordering::SeqCst);
        self.screen = None;
        debug!("capture devices released");
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_record_stream(app_name: &str, rate: u32) -> Result<psimple::Simple> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: 1,
        rate,
    };

    psimple::Simple::new(
        None, // default server
        app_name,
        pulse::stream::Direction::Record,
        None, // default device
        "microphone",
        &spec,
        None, // default channel map
        None, // default buffering
    )
    .context("failed to open microphone record stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent_and_sets_the_stop_flag() {
        // Built directly: device acquisition needs real hardware.
        let mut handle = CaptureHandle {
            app_name: "test".to_string(),
            native_rate: 48_000,
            stop: Arc::new(AtomicBool::new(false)),
            mic_claimed: false,
            screen: None,
            released: false,
        };

        let flag = handle.stop_flag();
        handle.release();
        handle.release();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn mic_is_claimed_at_most_once() {
        let mut handle = CaptureHandle {
            app_name: "test".to_string(),
            native_rate: 48_000,
            stop: Arc::new(AtomicBool::new(false)),
            mic_claimed: false,
            screen: None,
            released: false,
        };

        assert!(handle.take_mic().is_some());
        assert!(handle.take_mic().is_none());
    }
}
