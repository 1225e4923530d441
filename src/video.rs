//! Fixed-rate screen-frame sampling and JPEG encoding.
//!
//! Runs on the orchestrating runtime, never on the real-time audio path. A
//! tick with no fresh frame or a failed encode is skipped; video must never
//! stall audio.

use crate::capture::ScreenSource;
use crate::event::MediaFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

const JPEG_QUALITY: u8 = 75;

/// Sample the screen at `period` and forward encoded frames until the stop
/// flag is raised or the session side goes away.
pub fn spawn_frame_throttler(
    screen: ScreenSource,
    stop: Arc<AtomicBool>,
    period: Duration,
    tx: mpsc::Sender<MediaFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("video frame throttler started ({period:?} per frame)");
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let Some(frame) = screen.latest_frame() else {
                debug!("no new screen frame this tick");
                continue;
            };

            match encode_jpeg(frame.width, frame.height, frame.raw) {
                Ok(jpeg) => {
                    debug!("captured screen frame ({} KB)", jpeg.len() / 1024);
                    match tx.try_send(MediaFrame::Video(jpeg)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("outbound channel full, dropping video frame");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(e) => warn!("JPEG encode failed: {e}"),
            }
        }

        drop(screen);
        info!("video frame throttler stopped");
    })
}

fn encode_jpeg(width: u32, height: u32, raw: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let rgba = image::RgbaImage::from_raw(width, height, raw)
        .ok_or_else(|| anyhow::anyhow!("frame buffer does not match {width}x{height}"))?;
    let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();

    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode_image(&rgb)?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_small_frame() {
        let raw = vec![0x80u8; 8 * 8 * 4];
        let jpeg = encode_jpeg(8, 8, raw).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[0..2], &[0xff, 0xd8]);
    }

    #[test]
    fn rejects_a_mismatched_buffer() {
        assert!(encode_jpeg(8, 8, vec![0u8; 16]).is_err());
    }
}
