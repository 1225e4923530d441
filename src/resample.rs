//! Resampling encoder for outbound microphone audio.
//!
//! The capture thread reads fixed-duration blocks from the record stream at
//! the device's native rate, decimates them to the endpoint's input rate by
//! window averaging, and frames the result as little-endian 16-bit PCM. The
//! thread never blocks on the session side: a full channel drops the frame.

use crate::capture::MicSource;
use crate::event::MediaFrame;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const BLOCK_DURATION_MS: u64 = 20;

/// Decimate `input` from `source_rate` to `target_rate`.
///
/// Each output sample is the mean of the input window
/// `[round(i * ratio), round((i + 1) * ratio))`, clamped to `[-1, 1]` and
/// scaled to the signed 16-bit range. Output length is
/// `round(len / ratio)`. One allocation, no I/O: safe on the capture thread.
pub fn resample_to_i16(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if input.is_empty() || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let start = (i as f64 * ratio).round() as usize;
        let end = ((i + 1) as f64 * ratio).round() as usize;
        let start = start.min(input.len().saturating_sub(1));
        let end = end.clamp(start + 1, input.len().max(start + 1));

        let window = &input[start..end.min(input.len())];
        let mean = window.iter().sum::<f32>() / window.len() as f32;

        out.push((mean.clamp(-1.0, 1.0) * 32_767.0).round() as i16);
    }

    out
}

/// Run the resampling encoder on a dedicated thread until the stop flag is
/// raised or the session side goes away.
pub fn spawn_capture_thread(
    mic: MicSource,
    target_rate: u32,
    tx: mpsc::Sender<MediaFrame>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stream = match mic.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!("capture thread failed to open record stream: {e:#}");
                return;
            }
        };

        info!(
            "capture thread started ({} Hz -> {} Hz, {BLOCK_DURATION_MS} ms blocks)",
            mic.native_rate, target_rate
        );

        let samples_per_block = (mic.native_rate as u64 * BLOCK_DURATION_MS / 1000) as usize;
        let mut bytes = vec![0u8; samples_per_block * 2];
        let mut block = vec![0f32; samples_per_block];

        while !mic.stop.load(Ordering::SeqCst) {
            if let Err(e) = stream.read(&mut bytes) {
                error!("microphone read failed: {e}");
                break;
            }

            for (sample, pair) in block.iter_mut().zip(bytes.chunks_exact(2)) {
                *sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0;
            }

            let resampled = resample_to_i16(&block, mic.native_rate, target_rate);
            let mut framed = Vec::with_capacity(resampled.len() * 2);
            for sample in resampled {
                framed.extend_from_slice(&sample.to_le_bytes());
            }

            match tx.try_send(MediaFrame::Audio(framed)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("outbound audio channel full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }

        info!("capture thread stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_length_is_rounded_input_over_ratio() {
        for (source, target, len) in [
            (48_000u32, 16_000u32, 480usize),
            (44_100, 16_000, 441),
            (48_000, 24_000, 1000),
            (44_100, 24_000, 333),
        ] {
            let input = vec![0.25f32; len];
            let ratio = source as f64 / target as f64;
            let expected = (len as f64 / ratio).round() as usize;
            assert_eq!(
                resample_to_i16(&input, source, target).len(),
                expected,
                "{source} -> {target} with {len} samples"
            );
        }
    }

    #[test]
    fn averages_each_window() {
        // 3:1 decimation; each output is the mean of three inputs.
        let input = [0.0, 0.3, 0.6, 0.9, 0.9, 0.9];
        let out = resample_to_i16(&input, 48_000, 16_000);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (0.3f32 * 32_767.0).round() as i16);
        assert_eq!(out[1], (0.9f32 * 32_767.0).round() as i16);
    }

    #[test]
    fn clamps_to_the_signed_16_bit_range() {
        let loud = vec![2.0f32; 300];
        let quiet = vec![-2.0f32; 300];
        for s in resample_to_i16(&loud, 48_000, 16_000) {
            assert_eq!(s, 32_767);
        }
        for s in resample_to_i16(&quiet, 48_000, 16_000) {
            assert_eq!(s, -32_767);
        }
    }

    #[test]
    fn every_sample_within_bounds_for_odd_ratios() {
        let input: Vec<f32> = (0..4410).map(|i| ((i % 200) as f32 / 100.0) - 1.0).collect();
        for s in resample_to_i16(&input, 44_100, 16_000) {
            assert!((-32_767..=32_767).contains(&s));
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(resample_to_i16(&[], 48_000, 16_000).is_empty());
    }
}
