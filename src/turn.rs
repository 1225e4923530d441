//! Accumulates one conversational turn's interim text and raw audio.
//!
//! Audio deltas are kept in arrival order, independent of playback timing.
//! Finalizing encodes the samples as a minimal mono 16-bit WAV at the most
//! recently observed inbound rate and resets both accumulators
//! synchronously, so a repeated completion signal can never re-emit stale
//! data.

use crate::protocol::DEFAULT_OUTPUT_RATE;
use std::io::Cursor;
use tracing::warn;

/// A finalized turn artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTurn {
    pub text: String,
    pub audio_wav: Option<Vec<u8>>,
}

pub struct TurnAggregator {
    text: String,
    audio: Vec<Vec<u8>>,
    rate: u32,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            audio: Vec::new(),
            rate: DEFAULT_OUTPUT_RATE,
        }
    }

    pub fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Append a raw little-endian 16-bit PCM delta.
    pub fn push_audio(&mut self, bytes: &[u8], rate: u32) {
        self.rate = rate;
        self.audio.push(bytes.to_vec());
    }

    /// Interim text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Finalize the turn and reset. A turn with no audio yields no artifact;
    /// a completion with nothing accumulated yields an empty turn.
    pub fn finish(&mut self) -> CompletedTurn {
        let text = std::mem::take(&mut self.text);
        let audio = std::mem::take(&mut self.audio);

        let audio_wav = if audio.is_empty() {
            None
        } else {
            match encode_wav(&audio, self.rate) {
                Ok(wav) => Some(wav),
                Err(e) => {
                    warn!("failed to encode turn audio: {e}");
                    None
                }
            }
        };

        CompletedTurn { text, audio_wav }
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.audio.clear();
    }
}

impl Default for TurnAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode ordered PCM buffers as a mono 16-bit WAV: the standard 44-byte
/// header followed by the little-endian payload.
fn encode_wav(buffers: &[Vec<u8>], rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for buffer in buffers {
            // A trailing odd byte is a corrupt delta; drop just that byte.
            for pair in buffer.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn artifact_is_byte_exact_for_rate_and_sample_count() {
        let mut agg = TurnAggregator::new();
        // 48000 samples at 24 kHz, split across two deltas.
        agg.push_audio(&vec![0u8; 60_000], 24_000);
        agg.push_audio(&vec![0u8; 36_000], 24_000);

        let wav = agg.finish().audio_wav.unwrap();
        assert_eq!(wav.len(), 44 + 96_000);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u16_at(&wav, 22), 1, "channel count");
        assert_eq!(u32_at(&wav, 24), 24_000, "sample rate");
        assert_eq!(u32_at(&wav, 28), 48_000, "byte rate");
        assert_eq!(u16_at(&wav, 32), 2, "block align");
        assert_eq!(u16_at(&wav, 34), 16, "bits per sample");
        assert_eq!(u32_at(&wav, 40), 96_000, "data size");
    }

    #[test]
    fn payload_preserves_sample_order() {
        let mut agg = TurnAggregator::new();
        agg.push_audio(&[1, 0, 2, 0], 24_000);
        agg.push_audio(&[3, 0], 24_000);

        let wav = agg.finish().audio_wav.unwrap();
        assert_eq!(&wav[44..], &[1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn accumulators_are_empty_immediately_after_finish() {
        let mut agg = TurnAggregator::new();
        agg.push_text("hello ");
        agg.push_text("world");
        agg.push_audio(&[0, 0], 24_000);

        let first = agg.finish();
        assert_eq!(first.text, "hello world");
        assert!(first.audio_wav.is_some());

        // A second completion with no intervening deltas emits an empty
        // turn, never stale data.
        let second = agg.finish();
        assert_eq!(second.text, "");
        assert!(second.audio_wav.is_none());
    }

    #[test]
    fn uses_most_recently_observed_rate() {
        let mut agg = TurnAggregator::new();
        agg.push_audio(&[0, 0], 16_000);
        agg.push_audio(&[0, 0], 24_000);

        let wav = agg.finish().audio_wav.unwrap();
        assert_eq!(u32_at(&wav, 24), 24_000);
    }
}
