//! Inbound playback scheduling against a monotonic output clock.
//!
//! Decoded audio chunks are queued, coalesced into contiguous buffers, and
//! scheduled back to back so successive buffers are gapless. A barge-in
//! interrupt stops every active buffer, clears the queue, and resets the
//! clock cursor to "now". A chunk whose rate differs from the output
//! stream's configured rate forces the stream to be rebuilt at the new rate;
//! this is a legitimate mid-session transition, not an error.

use crate::protocol::{LiveError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;

/// Identifies one scheduled buffer on the output stream.
pub type SourceId = u64;

/// The output clock domain: schedules buffers at absolute stream times and
/// stops them on demand. Implemented by [`PulseOutput`] in production and by
/// a manually clocked mock in tests.
pub trait OutputStream {
    fn sample_rate(&self) -> u32;
    /// Current position on the stream's monotonic clock.
    fn now(&self) -> Duration;
    /// Schedule `samples` (mono f32) to start playing at `at`.
    fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> SourceId;
    /// Stop every in-flight and pending buffer immediately.
    fn stop_all(&mut self);
}

/// Object-safe face of the scheduler, so the session controller does not
/// carry the output-stream generics.
pub trait PlaybackSink: Send {
    /// Queue a little-endian 16-bit PCM chunk tagged with its sample rate.
    fn enqueue_pcm16(&mut self, bytes: &[u8], rate: u32);
    /// A scheduled buffer finished playing.
    fn on_complete(&mut self, id: SourceId);
    /// Barge-in: flush everything and reset the clock cursor.
    fn interrupt(&mut self);
}

struct Chunk {
    samples: Vec<f32>,
    rate: u32,
}

/// Gapless scheduler over an [`OutputStream`].
pub struct Scheduler<S, F>
where
    S: OutputStream,
    F: FnMut(u32) -> Result<S>,
{
    open: F,
    stream: S,
    queue: VecDeque<Chunk>,
    next_play_time: Duration,
    active: Vec<SourceId>,
}

impl<S, F> Scheduler<S, F>
where
    S: OutputStream,
    F: FnMut(u32) -> Result<S>,
{
    pub fn new(mut open: F, initial_rate: u32) -> Result<Self> {
        let stream = open(initial_rate)?;
        let next_play_time = stream.now();
        Ok(Self {
            open,
            stream,
            queue: VecDeque::new(),
            next_play_time,
            active: Vec::new(),
        })
    }

    /// Queue a little-endian 16-bit PCM chunk tagged with its sample rate.
    /// A corrupt chunk (odd byte count) is dropped; playback continues.
    pub fn enqueue_pcm16(&mut self, bytes: &[u8], rate: u32) {
        if bytes.is_empty() {
            return;
        }
        if bytes.len() % 2 != 0 {
            warn!("dropping corrupt audio chunk ({} bytes)", bytes.len());
            return;
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]) as f32 / 32_768.0)
            .collect();
        self.queue.push_back(Chunk { samples, rate });
        self.drain();
    }

    /// A scheduled buffer finished playing; drain whatever queued meanwhile.
    pub fn on_complete(&mut self, id: SourceId) {
        self.active.retain(|a| *a != id);
        self.drain();
    }

    /// Barge-in: stop active buffers, clear the queue, reset the cursor.
    pub fn interrupt(&mut self) {
        self.stream.stop_all();
        self.active.clear();
        self.queue.clear();
        self.next_play_time = self.stream.now();
    }

    /// Merge everything queued into one contiguous buffer and schedule it at
    /// `max(now, next_play_time)`; rebuild the stream first when the head
    /// chunk's rate disagrees with the stream's.
    fn drain(&mut self) {
        while let Some(head_rate) = self.queue.front().map(|c| c.rate) {
            if head_rate != self.stream.sample_rate() {
                info!(
                    "output rate change {} Hz -> {head_rate} Hz, rebuilding stream",
                    self.stream.sample_rate()
                );
                match (self.open)(head_rate) {
                    Ok(stream) => {
                        self.stream = stream;
                        self.active.clear();
                        self.next_play_time = self.stream.now();
                    }
                    Err(e) => {
                        warn!("failed to reopen output at {head_rate} Hz, dropping chunk: {e}");
                        self.queue.pop_front();
                        continue;
                    }
                }
            }

            let rate = self.stream.sample_rate();
            let mut merged = Vec::new();
            while self
                .queue
                .front()
                .is_some_and(|c| c.rate == rate)
            {
                merged.extend(self.queue.pop_front().unwrap().samples);
            }
            if merged.is_empty() {
                continue;
            }

            let duration = Duration::from_secs_f64(merged.len() as f64 / rate as f64);
            let start = self.stream.now().max(self.next_play_time);
            let id = self.stream.schedule(merged, start);
            self.active.push(id);
            self.next_play_time = start + duration;
            debug!(
                "scheduled {:?} of audio at {:?} (cursor {:?})",
                duration, start, self.next_play_time
            );
        }
    }
}

impl<S, F> PlaybackSink for Scheduler<S, F>
where
    S: OutputStream + Send,
    F: FnMut(u32) -> Result<S> + Send,
{
    fn enqueue_pcm16(&mut self, bytes: &[u8], rate: u32) {
        Scheduler::enqueue_pcm16(self, bytes, rate);
    }

    fn on_complete(&mut self, id: SourceId) {
        Scheduler::on_complete(self, id);
    }

    fn interrupt(&mut self) {
        Scheduler::interrupt(self);
    }
}

struct PlayCmd {
    id: SourceId,
    samples: Vec<f32>,
    at: Duration,
    generation: u64,
}

/// PulseAudio-backed output stream. A dedicated playback thread holds the
/// stream, waits out each buffer's start time, and writes in short slices so
/// a generation bump from [`OutputStream::stop_all`] lands mid-buffer.
pub struct PulseOutput {
    rate: u32,
    origin: Instant,
    cmd_tx: Sender<PlayCmd>,
    generation: Arc<AtomicU64>,
    next_id: SourceId,
}

impl PulseOutput {
    /// Open the playback stream at `rate`. Completions are reported through
    /// `done_tx` so the session loop can re-drain the scheduler.
    pub fn open(rate: u32, app_name: &str, done_tx: UnboundedSender<SourceId>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));
        let origin = Instant::now();

        let thread_gen = generation.clone();
        let thread_app = app_name.to_string();
        std::thread::spawn(move || {
            playback_thread(rate, &thread_app, origin, cmd_rx, ready_tx, thread_gen, done_tx)
        });

        // The thread reports whether the stream opened before any scheduling.
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                rate,
                origin,
                cmd_tx,
                generation,
                next_id: 0,
            }),
            Ok(Err(msg)) => Err(LiveError::Device(msg)),
            Err(_) => Err(LiveError::Device(
                "playback thread failed to start".to_string(),
            )),
        }
    }
}

fn playback_thread(
    rate: u32,
    app_name: &str,
    origin: Instant,
    cmd_rx: Receiver<PlayCmd>,
    ready_tx: Sender<std::result::Result<(), String>>,
    generation: Arc<AtomicU64>,
    done_tx: UnboundedSender<SourceId>,
) {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: 1,
        rate,
    };

    let stream = match psimple::Simple::new(
        None,
        app_name,
        pulse::stream::Direction::Playback,
        None,
        "playback",
        &spec,
        None,
        None,
    ) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{e}")));
            return;
        }
    };

    info!("playback thread started at {rate} Hz");
    let slice_len = (rate as usize / 50).max(1); // ~20 ms per write

    while let Ok(cmd) = cmd_rx.recv() {
        if cmd.generation != generation.load(Ordering::SeqCst) {
            continue; // abandoned before it started
        }

        let start = origin + cmd.at;
        let now = Instant::now();
        if start > now {
            std::thread::sleep(start - now);
        }

        let mut abandoned = false;
        for slice in cmd.samples.chunks(slice_len) {
            if cmd.generation != generation.load(Ordering::SeqCst) {
                abandoned = true;
                break;
            }
            let mut bytes = Vec::with_capacity(slice.len() * 2);
            for sample in slice {
                let value = (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            if let Err(e) = stream.write(&bytes) {
                warn!("playback write failed: {e}");
                abandoned = true;
                break;
            }
        }

        if !abandoned && done_tx.send(cmd.id).is_err() {
            break;
        }
    }

    info!("playback thread stopped");
}

impl OutputStream for PulseOutput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> SourceId {
        let id = self.next_id;
        self.next_id += 1;
        let _ = self.cmd_tx.send(PlayCmd {
            id,
            samples,
            at,
            generation: self.generation.load(Ordering::SeqCst),
        });
        id
    }

    fn stop_all(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        // Abandon in-flight buffers; the thread exits once cmd_tx is gone.
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    struct Scheduled {
        id: SourceId,
        at: Duration,
        duration: Duration,
    }

    #[derive(Default)]
    struct MockState {
        clock: Duration,
        scheduled: Vec<Scheduled>,
        stopped: bool,
        next_id: SourceId,
    }

    struct MockStream {
        rate: u32,
        state: Rc<RefCell<MockState>>,
    }

    impl OutputStream for MockStream {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn now(&self) -> Duration {
            self.state.borrow().clock
        }

        fn schedule(&mut self, samples: Vec<f32>, at: Duration) -> SourceId {
            let mut state = self.state.borrow_mut();
            let id = state.next_id;
            state.next_id += 1;
            let duration = Duration::from_secs_f64(samples.len() as f64 / self.rate as f64);
            state.scheduled.push(Scheduled { id, at, duration });
            id
        }

        fn stop_all(&mut self) {
            self.state.borrow_mut().stopped = true;
        }
    }

    fn scheduler(
        rate: u32,
    ) -> (
        Scheduler<MockStream, impl FnMut(u32) -> Result<MockStream>>,
        Rc<RefCell<MockState>>,
    ) {
        let state = Rc::new(RefCell::new(MockState::default()));
        let for_factory = state.clone();
        let scheduler = Scheduler::new(
            move |rate| {
                Ok(MockStream {
                    rate,
                    state: for_factory.clone(),
                })
            },
            rate,
        )
        .unwrap();
        (scheduler, state)
    }

    fn pcm(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    #[test]
    fn back_to_back_chunks_are_gapless() {
        let (mut sched, state) = scheduler(24_000);

        // 1 s chunk, then a 0.5 s chunk arriving while the first plays.
        sched.enqueue_pcm16(&pcm(24_000), 24_000);
        sched.enqueue_pcm16(&pcm(12_000), 24_000);

        let scheduled = state.borrow().scheduled.clone();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].at, Duration::ZERO);
        assert_eq!(scheduled[1].at, scheduled[0].at + scheduled[0].duration);
        assert_eq!(
            sched.next_play_time,
            scheduled[1].at + scheduled[1].duration
        );
    }

    #[test]
    fn never_schedules_into_the_past() {
        let (mut sched, state) = scheduler(24_000);
        state.borrow_mut().clock = Duration::from_secs(3);

        sched.enqueue_pcm16(&pcm(24_000), 24_000);

        let scheduled = state.borrow().scheduled.clone();
        assert_eq!(scheduled[0].at, Duration::from_secs(3));
        assert_eq!(sched.next_play_time, Duration::from_secs(4));
    }

    #[test]
    fn interrupt_flushes_and_resets_the_cursor() {
        let (mut sched, state) = scheduler(24_000);
        sched.enqueue_pcm16(&pcm(24_000), 24_000);
        assert_eq!(sched.active.len(), 1);

        state.borrow_mut().clock = Duration::from_millis(250);
        sched.interrupt();

        assert!(state.borrow().stopped);
        assert!(sched.active.is_empty());
        assert!(sched.queue.is_empty());
        assert_eq!(sched.next_play_time, Duration::from_millis(250));

        // The next chunk starts at "now", not at the old cursor.
        sched.enqueue_pcm16(&pcm(2_400), 24_000);
        let scheduled = state.borrow().scheduled.clone();
        assert_eq!(scheduled.last().unwrap().at, Duration::from_millis(250));
    }

    #[test]
    fn completion_drains_whatever_queued_meanwhile() {
        let (mut sched, state) = scheduler(24_000);
        sched.enqueue_pcm16(&pcm(24_000), 24_000);
        let first = state.borrow().scheduled[0].clone();

        state.borrow_mut().clock = first.duration;
        sched.on_complete(first.id);
        assert!(sched.active.is_empty());

        sched.enqueue_pcm16(&pcm(12_000), 24_000);
        assert_eq!(sched.active.len(), 1);
    }

    #[test]
    fn rate_change_rebuilds_the_stream_and_resets_the_cursor() {
        let (mut sched, state) = scheduler(24_000);
        sched.enqueue_pcm16(&pcm(24_000), 24_000);
        assert_eq!(sched.next_play_time, Duration::from_secs(1));

        state.borrow_mut().clock = Duration::from_millis(100);
        sched.enqueue_pcm16(&pcm(16_000), 16_000);

        assert_eq!(sched.stream.sample_rate(), 16_000);
        // Cursor restarted from "now" on the new stream, then advanced by
        // the one-second chunk.
        assert_eq!(
            sched.next_play_time,
            Duration::from_millis(100) + Duration::from_secs(1)
        );
    }

    #[test]
    fn corrupt_chunk_is_dropped_and_playback_continues() {
        let (mut sched, state) = scheduler(24_000);
        sched.enqueue_pcm16(&[1, 2, 3], 24_000); // odd length
        assert!(state.borrow().scheduled.is_empty());

        sched.enqueue_pcm16(&pcm(2_400), 24_000);
        assert_eq!(state.borrow().scheduled.len(), 1);
    }
}
