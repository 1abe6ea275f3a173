//! Playback queue (module D)
//!
//! A FIFO of outbound interleaved stereo16 PCM at 48kHz, drained by the
//! session's pump tick in fixed-size chunks through a [`TransportSink`].
//! There is no pump task of its own: the session's single event loop calls
//! [`PlaybackQueue::pump_tick`] on its own cadence, keeping the "one owner,
//! cooperative suspension" shape the teacher's `voice::coordinator`
//! pipeline uses for its write loop.

use std::collections::VecDeque;

use crate::collaborators::TransportSink;
use crate::settings::PlaybackSettings;

/// Result of attempting to enqueue a chunk of synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted: bool,
    /// Set when the queue just crossed the warn watermark and the warn
    /// cooldown has elapsed, meaning the caller should log a backlog event.
    pub warn: bool,
}

/// Result of one pump tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Nothing queued, nothing written.
    Idle,
    /// A chunk was written successfully.
    Wrote { bytes: usize },
    /// The sink reported backpressure; the chunk was dropped rather than
    /// requeued, since retrying a stale frame only adds latency.
    Backpressure { bytes: usize },
}

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    buffer: VecDeque<u8>,
    last_warn_at_ms: Option<u64>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self { buffer: VecDeque::new(), last_warn_at_ms: None }
    }

    pub fn len_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append synthesized PCM. Rejected outright once the hard max would be
    /// exceeded (spec §4.D): a caller that keeps synthesizing into a full
    /// queue is producing faster than the bot can speak, and queueing
    /// further only grows perceived latency.
    pub fn enqueue(&mut self, pcm: &[u8], now_ms: u64, settings: &PlaybackSettings) -> EnqueueOutcome {
        if self.buffer.len() + pcm.len() > settings.playback_queue_hard_max_bytes {
            return EnqueueOutcome { accepted: false, warn: false };
        }
        self.buffer.extend(pcm.iter().copied());

        let over_warn = self.buffer.len() >= settings.playback_queue_warn_bytes;
        let cooldown_elapsed = match self.last_warn_at_ms {
            Some(last) => now_ms.saturating_sub(last) >= settings.warn_cooldown_ms,
            None => true,
        };
        let warn = over_warn && cooldown_elapsed;
        if warn {
            self.last_warn_at_ms = Some(now_ms);
        }

        EnqueueOutcome { accepted: true, warn }
    }

    /// Drop everything queued, e.g. on barge-in or session end. Does not
    /// touch whatever chunk the sink is mid-write on.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop and write the next chunk (at most `settings.pump_chunk_bytes`)
    /// through `sink`. No-op if the queue is empty.
    pub async fn pump_tick(&mut self, sink: &dyn TransportSink, settings: &PlaybackSettings) -> PumpOutcome {
        if self.buffer.is_empty() {
            return PumpOutcome::Idle;
        }
        let take = settings.pump_chunk_bytes.min(self.buffer.len());
        let chunk: Vec<u8> = self.buffer.drain(..take).collect();
        let ok = sink.write_pcm(&chunk).await;
        if ok {
            PumpOutcome::Wrote { bytes: chunk.len() }
        } else {
            PumpOutcome::Backpressure { bytes: chunk.len() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeSink {
        writes: Arc<AtomicUsize>,
        accept: AtomicBool,
    }

    #[async_trait]
    impl TransportSink for FakeSink {
        async fn write_pcm(&self, frame: &[u8]) -> bool {
            self.writes.fetch_add(frame.len(), Ordering::SeqCst);
            self.accept.load(Ordering::SeqCst)
        }
        async fn destroy(&self) {}
    }

    #[test]
    fn enqueue_rejects_past_hard_max() {
        let mut queue = PlaybackQueue::new();
        let mut settings = PlaybackSettings::default();
        settings.playback_queue_hard_max_bytes = 10;

        let outcome = queue.enqueue(&[0u8; 20], 0, &settings);
        assert!(!outcome.accepted);
        assert_eq!(queue.len_bytes(), 0);
    }

    #[test]
    fn enqueue_warns_once_per_cooldown() {
        let mut queue = PlaybackQueue::new();
        let mut settings = PlaybackSettings::default();
        settings.playback_queue_warn_bytes = 5;
        settings.playback_queue_hard_max_bytes = 1_000;
        settings.warn_cooldown_ms = 1_000;

        let first = queue.enqueue(&[0u8; 10], 0, &settings);
        assert!(first.warn);
        let second = queue.enqueue(&[0u8; 10], 100, &settings);
        assert!(!second.warn, "cooldown should suppress repeat warnings");
        let third = queue.enqueue(&[0u8; 10], 2_000, &settings);
        assert!(third.warn);
    }

    #[test]
    fn clear_empties_queue() {
        let mut queue = PlaybackQueue::new();
        let settings = PlaybackSettings::default();
        queue.enqueue(&[0u8; 10], 0, &settings);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn pump_tick_idle_on_empty_queue() {
        let mut queue = PlaybackQueue::new();
        let settings = PlaybackSettings::default();
        let sink = FakeSink { accept: AtomicBool::new(true), ..Default::default() };
        assert_eq!(queue.pump_tick(&sink, &settings).await, PumpOutcome::Idle);
    }

    #[tokio::test]
    async fn pump_tick_writes_chunk_sized_pieces() {
        let mut queue = PlaybackQueue::new();
        let mut settings = PlaybackSettings::default();
        settings.pump_chunk_bytes = 4;
        settings.playback_queue_hard_max_bytes = 1_000;
        let sink = FakeSink { accept: AtomicBool::new(true), ..Default::default() };

        queue.enqueue(&[1, 2, 3, 4, 5, 6], 0, &settings);
        let outcome = queue.pump_tick(&sink, &settings).await;
        assert_eq!(outcome, PumpOutcome::Wrote { bytes: 4 });
        assert_eq!(queue.len_bytes(), 2);
    }

    #[tokio::test]
    async fn pump_tick_reports_backpressure() {
        let mut queue = PlaybackQueue::new();
        let mut settings = PlaybackSettings::default();
        settings.playback_queue_hard_max_bytes = 1_000;
        let sink = FakeSink { accept: AtomicBool::new(false), ..Default::default() };

        queue.enqueue(&[1, 2, 3], 0, &settings);
        let outcome = queue.pump_tick(&sink, &settings).await;
        assert_eq!(outcome, PumpOutcome::Backpressure { bytes: 3 });
    }
}
