use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };
use tracing::info;

/// Lock-free bridge counters
#[derive(Debug, Default)]
pub struct Stats {
    pub bytes_in: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub frames_ignored: AtomicU64,
    pub reconnects: AtomicU64,
    pub voice_datagrams: AtomicU64,
    pub utterances: AtomicU64,
    pub reply_segments: AtomicU64,
    pub event_drops: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline(always)]
    pub fn record_bytes_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Unknown message id or undecodable body.
    #[inline(always)]
    pub fn record_ignored(&self) {
        self.frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_voice_datagram(&self) {
        self.voice_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_utterance(&self) {
        self.utterances.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_segments(&self, n: usize) {
        self.reply_segments.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_event_drop(&self) {
        self.event_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let bytes = self.bytes_in.swap(0, Ordering::Relaxed);
        let frames_in = self.frames_in.swap(0, Ordering::Relaxed);
        let frames_out = self.frames_out.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            api_kbps: ((bytes as f64) * 8.0) / (secs * 1000.0),
            frames_in_ps: (frames_in as f64) / secs,
            frames_out_ps: (frames_out as f64) / secs,
            frames_ignored: self.frames_ignored.swap(0, Ordering::Relaxed),
            reconnects: self.reconnects.swap(0, Ordering::Relaxed),
            voice_datagrams: self.voice_datagrams.swap(0, Ordering::Relaxed),
            utterances: self.utterances.swap(0, Ordering::Relaxed),
            reply_segments: self.reply_segments.swap(0, Ordering::Relaxed),
            event_drops: self.event_drops.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub api_kbps: f64,
    pub frames_in_ps: f64,
    pub frames_out_ps: f64,
    pub frames_ignored: u64,
    pub reconnects: u64,
    pub voice_datagrams: u64,
    pub utterances: u64,
    pub reply_segments: u64,
    pub event_drops: u64,
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // disabled
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        info!(
            api_kbps = format!("{:.1}", snap.api_kbps),
            frames_in = format!("{:.1}/s", snap.frames_in_ps),
            frames_out = format!("{:.1}/s", snap.frames_out_ps),
            ignored = snap.frames_ignored,
            reconnects = snap.reconnects,
            datagrams = snap.voice_datagrams,
            utterances = snap.utterances,
            segments = snap.reply_segments,
            drops = snap.event_drops,
            "📊 stats"
        );
    }
}
