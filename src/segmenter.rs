/// Streaming silence segmenter for reply (agent → device) audio.
///
/// Consumes 16-bit mono PCM in arbitrarily sized chunks and cuts it into
/// utterance-sized segments at stretches of silence:
///
/// ```text
///  feed(chunk) ──▶ remainder ──30 ms frames──▶ classify (dBFS) ──▶ current
///                                                          │
///        silence ≥ min_silence  &&  cut ≥ min_chunk ───────┘──▶ cut + emit
/// ```
///
/// The cut lands `post_pad` after the start of the trailing silence and
/// never closer than `pre_pad` to the end of `current`, so the bytes after
/// it (the seed of the next segment) always hold at least `pre_pad` of
/// silence. No audio is ever discarded: concatenating every emitted segment
/// and the final `flush()` reproduces the input exactly. Chunk boundaries
/// never influence the output: only whole frames are classified, partial
/// ones wait in `remainder`.
use bytes::{ Buf, BytesMut };
use tracing::debug;

use crate::audio;

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    /// Analysis window.
    pub frame_ms: u32,
    /// Frames quieter than this are silence.
    pub silence_dbfs: f64,
    /// Trailing silence needed to close a segment.
    pub min_silence_ms: u32,
    /// Shortest segment closed on silence.
    pub min_chunk_ms: u32,
    /// Silence left ahead of the next segment's voice.
    pub pre_pad_ms: u32,
    /// Silence kept after a segment's last voiced frame.
    pub post_pad_ms: u32,
    /// Longest silence held back before it is released as a segment.
    pub max_hold_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            sample_rate: 16_000,
            frame_ms: 30,
            silence_dbfs: -45.0,
            min_silence_ms: 300,
            min_chunk_ms: 600,
            pre_pad_ms: 60,
            post_pad_ms: 120,
            max_hold_ms: 5000,
        }
    }
}

#[derive(Debug)]
pub struct PcmSegmenter {
    frame_bytes: usize,
    min_silence_frames: usize,
    min_chunk_bytes: usize,
    pre_pad_bytes: usize,
    post_pad_bytes: usize,
    max_hold_bytes: usize,
    silence_dbfs: f64,

    /// Partial frame carried to the next `feed`.
    remainder: BytesMut,
    /// In-progress segment.
    current: BytesMut,
    /// `current` contains at least one voiced frame.
    voiced: bool,
    /// Consecutive silent frames at the tail of `current`.
    silence_frames: usize,
    /// Most recent silent bytes, capped at `post_pad_bytes`.
    trailing: BytesMut,
}

impl PcmSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        let frame_bytes = audio::ms_to_bytes(config.sample_rate, config.frame_ms).max(audio::BYTES_PER_SAMPLE);
        let frame_ms = config.frame_ms.max(1);
        let min_chunk_bytes = audio::ms_to_bytes(config.sample_rate, config.min_chunk_ms);
        let pre_pad_bytes = audio::ms_to_bytes(config.sample_rate, config.pre_pad_ms);

        PcmSegmenter {
            frame_bytes,
            min_silence_frames: config.min_silence_ms.div_ceil(frame_ms).max(1) as usize,
            min_chunk_bytes,
            pre_pad_bytes,
            post_pad_bytes: audio::ms_to_bytes(config.sample_rate, config.post_pad_ms),
            // a released hold is never shorter than a regular segment
            max_hold_bytes: audio
                ::ms_to_bytes(config.sample_rate, config.max_hold_ms)
                .max(min_chunk_bytes + pre_pad_bytes + frame_bytes),
            silence_dbfs: config.silence_dbfs,
            remainder: BytesMut::new(),
            current: BytesMut::new(),
            voiced: false,
            silence_frames: 0,
            trailing: BytesMut::new(),
        }
    }

    /// Append audio; returns every segment closed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.remainder.extend_from_slice(chunk);

        let mut segments = Vec::new();
        while self.remainder.len() >= self.frame_bytes {
            let frame = self.remainder.split_to(self.frame_bytes);
            if let Some(segment) = self.push_frame(&frame) {
                segments.push(segment);
            }
        }
        segments
    }

    /// Emit everything buffered, ignoring the silence and length gates,
    /// and reset.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        let mut segment = std::mem::take(&mut self.current).to_vec();
        segment.extend_from_slice(&self.remainder);
        self.reset();

        if segment.is_empty() {
            None
        } else {
            debug!(bytes = segment.len(), "segment flushed");
            Some(segment)
        }
    }

    pub fn reset(&mut self) {
        self.remainder.clear();
        self.current.clear();
        self.trailing.clear();
        self.voiced = false;
        self.silence_frames = 0;
    }

    fn is_silent(&self, pcm: &[u8]) -> bool {
        audio::dbfs(pcm) < self.silence_dbfs
    }

    fn push_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.current.extend_from_slice(frame);

        if self.is_silent(frame) {
            self.silence_frames += 1;
            self.trailing.extend_from_slice(frame);
            if self.trailing.len() > self.post_pad_bytes {
                let excess = self.trailing.len() - self.post_pad_bytes;
                self.trailing.advance(excess);
            }
        } else {
            self.silence_frames = 0;
            self.trailing.clear();
            self.voiced = true;
            return None;
        }

        let len = self.current.len();
        let silence_bytes = (self.silence_frames * self.frame_bytes).min(len);
        let silence_start = len - silence_bytes;
        let closing = silence_start + self.post_pad_bytes;

        let cut = if
            self.voiced &&
            self.silence_frames >= self.min_silence_frames &&
            closing >= self.min_chunk_bytes
        {
            closing
        } else if silence_bytes >= self.max_hold_bytes {
            // long pause: release what is held, keeping the pre-pad
            len - self.pre_pad_bytes
        } else {
            return None;
        };

        if cut == 0 || cut + self.pre_pad_bytes > len {
            return None;
        }

        let segment = self.current.split_to(cut).to_vec();
        // the seed is silence only
        self.voiced = false;
        self.silence_frames = self.current.len() / self.frame_bytes;

        debug!(bytes = segment.len(), carried = self.current.len(), "segment closed");
        Some(segment)
    }
}

#[cfg(test)]
impl PcmSegmenter {
    /// Bytes held in the in-progress segment plus the partial frame.
    fn pending_bytes(&self) -> usize {
        self.current.len() + self.remainder.len()
    }

    /// Length of the trailing-silence window (0 while voice is active).
    fn trailing_silence_bytes(&self) -> usize {
        self.trailing.len()
    }
}
