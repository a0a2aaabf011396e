use clap::Parser;
use std::time::Duration;

use crate::connection::ClientConfig;
use crate::segmenter::SegmenterConfig;
use crate::voice_capture::CaptureConfig;

/// Voice-satellite bridge for ESPHome devices speaking the native API.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Device hostname or IP
    #[arg(long, env = "ESPHOME_HOST")]
    pub host: String,

    /// Device native API port
    #[arg(long, default_value_t = 6053)]
    pub api_port: u16,

    /// API password (empty for none)
    #[arg(long, env = "ESPHOME_PASSWORD", default_value = "")]
    pub password: String,

    /// Client name announced in the hello
    #[arg(long, default_value = "esphome-voice-bridge")]
    pub client_info: String,

    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,

    // ── Reconnect & health ─────────────────────────────────────────────

    /// First reconnect delay; doubles per failed attempt
    #[arg(long, default_value_t = 1000)]
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling
    #[arg(long, default_value_t = 10_000)]
    pub reconnect_max_ms: u64,

    /// How often ping liveness is checked
    #[arg(long, default_value_t = 5)]
    pub health_interval_secs: u64,

    /// Reconnect when the device has not pinged for this long
    #[arg(long, default_value_t = 10)]
    pub ping_timeout_secs: u64,

    // ── Microphone (device → bridge) ───────────────────────────────────

    /// Address the per-run UDP audio socket binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub voice_bind_host: String,

    /// UDP receive buffer size (SO_RCVBUF)
    #[arg(long, default_value_t = 256 * 1024)]
    pub recv_buf_size: usize,

    #[arg(long, default_value_t = 16_000)]
    pub mic_sample_rate: u32,

    /// Datagram RMS (int16 units) above which audio counts as voice
    #[arg(long, default_value_t = 1200.0)]
    pub vad_rms_threshold: f64,

    /// Trailing silence that ends an utterance
    #[arg(long, default_value_t = 800)]
    pub vad_silence_ms: u32,

    /// Pre-roll dropped from the start of each utterance
    #[arg(long, default_value_t = 400)]
    pub vad_trim_ms: u32,

    // ── Reply audio (bridge → device) ──────────────────────────────────

    #[arg(long, default_value_t = 16_000)]
    pub reply_sample_rate: u32,

    /// Frames quieter than this are silence
    #[arg(long, default_value_t = -45.0, allow_negative_numbers = true)]
    pub segment_silence_dbfs: f64,

    #[arg(long, default_value_t = 300)]
    pub segment_min_silence_ms: u32,

    #[arg(long, default_value_t = 600)]
    pub segment_min_chunk_ms: u32,

    #[arg(long, default_value_t = 60)]
    pub segment_pre_pad_ms: u32,

    #[arg(long, default_value_t = 120)]
    pub segment_post_pad_ms: u32,

    /// Longest silence held before it is released as its own segment
    #[arg(long, default_value_t = 5000)]
    pub segment_max_hold_ms: u32,

    /// Directory for reply segments and debug recordings
    #[arg(long, default_value = "./voice_audio")]
    pub audio_save_dir: String,

    /// Save every captured utterance to audio_save_dir/debug/
    #[arg(long, default_value_t = false)]
    pub save_debug_audio: bool,

    /// URL under which audio_save_dir is served to the device
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Play each captured utterance back to the device (needs --public-base-url)
    #[arg(long, default_value_t = false)]
    pub echo: bool,

    /// Media-player volume (0..1) applied whenever the device connects
    #[arg(long)]
    pub volume: Option<f32>,

    // ── Runtime ────────────────────────────────────────────────────────

    /// Accept operator commands on stdin
    #[arg(long, default_value_t = false)]
    pub console: bool,

    /// Capacity of the device event channel
    #[arg(long, default_value_t = 256)]
    pub channel_capacity: usize,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 30)]
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.mic_sample_rate,
            rms_threshold: self.vad_rms_threshold,
            silence_ms: self.vad_silence_ms,
            trim_ms: self.vad_trim_ms,
        }
    }

    pub fn segmenter(&self) -> SegmenterConfig {
        SegmenterConfig {
            sample_rate: self.reply_sample_rate,
            silence_dbfs: self.segment_silence_dbfs,
            min_silence_ms: self.segment_min_silence_ms,
            min_chunk_ms: self.segment_min_chunk_ms,
            pre_pad_ms: self.segment_pre_pad_ms,
            post_pad_ms: self.segment_post_pad_ms,
            max_hold_ms: self.segment_max_hold_ms,
            ..SegmenterConfig::default()
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.api_port,
            client_info: self.client_info.clone(),
            password: self.password.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            health_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            voice_bind_host: self.voice_bind_host.clone(),
            recv_buf_size: self.recv_buf_size,
            capture: self.capture(),
        }
    }
}
