mod audio;
mod config;
mod connection;
mod console;
mod egress;
mod frame;
mod proto;
mod reconnect;
mod segmenter;
mod session;
mod stats;
mod voice_capture;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::Config;
use connection::DeviceHandle;
use egress::ReplyPublisher;
use session::DeviceEvent;
use stats::Stats;
use tracing::{ debug, info, warn };
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();
    if config.echo && config.public_base_url.is_none() {
        anyhow::bail!("--echo needs --public-base-url so the device can fetch replies");
    }
    if let Some(volume) = config.volume {
        if !(0.0..=1.0).contains(&volume) {
            anyhow::bail!("--volume must be between 0 and 1, got {volume}");
        }
    }

    info!(
        device = config.device_addr(),
        voice_bind = %config.voice_bind_host,
        echo = config.echo,
        channel_cap = config.channel_capacity,
        "🚀 esphome-voice-bridge starting"
    );

    let stats = Stats::new();

    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    let (device, mut events, task) = connection::spawn(
        config.client(),
        stats.clone(),
        config.channel_capacity
    );
    let mut bridge = Bridge::new(&config, device.clone(), stats)?;
    device.start().await?;

    let console = config.console.then(|| tokio::spawn(console::run(device.clone())));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = bridge.on_event(event).await {
                            warn!(error = %e, "device event handling failed");
                        }
                    }
                    None => break,
                }
            }

            _ = &mut ctrl_c => {
                info!("🛑 ctrl-c received, disconnecting");
                device.disconnect().await?;
                break;
            }
        }
    }

    // closing the last handle ends the connection task
    if let Some(console) = console {
        console.abort();
        let _ = console.await;
    }
    drop(bridge);
    drop(device);
    task.await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Device logic
// ═══════════════════════════════════════════════════════════════════════

/// Minimal device logic: acknowledge each run and, in echo mode, play the
/// captured utterance back through the reply path.
struct Bridge {
    device: DeviceHandle,
    mic_sample_rate: u32,
    debug_dir: Option<PathBuf>,
    echo: Option<ReplyPublisher>,
    volume: Option<f32>,
    playlist: VecDeque<Url>,
    playing: bool,
    runs: u64,
}

impl Bridge {
    fn new(config: &Config, device: DeviceHandle, stats: Arc<Stats>) -> anyhow::Result<Self> {
        let save_dir = PathBuf::from(&config.audio_save_dir);

        let echo = match (&config.public_base_url, config.echo) {
            (Some(base), true) => Some(ReplyPublisher::new(&save_dir, base, "reply", &config.segmenter(), stats)?),
            _ => None,
        };

        Ok(Bridge {
            device,
            mic_sample_rate: config.mic_sample_rate,
            debug_dir: config.save_debug_audio.then(|| save_dir.join("debug")),
            echo,
            volume: config.volume,
            playlist: VecDeque::new(),
            playing: false,
            runs: 0,
        })
    }

    async fn on_event(&mut self, event: DeviceEvent) -> anyhow::Result<()> {
        match event {
            DeviceEvent::Connected(info) => {
                info!(device = %serde_json::to_string(&info)?, "📟 device connected");
                if let Some(volume) = self.volume {
                    self.device.set_volume(volume).await?;
                }
            }

            DeviceEvent::Disconnected => {
                warn!("📴 device disconnected");
                self.playlist.clear();
                self.playing = false;
                if let Some(publisher) = self.echo.as_mut() {
                    publisher.reset();
                }
            }

            DeviceEvent::Begin { conversation_id, wake_word } => {
                self.runs += 1;
                info!(run = self.runs, conversation_id = %conversation_id, wake_word = %wake_word, "🎙️ voice run");
                self.device.run_start().await?;
                self.device.stt_vad_start().await?;
            }

            DeviceEvent::Audio(pcm) => {
                self.device.stt_vad_end("").await?;

                if let Some(dir) = &self.debug_dir {
                    let path = dir.join(format!("utterance-{:04}.wav", self.runs));
                    match audio::save_wav(&path, self.mic_sample_rate, &pcm).await {
                        Ok(()) => info!(path = %path.display(), "💾 utterance saved"),
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to save utterance"),
                    }
                }

                match self.echo.as_mut() {
                    Some(publisher) => {
                        self.device.intent_start().await?;
                        self.device.intent_end("echo").await?;
                        let mut urls = publisher.feed(&pcm).await?;
                        urls.extend(publisher.finish().await?);
                        if urls.is_empty() {
                            self.device.run_end().await?;
                        } else {
                            self.device.tts_start().await?;
                            self.playlist.extend(urls);
                            self.play_next().await?;
                        }
                    }
                    None => self.device.run_end().await?,
                }
            }

            DeviceEvent::End { stream_id, success } => {
                debug!(stream_id, success, "announcement finished");
                if self.playing {
                    self.play_next().await?;
                }
            }

            DeviceEvent::Volume(volume) => info!(volume, "🔈 volume changed"),
            DeviceEvent::Mute(muted) => info!(muted, "🔇 mute changed"),
        }
        Ok(())
    }

    /// Announce the next queued URL, or close the run when none is left.
    async fn play_next(&mut self) -> anyhow::Result<()> {
        match self.playlist.pop_front() {
            Some(url) => {
                self.playing = true;
                self.device.play_audio_from_url(url.as_str(), None).await?;
            }
            None => {
                self.playing = false;
                self.device.tts_end().await?;
                self.device.run_end().await?;
            }
        }
        Ok(())
    }
}
