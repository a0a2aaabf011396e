/// Agent → device reply path.
///
/// Reply audio is cut into utterance-sized segments, each written as a WAV
/// file into a directory served over HTTP by something else. The device
/// then fetches every segment by URL through an announcement.
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{ debug, info };
use url::Url;

use crate::audio;
use crate::segmenter::{ PcmSegmenter, SegmenterConfig };
use crate::stats::Stats;

#[derive(Debug)]
pub struct ReplyPublisher {
    segmenter: PcmSegmenter,
    sample_rate: u32,
    dir: PathBuf,
    base_url: Url,
    prefix: String,
    seq: u64,
    stats: Arc<Stats>,
}

impl ReplyPublisher {
    /// `base_url` is where `dir` is served from.
    pub fn new(
        dir: impl Into<PathBuf>,
        base_url: &str,
        prefix: impl Into<String>,
        config: &SegmenterConfig,
        stats: Arc<Stats>
    ) -> anyhow::Result<Self> {
        // Url::join replaces the last path segment unless it ends in '/'
        let base = if base_url.ends_with('/') { base_url.to_string() } else { format!("{base_url}/") };
        let base_url = Url::parse(&base).with_context(|| format!("invalid public base url {base_url:?}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("public base url {base_url} cannot be a base");
        }

        Ok(ReplyPublisher {
            segmenter: PcmSegmenter::new(config),
            sample_rate: config.sample_rate,
            dir: dir.into(),
            base_url,
            prefix: prefix.into(),
            seq: 0,
            stats,
        })
    }

    /// Feed reply PCM; returns a URL for every segment it closed.
    pub async fn feed(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<Url>> {
        let segments = self.segmenter.feed(pcm);
        let mut urls = Vec::with_capacity(segments.len());
        for segment in segments {
            urls.push(self.publish(&segment).await?);
        }
        Ok(urls)
    }

    /// End of reply: publish whatever audio is still buffered.
    pub async fn finish(&mut self) -> anyhow::Result<Option<Url>> {
        match self.segmenter.flush() {
            Some(segment) => Ok(Some(self.publish(&segment).await?)),
            None => Ok(None),
        }
    }

    /// Drop buffered audio (e.g. the run was cancelled).
    pub fn reset(&mut self) {
        self.segmenter.reset();
    }

    async fn publish(&mut self, segment: &[u8]) -> anyhow::Result<Url> {
        self.seq += 1;
        let name = format!("{}-{:04}.wav", self.prefix, self.seq);
        let path = self.dir.join(&name);

        audio::save_wav(&path, self.sample_rate, segment).await
            .with_context(|| format!("failed to write reply segment {}", path.display()))?;
        let url = self.base_url.join(&name)?;

        self.stats.record_segments(1);
        info!(
            url = %url,
            bytes = segment.len(),
            ms = format!("{:.0}", audio::bytes_to_ms(self.sample_rate, segment.len())),
            "💾 reply segment published"
        );
        debug!(path = %path.display(), "segment file written");
        Ok(url)
    }
}
