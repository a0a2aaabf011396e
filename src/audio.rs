/// PCM helpers shared by the ingress VAD and the egress segmenter.
///
/// All audio here is 16-bit little-endian mono PCM.
use std::path::Path;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Floor applied before `log10` so digital silence maps to a finite dBFS.
const DBFS_EPSILON: f64 = 1e-10;

/// RMS of a byte buffer interpreted as 16-bit LE samples, in raw sample
/// units (0 ..= 32768).
#[inline]
pub fn rms_i16(data: &[u8]) -> f64 {
    let n_samples = data.len() / BYTES_PER_SAMPLE;
    if n_samples == 0 {
        return 0.0;
    }

    let sum_sq: f64 = data
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|s| {
            let sample = i16::from_le_bytes([s[0], s[1]]) as f64;
            sample * sample
        })
        .sum();

    (sum_sq / (n_samples as f64)).sqrt()
}

/// Loudness in dBFS: `20·log10(rms)` over samples normalised to [-1, 1].
#[inline]
pub fn dbfs(data: &[u8]) -> f64 {
    let rms = rms_i16(data) / 32768.0;
    20.0 * rms.max(DBFS_EPSILON).log10()
}

/// Byte count of `ms` milliseconds of audio at `sample_rate`, sample aligned.
#[inline]
pub fn ms_to_bytes(sample_rate: u32, ms: u32) -> usize {
    ((sample_rate as usize) * (ms as usize) / 1000) * BYTES_PER_SAMPLE
}

/// Duration in milliseconds of `bytes` of audio at `sample_rate`.
#[inline]
pub fn bytes_to_ms(sample_rate: u32, bytes: usize) -> f64 {
    ((bytes / BYTES_PER_SAMPLE) as f64) * 1000.0 / (sample_rate as f64)
}

/// Wrap raw PCM in a RIFF/WAVE container (16-bit, mono).
pub fn wav_bytes(sample_rate: u32, pcm_data: &[u8]) -> Vec<u8> {
    let data_len = pcm_data.len() as u32;
    let bits_per_sample: u16 = 16;
    let channels: u16 = 1;
    let byte_rate = sample_rate * ((bits_per_sample as u32) / 8) * (channels as u32);
    let block_align = channels * (bits_per_sample / 8);

    let mut wav = Vec::with_capacity(44 + pcm_data.len());
    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    // fmt sub-chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&(16u32).to_le_bytes()); // sub-chunk size
    wav.extend_from_slice(&(1u16).to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    // data sub-chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm_data);
    wav
}

/// Write PCM as a WAV file, creating the parent directory if needed.
pub async fn save_wav(path: &Path, sample_rate: u32, pcm_data: &[u8]) -> anyhow::Result<()> {
    if pcm_data.is_empty() {
        anyhow::bail!("no audio data to save");
    }
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, wav_bytes(sample_rate, pcm_data)).await?;
    Ok(())
}
