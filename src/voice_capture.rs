/// Microphone capture for one voice-assistant run.
///
/// After the device asks for a run, the bridge binds an ephemeral UDP
/// socket and advertises its port; the device then streams raw 16-bit LE
/// mono PCM datagrams to it (no framing inside a datagram).
///
/// ```text
///  datagram ──▶ append ──▶ RMS > threshold? ──yes──▶ voiced_end = len
///                                   │
///                                   no
///                                   ▼
///            silence since voiced_end > silence_ms ──▶ deliver
///                                                      buffer[trim..voiced_end]
/// ```
///
/// Time is measured on the audio itself (bytes received), so the detector
/// behaves identically regardless of datagram jitter.
use std::io;
use std::net::{ IpAddr, SocketAddr };
use tokio::net::UdpSocket;
use tracing::debug;

use crate::audio;

/// Largest datagram accepted from the device.
const MAX_DATAGRAM_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Datagrams with RMS above this (raw int16 units) count as voice.
    pub rms_threshold: f64,
    /// Trailing silence that closes the utterance.
    pub silence_ms: u32,
    /// Pre-roll discarded from the front of the utterance.
    pub trim_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            sample_rate: 16_000,
            rms_threshold: 1200.0,
            silence_ms: 800,
            trim_ms: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Still collecting.
    Listening,
    /// Utterance closed; trimmed audio ready for delivery.
    Complete(Vec<u8>),
    /// Utterance closed but nothing survived the trim.
    Empty,
    /// Already delivered; further audio is ignored.
    Closed,
}

// ═══════════════════════════════════════════════════════════════════════
//  Amplitude VAD + utterance buffer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct VoiceCapture {
    config: CaptureConfig,
    buffer: Vec<u8>,
    /// Buffer length right after the last voiced datagram.
    voiced_end: usize,
    datagrams: u64,
    closed: bool,
}

impl VoiceCapture {
    /// Pre-allocates ~10 s of 16 kHz audio.
    pub fn new(config: CaptureConfig) -> Self {
        VoiceCapture {
            config,
            buffer: Vec::with_capacity(16_000 * 2 * 10),
            voiced_end: 0,
            datagrams: 0,
            closed: false,
        }
    }

    pub fn push(&mut self, datagram: &[u8]) -> CaptureStatus {
        if self.closed {
            return CaptureStatus::Closed;
        }

        self.buffer.extend_from_slice(datagram);
        self.datagrams += 1;

        if audio::rms_i16(datagram) > self.config.rms_threshold {
            self.voiced_end = self.buffer.len();
        }

        let silent_ms = audio::bytes_to_ms(self.config.sample_rate, self.buffer.len() - self.voiced_end);
        if silent_ms > (self.config.silence_ms as f64) {
            self.finish()
        } else {
            CaptureStatus::Listening
        }
    }

    /// Close the utterance now and hand out whatever survives the trim.
    pub fn finish(&mut self) -> CaptureStatus {
        if self.closed {
            return CaptureStatus::Closed;
        }
        self.closed = true;

        let trim = audio::ms_to_bytes(self.config.sample_rate, self.config.trim_ms);
        let buffer = std::mem::take(&mut self.buffer);
        debug!(
            datagrams = self.datagrams,
            buffered = buffer.len(),
            voiced_end = self.voiced_end,
            trim = trim,
            "voice capture closed"
        );

        if self.voiced_end <= trim {
            CaptureStatus::Empty
        } else {
            CaptureStatus::Complete(buffer[trim..self.voiced_end].to_vec())
        }
    }

    pub fn buffered_ms(&self) -> f64 {
        audio::bytes_to_ms(self.config.sample_rate, self.buffer.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  UDP session
// ═══════════════════════════════════════════════════════════════════════

/// One run's UDP receiver. Dropping it closes the socket.
#[derive(Debug)]
pub struct VoiceSession {
    socket: UdpSocket,
    capture: VoiceCapture,
    buf: Vec<u8>,
    pub conversation_id: String,
}

impl VoiceSession {
    /// Bind an ephemeral UDP port on `bind_host`.
    pub fn open(
        bind_host: &str,
        recv_buf_size: usize,
        config: CaptureConfig,
        conversation_id: String
    ) -> anyhow::Result<Self> {
        let socket = bind_ephemeral(bind_host, recv_buf_size)?;
        Ok(VoiceSession {
            socket,
            capture: VoiceCapture::new(config),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            conversation_id,
        })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Wait for the next datagram and run it through the detector.
    ///
    /// Cancel safe: nothing is consumed unless a datagram was received.
    pub async fn next_status(&mut self) -> io::Result<CaptureStatus> {
        let (len, _src) = self.socket.recv_from(&mut self.buf).await?;
        Ok(self.capture.push(&self.buf[..len]))
    }

    /// Audio that arrived over the API connection instead of UDP.
    pub fn push_api_audio(&mut self, data: &[u8]) -> CaptureStatus {
        self.capture.push(data)
    }

    pub fn finish(&mut self) -> CaptureStatus {
        self.capture.finish()
    }

    pub fn buffered_ms(&self) -> f64 {
        self.capture.buffered_ms()
    }
}

fn bind_ephemeral(host: &str, recv_buf_size: usize) -> anyhow::Result<UdpSocket> {
    let ip: IpAddr = host.parse()?;
    let addr = SocketAddr::new(ip, 0);

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP)
    )?;

    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(recv_buf_size)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
