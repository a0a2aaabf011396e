/// Device connection manager.
///
/// One task owns the TCP link to the satellite, the frame reader, the
/// session state machine, the reconnect timer, the health check and the
/// per-run voice socket. Callers talk to it through a cloneable
/// [`DeviceHandle`] and receive [`DeviceEvent`]s on a bounded channel.
///
/// ```text
///  DeviceHandle ──commands──▶ ┌──────────────────────────────┐ ──events──▶ integration
///                             │  select! {                    │
///      device TCP ◀─frames──▶ │    command | connect | read   │
///                             │    reconnect timer | health   │
///      device UDP ──pcm─────▶ │    voice datagram }           │
///                             └──────────────────────────────┘
/// ```
use std::future::{ pending, Future };
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{ self, Instant, Interval, MissedTickBehavior };
use tracing::{ debug, error, info, warn };

use crate::frame::{ self, FrameReader };
use crate::proto::{ ApiMessage, DisconnectRequest, VoiceAssistantResponse };
use crate::reconnect::{ Backoff, Liveness };
use crate::session::{ Action, DeviceEvent, LinkState, Session, VoiceEvent };
use crate::stats::Stats;
use crate::voice_capture::{ CaptureConfig, CaptureStatus, VoiceSession };

const COMMAND_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub client_info: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub health_interval: Duration,
    /// Longest gap between device pings before the link is presumed dead.
    pub ping_timeout: Duration,
    pub voice_bind_host: String,
    pub recv_buf_size: usize,
    pub capture: CaptureConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: 6053,
            client_info: "esphome-voice-bridge".into(),
            password: String::new(),
            connect_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(10_000),
            health_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(10),
            voice_bind_host: "0.0.0.0".into(),
            recv_buf_size: 256 * 1024,
            capture: CaptureConfig::default(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Disconnect,
    SetHost(String),
    Voice(VoiceEvent),
    Announce {
        url: String,
        preannounce: Option<String>,
    },
    PlayMedia(String),
    SetVolume(f32),
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct DeviceHandle {
    tx: mpsc::Sender<Command>,
}

impl DeviceHandle {
    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.tx.send(cmd).await.map_err(|_| anyhow!("device connection task has stopped"))
    }

    /// Connect now. No-op while connected or connecting.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.send(Command::Start).await
    }

    /// Close the link without reconnecting.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(Command::Stop).await
    }

    /// Tell the device we are leaving, then stop.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Takes effect on the next connect attempt.
    pub async fn set_host(&self, host: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::SetHost(host.into())).await
    }

    pub async fn voice_event(&self, event: VoiceEvent) -> anyhow::Result<()> {
        self.send(Command::Voice(event)).await
    }

    pub async fn run_start(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::RunStart).await
    }

    pub async fn stt_vad_start(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::SttVadStart).await
    }

    pub async fn stt_vad_end(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::SttVadEnd { text: text.into() }).await
    }

    pub async fn intent_start(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::IntentStart).await
    }

    pub async fn intent_end(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::IntentEnd { text: text.into() }).await
    }

    pub async fn tts_start(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::TtsStart).await
    }

    pub async fn tts_end(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::TtsEnd).await
    }

    pub async fn run_end(&self) -> anyhow::Result<()> {
        self.voice_event(VoiceEvent::RunEnd).await
    }

    /// Ask the device to fetch and play `url`. Completion arrives as
    /// [`DeviceEvent::End`].
    pub async fn play_audio_from_url(
        &self,
        url: impl Into<String>,
        preannounce: Option<String>
    ) -> anyhow::Result<()> {
        self.send(Command::Announce { url: url.into(), preannounce }).await
    }

    /// Play through the device's media-player entity, if it has one.
    pub async fn play_media(&self, url: impl Into<String>) -> anyhow::Result<()> {
        self.send(Command::PlayMedia(url.into())).await
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.send(Command::SetVolume(volume)).await
    }
}

/// Spawn the connection task. It idles until [`DeviceHandle::start`].
pub fn spawn(
    config: ClientConfig,
    stats: Arc<Stats>,
    event_capacity: usize
) -> (DeviceHandle, mpsc::Receiver<DeviceEvent>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
    let conn = DeviceConnection::new(config, event_tx, stats);
    let task = tokio::spawn(conn.run(cmd_rx));
    (DeviceHandle { tx: cmd_tx }, event_rx, task)
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection task
// ═══════════════════════════════════════════════════════════════════════

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

struct DeviceConnection {
    config: ClientConfig,
    host: String,
    session: Session,
    socket: Option<TcpStream>,
    connecting: Option<ConnectFuture>,
    reader: FrameReader,
    reconnect: Backoff,
    liveness: Liveness,
    health: Option<Interval>,
    voice: Option<VoiceSession>,
    events: mpsc::Sender<DeviceEvent>,
    stats: Arc<Stats>,
}

impl DeviceConnection {
    fn new(config: ClientConfig, events: mpsc::Sender<DeviceEvent>, stats: Arc<Stats>) -> Self {
        DeviceConnection {
            host: config.host.clone(),
            session: Session::new(config.client_info.clone(), config.password.clone()),
            socket: None,
            connecting: None,
            reader: FrameReader::new(),
            reconnect: Backoff::new(config.reconnect_base, config.reconnect_max),
            liveness: Liveness::new(config.ping_timeout, Instant::now()),
            health: None,
            voice: None,
            events,
            stats,
            config,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("device connection task started");
        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.stop();
                            break;
                        }
                    }
                }

                res = poll_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match res {
                        Ok(stream) => self.on_connected(stream).await,
                        Err(e) => self.fail(&format!("connect failed: {e}")),
                    }
                }

                res = read_socket(&mut self.socket, self.reader.buffer_mut()) => {
                    self.on_read(res).await;
                }

                res = recv_voice(&mut self.voice) => {
                    self.on_voice(res);
                }

                _ = sleep_until(self.reconnect.deadline()) => {
                    if self.reconnect.fire() {
                        self.open();
                    }
                }

                _ = tick(&mut self.health) => {
                    self.check_health();
                }
            }
        }
        info!("device connection task exiting");
    }

    // ── Commands ──────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                self.reconnect.cancel_pending();
                self.open();
            }
            Command::Stop => {
                self.stop();
                info!(host = %self.host, "⏹️ device connection stopped");
            }
            Command::Disconnect => self.disconnect().await,
            Command::SetHost(host) => {
                info!(old = %self.host, new = %host, "device host updated");
                self.host = host;
            }
            Command::Voice(event) => {
                if self.session.state() != LinkState::Ready {
                    debug!(event = ?event, state = %self.session.state(), "not ready, voice event dropped");
                    return;
                }
                let msg = self.session.voice_event(&event);
                self.send(msg).await;
            }
            Command::Announce { url, preannounce } => {
                info!(url = %url, stream_id = self.session.stream_id(), "🔊 announce");
                let msg = self.session.announce(&url, preannounce.as_deref());
                self.send(msg).await;
            }
            Command::PlayMedia(url) => {
                match self.session.media_play(&url) {
                    Some(msg) => self.send(msg).await,
                    None => warn!(url = %url, "no media player discovered, play ignored"),
                }
            }
            Command::SetVolume(volume) => {
                match self.session.media_volume(volume) {
                    Some(msg) => self.send(msg).await,
                    None => warn!(volume, "no media player discovered, volume ignored"),
                }
            }
        }
    }

    // ── Link lifecycle ────────────────────────────────────────

    fn open(&mut self) {
        if self.socket.is_some() || self.connecting.is_some() {
            return;
        }

        let addr = format!("{}:{}", self.host, self.config.port);
        let timeout = self.config.connect_timeout;
        info!(addr = %addr, attempt = self.reconnect.attempt(), "🔌 connecting to device");

        self.session.on_connecting();
        self.connecting = Some(
            Box::pin(async move {
                match time::timeout(timeout, TcpStream::connect(addr)).await {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                }
            })
        );
    }

    async fn on_connected(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        info!(host = %self.host, port = self.config.port, "📡 TCP connected, starting handshake");

        self.socket = Some(stream);
        self.reader.clear();
        let hello = self.session.on_socket_open();
        self.send(hello).await;
    }

    fn on_ready(&mut self) {
        self.reconnect.on_ready();

        let now = Instant::now();
        self.liveness = Liveness::new(self.config.ping_timeout, now);
        let period = self.config.health_interval;
        let mut interval = time::interval_at(now + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.health = Some(interval);

        let info = self.session.device().clone();
        info!(
            name = %info.name,
            model = %info.model,
            esphome = %info.esphome_version,
            api = %info.api_version,
            media_player = self.session.media_player_key().is_some(),
            "✅ device ready"
        );
        self.emit(DeviceEvent::Connected(info));
    }

    fn check_health(&mut self) {
        let now = Instant::now();
        if self.liveness.is_expired(now) {
            warn!(
                since_ms = self.liveness.since_last(now).as_millis() as u64,
                "💔 no ping from device"
            );
            self.fail("ping timeout");
        }
    }

    /// Drop every link resource and return to `Disconnected`.
    fn teardown(&mut self) {
        let was_ready = self.session.state() == LinkState::Ready;

        self.socket = None;
        self.connecting = None;
        self.health = None;
        if let Some(voice) = self.voice.take() {
            debug!(conversation_id = %voice.conversation_id, "voice session discarded");
        }
        self.reader.clear();
        self.session.reset();

        if was_ready {
            self.emit(DeviceEvent::Disconnected);
        }
    }

    /// Transient failure: tear down and schedule a reconnect.
    fn fail(&mut self, reason: &str) {
        warn!(host = %self.host, reason = reason, "⚠️ device link down");
        self.teardown();
        self.stats.record_reconnect();

        match self.reconnect.on_failure(Instant::now()) {
            Some(delay) =>
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.reconnect.attempt(),
                    "⏳ reconnect scheduled"
                ),
            None => debug!("reconnect already pending"),
        }
    }

    fn stop(&mut self) {
        self.reconnect.cancel_pending();
        self.teardown();
    }

    async fn disconnect(&mut self) {
        if self.socket.is_some() {
            self.send(DisconnectRequest {}.into()).await;
        }
        self.stop();
        info!(host = %self.host, "👋 disconnected from device");
    }

    // ── I/O ───────────────────────────────────────────────────

    async fn send(&mut self, message: ApiMessage) {
        let Some(socket) = self.socket.as_mut() else {
            debug!(name = message.name(), "not connected, outbound message dropped");
            return;
        };

        let bytes = match frame::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(name = message.name(), error = %e, "failed to encode message");
                return;
            }
        };

        let result = socket.write_all(&bytes).await;
        if let Err(e) = result {
            self.fail(&format!("write error: {e}"));
            return;
        }
        self.stats.record_frame_out();
        debug!(name = message.name(), bytes = bytes.len(), "➡️ frame sent");
    }

    async fn on_read(&mut self, res: io::Result<usize>) {
        match res {
            Ok(0) => self.fail("connection closed by device"),
            Ok(n) => {
                self.stats.record_bytes_in(n);
                self.drain_frames().await;
            }
            Err(e) => self.fail(&format!("read error: {e}")),
        }
    }

    async fn drain_frames(&mut self) {
        // a handler may tear the link down mid-drain
        while self.socket.is_some() {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail(&e.to_string());
                    break;
                }
            };
            self.stats.record_frame_in();

            let Some(message) = frame.message else {
                self.stats.record_ignored();
                debug!(
                    id = frame.id,
                    name = frame.name.unwrap_or("?"),
                    len = frame.payload.len(),
                    "ignoring unknown or undecodable frame"
                );
                continue;
            };

            debug!(name = message.name(), "⬅️ frame received");
            for action in self.session.handle(message) {
                self.apply(action).await;
            }
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::Send(message) => self.send(message).await,
            Action::Emit(event) => self.emit(event),
            Action::Heartbeat => self.liveness.touch(Instant::now()),
            Action::Ready => self.on_ready(),
            Action::OpenVoice { conversation_id, wake_word } => {
                self.open_voice(conversation_id, wake_word).await;
            }
            Action::StopVoice => {
                if let Some(mut voice) = self.voice.take() {
                    debug!(buffered_ms = voice.buffered_ms(), "device ended the voice run");
                    let status = voice.finish();
                    self.deliver(status);
                }
            }
            Action::VoiceAudio(data) => {
                let status = match self.voice.as_mut() {
                    Some(voice) => voice.push_api_audio(&data),
                    None => {
                        return;
                    }
                };
                self.on_capture(status);
            }
            Action::Hangup(reason) => self.fail(reason),
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Err(e) = self.events.try_send(event) {
            self.stats.record_event_drop();
            warn!(error = %e, "device event dropped");
        }
    }

    // ── Voice ─────────────────────────────────────────────────

    fn bind_voice(&self, conversation_id: String) -> anyhow::Result<(VoiceSession, u16)> {
        let session = VoiceSession::open(
            &self.config.voice_bind_host,
            self.config.recv_buf_size,
            self.config.capture.clone(),
            conversation_id
        )?;
        let port = session.port()?;
        Ok((session, port))
    }

    async fn open_voice(&mut self, conversation_id: String, wake_word: String) {
        // the old socket stays bound until the new one has its port, so the
        // two runs never share one
        let replaced = self.voice.take();
        if let Some(old) = &replaced {
            info!(conversation_id = %old.conversation_id, "replacing in-flight voice session");
        }

        let bound = self.bind_voice(conversation_id.clone());
        drop(replaced);

        match bound {
            Ok((session, port)) => {
                info!(port, conversation_id = %conversation_id, wake_word = %wake_word, "🎙️ voice run started");
                self.voice = Some(session);
                self.send(VoiceAssistantResponse { port: port as u32, error: false }.into()).await;
                self.emit(DeviceEvent::Begin { conversation_id, wake_word });
            }
            Err(e) => {
                warn!(error = %e, "failed to open voice socket");
                self.send(VoiceAssistantResponse { port: 0, error: true }.into()).await;
            }
        }
    }

    fn on_voice(&mut self, res: io::Result<CaptureStatus>) {
        match res {
            Ok(status) => {
                self.stats.record_voice_datagram();
                self.on_capture(status);
            }
            Err(e) => {
                warn!(error = %e, "voice socket error, closing run");
                if let Some(mut voice) = self.voice.take() {
                    let status = voice.finish();
                    self.deliver(status);
                }
            }
        }
    }

    fn on_capture(&mut self, status: CaptureStatus) {
        if status == CaptureStatus::Listening {
            return;
        }
        // closed: drop the socket
        self.voice = None;
        self.deliver(status);
    }

    fn deliver(&mut self, status: CaptureStatus) {
        match status {
            CaptureStatus::Complete(pcm) => {
                info!(
                    bytes = pcm.len(),
                    ms = format!("{:.0}", crate::audio::bytes_to_ms(self.config.capture.sample_rate, pcm.len())),
                    "🗣️ utterance captured"
                );
                self.stats.record_utterance();
                self.emit(DeviceEvent::Audio(pcm));
            }
            CaptureStatus::Empty => debug!("utterance empty after trim, dropped"),
            CaptureStatus::Listening | CaptureStatus::Closed => {}
        }
    }
}

// ── select! arms over optional resources ──────────────────────────────

async fn poll_connect(connecting: &mut Option<ConnectFuture>) -> io::Result<TcpStream> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn read_socket(socket: &mut Option<TcpStream>, buf: &mut BytesMut) -> io::Result<usize> {
    match socket {
        Some(stream) => {
            buf.reserve(READ_CHUNK);
            stream.read_buf(buf).await
        }
        None => pending().await,
    }
}

async fn recv_voice(voice: &mut Option<VoiceSession>) -> io::Result<CaptureStatus> {
    match voice {
        Some(session) => session.next_status().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::square_ms;
    use crate::proto::*;
    use tokio::net::{ TcpListener, UdpSocket };

    const STEP: Duration = Duration::from_secs(5);

    struct FakeDevice {
        stream: TcpStream,
        reader: FrameReader,
    }

    impl FakeDevice {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = time::timeout(STEP, listener.accept()).await.unwrap().unwrap();
            FakeDevice { stream, reader: FrameReader::new() }
        }

        async fn recv(&mut self) -> ApiMessage {
            loop {
                if let Some(frame) = self.reader.next_frame().unwrap() {
                    return frame.message.expect("known message");
                }
                let n = time::timeout(STEP, self.stream.read_buf(self.reader.buffer_mut())).await
                    .expect("timed out waiting for bridge")
                    .unwrap();
                assert!(n > 0, "bridge closed the connection");
            }
        }

        async fn expect(&mut self, name: &str) -> ApiMessage {
            let msg = self.recv().await;
            assert_eq!(msg.name(), name);
            msg
        }

        async fn send(&mut self, msg: impl Into<ApiMessage>) {
            let bytes = frame::encode(&msg.into()).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        /// Walk the bridge through the handshake up to `Ready`.
        async fn handshake(&mut self) {
            match self.expect("HelloRequest").await {
                ApiMessage::HelloRequest(h) => assert_eq!(h.client_info, "test-bridge"),
                _ => unreachable!(),
            }
            self.send(HelloResponse {
                api_version_major: 1,
                api_version_minor: 10,
                server_info: "fake".into(),
                name: "fake".into(),
            }).await;
            self.expect("ConnectRequest").await;
            self.send(ConnectResponse { invalid_password: false }).await;
            self.expect("DeviceInfoRequest").await;
            self.expect("ListEntitiesRequest").await;
            self.send(DeviceInfoResponse { name: "kitchen-satellite".into(), ..Default::default() }).await;
            self.send(ListEntitiesMediaPlayerResponse { key: 42, ..Default::default() }).await;
            self.send(ListEntitiesDoneResponse {}).await;
            match self.expect("SubscribeVoiceAssistantRequest").await {
                ApiMessage::SubscribeVoiceAssistantRequest(s) => assert!(s.subscribe),
                _ => unreachable!(),
            }
            self.expect("SubscribeStatesRequest").await;
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
        time::timeout(STEP, events.recv()).await.expect("timed out waiting for event").expect("event channel open")
    }

    fn test_config(port: u16) -> ClientConfig {
        ClientConfig {
            // replaced through set_host below
            host: "192.0.2.1".into(),
            port,
            client_info: "test-bridge".into(),
            voice_bind_host: "127.0.0.1".into(),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_voice_run_against_fake_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Stats::new();
        let (handle, mut events, _task) = spawn(test_config(port), stats.clone(), 16);

        handle.set_host("127.0.0.1").await.unwrap();
        handle.start().await.unwrap();

        let mut device = FakeDevice::accept(&listener).await;
        device.handshake().await;
        match next_event(&mut events).await {
            DeviceEvent::Connected(info) => {
                assert_eq!(info.name, "kitchen-satellite");
                assert_eq!(info.api_version, "1.10");
            }
            other => panic!("expected connected, got {other:?}"),
        }

        // ping → pong
        device.send(PingRequest {}).await;
        device.expect("PingResponse").await;

        // voice run over UDP
        device.send(VoiceAssistantRequest {
            start: true,
            conversation_id: "conv-1".into(),
            wake_word_phrase: "okay nabu".into(),
            ..Default::default()
        }).await;
        let udp_port = match device.expect("VoiceAssistantResponse").await {
            ApiMessage::VoiceAssistantResponse(r) => {
                assert!(!r.error);
                r.port as u16
            }
            _ => unreachable!(),
        };
        assert_ne!(udp_port, 0);
        assert_eq!(next_event(&mut events).await, DeviceEvent::Begin {
            conversation_id: "conv-1".into(),
            wake_word: "okay nabu".into(),
        });

        let mic = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut pcm = square_ms(1800, 16_000, 1000);
        pcm.extend(square_ms(200, 16_000, 1000));
        for pkt in pcm.chunks(1000) {
            mic.send_to(pkt, ("127.0.0.1", udp_port)).await.unwrap();
            // pace the datagrams so the loopback buffer never overflows
            tokio::task::yield_now().await;
        }
        match next_event(&mut events).await {
            DeviceEvent::Audio(audio) => assert_eq!(audio.len(), 19_200),
            other => panic!("expected audio, got {other:?}"),
        }

        // reply path
        handle.stt_vad_end("hello").await.unwrap();
        match device.expect("VoiceAssistantEventResponse").await {
            ApiMessage::VoiceAssistantEventResponse(ev) => {
                assert_eq!(ev.event_type, VoiceAssistantEvent::SttVadEnd as i32);
                assert_eq!(ev.data_value("stream_id"), Some("1"));
                assert_eq!(ev.data_value("text"), Some("hello"));
            }
            _ => unreachable!(),
        }
        handle.run_end().await.unwrap();
        device.expect("VoiceAssistantEventResponse").await;

        handle.play_audio_from_url("http://bridge.local/reply.wav", None).await.unwrap();
        match device.expect("VoiceAssistantAnnounceRequest").await {
            ApiMessage::VoiceAssistantAnnounceRequest(req) => {
                assert_eq!(req.media_id, "http://bridge.local/reply.wav");
            }
            _ => unreachable!(),
        }
        device.send(VoiceAssistantAnnounceFinished { success: true }).await;
        assert_eq!(next_event(&mut events).await, DeviceEvent::End { stream_id: 2, success: true });

        // media player
        handle.set_volume(0.25).await.unwrap();
        match device.expect("MediaPlayerCommandRequest").await {
            ApiMessage::MediaPlayerCommandRequest(cmd) => {
                assert_eq!(cmd.key, 42);
                assert!(cmd.has_volume);
            }
            _ => unreachable!(),
        }

        // device goes away
        drop(device);
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);
        assert!(stats.utterances.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_device_disconnect_request_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = test_config(port);
        config.host = "127.0.0.1".into();
        let (handle, mut events, _task) = spawn(config, Stats::new(), 16);
        handle.start().await.unwrap();

        let mut device = FakeDevice::accept(&listener).await;
        device.handshake().await;
        assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected(_)));

        device.send(DisconnectRequest {}).await;
        device.expect("DisconnectResponse").await;
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);

        // first backoff step is one second
        let mut device = FakeDevice::accept(&listener).await;
        device.expect("HelloRequest").await;
    }

    #[tokio::test]
    async fn test_disconnect_is_final_and_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = test_config(port);
        config.host = "127.0.0.1".into();
        let (handle, mut events, _task) = spawn(config, Stats::new(), 16);
        handle.start().await.unwrap();

        let mut device = FakeDevice::accept(&listener).await;
        device.handshake().await;
        assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected(_)));

        handle.disconnect().await.unwrap();
        device.expect("DisconnectRequest").await;
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);

        handle.disconnect().await.unwrap();
        handle.stop().await.unwrap();

        // no reconnect attempt follows
        assert!(time::timeout(Duration::from_millis(1500), listener.accept()).await.is_err());
    }

    async fn ready_device(config: ClientConfig) -> (
        DeviceHandle,
        mpsc::Receiver<DeviceEvent>,
        FakeDevice,
        TcpListener,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ClientConfig { port: listener.local_addr().unwrap().port(), ..config };
        config.host = "127.0.0.1".into();
        let (handle, mut events, _task) = spawn(config, Stats::new(), 16);
        handle.start().await.unwrap();

        let mut device = FakeDevice::accept(&listener).await;
        device.handshake().await;
        assert!(matches!(next_event(&mut events).await, DeviceEvent::Connected(_)));
        (handle, events, device, listener)
    }

    #[tokio::test]
    async fn test_silent_device_is_dropped_and_redialed() {
        let config = ClientConfig {
            health_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(300),
            reconnect_base: Duration::from_millis(100),
            ..test_config(0)
        };
        let (_handle, mut events, mut device, listener) = ready_device(config).await;

        // never ping: the health tick gives up after the timeout
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);
        let mut buf = [0u8; 64];
        let n = time::timeout(STEP, device.stream.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0, "old link still open");

        let mut device = FakeDevice::accept(&listener).await;
        device.expect("HelloRequest").await;
    }

    #[tokio::test]
    async fn test_pings_keep_a_healthy_link_up() {
        let config = ClientConfig {
            health_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(300),
            ..test_config(0)
        };
        let (_handle, mut events, mut device, _listener) = ready_device(config).await;

        for _ in 0..6 {
            time::sleep(Duration::from_millis(150)).await;
            device.send(PingRequest {}).await;
            device.expect("PingResponse").await;
        }
        assert!(time::timeout(Duration::from_millis(50), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_frame_between_pings_is_skipped() {
        let (_handle, _events, mut device, _listener) = ready_device(test_config(0)).await;

        // ping, unregistered id 200 with a 3-byte body, ping; one write
        let mut bytes = frame::encode(&PingRequest {}.into()).unwrap();
        bytes.extend_from_slice(&[0x00, 0x03, 0xc8, 0x01, 1, 2, 3]);
        bytes.extend(frame::encode(&PingRequest {}.into()).unwrap());
        device.stream.write_all(&bytes).await.unwrap();

        device.expect("PingResponse").await;
        device.expect("PingResponse").await;

        // and split across writes
        device.stream.write_all(&[0x00, 0x00, 0xc8]).await.unwrap();
        device.stream.write_all(&[0x01]).await.unwrap();
        device.send(PingRequest {}).await;
        device.expect("PingResponse").await;
    }

    #[tokio::test]
    async fn test_second_voice_request_replaces_first() {
        let (_handle, mut events, mut device, _listener) = ready_device(test_config(0)).await;

        let mut ports = Vec::new();
        for conversation in ["conv-1", "conv-2"] {
            device.send(VoiceAssistantRequest {
                start: true,
                conversation_id: conversation.into(),
                ..Default::default()
            }).await;
            match device.expect("VoiceAssistantResponse").await {
                ApiMessage::VoiceAssistantResponse(r) => {
                    assert!(!r.error);
                    ports.push(r.port as u16);
                }
                _ => unreachable!(),
            }
            match next_event(&mut events).await {
                DeviceEvent::Begin { conversation_id, .. } => assert_eq!(conversation_id, conversation),
                other => panic!("expected begin, got {other:?}"),
            }
        }

        assert_ne!(ports[0], ports[1]);
        // the first run's socket is gone, so its port can be bound again
        std::net::UdpSocket::bind(("127.0.0.1", ports[0])).expect("first voice socket still bound");
        assert!(std::net::UdpSocket::bind(("127.0.0.1", ports[1])).is_err());
    }

    #[tokio::test]
    async fn test_malformed_header_forces_reconnect() {
        let config = ClientConfig { reconnect_base: Duration::from_millis(100), ..test_config(0) };
        let (_handle, mut events, mut device, listener) = ready_device(config).await;

        device.stream.write_all(&[0x00]).await.unwrap();
        device.stream.write_all(&[0xff; 10]).await.unwrap();
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);

        let mut device = FakeDevice::accept(&listener).await;
        device.expect("HelloRequest").await;
    }

    #[tokio::test]
    async fn test_set_host_applies_on_restart() {
        let (handle, mut events, _device, listener) = ready_device(test_config(0)).await;

        handle.stop().await.unwrap();
        assert_eq!(next_event(&mut events).await, DeviceEvent::Disconnected);
        handle.set_host("localhost").await.unwrap();
        handle.start().await.unwrap();

        let mut device = FakeDevice::accept(&listener).await;
        device.expect("HelloRequest").await;
    }

    #[tokio::test]
    async fn test_voice_events_dropped_before_ready() {
        let (handle, mut events, _task) = spawn(test_config(1), Stats::new(), 4);
        handle.run_start().await.unwrap();
        handle.play_media("http://x/y.wav").await.unwrap();
        handle.stop().await.unwrap();
        assert!(time::timeout(Duration::from_millis(200), events.recv()).await.is_err());
    }
}
