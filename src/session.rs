/// Protocol session state machine.
///
/// Pure: consumes decoded messages, returns the [`Action`]s the connection
/// must carry out (frames to send, events to emit, voice-session control).
/// No I/O happens here, which keeps every transition testable.
///
/// ```text
/// Disconnected ──open──▶ Connecting ──socket up──▶ HandshakeHello
///                                                      │ HelloResponse
///                                                      ▼
///        Ready ◀──ListEntitiesDone── EntityDiscovery ◀──ConnectResponse── HandshakeConnect
/// ```
use serde::Serialize;
use std::fmt;
use std::time::{ SystemTime, UNIX_EPOCH };
use tracing::{ debug, info, warn };

use crate::proto::*;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Socket up, `HelloRequest` sent.
    HandshakeHello,
    /// `ConnectRequest` sent.
    HandshakeConnect,
    /// `ListEntitiesRequest` sent, collecting entities.
    EntityDiscovery,
    /// Subscribed to voice-assistant requests.
    Ready,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::HandshakeHello => write!(f, "handshake-hello"),
            LinkState::HandshakeConnect => write!(f, "handshake-connect"),
            LinkState::EntityDiscovery => write!(f, "entity-discovery"),
            LinkState::Ready => write!(f, "ready"),
        }
    }
}

/// What the device told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub friendly_name: String,
    pub mac_address: String,
    pub model: String,
    pub manufacturer: String,
    pub esphome_version: String,
    pub project_name: String,
    pub project_version: String,
    pub server_info: String,
    pub api_version: String,
    pub voice_assistant_feature_flags: u32,
}

/// Events surfaced to the integration layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Handshake finished; the device is available.
    Connected(DeviceInfo),
    /// The link left `Ready`; the device is unavailable until it returns.
    Disconnected,
    /// The device started a voice run.
    Begin {
        conversation_id: String,
        wake_word: String,
    },
    /// One trimmed microphone utterance (16-bit LE mono PCM).
    Audio(Vec<u8>),
    /// The device finished playing an announcement.
    End {
        stream_id: u32,
        success: bool,
    },
    Volume(f32),
    Mute(bool),
}

/// Voice-run progress reported to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    RunStart,
    SttVadStart,
    SttVadEnd {
        text: String,
    },
    IntentStart,
    IntentEnd {
        text: String,
    },
    TtsStart,
    TtsEnd,
    RunEnd,
}

/// Side effects requested by the state machine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(ApiMessage),
    Emit(DeviceEvent),
    /// A device ping arrived.
    Heartbeat,
    /// Handshake complete.
    Ready,
    OpenVoice {
        conversation_id: String,
        wake_word: String,
    },
    StopVoice,
    /// Microphone audio delivered over the API connection.
    VoiceAudio(Vec<u8>),
    /// Drop the link and go through the reconnect path.
    Hangup(&'static str),
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct Session {
    client_info: String,
    password: String,
    state: LinkState,
    /// Correlates voice events to a run; bumped after each `RunEnd`.
    stream_id: u32,
    device: DeviceInfo,
    media_player_key: Option<u32>,
    volume: Option<f32>,
    muted: Option<bool>,
}

impl Session {
    pub fn new(client_info: impl Into<String>, password: impl Into<String>) -> Self {
        Session {
            client_info: client_info.into(),
            password: password.into(),
            state: LinkState::Disconnected,
            stream_id: 1,
            device: DeviceInfo::default(),
            media_player_key: None,
            volume: None,
            muted: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn media_player_key(&self) -> Option<u32> {
        self.media_player_key
    }

    pub fn on_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// Socket is up: returns the hello to send.
    pub fn on_socket_open(&mut self) -> ApiMessage {
        self.state = LinkState::HandshakeHello;
        (HelloRequest {
            client_info: self.client_info.clone(),
            api_version_major: API_VERSION_MAJOR,
            api_version_minor: API_VERSION_MINOR,
        }).into()
    }

    /// Back to `Disconnected`. The stream id survives reconnects.
    pub fn reset(&mut self) {
        self.state = LinkState::Disconnected;
        self.media_player_key = None;
        self.volume = None;
        self.muted = None;
    }

    /// Interpret one inbound message.
    pub fn handle(&mut self, message: ApiMessage) -> Vec<Action> {
        match (self.state, message) {
            // ── Valid in any connected state ─────────────────────
            (_, ApiMessage::PingRequest(_)) => {
                vec![Action::Send(PingResponse {}.into()), Action::Heartbeat]
            }

            (_, ApiMessage::DisconnectRequest(_)) => {
                info!("device requested disconnect");
                vec![
                    Action::Send(DisconnectResponse {}.into()),
                    Action::Hangup("device requested disconnect")
                ]
            }

            (_, ApiMessage::GetTimeRequest(_)) => {
                let epoch_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as u32;
                vec![Action::Send(GetTimeResponse { epoch_seconds }.into())]
            }

            (_, ApiMessage::DeviceInfoResponse(info)) => {
                self.device.name = info.name;
                self.device.friendly_name = info.friendly_name;
                self.device.mac_address = info.mac_address;
                self.device.model = info.model;
                self.device.manufacturer = info.manufacturer;
                self.device.esphome_version = info.esphome_version;
                self.device.project_name = info.project_name;
                self.device.project_version = info.project_version;
                self.device.voice_assistant_feature_flags = info.voice_assistant_feature_flags;
                Vec::new()
            }

            // ── Handshake ────────────────────────────────────────
            (LinkState::HandshakeHello, ApiMessage::HelloResponse(hello)) => {
                self.device.server_info = hello.server_info;
                self.device.api_version = format!(
                    "{}.{}",
                    hello.api_version_major,
                    hello.api_version_minor
                );
                if self.device.name.is_empty() {
                    self.device.name = hello.name;
                }
                self.state = LinkState::HandshakeConnect;
                vec![Action::Send(ConnectRequest { password: self.password.clone() }.into())]
            }

            (LinkState::HandshakeConnect, ApiMessage::ConnectResponse(resp)) => {
                if resp.invalid_password {
                    warn!("device rejected the API password");
                    return vec![Action::Hangup("invalid password")];
                }
                self.state = LinkState::EntityDiscovery;
                vec![
                    Action::Send(DeviceInfoRequest {}.into()),
                    Action::Send(ListEntitiesRequest {}.into())
                ]
            }

            (LinkState::EntityDiscovery, ApiMessage::ListEntitiesMediaPlayerResponse(entity)) => {
                debug!(key = entity.key, object_id = %entity.object_id, "media player discovered");
                self.media_player_key = Some(entity.key);
                Vec::new()
            }

            (LinkState::EntityDiscovery, ApiMessage::ListEntitiesDoneResponse(_)) => {
                self.state = LinkState::Ready;
                vec![
                    Action::Send(SubscribeVoiceAssistantRequest { subscribe: true, flags: 0 }.into()),
                    Action::Send(SubscribeStatesRequest {}.into()),
                    Action::Ready
                ]
            }

            // ── Ready ────────────────────────────────────────────
            (LinkState::Ready, ApiMessage::VoiceAssistantRequest(req)) => {
                if req.start {
                    vec![Action::OpenVoice {
                        conversation_id: req.conversation_id,
                        wake_word: req.wake_word_phrase,
                    }]
                } else {
                    vec![Action::StopVoice]
                }
            }

            (LinkState::Ready, ApiMessage::VoiceAssistantAudio(audio)) => {
                let mut actions = Vec::with_capacity(2);
                if !audio.data.is_empty() {
                    actions.push(Action::VoiceAudio(audio.data));
                }
                if audio.end {
                    actions.push(Action::StopVoice);
                }
                actions
            }

            (LinkState::Ready, ApiMessage::VoiceAssistantAnnounceFinished(done)) => {
                vec![
                    Action::Emit(DeviceEvent::End {
                        stream_id: self.stream_id,
                        success: done.success,
                    })
                ]
            }

            (LinkState::Ready, ApiMessage::MediaPlayerStateResponse(state)) => {
                if self.media_player_key.is_some_and(|k| k != state.key) {
                    return Vec::new();
                }
                let mut actions = Vec::new();
                if self.volume != Some(state.volume) {
                    self.volume = Some(state.volume);
                    actions.push(Action::Emit(DeviceEvent::Volume(state.volume)));
                }
                if self.muted != Some(state.muted) {
                    self.muted = Some(state.muted);
                    actions.push(Action::Emit(DeviceEvent::Mute(state.muted)));
                }
                actions
            }

            (state, other) => {
                debug!(state = %state, name = other.name(), "ignoring message");
                Vec::new()
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────

    /// Build the event frame for `event`, tagged with the current stream id.
    /// `RunEnd` advances the stream id after tagging.
    pub fn voice_event(&mut self, event: &VoiceEvent) -> ApiMessage {
        let mut data = vec![event_data("stream_id", self.stream_id.to_string())];

        let event_type = match event {
            VoiceEvent::RunStart => VoiceAssistantEvent::RunStart,
            VoiceEvent::SttVadStart => VoiceAssistantEvent::SttVadStart,
            VoiceEvent::SttVadEnd { text } => {
                data.push(event_data("text", text.clone()));
                VoiceAssistantEvent::SttVadEnd
            }
            VoiceEvent::IntentStart => VoiceAssistantEvent::IntentStart,
            VoiceEvent::IntentEnd { text } => {
                data.push(event_data("text", text.clone()));
                VoiceAssistantEvent::IntentEnd
            }
            VoiceEvent::TtsStart => VoiceAssistantEvent::TtsStart,
            VoiceEvent::TtsEnd => VoiceAssistantEvent::TtsEnd,
            VoiceEvent::RunEnd => VoiceAssistantEvent::RunEnd,
        };

        let message: ApiMessage = (VoiceAssistantEventResponse { event_type: event_type as i32, data }).into();
        if *event == VoiceEvent::RunEnd {
            self.stream_id = self.stream_id.wrapping_add(1);
        }
        message
    }

    /// Fire-and-forget playback of `url`; completion arrives later as
    /// `VoiceAssistantAnnounceFinished`.
    pub fn announce(&self, url: &str, preannounce: Option<&str>) -> ApiMessage {
        (VoiceAssistantAnnounceRequest {
            media_id: url.to_string(),
            text: String::new(),
            preannounce_media_id: preannounce.unwrap_or_default().to_string(),
            start_conversation: false,
        }).into()
    }

    /// Announcement-flagged media URL for the discovered media player.
    pub fn media_play(&self, url: &str) -> Option<ApiMessage> {
        let key = self.media_player_key?;
        Some(
            (MediaPlayerCommandRequest {
                key,
                has_media_url: true,
                media_url: url.to_string(),
                has_announcement: true,
                announcement: true,
                ..Default::default()
            }).into()
        )
    }

    pub fn media_volume(&self, volume: f32) -> Option<ApiMessage> {
        let key = self.media_player_key?;
        Some(
            (MediaPlayerCommandRequest {
                key,
                has_volume: true,
                volume: volume.clamp(0.0, 1.0),
                ..Default::default()
            }).into()
        )
    }
}

fn event_data(name: &str, value: String) -> VoiceAssistantEventData {
    VoiceAssistantEventData { name: name.to_string(), value }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| {
                match a {
                    Action::Send(m) => Some(m.name()),
                    _ => None,
                }
            })
            .collect()
    }

    fn ready_session() -> Session {
        let mut s = Session::new("test-client", "");
        s.on_connecting();
        s.on_socket_open();
        s.handle(HelloResponse::default().into());
        s.handle(ConnectResponse::default().into());
        s.handle(ListEntitiesMediaPlayerResponse { key: 7, ..Default::default() }.into());
        s.handle(ListEntitiesDoneResponse {}.into());
        assert_eq!(s.state(), LinkState::Ready);
        s
    }

    #[test]
    fn test_handshake_walk() {
        let mut s = Session::new("test-client", "secret");
        s.on_connecting();
        assert_eq!(s.state(), LinkState::Connecting);

        match s.on_socket_open() {
            ApiMessage::HelloRequest(h) => {
                assert_eq!(h.client_info, "test-client");
                assert_eq!(h.api_version_major, API_VERSION_MAJOR);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(s.state(), LinkState::HandshakeHello);

        let actions = s.handle(
            HelloResponse {
                api_version_major: 1,
                api_version_minor: 10,
                server_info: "satellite (esphome v2025.5.0)".into(),
                name: "satellite".into(),
            }.into()
        );
        assert_eq!(
            actions,
            vec![Action::Send(ConnectRequest { password: "secret".into() }.into())]
        );
        assert_eq!(s.state(), LinkState::HandshakeConnect);

        let actions = s.handle(ConnectResponse { invalid_password: false }.into());
        assert_eq!(sent(&actions), vec!["DeviceInfoRequest", "ListEntitiesRequest"]);
        assert_eq!(s.state(), LinkState::EntityDiscovery);

        s.handle(DeviceInfoResponse { name: "kitchen".into(), ..Default::default() }.into());

        let actions = s.handle(ListEntitiesDoneResponse {}.into());
        assert_eq!(sent(&actions), vec!["SubscribeVoiceAssistantRequest", "SubscribeStatesRequest"]);
        assert_eq!(actions.last(), Some(&Action::Ready));
        assert_eq!(s.state(), LinkState::Ready);
        assert_eq!(s.device().name, "kitchen");
        assert_eq!(s.device().api_version, "1.10");
    }

    #[test]
    fn test_invalid_password_hangs_up() {
        let mut s = Session::new("c", "wrong");
        s.on_socket_open();
        s.handle(HelloResponse::default().into());
        let actions = s.handle(ConnectResponse { invalid_password: true }.into());
        assert_eq!(actions, vec![Action::Hangup("invalid password")]);
    }

    #[test]
    fn test_ping_answered_in_any_state() {
        let mut s = Session::new("c", "");
        s.on_socket_open();
        let actions = s.handle(PingRequest {}.into());
        assert_eq!(actions, vec![Action::Send(PingResponse {}.into()), Action::Heartbeat]);
    }

    #[test]
    fn test_out_of_state_messages_ignored() {
        let mut s = Session::new("c", "");
        s.on_socket_open();
        assert!(s.handle(ListEntitiesDoneResponse {}.into()).is_empty());
        assert!(s.handle(VoiceAssistantRequest { start: true, ..Default::default() }.into()).is_empty());
        assert_eq!(s.state(), LinkState::HandshakeHello);
    }

    #[test]
    fn test_voice_request_opens_and_stops() {
        let mut s = ready_session();
        let actions = s.handle(
            VoiceAssistantRequest {
                start: true,
                conversation_id: "conv-1".into(),
                wake_word_phrase: "hey jarvis".into(),
                ..Default::default()
            }.into()
        );
        assert_eq!(
            actions,
            vec![Action::OpenVoice { conversation_id: "conv-1".into(), wake_word: "hey jarvis".into() }]
        );

        let actions = s.handle(VoiceAssistantRequest { start: false, ..Default::default() }.into());
        assert_eq!(actions, vec![Action::StopVoice]);
    }

    #[test]
    fn test_run_end_advances_stream_id() {
        let mut s = ready_session();
        assert_eq!(s.stream_id(), 1);

        let msg = s.voice_event(&VoiceEvent::SttVadEnd { text: "turn on the lights".into() });
        let ApiMessage::VoiceAssistantEventResponse(ev) = msg else {
            panic!("expected event response");
        };
        assert_eq!(ev.event_type, VoiceAssistantEvent::SttVadEnd as i32);
        assert_eq!(ev.data_value("stream_id"), Some("1"));
        assert_eq!(ev.data_value("text"), Some("turn on the lights"));
        assert_eq!(s.stream_id(), 1);

        let ApiMessage::VoiceAssistantEventResponse(ev) = s.voice_event(&VoiceEvent::RunEnd) else {
            panic!("expected event response");
        };
        assert_eq!(ev.data_value("stream_id"), Some("1"));
        assert_eq!(s.stream_id(), 2);

        // survives a reconnect
        s.reset();
        assert_eq!(s.stream_id(), 2);
    }

    #[test]
    fn test_announce_finished_reports_stream_id() {
        let mut s = ready_session();
        s.voice_event(&VoiceEvent::RunEnd);
        let actions = s.handle(VoiceAssistantAnnounceFinished { success: true }.into());
        assert_eq!(actions, vec![Action::Emit(DeviceEvent::End { stream_id: 2, success: true })]);
    }

    #[test]
    fn test_media_state_emits_on_change_only() {
        let mut s = ready_session();
        let state = MediaPlayerStateResponse { key: 7, state: 1, volume: 0.5, muted: false };

        let actions = s.handle(state.clone().into());
        assert_eq!(
            actions,
            vec![Action::Emit(DeviceEvent::Volume(0.5)), Action::Emit(DeviceEvent::Mute(false))]
        );
        assert!(s.handle(state.clone().into()).is_empty());

        let muted = MediaPlayerStateResponse { muted: true, ..state.clone() };
        assert_eq!(s.handle(muted.into()), vec![Action::Emit(DeviceEvent::Mute(true))]);

        // other media players are ignored
        let other = MediaPlayerStateResponse { key: 99, volume: 0.1, ..state };
        assert!(s.handle(other.into()).is_empty());
    }

    #[test]
    fn test_media_commands_need_discovered_player() {
        let s = Session::new("c", "");
        assert!(s.media_play("http://host/a.wav").is_none());

        let s = ready_session();
        match s.media_play("http://host/a.wav") {
            Some(ApiMessage::MediaPlayerCommandRequest(cmd)) => {
                assert_eq!(cmd.key, 7);
                assert!(cmd.has_media_url && cmd.announcement);
                assert_eq!(cmd.media_url, "http://host/a.wav");
            }
            other => panic!("expected media command, got {other:?}"),
        }
        match s.media_volume(1.7) {
            Some(ApiMessage::MediaPlayerCommandRequest(cmd)) => {
                assert!(cmd.has_volume);
                assert_eq!(cmd.volume, 1.0);
            }
            other => panic!("expected volume command, got {other:?}"),
        }
    }

    #[test]
    fn test_device_disconnect_request() {
        let mut s = ready_session();
        let actions = s.handle(DisconnectRequest {}.into());
        assert_eq!(sent(&actions), vec!["DisconnectResponse"]);
        assert_eq!(actions.last(), Some(&Action::Hangup("device requested disconnect")));
    }

    #[test]
    fn test_announce_request_fields() {
        let s = ready_session();
        match s.announce("http://host/reply.wav", Some("http://host/chime.wav")) {
            ApiMessage::VoiceAssistantAnnounceRequest(req) => {
                assert_eq!(req.media_id, "http://host/reply.wav");
                assert_eq!(req.preannounce_media_id, "http://host/chime.wav");
                assert!(!req.start_conversation);
            }
            other => panic!("expected announce, got {other:?}"),
        }
    }
}
