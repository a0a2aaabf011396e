/// ESPHome native API message bodies + message-type registry.
///
/// Only the subset of the device schema this bridge speaks is modelled.
/// Bodies are plain protobuf, encoded/decoded through `prost` derives; the
/// frame header around them lives in [`crate::frame`].
///
/// The registry is built once from two static tables:
///
/// * **base**: messages from the shared device schema
/// * **supplemental**: hand-authored entries the base schema lacks
///   (announce request, media-player command)
///
/// Names and ids are unique across both tables.
use prost::Message;
use std::collections::HashMap;
use std::sync::OnceLock;

/// API version advertised in `HelloRequest`.
pub const API_VERSION_MAJOR: u32 = 1;
pub const API_VERSION_MINOR: u32 = 10;

// ═══════════════════════════════════════════════════════════════════════
//  Handshake / connection
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, PartialEq, Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub client_info: String,
    #[prost(uint32, tag = "2")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "3")]
    pub api_version_minor: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloResponse {
    #[prost(uint32, tag = "1")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "2")]
    pub api_version_minor: u32,
    #[prost(string, tag = "3")]
    pub server_info: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectResponse {
    #[prost(bool, tag = "1")]
    pub invalid_password: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoResponse {
    #[prost(bool, tag = "1")]
    pub uses_password: bool,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
    #[prost(string, tag = "4")]
    pub esphome_version: String,
    #[prost(string, tag = "5")]
    pub compilation_time: String,
    #[prost(string, tag = "6")]
    pub model: String,
    #[prost(bool, tag = "7")]
    pub has_deep_sleep: bool,
    #[prost(string, tag = "8")]
    pub project_name: String,
    #[prost(string, tag = "9")]
    pub project_version: String,
    #[prost(uint32, tag = "10")]
    pub webserver_port: u32,
    #[prost(string, tag = "12")]
    pub manufacturer: String,
    #[prost(string, tag = "13")]
    pub friendly_name: String,
    #[prost(string, tag = "16")]
    pub suggested_area: String,
    #[prost(uint32, tag = "17")]
    pub voice_assistant_feature_flags: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetTimeRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct GetTimeResponse {
    #[prost(fixed32, tag = "1")]
    pub epoch_seconds: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Entities
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, PartialEq, Message)]
pub struct ListEntitiesRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct ListEntitiesDoneResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeStatesRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct ListEntitiesMediaPlayerResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(fixed32, tag = "2")]
    pub key: u32,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub unique_id: String,
    #[prost(bool, tag = "8")]
    pub supports_pause: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MediaPlayerState {
    Unset = 0,
    Idle = 1,
    Playing = 2,
    Paused = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct MediaPlayerStateResponse {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(enumeration = "MediaPlayerState", tag = "2")]
    pub state: i32,
    #[prost(float, tag = "3")]
    pub volume: f32,
    #[prost(bool, tag = "4")]
    pub muted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MediaPlayerCommand {
    Play = 0,
    Pause = 1,
    Stop = 2,
    Mute = 3,
    Unmute = 4,
}

/// Supplemental: media-player command (play URL / volume).
#[derive(Clone, PartialEq, Message)]
pub struct MediaPlayerCommandRequest {
    #[prost(fixed32, tag = "1")]
    pub key: u32,
    #[prost(bool, tag = "2")]
    pub has_command: bool,
    #[prost(enumeration = "MediaPlayerCommand", tag = "3")]
    pub command: i32,
    #[prost(bool, tag = "4")]
    pub has_volume: bool,
    #[prost(float, tag = "5")]
    pub volume: f32,
    #[prost(bool, tag = "6")]
    pub has_media_url: bool,
    #[prost(string, tag = "7")]
    pub media_url: String,
    #[prost(bool, tag = "8")]
    pub has_announcement: bool,
    #[prost(bool, tag = "9")]
    pub announcement: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Voice assistant
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeVoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAudioSettings {
    #[prost(uint32, tag = "1")]
    pub noise_suppression_level: u32,
    #[prost(uint32, tag = "2")]
    pub auto_gain: u32,
    #[prost(float, tag = "3")]
    pub volume_multiplier: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub start: bool,
    #[prost(string, tag = "2")]
    pub conversation_id: String,
    #[prost(uint32, tag = "3")]
    pub flags: u32,
    #[prost(message, optional, tag = "4")]
    pub audio_settings: Option<VoiceAssistantAudioSettings>,
    #[prost(string, tag = "5")]
    pub wake_word_phrase: String,
}

/// Reply to a run request. A non-zero `port` selects the UDP audio
/// sub-channel; `error` tells the device the run cannot proceed.
#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantResponse {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(bool, tag = "2")]
    pub error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VoiceAssistantEvent {
    RunError = 0,
    RunStart = 1,
    RunEnd = 2,
    SttStart = 3,
    SttEnd = 4,
    IntentStart = 5,
    IntentEnd = 6,
    TtsStart = 7,
    TtsEnd = 8,
    WakeWordStart = 9,
    WakeWordEnd = 10,
    SttVadStart = 11,
    SttVadEnd = 12,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantEventData {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantEventResponse {
    #[prost(enumeration = "VoiceAssistantEvent", tag = "1")]
    pub event_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<VoiceAssistantEventData>,
}

#[cfg(test)]
impl VoiceAssistantEventResponse {
    /// Value of the data entry called `name`, if present.
    pub(crate) fn data_value(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAudio {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub end: bool,
}

/// Supplemental: ask the device to fetch and play a media URL.
#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAnnounceRequest {
    #[prost(string, tag = "1")]
    pub media_id: String,
    #[prost(string, tag = "2")]
    pub text: String,
    #[prost(string, tag = "3")]
    pub preannounce_media_id: String,
    #[prost(bool, tag = "4")]
    pub start_conversation: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAnnounceFinished {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════════════

/// One registry row: wire name, numeric type id and body decoder.
#[derive(Debug)]
pub struct SchemaEntry {
    pub name: &'static str,
    pub id: u32,
    decoder: fn(&[u8]) -> Option<ApiMessage>,
}

impl SchemaEntry {
    /// Decode a frame body against this entry's field layout.
    ///
    /// Returns `None` when the body does not parse.
    pub fn decode(&self, body: &[u8]) -> Option<ApiMessage> {
        (self.decoder)(body)
    }
}

fn decode_as<M>(body: &[u8]) -> Option<ApiMessage> where M: Message + Default + Into<ApiMessage> {
    M::decode(body).ok().map(Into::into)
}

macro_rules! schema {
    (
        base { $( $b:ident = $bid:literal, )+ }
        supplemental { $( $s:ident = $sid:literal, )+ }
    ) => {
        /// Every message body the bridge sends or understands.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ApiMessage {
            $( $b($b), )+
            $( $s($s), )+
        }

        impl ApiMessage {
            /// Wire name, as registered in the schema.
            pub fn name(&self) -> &'static str {
                match self {
                    $( ApiMessage::$b(_) => stringify!($b), )+
                    $( ApiMessage::$s(_) => stringify!($s), )+
                }
            }

            /// Serialize the body (no frame header).
            pub fn encode_body(&self) -> Vec<u8> {
                match self {
                    $( ApiMessage::$b(m) => m.encode_to_vec(), )+
                    $( ApiMessage::$s(m) => m.encode_to_vec(), )+
                }
            }
        }

        $(
            impl From<$b> for ApiMessage {
                fn from(m: $b) -> Self {
                    ApiMessage::$b(m)
                }
            }
        )+
        $(
            impl From<$s> for ApiMessage {
                fn from(m: $s) -> Self {
                    ApiMessage::$s(m)
                }
            }
        )+

        static BASE_SCHEMA: &[SchemaEntry] = &[
            $( SchemaEntry { name: stringify!($b), id: $bid, decoder: decode_as::<$b> }, )+
        ];

        static SUPPLEMENTAL_SCHEMA: &[SchemaEntry] = &[
            $( SchemaEntry { name: stringify!($s), id: $sid, decoder: decode_as::<$s> }, )+
        ];
    };
}

schema! {
    base {
        HelloRequest = 1,
        HelloResponse = 2,
        ConnectRequest = 3,
        ConnectResponse = 4,
        DisconnectRequest = 5,
        DisconnectResponse = 6,
        PingRequest = 7,
        PingResponse = 8,
        DeviceInfoRequest = 9,
        DeviceInfoResponse = 10,
        ListEntitiesRequest = 11,
        ListEntitiesDoneResponse = 19,
        SubscribeStatesRequest = 20,
        GetTimeRequest = 36,
        GetTimeResponse = 37,
        ListEntitiesMediaPlayerResponse = 63,
        MediaPlayerStateResponse = 64,
        SubscribeVoiceAssistantRequest = 89,
        VoiceAssistantRequest = 90,
        VoiceAssistantResponse = 91,
        VoiceAssistantEventResponse = 92,
        VoiceAssistantAudio = 106,
        VoiceAssistantAnnounceFinished = 120,
    }
    supplemental {
        MediaPlayerCommandRequest = 65,
        VoiceAssistantAnnounceRequest = 119,
    }
}

/// Immutable name ↔ id ↔ codec table, built on first use.
#[derive(Debug)]
pub struct Registry {
    by_name: HashMap<&'static str, &'static SchemaEntry>,
    by_id: HashMap<u32, &'static SchemaEntry>,
}

impl Registry {
    fn build() -> Self {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for entry in BASE_SCHEMA.iter().chain(SUPPLEMENTAL_SCHEMA.iter()) {
            let dup_name = by_name.insert(entry.name, entry);
            let dup_id = by_id.insert(entry.id, entry);
            debug_assert!(dup_name.is_none() && dup_id.is_none(), "duplicate schema entry {}", entry.name);
        }
        Registry { by_name, by_id }
    }

    /// Process-wide registry.
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::build)
    }

    pub fn by_name(&self, name: &str) -> Option<&'static SchemaEntry> {
        self.by_name.get(name).copied()
    }

    pub fn by_id(&self, id: u32) -> Option<&'static SchemaEntry> {
        self.by_id.get(&id).copied()
    }
}

#[cfg(test)]
impl Registry {
    fn len(&self) -> usize {
        self.by_id.len()
    }
}
