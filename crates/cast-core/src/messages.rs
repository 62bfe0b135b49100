//! JSON payload vocabulary spoken over the control channel.
//!
//! Every payload carries a `type` discriminator; request/response pairs also
//! carry a `requestId` (absent or 0 for unsolicited messages).

use serde::{Deserialize, Serialize};

use crate::envelope::CastMessage;
use crate::error::{CastError, CastResult};

pub const DEFAULT_SENDER: &str = "sender-0";
pub const DEFAULT_RECEIVER: &str = "receiver-0";
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// Inbound `type` values the client reacts to.
pub mod kind {
    pub const PING: &str = "PING";
    pub const CLOSE: &str = "CLOSE";
    pub const RECEIVER_STATUS: &str = "RECEIVER_STATUS";
    pub const MEDIA_STATUS: &str = "MEDIA_STATUS";
    pub const LOAD_FAILED: &str = "LOAD_FAILED";
}

/// The `type` / `requestId` pair present on every payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PayloadHeader {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "requestId", default)]
    pub request_id: u32,
}

/// Outbound payloads. The request id is stamped separately by the multiplexer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Connect,
    Close,
    GetStatus,
    Pong,
    Launch {
        #[serde(rename = "appId")]
        app_id: String,
    },
    /// Receiver-level stop: tears down the running application.
    #[serde(rename = "STOP")]
    StopApp {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Play(MediaCommand),
    Pause(MediaCommand),
    /// Media-level stop: ends the media session, app keeps running.
    #[serde(rename = "STOP")]
    StopMedia(MediaCommand),
    Seek(SeekCommand),
    SetVolume {
        volume: Volume,
    },
    Load(LoadCommand),
    QueueLoad(QueueLoadCommand),
    QueueUpdate(QueueUpdateCommand),
}

impl Request {
    /// Serialize to the JSON payload string, stamping `requestId` when non-zero.
    pub fn to_payload(&self, request_id: u32) -> CastResult<String> {
        let mut value = serde_json::to_value(self)?;
        if request_id != 0 {
            let obj = value.as_object_mut().ok_or_else(|| {
                CastError::Serialization("payload is not a JSON object".into())
            })?;
            obj.insert("requestId".into(), request_id.into());
        }
        Ok(serde_json::to_string(&value)?)
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Close => "CLOSE",
            Self::GetStatus => "GET_STATUS",
            Self::Pong => "PONG",
            Self::Launch { .. } => "LAUNCH",
            Self::StopApp { .. } | Self::StopMedia(_) => "STOP",
            Self::Play(_) => "PLAY",
            Self::Pause(_) => "PAUSE",
            Self::Seek(_) => "SEEK",
            Self::SetVolume { .. } => "SET_VOLUME",
            Self::Load(_) => "LOAD",
            Self::QueueLoad(_) => "QUEUE_LOAD",
            Self::QueueUpdate(_) => "QUEUE_UPDATE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaCommand {
    #[serde(rename = "mediaSessionId")]
    pub media_session_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumeState {
    PlaybackStart,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekCommand {
    pub media_session_id: i64,
    pub current_time: f64,
    pub resume_state: ResumeState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdateCommand {
    pub media_session_id: i64,
    pub jump: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadCommand {
    pub media: MediaItem,
    pub current_time: f64,
    pub autoplay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatMode {
    RepeatOff,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLoadCommand {
    pub items: Vec<QueueItem>,
    pub start_index: u32,
    pub repeat_mode: RepeatMode,
    pub current_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub media: MediaItem,
    pub autoplay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaItem {
    pub content_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stream_type: String,
    /// Zero for live streams or when the receiver hasn't reported it.
    #[serde(skip_serializing_if = "is_zero")]
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaMetadata>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaMetadata {
    pub metadata_type: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

/// An application running on the receiver, as reported by RECEIVER_STATUS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverApplication {
    pub app_id: String,
    pub display_name: String,
    pub is_idle_screen: bool,
    pub session_id: String,
    pub status_text: String,
    /// Destination id for the app's connection and media namespaces.
    pub transport_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverStatus {
    pub applications: Vec<ReceiverApplication>,
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverStatusResponse {
    pub status: ReceiverStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    #[default]
    Idle,
    Playing,
    Paused,
    Buffering,
    Loading,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Cancelled,
    Interrupted,
    Finished,
    Error,
    #[serde(other)]
    Unknown,
}

/// One media session entry from MEDIA_STATUS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaStatus {
    pub media_session_id: i64,
    pub player_state: PlayerState,
    pub current_time: f64,
    pub idle_reason: Option<IdleReason>,
    pub volume: Volume,
    pub current_item_id: i64,
    /// Non-zero while the receiver is preparing the next queue item.
    pub loading_item_id: i64,
    pub media: MediaItem,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaStatusResponse {
    pub status: Vec<MediaStatus>,
}

/// An inbound envelope after correlation.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Reply to an outstanding request.
    Reply { request_id: u32, message: CastMessage },
    /// Unsolicited event (or a reply nobody is waiting for any more).
    Broadcast { kind: String, message: CastMessage },
}
