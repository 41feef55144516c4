//! Wire protocol for the duplex event channel.
//!
//! Events travel as JSON text frames shaped `{"event": "...", "data": {...}}`.
//! SDP payloads are opaque to the server and relayed unchanged; binary chunk
//! payloads are base64-encoded inside the `file-upload-chunk` event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ConnectionId, UploadId};

/// Everything a client may send over the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, nickname: String },

    /// Camera-session SDP offer, bundled ICE included.
    #[serde(rename_all = "camelCase")]
    Offer {
        room_id: String,
        offer: serde_json::Value,
        to: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        room_id: String,
        answer: serde_json::Value,
        to: ConnectionId,
    },

    /// Screen-session SDP offer. Same relay mechanics as `offer`, separate
    /// channel so both peer connections can negotiate in parallel.
    #[serde(rename_all = "camelCase")]
    ScreenShareOffer {
        room_id: String,
        offer: serde_json::Value,
        to: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareAnswer {
        room_id: String,
        answer: serde_json::Value,
        to: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStart {
        room_id: String,
        user_id: ConnectionId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStop {
        room_id: String,
        user_id: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ChatMessage {
        #[serde(default)]
        message: String,
        #[serde(default)]
        file: Option<FileMeta>,
    },

    #[serde(rename_all = "camelCase")]
    ToggleMute { is_muted: bool },

    #[serde(rename_all = "camelCase")]
    ToggleRaiseHand { is_hand_raised: bool },

    #[serde(rename_all = "camelCase")]
    ToggleVideo { is_video_enabled: bool },

    /// Declared size is signed so that a zero or negative value reaches the
    /// validator and earns a negative ack instead of a parse failure.
    #[serde(rename_all = "camelCase")]
    FileUploadStart {
        room_id: String,
        original_name: String,
        mime_type: String,
        size: i64,
    },

    #[serde(rename_all = "camelCase")]
    FileUploadChunk {
        upload_id: UploadId,
        /// Base64-encoded chunk bytes.
        chunk: String,
    },

    #[serde(rename_all = "camelCase")]
    FileUploadComplete { upload_id: UploadId },
}

/// Everything the server may push to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        participants: Vec<ParticipantInfo>,
        is_host: bool,
    },

    UserJoined(ParticipantInfo),

    #[serde(rename_all = "camelCase")]
    UserLeft {
        socket_id: ConnectionId,
        nickname: String,
    },

    #[serde(rename_all = "camelCase")]
    Offer {
        offer: serde_json::Value,
        from: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        answer: serde_json::Value,
        from: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareOffer {
        offer: serde_json::Value,
        from: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareAnswer {
        answer: serde_json::Value,
        from: ConnectionId,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStart {
        user_id: ConnectionId,
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStop { user_id: ConnectionId },

    ChatMessage(ChatRecord),

    #[serde(rename_all = "camelCase")]
    UserMuteChanged {
        socket_id: ConnectionId,
        is_muted: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserHandRaised {
        socket_id: ConnectionId,
        is_hand_raised: bool,
        nickname: String,
    },

    #[serde(rename_all = "camelCase")]
    UserVideoChanged {
        socket_id: ConnectionId,
        is_video_enabled: bool,
    },

    #[serde(rename_all = "camelCase")]
    FileUploadStartAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        upload_id: Option<UploadId>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    FileUploadChunkAck {
        upload_id: UploadId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        received: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    FileUploadCompleteAck {
        upload_id: UploadId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        file: Option<FileMeta>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
    },

    /// Asynchronous notification that an in-flight upload failed server-side,
    /// so the client can abort without waiting for the next chunk ack.
    #[serde(rename_all = "camelCase")]
    FileUploadError {
        upload_id: UploadId,
        error: String,
    },

    Error { message: String },
}

/// Snapshot of one participant as shown to other clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub socket_id: ConnectionId,
    pub nickname: String,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_hand_raised: bool,
    pub is_screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

/// One chat log entry. Nickname is snapshotted at send time so renames (or
/// the author leaving) never rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: Uuid,
    pub socket_id: ConnectionId,
    pub nickname: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<FileMeta>,
    pub timestamp: DateTime<Utc>,
}

/// Metadata of a completed upload. `url` is server-relative and stable; the
/// original name is untrusted display data, never a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: Uuid,
    pub url: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}
