use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("homeserver rejected too large file")]
    TooLarge,

    #[error("proxy rejected too large file")]
    ProxyTooLarge,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("homeserver returned {status} {errcode}: {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("attachment error: {0}")]
    Attachment(String),
}

impl MatrixError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, MatrixError::Forbidden(_))
    }
}

impl From<reqwest::Error> for MatrixError {
    fn from(err: reqwest::Error) -> Self {
        MatrixError::Transport(err.to_string())
    }
}

pub const MSG_TEXT: &str = "m.text";
pub const MSG_NOTICE: &str = "m.notice";
pub const MSG_EMOTE: &str = "m.emote";
pub const MSG_IMAGE: &str = "m.image";
pub const MSG_VIDEO: &str = "m.video";
pub const MSG_AUDIO: &str = "m.audio";
pub const MSG_FILE: &str = "m.file";
pub const MSG_LOCATION: &str = "m.location";

pub const EVENT_MESSAGE: &str = "m.room.message";
pub const EVENT_STICKER: &str = "m.sticker";
pub const EVENT_REDACTION: &str = "m.room.redaction";
pub const EVENT_MEMBER: &str = "m.room.member";

pub const FORMAT_HTML: &str = "org.matrix.custom.html";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub key_ops: Vec<String>,
    pub alg: String,
    pub k: String,
    pub ext: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedFile {
    pub url: String,
    pub key: JsonWebKey,
    pub iv: String,
    pub hashes: BTreeMap<String, String>,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(
        rename = "m.in_reply_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub in_reply_to: Option<InReplyTo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mentions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room: bool,
}

/// Content of `m.room.message` (and, minus `msgtype`, `m.sticker`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<EncryptedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_uri: Option<String>,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<RelatesTo>,
    #[serde(rename = "m.mentions", default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Mentions>,
    #[serde(
        rename = "org.matrix.msc3245.voice",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub voice: Option<Value>,
}

impl MessageContent {
    pub fn new(msgtype: &str, body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype.to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(MSG_TEXT, body)
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self::new(MSG_NOTICE, body)
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.format = Some(FORMAT_HTML.to_string());
        self.formatted_body = Some(html.into());
        self
    }

    pub fn set_reply(&mut self, event_id: &str) {
        self.relates_to = Some(RelatesTo {
            in_reply_to: Some(InReplyTo {
                event_id: event_id.to_string(),
            }),
        });
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.relates_to
            .as_ref()?
            .in_reply_to
            .as_ref()
            .map(|reply| reply.event_id.as_str())
    }

    /// The MXC URI of the media, encrypted or not.
    pub fn media_url(&self) -> Option<&str> {
        self.file
            .as_ref()
            .map(|file| file.url.as_str())
            .or(self.url.as_deref())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A room event as delivered in an appservice transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

impl RoomEvent {
    pub fn message_content(&self) -> Option<MessageContent> {
        serde_json::from_value(self.content.clone()).ok()
    }

    pub fn redacts(&self) -> Option<&str> {
        self.redacts
            .as_deref()
            .or_else(|| self.content.get("redacts").and_then(Value::as_str))
    }

    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_state: Vec<StateEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_level_content_override: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_content_serializes_relation_and_mentions() {
        let mut content = MessageContent::text("hi").with_html("<b>hi</b>");
        content.set_reply("$orig");
        content.mentions = Some(Mentions {
            user_ids: vec!["@qq_1:example.org".to_string()],
            room: false,
        });

        let value = content.to_value();
        assert_eq!(value["m.relates_to"]["m.in_reply_to"]["event_id"], "$orig");
        assert_eq!(value["format"], FORMAT_HTML);
        assert_eq!(value["m.mentions"], json!({ "user_ids": ["@qq_1:example.org"] }));
        assert!(value.get("url").is_none());
    }

    #[test]
    fn sticker_content_parses_without_msgtype() {
        let event: RoomEvent = serde_json::from_value(json!({
            "type": "m.sticker",
            "event_id": "$s",
            "room_id": "!r",
            "sender": "@u:hs",
            "content": { "body": "cat", "url": "mxc://hs/abc", "info": { "mimetype": "image/png" } }
        }))
        .expect("event parses");
        let content = event.message_content().expect("content parses");
        assert_eq!(content.msgtype, "");
        assert_eq!(content.media_url(), Some("mxc://hs/abc"));
    }
}
