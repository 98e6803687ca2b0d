use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::qq::{MessageKey, PortalKey, Uid};

/// MXIDs of records that never reached Matrix start with this prefix.
pub const FAKE_MXID_PREFIX: &str = "net.qq.bridge.fake::";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRecord {
    pub key: PortalKey,
    pub mxid: Option<String>,
    pub name: String,
    pub name_set: bool,
    pub topic: String,
    pub topic_set: bool,
    pub avatar: String,
    pub avatar_url: String,
    pub avatar_set: bool,
    pub encrypted: bool,
    pub last_sync: DateTime<Utc>,
}

impl PortalRecord {
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            mxid: None,
            name: String::new(),
            name_set: false,
            topic: String::new(),
            topic_set: false,
            avatar: String::new(),
            avatar_url: String::new(),
            avatar_set: false,
            encrypted: false,
            last_sync: DateTime::<Utc>::default(),
        }
    }

    pub fn with_mxid(mut self, mxid: impl Into<String>) -> Self {
        self.mxid = Some(mxid.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Confidence in a ghost's display name; a lower value never replaces a
/// higher one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NameQuality {
    #[default]
    Unset = 0,
    Uin = 1,
    Name = 2,
    Remark = 3,
}

impl NameQuality {
    pub fn from_i16(value: i16) -> Self {
        match value {
            1 => NameQuality::Uin,
            2 => NameQuality::Name,
            3 => NameQuality::Remark,
            _ => NameQuality::Unset,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuppetRecord {
    pub uid: Uid,
    pub displayname: String,
    pub name_quality: NameQuality,
    pub avatar: String,
    pub avatar_url: String,
    pub avatar_set: bool,
    pub last_sync: DateTime<Utc>,
    pub custom_mxid: Option<String>,
    pub access_token: Option<String>,
}

impl PuppetRecord {
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            displayname: String::new(),
            name_quality: NameQuality::Unset,
            avatar: String::new(),
            avatar_url: String::new(),
            avatar_set: false,
            last_sync: DateTime::<Utc>::default(),
            custom_mxid: None,
            access_token: None,
        }
    }

    pub fn with_custom_mxid(mut self, mxid: impl Into<String>) -> Self {
        self.custom_mxid = Some(mxid.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageKind {
    #[default]
    Normal,
    Fake,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Normal => "message",
            MessageKind::Fake => "fake",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "fake" => MessageKind::Fake,
            _ => MessageKind::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageErrorKind {
    #[default]
    None,
    DecryptionFailed,
    MediaNotFound,
}

impl MessageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageErrorKind::None => "",
            MessageErrorKind::DecryptionFailed => "decryption_failed",
            MessageErrorKind::MediaNotFound => "media_not_found",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "decryption_failed" => MessageErrorKind::DecryptionFailed,
            "media_not_found" => MessageErrorKind::MediaNotFound,
            _ => MessageErrorKind::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub chat: PortalKey,
    pub key: MessageKey,
    pub mxid: String,
    pub sender: Uid,
    /// Unix seconds as reported by QQ.
    pub timestamp: i64,
    pub sent: bool,
    pub kind: MessageKind,
    pub error: MessageErrorKind,
    pub content: String,
}

impl MessageRecord {
    pub fn new(chat: PortalKey, key: MessageKey, sender: Uid, timestamp: i64) -> Self {
        Self {
            chat,
            key,
            mxid: String::new(),
            sender,
            timestamp,
            sent: false,
            kind: MessageKind::Normal,
            error: MessageErrorKind::None,
            content: String::new(),
        }
    }

    pub fn with_mxid(mut self, mxid: impl Into<String>) -> Self {
        self.mxid = mxid.into();
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn is_fake_mxid(&self) -> bool {
        self.mxid.starts_with(FAKE_MXID_PREFIX)
    }

    pub fn is_fake(&self) -> bool {
        self.kind == MessageKind::Fake || self.key.is_fake() || self.key.id == self.mxid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub mxid: String,
    pub uin: Option<String>,
    pub management_room: Option<String>,
    pub space_room: Option<String>,
}

impl UserRecord {
    pub fn new(mxid: impl Into<String>) -> Self {
        Self {
            mxid: mxid.into(),
            uin: None,
            management_room: None,
            space_room: None,
        }
    }

    pub fn with_uin(mut self, uin: impl Into<String>) -> Self {
        self.uin = Some(uin.into());
        self
    }
}
