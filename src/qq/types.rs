use serde::{Deserialize, Serialize};

use super::id::{ChatType, MessageKey};

/// Where the bytes of a media element live. Inbound elements carry the relay
/// URL, outbound elements carry the payload itself.
#[derive(Clone, PartialEq, Eq)]
pub enum MediaSource {
    Url(String),
    Data(Vec<u8>),
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            MediaSource::Data(data) => write!(f, "Data({} bytes)", data.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QqElement {
    Text {
        text: String,
    },
    Face {
        id: String,
        name: String,
    },
    /// `target` is a uin, or `0` for the whole group.
    At {
        target: String,
        display: String,
    },
    Image {
        source: MediaSource,
        file: String,
    },
    Voice {
        source: MediaSource,
        name: String,
    },
    Video {
        source: MediaSource,
        name: String,
        size: u64,
    },
    File {
        source: MediaSource,
        name: String,
        size: u64,
    },
    Reply {
        id: String,
        seq: String,
        time: i64,
        sender: String,
        group_id: Option<String>,
        summary: String,
    },
    LightApp {
        content: String,
    },
    Xml {
        content: String,
    },
    Forward {
        res_id: String,
    },
}

pub const AT_ALL_TARGET: &str = "0";

impl QqElement {
    pub fn text(text: impl Into<String>) -> Self {
        QqElement::Text { text: text.into() }
    }

    pub fn at(target: impl Into<String>, display: impl Into<String>) -> Self {
        QqElement::At {
            target: target.into(),
            display: display.into(),
        }
    }

    /// Whether this element makes a message worth opening a room for.
    pub fn is_conversational(&self) -> bool {
        !matches!(self, QqElement::Xml { .. } | QqElement::Forward { .. })
    }

    /// Flattened text kept alongside the message record.
    pub fn summary(&self) -> String {
        match self {
            QqElement::Text { text } => text.clone(),
            QqElement::Face { name, .. } => format!("/{name}"),
            QqElement::At { display, .. } => display.clone(),
            QqElement::Image { .. } => "[图片]".to_string(),
            QqElement::Voice { .. } => "[语音]".to_string(),
            QqElement::Video { .. } => "[视频]".to_string(),
            QqElement::File { name, .. } => format!("[文件]{name}"),
            QqElement::Reply { .. } => String::new(),
            QqElement::LightApp { .. } => "[卡片消息]".to_string(),
            QqElement::Xml { .. } => "[XML消息]".to_string(),
            QqElement::Forward { .. } => "[聊天记录]".to_string(),
        }
    }
}

pub fn summarize(elements: &[QqElement]) -> String {
    elements.iter().map(QqElement::summary).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Sticker,
    Audio,
    Video,
    File,
    Location,
    App,
    Revoke,
}

impl MessageType {
    pub fn classify(elements: &[QqElement]) -> Self {
        for element in elements {
            match element {
                QqElement::Image { .. } => return MessageType::Image,
                QqElement::Voice { .. } => return MessageType::Audio,
                QqElement::Video { .. } => return MessageType::Video,
                QqElement::File { .. } => return MessageType::File,
                QqElement::LightApp { .. } | QqElement::Xml { .. } => return MessageType::App,
                _ => {}
            }
        }
        MessageType::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QqMessage {
    pub chat_type: ChatType,
    /// Group code for group and temp messages.
    pub group: Option<String>,
    pub sender: String,
    pub sender_name: String,
    /// Receiving uin for private messages, the group code otherwise.
    pub target: String,
    pub key: MessageKey,
    pub time: i64,
    pub elements: Vec<QqElement>,
}

impl QqMessage {
    pub fn message_type(&self) -> MessageType {
        MessageType::classify(&self.elements)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QqEvent {
    Connected {
        self_uin: String,
    },
    Disconnected {
        reason: String,
    },
    Message(QqMessage),
    GroupRecall {
        group: String,
        operator: String,
        key: MessageKey,
        time: i64,
    },
    FriendRecall {
        peer: String,
        key: MessageKey,
        time: i64,
    },
    MemberJoined {
        group: String,
        member: String,
    },
    MemberLeft {
        group: String,
        member: String,
        operator: Option<String>,
    },
    MemberCardChanged {
        group: String,
        member: String,
        card: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub uin: String,
    pub name: String,
    pub remark: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInfo {
    pub code: String,
    pub name: String,
    pub avatar_url: String,
    pub member_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl MemberRole {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "owner" => MemberRole::Owner,
            "admin" => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMember {
    pub uin: String,
    pub nickname: String,
    pub card: String,
    pub role: MemberRole,
}

impl GroupMember {
    pub fn display_name(&self) -> &str {
        if self.card.is_empty() {
            &self.nickname
        } else {
            &self.card
        }
    }

    pub fn as_contact(&self) -> ContactInfo {
        ContactInfo {
            uin: self.uin.clone(),
            name: self.nickname.clone(),
            remark: String::new(),
            avatar_url: String::new(),
        }
    }
}

/// What the relay reports back after a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub key: MessageKey,
    pub time: i64,
}
